//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The `setup` (alias `pipeline`) subcommand

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::ArgMatches;
use tracing::info;

use crate::config::UserConfig;
use crate::pipeline::Pipeline;
use crate::util::process::SystemRunner;

pub fn setup(matches: &ArgMatches) -> Result<()> {
    let output = crate::commands::output_dir(matches);
    let scheduler = crate::commands::scheduler_override(matches)?;
    let dry = matches.get_flag("dry");
    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .expect("the config file is required by clap");

    let config = UserConfig::read(&config_path)?;
    std::fs::create_dir_all(&output)
        .with_context(|| format!("Creating {}", output.display()))?;

    let pipeline = Pipeline::build(&config, &output, scheduler, dry, &SystemRunner)?;
    pipeline.write_build_file(&pipeline.build_file())?;

    info!(
        "Set up {} jobs for {} libraries under {} ({})",
        pipeline.jobs().count(),
        pipeline.clusterings().len(),
        output.display(),
        pipeline.scheduler()
    );
    info!("Wrote {}", pipeline.build_file().display());
    Ok(())
}
