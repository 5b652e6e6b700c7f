//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The `check` subcommand

use anyhow::anyhow;
use anyhow::Result;
use clap::ArgMatches;
use tracing::info;

use crate::checker::check_completion;
use crate::error::MavisError;

pub fn check(matches: &ArgMatches) -> Result<()> {
    let output = crate::commands::output_dir(matches);
    let result = check_completion(&output)?;
    print!("{}", result.report);

    if result.success {
        info!("Pipeline complete");
        Ok(())
    } else {
        Err(anyhow!(MavisError::Incomplete(
            "the pipeline has incomplete, crashed or missing jobs".to_string()
        )))
    }
}
