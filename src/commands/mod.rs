//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

pub mod check;
pub mod config;
pub mod setup;
pub mod submit;

use std::path::PathBuf;

use anyhow::anyhow;
use anyhow::Result;
use clap::ArgMatches;

use crate::error::MavisError;
use crate::schedule::scheduler::SchedulerKind;

/// The shared, required `--output` flag
pub(crate) fn output_dir(matches: &ArgMatches) -> PathBuf {
    matches
        .get_one::<String>("output")
        .map(PathBuf::from)
        .expect("--output is required by clap")
}

/// The shared, optional `--scheduler` override
pub(crate) fn scheduler_override(matches: &ArgMatches) -> Result<Option<SchedulerKind>> {
    matches
        .get_one::<String>("scheduler")
        .map(|value| {
            value.parse::<SchedulerKind>().map_err(|_| {
                anyhow!(MavisError::InvalidInput(format!(
                    "unknown scheduler '{}'",
                    value
                )))
            })
        })
        .transpose()
}
