//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use tracing_subscriber::EnvFilter;

mod checker;
mod cli;
mod commands;
mod config;
mod error;
mod pipeline;
mod schedule;
mod util;

fn main() {
    human_panic::setup_panic!();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let matches = cli::cli().get_matches();
    let result = match matches.subcommand() {
        Some(("config", matches)) => commands::config::generate_config(matches),
        Some(("setup", matches)) => commands::setup::setup(matches),
        Some(("submit", matches)) => commands::submit::submit(matches),
        Some(("check", matches)) => commands::check::check(matches),
        _ => unreachable!("a subcommand is required"),
    };

    if let Err(error) = result {
        eprintln!("mavis: error: {:#}", error);
        std::process::exit(error::exit_code(&error));
    }
}
