//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use clap::crate_authors;
use clap::crate_version;
use clap::Arg;
use clap::ArgAction;
use clap::Command;

use crate::config::REFERENCE_KEYS;

pub fn cli() -> Command {
    Command::new("mavis")
        .author(crate_authors!())
        .version(crate_version!())
        .about("Batch-scheduler pipeline orchestration for structural variant analysis")
        .subcommand_required(true)
        .arg_required_else_help(true)

        .subcommand(Command::new("config")
            .about("Write a new user configuration file")
            .long_about(indoc::indoc!(r#"
            Write a new user configuration file.

            Libraries are declared with --library and wired to their input
            files (or conversion aliases) with --input. Conversion aliases
            come from --convert (built-in tool converters) or
            --external-conversion (arbitrary commands producing the common
            tab format).
            "#))

            .arg(Arg::new("write")
                .required(true)
                .short('w')
                .long("write")
                .value_name("FILE")
                .help("Path to the new configuration file")
            )
            .arg(arg_scheduler())
            .arg(Arg::new("library")
                .long("library")
                .num_args(8)
                .action(ArgAction::Append)
                .value_names([
                    "NAME",
                    "PROTOCOL",
                    "DISEASE_STATUS",
                    "BAM",
                    "STRANDED",
                    "READ_LENGTH",
                    "MEDIAN_FRAGMENT_SIZE",
                    "STDEV_FRAGMENT_SIZE",
                ])
                .help("Configuration for a library to be analyzed (protocol: genome|transcriptome, disease status: diseased|normal)")
            )
            .arg(Arg::new("input")
                .long("input")
                .num_args(2..)
                .action(ArgAction::Append)
                .value_names(["PATH", "LIBRARY"])
                .help("Path to an input file (or a conversion alias) followed by the libraries it should be used for")
            )
            .arg(Arg::new("convert")
                .long("convert")
                .num_args(4)
                .action(ArgAction::Append)
                .value_names(["ALIAS", "PATH", "TOOL", "STRANDED"])
                .help("Input file conversion using a built-in tool converter")
            )
            .arg(Arg::new("external-conversion")
                .long("external-conversion")
                .num_args(2)
                .action(ArgAction::Append)
                .value_names(["ALIAS", "COMMAND"])
                .help("Alias for use in inputs and the full conversion command (quote the command)")
            )
            .args(REFERENCE_KEYS.iter().map(|key| {
                Arg::new(*key)
                    .long(*key)
                    .value_name("PATH")
                    .help("Reference file forwarded to the workers")
            }))
        )

        .subcommand(Command::new("setup")
            .alias("pipeline")
            .about("Set up the output directory, convert inputs and write the build manifest")
            .arg(Arg::new("config")
                .required(true)
                .value_name("CONFIG")
                .help("Path to the user configuration file")
            )
            .arg(arg_output())
            .arg(arg_scheduler())
            .arg(Arg::new("dry")
                .long("dry")
                .action(ArgAction::SetTrue)
                .help("Pin validate/annotate arrays to a single task instead of deferring to the clustering output")
            )
        )

        .subcommand(Command::new("submit")
            .about("Submit every submittable job of the build manifest in dependency order")
            .arg(arg_output())
            .arg(arg_scheduler())
            .arg(Arg::new("resubmit")
                .long("resubmit")
                .action(ArgAction::SetTrue)
                .help("Also re-submit the failed tasks of jobs that finished FAILED or CANCELLED")
            )
        )

        .subcommand(Command::new("check")
            .about("Reconcile completion stamps and log files and report the pipeline status")
            .arg(arg_output())
        )
}

fn arg_output() -> Arg {
    Arg::new("output")
        .required(true)
        .short('o')
        .long("output")
        .value_name("DIR")
        .help("Path to the pipeline output directory")
}

fn arg_scheduler() -> Arg {
    Arg::new("scheduler")
        .long("scheduler")
        .value_name("SCHEDULER")
        .value_parser(["SLURM", "SGE", "TORQUE"])
        .help("The batch scheduler to drive")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn test_pipeline_is_an_alias_for_setup() {
        let matches = cli()
            .try_get_matches_from(["mavis", "pipeline", "-o", "/tmp/out", "config.cfg"])
            .unwrap();
        assert_eq!(Some("setup"), matches.subcommand_name());
    }

    #[test]
    fn test_scheduler_values_are_restricted() {
        assert!(cli()
            .try_get_matches_from(["mavis", "submit", "-o", "/tmp/out", "--scheduler", "LSF"])
            .is_err());
    }
}
