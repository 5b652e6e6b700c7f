//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The `config` subcommand: assemble and write a new user configuration

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use anyhow::anyhow;
use anyhow::Result;
use clap::ArgMatches;
use tracing::info;

use crate::config::Conversion;
use crate::config::DiseaseStatus;
use crate::config::GeneralConfig;
use crate::config::LibraryConfig;
use crate::config::Protocol;
use crate::config::ReferenceConfig;
use crate::config::UserConfig;
use crate::config::REFERENCE_KEYS;
use crate::error::MavisError;
use crate::util::atomic_write;

pub fn generate_config(matches: &ArgMatches) -> Result<()> {
    let write = matches
        .get_one::<String>("write")
        .map(PathBuf::from)
        .expect("--write is required by clap");

    let mut general = GeneralConfig::default();
    if let Some(scheduler) = crate::commands::scheduler_override(matches)? {
        general = general.with_scheduler(scheduler);
    }

    // inputs are declared once and assigned to libraries by name
    let mut inputs_by_library: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for mut occurrence in values_of(matches, "input") {
        let input = occurrence.remove(0);
        if occurrence.is_empty() {
            return Err(anyhow!(MavisError::InvalidInput(format!(
                "--input {} names no libraries",
                input
            ))));
        }
        for library in occurrence {
            inputs_by_library.entry(library).or_default().push(input.clone());
        }
    }

    let mut libraries = Vec::new();
    for occurrence in values_of(matches, "library") {
        let [name, protocol, disease_status, bam, stranded, read_length, median, stdev]: [String; 8] =
            occurrence.try_into().map_err(|_| {
                anyhow!(MavisError::InvalidInput(
                    "--library takes exactly 8 values".to_string()
                ))
            })?;

        let inputs = inputs_by_library.remove(&name).ok_or_else(|| {
            anyhow!(MavisError::InvalidInput(format!(
                "no --input was given for library '{}'",
                name
            )))
        })?;

        let invalid = |key: &str, value: &str| {
            anyhow!(MavisError::InvalidInput(format!(
                "library '{}': cannot parse {} value '{}'",
                name, key, value
            )))
        };
        libraries.push(LibraryConfig::new(
            name.clone(),
            protocol
                .parse::<Protocol>()
                .map_err(|_| invalid("protocol", &protocol))?,
            disease_status
                .parse::<DiseaseStatus>()
                .map_err(|_| invalid("disease_status", &disease_status))?,
            PathBuf::from(bam),
            parse_bool(&stranded).ok_or_else(|| invalid("stranded_bam", &stranded))?,
            read_length
                .parse()
                .map_err(|_| invalid("read_length", &read_length))?,
            median
                .parse()
                .map_err(|_| invalid("median_fragment_size", &median))?,
            stdev
                .parse()
                .map_err(|_| invalid("stdev_fragment_size", &stdev))?,
            inputs,
        )?);
    }
    if let Some(unassigned) = inputs_by_library.keys().next() {
        return Err(anyhow!(MavisError::InvalidInput(format!(
            "--input names library '{}' which was not configured with --library",
            unassigned
        ))));
    }

    let mut conversions = BTreeMap::new();
    for occurrence in values_of(matches, "convert") {
        let [alias, input, tool, stranded]: [String; 4] = occurrence.try_into().map_err(|_| {
            anyhow!(MavisError::InvalidInput(
                "--convert takes exactly 4 values".to_string()
            ))
        })?;
        let stranded = parse_bool(&stranded).ok_or_else(|| {
            anyhow!(MavisError::InvalidInput(format!(
                "conversion '{}': cannot parse strandedness '{}'",
                alias, stranded
            )))
        })?;
        insert_conversion(
            &mut conversions,
            alias,
            Conversion::Tool {
                input,
                tool,
                stranded,
            },
        )?;
    }
    for occurrence in values_of(matches, "external-conversion") {
        let [alias, command]: [String; 2] = occurrence.try_into().map_err(|_| {
            anyhow!(MavisError::InvalidInput(
                "--external-conversion takes exactly 2 values".to_string()
            ))
        })?;
        insert_conversion(&mut conversions, alias, Conversion::External { command })?;
    }

    let reference = reference_from_matches(matches)?;

    let config = UserConfig::assemble(general, reference, conversions, libraries)?;
    atomic_write(&write, &config.render())?;
    info!("Wrote configuration to {}", write.display());
    Ok(())
}

fn values_of(matches: &ArgMatches, id: &str) -> Vec<Vec<String>> {
    matches
        .get_occurrences::<String>(id)
        .map(|occurrences| {
            occurrences
                .map(|values| values.cloned().collect())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn insert_conversion(
    conversions: &mut BTreeMap<String, Conversion>,
    alias: String,
    conversion: Conversion,
) -> Result<()> {
    if conversions.contains_key(&alias) {
        return Err(anyhow!(MavisError::InvalidInput(format!(
            "duplicate conversion alias '{}'",
            alias
        ))));
    }
    conversions.insert(alias, conversion);
    Ok(())
}

fn reference_from_matches(matches: &ArgMatches) -> Result<ReferenceConfig> {
    let mut section = crate::util::ini::Section::new("reference");
    for key in REFERENCE_KEYS {
        if let Some(path) = matches.get_one::<String>(key) {
            if !Path::new(path).is_file() {
                return Err(anyhow!(MavisError::InvalidInput(format!(
                    "reference file does not exist: {}",
                    path
                ))));
            }
            section.push(key, path.clone());
        }
    }
    ReferenceConfig::from_section(&section)
}
