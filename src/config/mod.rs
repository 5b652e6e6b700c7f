//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The user configuration
//!
//! A sectioned key-value file: `[general]` with scheduler, resources and
//! filter settings, an optional `[convert]` table, an optional `[reference]`
//! section naming the reference files forwarded to the workers, and one
//! `[library:<name>]` section per sequencing library. Every `[general]` key
//! can be overridden through a `MAVIS_<KEY>` environment variable.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use getset::CopyGetters;
use getset::Getters;
use parse_display::Display;
use parse_display::FromStr;
use tracing::warn;

use crate::error::MavisError;
use crate::schedule::job::MailType;
use crate::schedule::scheduler::SchedulerKind;
use crate::util::ini::Document;
use crate::util::ini::Section;

const GENERAL_SECTION: &str = "general";
const CONVERT_SECTION: &str = "convert";
const REFERENCE_SECTION: &str = "reference";
const LIBRARY_SECTION_PREFIX: &str = "library:";

/// Marks a conversion entry as a built-in tool converter
const TOOL_CONVERSION_MARKER: &str = "convert_tool_output";

pub const REFERENCE_KEYS: [&str; 6] = [
    "annotations",
    "reference_genome",
    "masking",
    "template_metadata",
    "aligner_reference",
    "dgv_annotation",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromStr)]
#[display(style = "lowercase")]
pub enum Protocol {
    Genome,
    Transcriptome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromStr)]
#[display(style = "lowercase")]
pub enum DiseaseStatus {
    Diseased,
    Normal,
}

/// Thresholds forwarded to the summary worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct SummaryFilters {
    min_remapped_reads: u32,
    min_spanning_reads: u32,
    min_flanking_reads: u32,
    min_split_reads: u32,
    min_linking_split_reads: u32,
}

impl Default for SummaryFilters {
    fn default() -> Self {
        SummaryFilters {
            min_remapped_reads: 5,
            min_spanning_reads: 5,
            min_flanking_reads: 10,
            min_split_reads: 5,
            min_linking_split_reads: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Getters, CopyGetters)]
pub struct GeneralConfig {
    #[getset(get_copy = "pub")]
    scheduler: SchedulerKind,

    #[getset(get = "pub")]
    queue: Option<String>,

    /// Default memory in MB for cluster, pairing and summary jobs
    #[getset(get_copy = "pub")]
    memory_limit: u64,

    #[getset(get_copy = "pub")]
    validation_memory: u64,

    /// Validation memory for transcriptome libraries
    #[getset(get_copy = "pub")]
    trans_validation_memory: u64,

    #[getset(get_copy = "pub")]
    annotation_memory: u64,

    /// Wall time in seconds for every job
    #[getset(get_copy = "pub")]
    time_limit: u64,

    #[getset(get_copy = "pub")]
    concurrency_limit: Option<u32>,

    #[getset(get_copy = "pub")]
    import_env: bool,

    #[getset(get_copy = "pub")]
    mail_type: Option<MailType>,

    #[getset(get = "pub")]
    mail_user: Option<String>,

    #[getset(get_copy = "pub")]
    skip_validate: bool,

    #[getset(get_copy = "pub")]
    skip_pairing: bool,

    #[getset(get = "pub")]
    filters: SummaryFilters,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            scheduler: SchedulerKind::Slurm,
            queue: None,
            memory_limit: 16000,
            validation_memory: 16000,
            trans_validation_memory: 18000,
            annotation_memory: 12000,
            time_limit: 57600,
            concurrency_limit: None,
            import_env: true,
            mail_type: None,
            mail_user: None,
            skip_validate: false,
            skip_pairing: false,
            filters: SummaryFilters::default(),
        }
    }
}

/// Reference files passed through to the workers by name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceConfig {
    files: BTreeMap<String, PathBuf>,
}

impl ReferenceConfig {
    pub fn get(&self, key: &str) -> Option<&PathBuf> {
        self.files.get(key)
    }

    pub(crate) fn from_section(section: &Section) -> Result<Self> {
        let mut files = BTreeMap::new();
        for (key, value) in section.entries() {
            if !REFERENCE_KEYS.contains(&key) {
                return Err(anyhow!(MavisError::InvalidInput(format!(
                    "unknown reference file '{}'",
                    key
                ))));
            }
            if !value.is_empty() {
                files.insert(key.to_string(), PathBuf::from(value));
            }
        }
        Ok(ReferenceConfig { files })
    }
}

/// One entry of the `[convert]` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conversion {
    /// Built-in converter, run as `mavis convert`
    Tool {
        input: String,
        tool: String,
        stranded: bool,
    },
    /// Externally supplied command line, run through the shell with `-o`
    External { command: String },
}

impl Conversion {
    fn parse(alias: &str, value: &str) -> Result<Self> {
        let tokens: Vec<&str> = value.split_whitespace().collect();
        match tokens.as_slice() {
            [] => Err(anyhow!(MavisError::InvalidInput(format!(
                "conversion '{}' has no command",
                alias
            )))),
            [marker, input, tool, stranded] if *marker == TOOL_CONVERSION_MARKER => {
                let stranded = match stranded.to_lowercase().as_str() {
                    "true" | "1" | "yes" => true,
                    "false" | "0" | "no" => false,
                    other => {
                        return Err(anyhow!(MavisError::InvalidInput(format!(
                            "conversion '{}': cannot parse strandedness '{}'",
                            alias, other
                        ))))
                    }
                };
                Ok(Conversion::Tool {
                    input: input.to_string(),
                    tool: tool.to_string(),
                    stranded,
                })
            }
            [marker, ..] if *marker == TOOL_CONVERSION_MARKER => {
                Err(anyhow!(MavisError::InvalidInput(format!(
                    "conversion '{}' must be '{} <input> <tool> <stranded>'",
                    alias, TOOL_CONVERSION_MARKER
                ))))
            }
            _ => Ok(Conversion::External {
                command: value.trim().to_string(),
            }),
        }
    }

    fn render(&self) -> String {
        match self {
            Conversion::Tool {
                input,
                tool,
                stranded,
            } => format!("{} {} {} {}", TOOL_CONVERSION_MARKER, input, tool, stranded),
            Conversion::External { command } => command.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Getters, CopyGetters)]
pub struct LibraryConfig {
    #[getset(get = "pub")]
    name: String,

    #[getset(get_copy = "pub")]
    protocol: Protocol,

    #[getset(get_copy = "pub")]
    disease_status: DiseaseStatus,

    #[getset(get = "pub")]
    bam_file: PathBuf,

    #[getset(get_copy = "pub")]
    stranded_bam: bool,

    #[getset(get_copy = "pub")]
    read_length: u32,

    #[getset(get_copy = "pub")]
    median_fragment_size: u32,

    #[getset(get_copy = "pub")]
    stdev_fragment_size: f64,

    /// Raw input names: conversion aliases, plain paths or globs
    #[getset(get = "pub")]
    inputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Getters)]
#[getset(get = "pub")]
pub struct UserConfig {
    general: GeneralConfig,
    reference: ReferenceConfig,
    conversions: BTreeMap<String, Conversion>,
    libraries: Vec<LibraryConfig>,
}

impl UserConfig {
    pub fn read(path: &std::path::Path) -> Result<Self> {
        let document = Document::read(path)?;
        UserConfig::from_document(&document)
            .with_context(|| format!("Parsing configuration {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        UserConfig::from_document(&Document::parse(content)?)
    }

    fn from_document(document: &Document) -> Result<Self> {
        let general = GeneralConfig::from_section(document.section(GENERAL_SECTION))?;

        let reference = match document.section(REFERENCE_SECTION) {
            Some(section) => ReferenceConfig::from_section(section)?,
            None => ReferenceConfig::default(),
        };

        let mut conversions = BTreeMap::new();
        if let Some(section) = document.section(CONVERT_SECTION) {
            for (alias, value) in section.entries() {
                conversions.insert(alias.to_string(), Conversion::parse(alias, value)?);
            }
        }

        let mut libraries = Vec::new();
        for section in document.sections() {
            if let Some(name) = section.title().strip_prefix(LIBRARY_SECTION_PREFIX) {
                libraries.push(LibraryConfig::from_section(name, section)?);
            } else if ![GENERAL_SECTION, CONVERT_SECTION, REFERENCE_SECTION]
                .contains(&section.title())
            {
                warn!("Ignoring unknown configuration section [{}]", section.title());
            }
        }
        if libraries.is_empty() {
            return Err(anyhow!(MavisError::InvalidInput(
                "the configuration defines no [library:<name>] section".to_string()
            )));
        }

        Ok(UserConfig {
            general,
            reference,
            conversions,
            libraries,
        })
    }

    pub fn render(&self) -> String {
        let mut document = Document::new();

        let general = &self.general;
        let mut section = Section::new(GENERAL_SECTION);
        section.push("scheduler", general.scheduler.to_string());
        section.push("queue", general.queue.clone().unwrap_or_default());
        section.push("memory_limit", general.memory_limit.to_string());
        section.push("validation_memory", general.validation_memory.to_string());
        section.push(
            "trans_validation_memory",
            general.trans_validation_memory.to_string(),
        );
        section.push("annotation_memory", general.annotation_memory.to_string());
        section.push("time_limit", general.time_limit.to_string());
        section.push(
            "concurrency_limit",
            general
                .concurrency_limit
                .map(|c| c.to_string())
                .unwrap_or_default(),
        );
        section.push("import_env", general.import_env.to_string());
        section.push(
            "mail_type",
            general
                .mail_type
                .map(|m| m.to_string())
                .unwrap_or_default(),
        );
        section.push("mail_user", general.mail_user.clone().unwrap_or_default());
        section.push("skip_validate", general.skip_validate.to_string());
        section.push("skip_pairing", general.skip_pairing.to_string());
        section.push(
            "filter_min_remapped_reads",
            general.filters.min_remapped_reads.to_string(),
        );
        section.push(
            "filter_min_spanning_reads",
            general.filters.min_spanning_reads.to_string(),
        );
        section.push(
            "filter_min_flanking_reads",
            general.filters.min_flanking_reads.to_string(),
        );
        section.push(
            "filter_min_split_reads",
            general.filters.min_split_reads.to_string(),
        );
        section.push(
            "filter_min_linking_split_reads",
            general.filters.min_linking_split_reads.to_string(),
        );
        document.push(section);

        if !self.reference.files.is_empty() {
            let mut section = Section::new(REFERENCE_SECTION);
            for (key, path) in &self.reference.files {
                section.push(key.clone(), path.display().to_string());
            }
            document.push(section);
        }

        if !self.conversions.is_empty() {
            let mut section = Section::new(CONVERT_SECTION);
            for (alias, conversion) in &self.conversions {
                section.push(alias.clone(), conversion.render());
            }
            document.push(section);
        }

        for library in &self.libraries {
            let mut section =
                Section::new(format!("{}{}", LIBRARY_SECTION_PREFIX, library.name));
            section.push("protocol", library.protocol.to_string());
            section.push("disease_status", library.disease_status.to_string());
            section.push("bam_file", library.bam_file.display().to_string());
            section.push("stranded_bam", library.stranded_bam.to_string());
            section.push("read_length", library.read_length.to_string());
            section.push(
                "median_fragment_size",
                library.median_fragment_size.to_string(),
            );
            section.push(
                "stdev_fragment_size",
                library.stdev_fragment_size.to_string(),
            );
            section.push("inputs", library.inputs.join(";"));
            document.push(section);
        }

        document.render()
    }

    /// Used by the `config` subcommand to assemble a new configuration
    pub fn assemble(
        general: GeneralConfig,
        reference: ReferenceConfig,
        conversions: BTreeMap<String, Conversion>,
        libraries: Vec<LibraryConfig>,
    ) -> Result<Self> {
        if libraries.is_empty() {
            return Err(anyhow!(MavisError::InvalidInput(
                "at least one library is required".to_string()
            )));
        }
        Ok(UserConfig {
            general,
            reference,
            conversions,
            libraries,
        })
    }
}

impl GeneralConfig {
    pub fn with_scheduler(mut self, scheduler: SchedulerKind) -> Self {
        self.scheduler = scheduler;
        self
    }

    fn from_section(section: Option<&Section>) -> Result<Self> {
        let reader = SettingReader { section };
        let defaults = GeneralConfig::default();

        Ok(GeneralConfig {
            scheduler: reader.parse("scheduler", defaults.scheduler)?,
            queue: reader.get("queue"),
            memory_limit: reader.parse("memory_limit", defaults.memory_limit)?,
            validation_memory: reader
                .parse("validation_memory", defaults.validation_memory)?,
            trans_validation_memory: reader
                .parse("trans_validation_memory", defaults.trans_validation_memory)?,
            annotation_memory: reader
                .parse("annotation_memory", defaults.annotation_memory)?,
            time_limit: reader.parse("time_limit", defaults.time_limit)?,
            concurrency_limit: reader.parse_opt("concurrency_limit")?,
            import_env: reader.parse("import_env", defaults.import_env)?,
            mail_type: reader.parse_opt("mail_type")?,
            mail_user: reader.get("mail_user"),
            skip_validate: reader.parse("skip_validate", defaults.skip_validate)?,
            skip_pairing: reader.parse("skip_pairing", defaults.skip_pairing)?,
            filters: SummaryFilters {
                min_remapped_reads: reader.parse(
                    "filter_min_remapped_reads",
                    defaults.filters.min_remapped_reads,
                )?,
                min_spanning_reads: reader.parse(
                    "filter_min_spanning_reads",
                    defaults.filters.min_spanning_reads,
                )?,
                min_flanking_reads: reader.parse(
                    "filter_min_flanking_reads",
                    defaults.filters.min_flanking_reads,
                )?,
                min_split_reads: reader.parse(
                    "filter_min_split_reads",
                    defaults.filters.min_split_reads,
                )?,
                min_linking_split_reads: reader.parse(
                    "filter_min_linking_split_reads",
                    defaults.filters.min_linking_split_reads,
                )?,
            },
        })
    }
}

impl LibraryConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        protocol: Protocol,
        disease_status: DiseaseStatus,
        bam_file: PathBuf,
        stranded_bam: bool,
        read_length: u32,
        median_fragment_size: u32,
        stdev_fragment_size: f64,
        inputs: Vec<String>,
    ) -> Result<Self> {
        if name.is_empty() {
            return Err(anyhow!(MavisError::InvalidInput(
                "library names must not be empty".to_string()
            )));
        }
        if inputs.is_empty() {
            return Err(anyhow!(MavisError::InvalidInput(format!(
                "library '{}' has no inputs",
                name
            ))));
        }
        Ok(LibraryConfig {
            name,
            protocol,
            disease_status,
            bam_file,
            stranded_bam,
            read_length,
            median_fragment_size,
            stdev_fragment_size,
            inputs,
        })
    }

    fn from_section(name: &str, section: &Section) -> Result<Self> {
        fn required<'s>(section: &'s Section, name: &str, key: &str) -> Result<&'s str> {
            crate::util::ini::non_empty(section, key).ok_or_else(|| {
                anyhow!(MavisError::InvalidInput(format!(
                    "library '{}' is missing the required key '{}'",
                    name, key
                )))
            })
        }
        let parse = |key: &str, value: &str| {
            anyhow!(MavisError::InvalidInput(format!(
                "library '{}': cannot parse {} value '{}'",
                name, key, value
            )))
        };

        let protocol = required(section, name, "protocol")?;
        let disease_status = required(section, name, "disease_status")?;
        let stranded_bam = required(section, name, "stranded_bam")?;
        let read_length = required(section, name, "read_length")?;
        let median = required(section, name, "median_fragment_size")?;
        let stdev = required(section, name, "stdev_fragment_size")?;
        let bam_file = PathBuf::from(required(section, name, "bam_file")?);
        if !bam_file.is_file() {
            return Err(anyhow!(MavisError::InvalidInput(format!(
                "library '{}': bam file does not exist: {}",
                name,
                bam_file.display()
            ))));
        }

        LibraryConfig::new(
            name.to_string(),
            protocol
                .parse::<Protocol>()
                .map_err(|_| parse("protocol", protocol))?,
            disease_status
                .parse::<DiseaseStatus>()
                .map_err(|_| parse("disease_status", disease_status))?,
            bam_file,
            match stranded_bam.to_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => return Err(parse("stranded_bam", stranded_bam)),
            },
            read_length
                .parse::<u32>()
                .map_err(|_| parse("read_length", read_length))?,
            median
                .parse::<u32>()
                .map_err(|_| parse("median_fragment_size", median))?,
            stdev
                .parse::<f64>()
                .map_err(|_| parse("stdev_fragment_size", stdev))?,
            required(section, name, "inputs")?
                .split(';')
                .map(str::trim)
                .filter(|i| !i.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }
}

/// Reads `[general]` settings with `MAVIS_<KEY>` environment overrides
struct SettingReader<'a> {
    section: Option<&'a Section>,
}

impl<'a> SettingReader<'a> {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(format!("MAVIS_{}", key.to_uppercase()))
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| {
                self.section
                    .and_then(|s| s.get(key))
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            })
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: std::str::FromStr,
    {
        self.parse_opt(key).map(|v| v.unwrap_or(default))
    }

    fn parse_opt<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: std::str::FromStr,
    {
        match self.get(key) {
            Some(value) => value.parse::<T>().map(Some).map_err(|_| {
                anyhow!(MavisError::InvalidInput(format!(
                    "cannot parse {} value '{}'",
                    key, value
                )))
            }),
            None => Ok(None),
        }
    }
}
