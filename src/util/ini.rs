//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Sectioned key-value files
//!
//! Both the user configuration and the build manifest are plain text files
//! made of `[section]` titles followed by `key = value` lines. The writer is
//! deterministic so that re-serializing an unchanged document yields
//! byte-identical output.

use std::path::Path;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;

use crate::error::MavisError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    title: String,
    entries: Vec<(String, String)>,
}

impl Section {
    pub fn new<S: Into<String>>(title: S) -> Self {
        Section {
            title: title.into(),
            entries: Vec::new(),
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn push<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.entries.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    sections: Vec<Section>,
}

impl Document {
    pub fn new() -> Self {
        Document::default()
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Reading {}", path.display()))?;
        Document::parse(&content).with_context(|| format!("Parsing {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut sections: Vec<Section> = Vec::new();

        for (lineno, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') {
                let title = line
                    .strip_prefix('[')
                    .and_then(|l| l.strip_suffix(']'))
                    .ok_or_else(|| {
                        MavisError::InvalidInput(format!(
                            "malformed section title on line {}: '{}'",
                            lineno + 1,
                            raw
                        ))
                    })?
                    .trim();
                if sections.iter().any(|s| s.title() == title) {
                    return Err(anyhow!(MavisError::InvalidInput(format!(
                        "duplicate section '{}' on line {}",
                        title,
                        lineno + 1
                    ))));
                }
                sections.push(Section::new(title));
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                MavisError::InvalidInput(format!(
                    "expected 'key = value' on line {}: '{}'",
                    lineno + 1,
                    raw
                ))
            })?;
            let section = sections.last_mut().ok_or_else(|| {
                MavisError::InvalidInput(format!(
                    "entry before any section on line {}: '{}'",
                    lineno + 1,
                    raw
                ))
            })?;
            section.push(key.trim(), value.trim());
        }

        Ok(Document { sections })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            out.push('[');
            out.push_str(section.title());
            out.push_str("]\n");
            for (key, value) in section.entries() {
                out.push_str(key);
                out.push_str(" = ");
                out.push_str(value);
                out.push('\n');
            }
            out.push('\n');
        }
        out
    }

    pub fn push(&mut self, section: Section) {
        self.sections.push(section);
    }

    pub fn section(&self, title: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.title() == title)
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter()
    }
}

/// The value for `key`, unless it is absent or empty
pub fn non_empty<'s>(section: &'s Section, key: &str) -> Option<&'s str> {
    section.get(key).filter(|v| !v.is_empty())
}

pub fn parse_opt<T: std::str::FromStr>(section: &Section, key: &str) -> Result<Option<T>> {
    match non_empty(section, key) {
        Some(value) => value.parse::<T>().map(Some).map_err(|_| {
            anyhow!(MavisError::InvalidInput(format!(
                "cannot parse {} value '{}'",
                key, value
            )))
        }),
        None => Ok(None),
    }
}

pub fn parse_bool(section: &Section, key: &str, default: bool) -> Result<bool> {
    match non_empty(section, key) {
        Some(value) => match value.to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(anyhow!(MavisError::InvalidInput(format!(
                "cannot parse {} value '{}' as a boolean",
                key, value
            )))),
        },
        None => Ok(default),
    }
}
