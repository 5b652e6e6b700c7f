//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Rendering of task-index sets
//!
//! Contiguous runs collapse to `a-b`, isolated indices print bare and the
//! tokens are joined ascending: `{1,2,3,7,9,10,11}` renders as
//! `1-3, 7, 9-11`. Parsing is the exact inverse.

use std::collections::BTreeSet;

use anyhow::anyhow;
use anyhow::Result;
use itertools::Itertools;

use crate::error::MavisError;

pub fn convert_set_to_ranges(input: &BTreeSet<u32>) -> String {
    let mut ranges: Vec<(u32, u32)> = Vec::new();
    for current in input.iter().copied() {
        match ranges.last_mut() {
            Some((_, end)) if *end + 1 == current => *end = current,
            _ => ranges.push((current, current)),
        }
    }

    ranges
        .into_iter()
        .map(|(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{}-{}", start, end)
            }
        })
        .join(", ")
}

pub fn parse_ranges(input: &str) -> Result<BTreeSet<u32>> {
    let mut result = BTreeSet::new();
    for token in input.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        match token.split_once('-') {
            Some((start, end)) => {
                let start: u32 = parse_index(start)?;
                let end: u32 = parse_index(end)?;
                if start > end {
                    return Err(anyhow!(MavisError::InvalidInput(format!(
                        "descending task range '{}'",
                        token
                    ))));
                }
                result.extend(start..=end);
            }
            None => {
                result.insert(parse_index(token)?);
            }
        }
    }
    Ok(result)
}

fn parse_index(token: &str) -> Result<u32> {
    token.trim().parse::<u32>().map_err(|_| {
        anyhow!(MavisError::InvalidInput(format!(
            "expected a task index, got '{}'",
            token.trim()
        )))
    })
}
