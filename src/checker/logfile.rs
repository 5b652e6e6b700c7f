//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Worker log classification
//!
//! The log contract is simple: a worker that finishes prints a
//! `run time (s): <seconds>` line among its last lines, a worker that dies
//! leaves something containing `error` on its final line.

use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::Context;
use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref RUN_TIME: Regex = Regex::new(r"^\s*run time \(s\): (\d+)\s*$").unwrap();
}

/// How many trailing lines are searched for the runtime marker
const RUN_TIME_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStatus {
    Empty,
    Crash,
    Incomplete,
    Complete,
}

#[derive(Debug, Clone)]
pub struct LogDetails {
    pub filename: PathBuf,
    pub status: LogStatus,
    /// The final line, for crashed and incomplete logs
    pub message: Option<String>,
    pub run_time: Option<u64>,
    /// Filled for incomplete logs, the job may still be running
    pub last_modified: Option<SystemTime>,
}

impl LogDetails {
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Reading log file {}", path.display()))?;
        let lines: Vec<&str> = content.lines().collect();

        let mut details = LogDetails {
            filename: path.to_path_buf(),
            status: LogStatus::Empty,
            message: None,
            run_time: None,
            last_modified: None,
        };

        let last = match lines.last() {
            Some(last) => *last,
            None => return Ok(details),
        };

        if last.to_lowercase().contains("error") {
            details.status = LogStatus::Crash;
            details.message = Some(last.trim().to_string());
            return Ok(details);
        }

        let window = lines.len().saturating_sub(RUN_TIME_WINDOW);
        let run_time = lines[window..]
            .iter()
            .find_map(|line| RUN_TIME.captures(line))
            .and_then(|captures| captures[1].parse::<u64>().ok());

        match run_time {
            Some(run_time) => {
                details.status = LogStatus::Complete;
                details.run_time = Some(run_time);
            }
            None => {
                details.status = LogStatus::Incomplete;
                details.message = Some(last.trim().to_string());
                details.last_modified = crate::util::modified(path).ok();
            }
        }
        Ok(details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_log(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.log");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_empty_log() {
        let (_dir, path) = write_log("");
        assert_eq!(LogStatus::Empty, LogDetails::read(&path).unwrap().status);
    }

    #[test]
    fn test_single_error_line_is_a_crash() {
        let (_dir, path) = write_log("ERROR: segfault\n");
        let details = LogDetails::read(&path).unwrap();
        assert_eq!(LogStatus::Crash, details.status);
        assert_eq!(Some("ERROR: segfault"), details.message.as_deref());
    }

    #[test]
    fn test_crash_detection_is_case_insensitive() {
        let (_dir, path) = write_log("all good\nTraceback\nValueError: bad breakpoint\n");
        assert_eq!(LogStatus::Crash, LogDetails::read(&path).unwrap().status);
    }

    #[test]
    fn test_complete_with_runtime() {
        let (_dir, path) = write_log("step 1\nstep 2\nrun time (s): 42\n");
        let details = LogDetails::read(&path).unwrap();
        assert_eq!(LogStatus::Complete, details.status);
        assert_eq!(Some(42), details.run_time);
    }

    #[test]
    fn test_zero_runtime_is_complete() {
        let (_dir, path) = write_log("run time (s): 0\n");
        let details = LogDetails::read(&path).unwrap();
        assert_eq!(LogStatus::Complete, details.status);
        assert_eq!(Some(0), details.run_time);
    }

    #[test]
    fn test_runtime_outside_window_is_incomplete() {
        let mut content = String::from("run time (s): 42\n");
        for i in 0..12 {
            content.push_str(&format!("later line {}\n", i));
        }
        let (_dir, path) = write_log(&content);
        let details = LogDetails::read(&path).unwrap();
        assert_eq!(LogStatus::Incomplete, details.status);
        assert!(details.last_modified.is_some());
        assert_eq!(Some("later line 11"), details.message.as_deref());
    }

    #[test]
    fn test_runtime_line_must_match_exactly() {
        let (_dir, path) = write_log("total run time (s): 42 approximately\n");
        assert_eq!(
            LogStatus::Incomplete,
            LogDetails::read(&path).unwrap().status
        );
    }
}
