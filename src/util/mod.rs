//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use regex::Regex;
use walkdir::WalkDir;

use crate::error::MavisError;

pub mod ini;
pub mod process;
pub mod ranges;

/// Format a duration in seconds the way schedulers expect wall-time: `H:MM:SS`
pub fn format_elapsed(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    format!("{}:{:02}:{:02}", hours, minutes, secs)
}

/// Compile a shell-style glob (only `*` is special) into an anchored regex
pub fn glob_regex(pattern: &str) -> Regex {
    let escaped = pattern
        .split('*')
        .map(|part| regex::escape(part))
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{}$", escaped)).expect("escaped glob is a valid regex")
}

/// The direct children of a directory, sorted by name
///
/// A missing directory is not an error, it simply has no children.
pub fn dir_entries(dir: &Path) -> Vec<PathBuf> {
    let mut entries: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .collect();
    entries.sort();
    entries
}

/// All files in `dir` whose name matches `pattern` (shell-style glob)
pub fn glob_files(dir: &Path, pattern: &str) -> Vec<PathBuf> {
    let re = glob_regex(pattern);
    dir_entries(dir)
        .into_iter()
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| re.is_match(n))
                .unwrap_or(false)
        })
        .collect()
}

/// All directories in `dir` whose name matches `pattern` (shell-style glob)
pub fn glob_dirs(dir: &Path, pattern: &str) -> Vec<PathBuf> {
    let re = glob_regex(pattern);
    dir_entries(dir)
        .into_iter()
        .filter(|p| p.is_dir())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| re.is_match(n))
                .unwrap_or(false)
        })
        .collect()
}

/// Expand a user-supplied input path that may contain a glob in its file name
///
/// A plain path expands to itself if the file exists. The expansion must
/// yield at least one file.
pub fn expand_glob(pattern: &str) -> Result<Vec<PathBuf>> {
    let path = PathBuf::from(pattern);
    let expanded = if pattern.contains('*') {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("Glob pattern has no file name: {}", pattern))?
            .to_string();
        glob_files(&parent, &name)
    } else if path.is_file() {
        vec![path]
    } else {
        Vec::new()
    };

    if expanded.is_empty() {
        return Err(anyhow!(MavisError::InvalidInput(format!(
            "input file does not exist: {}",
            pattern
        ))));
    }
    Ok(expanded)
}

/// Pick the most recently modified of a set of files
pub fn newest_file(candidates: Vec<PathBuf>) -> Option<PathBuf> {
    candidates
        .into_iter()
        .max_by_key(|p| modified(p).unwrap_or(SystemTime::UNIX_EPOCH))
}

pub fn modified(path: &Path) -> Result<SystemTime> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .with_context(|| format!("Reading modification time of {}", path.display()))
}

/// Write a file atomically: write to a temporary sibling, then rename over
/// the target
pub fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)
        .with_context(|| format!("Writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Renaming {} to {}", tmp.display(), path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!("1:00:00", format_elapsed(3600));
        assert_eq!("0:00:00", format_elapsed(0));
        assert_eq!("16:00:00", format_elapsed(57600));
        assert_eq!("2:05:09", format_elapsed(2 * 3600 + 5 * 60 + 9));
    }

    #[test]
    fn test_glob_regex() {
        let re = glob_regex("*.o*.3");
        assert!(re.is_match("validate_K562.o1234.3"));
        assert!(!re.is_match("validate_K562.o1234.31"));
        assert!(!re.is_match("validate_K562.log"));

        let re = glob_regex("batch-*.tab");
        assert!(re.is_match("batch-aX9-1.tab"));
        assert!(!re.is_match("batch-aX9-1.tab.bak"));
    }

    #[test]
    fn test_glob_files_and_newest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.log"), "x").unwrap();
        std::fs::write(dir.path().join("b.log"), "x").unwrap();
        std::fs::write(dir.path().join("c.txt"), "x").unwrap();

        let matches = glob_files(dir.path(), "*.log");
        assert_eq!(2, matches.len());
        assert!(newest_file(matches).is_some());
    }

    #[test]
    fn test_expand_glob_missing_file() {
        assert!(expand_glob("/nonexistent/input.tab").is_err());
    }

    #[test]
    fn test_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("build.cfg");
        atomic_write(&target, "content").unwrap();
        assert_eq!("content", std::fs::read_to_string(&target).unwrap());
        assert!(!target.with_extension("tmp").exists());
    }
}
