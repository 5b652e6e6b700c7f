//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Completion checking
//!
//! The checker never talks to the scheduler. It walks the output tree,
//! reconciles completion stamps with worker logs per stage and per array
//! task, verifies the cross-stage stamp ordering and renders an indented
//! report. A pipeline counts as done only when every expected task is
//! COMPLETE and no ordering violation was found.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::anyhow;
use anyhow::Result;
use colored::Colorize;
use lazy_static::lazy_static;
use regex::Regex;

use crate::checker::logfile::LogDetails;
use crate::checker::logfile::LogStatus;
use crate::error::MavisError;
use crate::schedule::job::Stage;
use crate::util::dir_entries;
use crate::util::glob_dirs;
use crate::util::glob_files;
use crate::util::modified;
use crate::util::newest_file;
use crate::util::ranges::convert_set_to_ranges;

pub mod logfile;

/// Written by a successful worker next to its outputs
pub const COMPLETE_STAMP: &str = "MAVIS.COMPLETE";

const INDENT: &str = "  ";

lazy_static! {
    static ref LIBRARY_DIR: Regex =
        Regex::new(r"^[\w-]+_(diseased|normal)_(genome|transcriptome)$").unwrap();
    static ref TASK_ENTRY: Regex =
        Regex::new(r"^batch-[0-9a-zA-Z-]+-(\d+)(\.tab)?$").unwrap();
}

#[derive(Debug)]
pub struct CheckReport {
    /// True only when every expected task is complete and the stamp
    /// ordering holds
    pub success: bool,
    pub report: String,
}

/// Per-task reconciliation of stamp and log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskClass {
    Complete,
    Crash,
    Incomplete,
    /// logged complete but no stamp
    MissingStamp,
    /// stamped complete but no log
    MissingLog,
    NotStarted,
}

fn classify(stamped: bool, log: Option<&LogDetails>) -> TaskClass {
    match (stamped, log) {
        (true, Some(log)) => match log.status {
            LogStatus::Complete => TaskClass::Complete,
            LogStatus::Crash => TaskClass::Crash,
            LogStatus::Incomplete | LogStatus::Empty => TaskClass::Incomplete,
        },
        (false, Some(log)) => match log.status {
            LogStatus::Crash => TaskClass::Crash,
            LogStatus::Complete => TaskClass::MissingStamp,
            LogStatus::Incomplete | LogStatus::Empty => TaskClass::Incomplete,
        },
        (true, None) => TaskClass::MissingLog,
        (false, None) => TaskClass::NotStarted,
    }
}

#[derive(Debug, Default)]
struct StageOutcome {
    /// Every expected task classified COMPLETE
    all_complete: bool,
    /// Some expected runtime could not be recovered from the logs
    log_parse_error: bool,
    run_times: BTreeMap<Option<u32>, u64>,
    max_run_time: Option<u64>,
    total_run_time: Option<u64>,
    stamps: BTreeMap<Option<u32>, SystemTime>,
}

impl StageOutcome {
    fn missing() -> Self {
        StageOutcome {
            log_parse_error: true,
            ..StageOutcome::default()
        }
    }
}

struct StageCheck {
    stage: Stage,
    dir: PathBuf,
    /// Task indices seen among the directory entries
    observed: BTreeSet<u32>,
    /// Task indices that must be accounted for (union across the library)
    expected: BTreeSet<u32>,
    logs: BTreeMap<Option<u32>, LogDetails>,
    stamps: BTreeMap<Option<u32>, SystemTime>,
}

impl StageCheck {
    fn open(stage: Stage, dir: PathBuf) -> Option<StageCheck> {
        if !dir.is_dir() {
            return None;
        }
        let observed = dir_entries(&dir)
            .iter()
            .filter_map(|entry| entry.file_name().and_then(|n| n.to_str()))
            .filter_map(|name| TASK_ENTRY.captures(name))
            .filter_map(|captures| captures[1].parse::<u32>().ok())
            .collect();
        Some(StageCheck {
            stage,
            dir,
            observed,
            expected: BTreeSet::new(),
            logs: BTreeMap::new(),
            stamps: BTreeMap::new(),
        })
    }

    fn task_keys(&self) -> Vec<Option<u32>> {
        if self.stage.is_array() {
            self.expected.iter().map(|k| Some(*k)).collect()
        } else {
            vec![None]
        }
    }

    fn collect(&mut self) -> Result<()> {
        if self.stage.is_array() && self.expected.is_empty() {
            self.expected.insert(1);
        }
        for key in self.task_keys() {
            self.collect_stamp(key)?;
            self.collect_log(key)?;
        }
        Ok(())
    }

    fn collect_stamp(&mut self, task: Option<u32>) -> Result<()> {
        let stamp = match task {
            Some(task) => {
                // one task-indexed subdirectory holds the stamp; anything
                // ambiguous counts as missing
                let candidates: Vec<PathBuf> = glob_dirs(&self.dir, &format!("*-{}", task))
                    .into_iter()
                    .map(|subdir| subdir.join(COMPLETE_STAMP))
                    .filter(|stamp| stamp.is_file())
                    .collect();
                match candidates.as_slice() {
                    [stamp] => Some(stamp.clone()),
                    _ => None,
                }
            }
            None => Some(self.dir.join(COMPLETE_STAMP)).filter(|stamp| stamp.is_file()),
        };
        if let Some(stamp) = stamp {
            self.stamps.insert(task, modified(&stamp)?);
        }
        Ok(())
    }

    fn collect_log(&mut self, task: Option<u32>) -> Result<()> {
        let candidates = match task {
            Some(task) => {
                let scheduler_logs = glob_files(&self.dir, &format!("*.o*.{}", task));
                if !scheduler_logs.is_empty() {
                    scheduler_logs
                } else {
                    let mut task_logs = Vec::new();
                    for subdir in glob_dirs(&self.dir, &format!("*-{}", task)) {
                        task_logs.extend(glob_files(&subdir, "*.log"));
                    }
                    if !task_logs.is_empty() {
                        task_logs
                    } else {
                        // manual-run fallback
                        glob_files(&self.dir, "*.log")
                    }
                }
            }
            None => {
                let scheduler_logs = glob_files(&self.dir, "*.o*");
                if !scheduler_logs.is_empty() {
                    scheduler_logs
                } else {
                    glob_files(&self.dir, "*.log")
                }
            }
        };
        if let Some(newest) = newest_file(candidates) {
            self.logs.insert(task, LogDetails::read(&newest)?);
        }
        Ok(())
    }

    fn report(&self, out: &mut String, indent_level: usize) -> StageOutcome {
        let indent = INDENT.repeat(indent_level);
        let detail = INDENT.repeat(indent_level + 1);
        let keys = self.task_keys();

        let mut classes: BTreeMap<Option<u32>, TaskClass> = BTreeMap::new();
        for key in &keys {
            classes.insert(
                *key,
                classify(self.stamps.contains_key(key), self.logs.get(key)),
            );
        }
        let with_class = |class: TaskClass| -> BTreeSet<u32> {
            classes
                .iter()
                .filter(|(_, c)| **c == class)
                .filter_map(|(k, _)| *k)
                .collect()
        };

        let mut outcome = StageOutcome::default();
        for key in &keys {
            if let Some(run_time) = self.logs.get(key).and_then(|l| l.run_time) {
                if classes[key] == TaskClass::Complete {
                    outcome.run_times.insert(*key, run_time);
                }
            }
        }
        outcome.all_complete = classes.values().all(|c| *c == TaskClass::Complete);
        outcome.log_parse_error = keys.iter().any(|k| !outcome.run_times.contains_key(k));
        outcome.stamps = self.stamps.clone();
        if !outcome.run_times.is_empty() {
            let total: u64 = outcome.run_times.values().sum();
            outcome.max_run_time = outcome.run_times.values().max().copied();
            outcome.total_run_time = Some(total);
        }

        if outcome.all_complete {
            let _ = writeln!(out, "{}{} {}", indent, self.stage, "OK".green());
            match (outcome.max_run_time, outcome.total_run_time) {
                (Some(max), Some(total)) if self.stage.is_array() => {
                    let average =
                        (total as f64 / outcome.run_times.len() as f64).round() as u64;
                    let _ = writeln!(
                        out,
                        "{}run time (s): {} (max), {} (total), {} (average)",
                        detail, max, total, average
                    );
                }
                (Some(max), Some(_)) => {
                    let _ = writeln!(out, "{}run time (s): {}", detail, max);
                }
                _ => {
                    let _ = writeln!(
                        out,
                        "{}error parsing run-times from the log files",
                        detail
                    );
                }
            }
            return outcome;
        }

        let _ = writeln!(out, "{}{} {}", indent, self.stage, "FAIL".red());

        let sections: [(TaskClass, &str, &str); 5] = [
            (
                TaskClass::MissingLog,
                "stamped complete but missing log files",
                "job stamped complete but missing log file",
            ),
            (
                TaskClass::MissingStamp,
                "logged complete but missing stamp",
                "job logged complete but missing complete stamp",
            ),
            (
                TaskClass::NotStarted,
                "not started (no log/stamp)",
                "job not started (no log/stamp)",
            ),
            (
                TaskClass::Incomplete,
                "running, incomplete without errors",
                "job running, incomplete without errors",
            ),
            (TaskClass::Crash, "CRASHED", "job CRASHED"),
        ];

        if self.stage.is_array() {
            for (class, plural, _) in sections {
                let tasks = with_class(class);
                if tasks.is_empty() {
                    continue;
                }
                let _ = writeln!(
                    out,
                    "{}{} tasks {} (tasks: {})",
                    detail,
                    tasks.len(),
                    plural,
                    convert_set_to_ranges(&tasks)
                );
                if class == TaskClass::Crash {
                    // group the crashed tasks by their failure message
                    let mut by_message: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();
                    for task in tasks {
                        let message = self
                            .logs
                            .get(&Some(task))
                            .and_then(|l| l.message.clone())
                            .unwrap_or_default();
                        by_message.entry(message).or_default().insert(task);
                    }
                    for (message, tasks) in by_message {
                        let _ = writeln!(
                            out,
                            "{}{}{} (tasks: {})",
                            detail,
                            INDENT,
                            message,
                            convert_set_to_ranges(&tasks)
                        );
                    }
                }
            }
        } else {
            let class = classes[&None];
            for (candidate, _, singular) in sections {
                if class != candidate {
                    continue;
                }
                if candidate == TaskClass::Crash {
                    let message = self
                        .logs
                        .get(&None)
                        .and_then(|l| l.message.clone())
                        .unwrap_or_default();
                    let _ = writeln!(out, "{}{}: {}", detail, singular, message);
                } else {
                    let _ = writeln!(out, "{}{}", detail, singular);
                }
            }
            if class == TaskClass::Incomplete {
                if let Some(last_modified) =
                    self.logs.get(&None).and_then(|l| l.last_modified)
                {
                    let timestamp: chrono::DateTime<chrono::Local> = last_modified.into();
                    let _ = writeln!(
                        out,
                        "{}last modified on: {}",
                        detail,
                        timestamp.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
        }
        outcome
    }
}

#[derive(Debug, Default, Clone)]
struct LibraryStamps {
    name: String,
    cluster: Option<SystemTime>,
    validate: BTreeMap<u32, SystemTime>,
    annotate: BTreeMap<u32, SystemTime>,
}

struct LibraryCheck {
    name: String,
    cluster: Option<StageCheck>,
    validate: Option<StageCheck>,
    annotate: Option<StageCheck>,
}

#[derive(Debug, Default)]
struct LibraryOutcome {
    all_complete: bool,
    log_parse_error: bool,
    /// cluster + max over tasks of validate+annotate
    parallel_run_time: u64,
    /// cluster + sum over tasks of validate+annotate
    total_run_time: u64,
    stamps: LibraryStamps,
}

impl LibraryCheck {
    fn open(name: String, dir: &Path) -> LibraryCheck {
        LibraryCheck {
            cluster: StageCheck::open(Stage::Cluster, dir.join(Stage::Cluster.to_string())),
            validate: StageCheck::open(Stage::Validate, dir.join(Stage::Validate.to_string())),
            annotate: StageCheck::open(Stage::Annotate, dir.join(Stage::Annotate.to_string())),
            name,
        }
    }

    fn report(&mut self, out: &mut String) -> Result<LibraryOutcome> {
        let _ = writeln!(out, "checking library: {}", self.name);
        let mut outcome = LibraryOutcome {
            all_complete: true,
            stamps: LibraryStamps {
                name: self.name.clone(),
                ..LibraryStamps::default()
            },
            ..LibraryOutcome::default()
        };

        // a task index seen by any stage is expected from every stage
        let mut union = BTreeSet::new();
        for stage in [&self.cluster, &self.validate, &self.annotate]
            .into_iter()
            .flatten()
        {
            union.extend(stage.observed.iter().copied());
        }
        for stage in [&mut self.validate, &mut self.annotate].into_iter().flatten() {
            stage.expected = union.clone();
        }

        let cluster = report_stage(&mut self.cluster, Stage::Cluster, out, &mut outcome)?;
        outcome.stamps.cluster = cluster.stamps.get(&None).copied();
        let cluster_run_time = match cluster.max_run_time {
            Some(run_time) => run_time,
            None => {
                outcome.log_parse_error = true;
                0
            }
        };

        let validate = match self.validate.as_mut() {
            Some(stage) => {
                stage.collect()?;
                let stage_outcome = stage.report(out, 1);
                outcome.all_complete &= stage_outcome.all_complete;
                outcome.log_parse_error |= stage_outcome.log_parse_error;
                Some(stage_outcome)
            }
            None => {
                let _ = writeln!(out, "{}validate skipped (no directory)", INDENT);
                None
            }
        };
        let annotate = report_stage(&mut self.annotate, Stage::Annotate, out, &mut outcome)?;

        if let Some(validate) = &validate {
            for (task, time) in &validate.stamps {
                if let Some(task) = task {
                    outcome.stamps.validate.insert(*task, *time);
                }
            }
        }
        for (task, time) in &annotate.stamps {
            if let Some(task) = task {
                outcome.stamps.annotate.insert(*task, *time);
            }
        }

        // per-task chain time: validate[k] + annotate[k] (annotate only when
        // validation was skipped)
        let mut chain_times = Vec::new();
        for task in &union {
            let annotate_time = annotate.run_times.get(&Some(*task)).copied();
            let chained = match &validate {
                Some(validate) => validate
                    .run_times
                    .get(&Some(*task))
                    .copied()
                    .zip(annotate_time)
                    .map(|(v, a)| v + a),
                None => annotate_time,
            };
            match chained {
                Some(time) => chain_times.push(time),
                None => outcome.log_parse_error = true,
            }
        }
        outcome.parallel_run_time =
            cluster_run_time + chain_times.iter().max().copied().unwrap_or(0);
        outcome.total_run_time = cluster_run_time + chain_times.iter().sum::<u64>();
        Ok(outcome)
    }
}

/// Report a stage that must exist; a missing directory fails the library
fn report_stage(
    stage: &mut Option<StageCheck>,
    name: Stage,
    out: &mut String,
    outcome: &mut LibraryOutcome,
) -> Result<StageOutcome> {
    match stage.as_mut() {
        Some(stage) => {
            stage.collect()?;
            let stage_outcome = stage.report(out, 1);
            outcome.all_complete &= stage_outcome.all_complete;
            outcome.log_parse_error |= stage_outcome.log_parse_error;
            Ok(stage_outcome)
        }
        None => {
            let _ = writeln!(out, "{}{} {}", INDENT, name, "FAIL".red());
            let _ = writeln!(out, "{}missing stage directory", INDENT.repeat(2));
            outcome.all_complete = false;
            Ok(StageOutcome::missing())
        }
    }
}

/// Stamp-ordering verification: cluster <= validate <= matching annotate,
/// libraries <= pairing <= summary. Violations are reported, they do not
/// change the per-task classification.
fn ordering_errors(
    libraries: &[LibraryStamps],
    pairing: Option<SystemTime>,
    summary: Option<SystemTime>,
) -> Vec<String> {
    let mut errors = Vec::new();
    for library in libraries {
        if let Some(cluster) = library.cluster {
            if library.validate.values().any(|stamp| *stamp < cluster) {
                errors.push(format!(
                    "** ERROR: {}: the clustering completion stamp must precede the \
                     validation completion stamps",
                    library.name
                ));
            }
        }
        for (task, validate_stamp) in &library.validate {
            if let Some(annotate_stamp) = library.annotate.get(task) {
                if annotate_stamp < validate_stamp {
                    errors.push(format!(
                        "** ERROR: {}: the validation completion stamp of task {} is \
                         newer than its annotation completion stamp",
                        library.name, task
                    ));
                }
            }
        }
    }

    let library_last = libraries
        .iter()
        .flat_map(|library| {
            library
                .validate
                .values()
                .chain(library.annotate.values())
                .chain(library.cluster.iter())
        })
        .max()
        .copied();
    if let (Some(pairing), Some(library_last)) = (pairing, library_last) {
        if pairing < library_last {
            errors.push(
                "** ERROR: the pairing completion stamp is older than the library \
                 completion stamps"
                    .to_string(),
            );
        }
    }
    if let (Some(summary), Some(pairing)) = (summary, pairing) {
        if summary < pairing {
            errors.push(
                "** ERROR: the summary completion stamp is older than the pairing \
                 completion stamp"
                    .to_string(),
            );
        }
    }
    errors
}

/// Walk the output tree and produce the completion report
pub fn check_completion(output: &Path) -> Result<CheckReport> {
    if !output.is_dir() {
        return Err(anyhow!(MavisError::InvalidInput(format!(
            "expected the pipeline output directory, {} is not a directory",
            output.display()
        ))));
    }

    let mut report = String::new();
    let mut libraries = Vec::new();
    let mut pairing = None;
    let mut summary = None;

    for entry in dir_entries(output) {
        let name = entry
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        if entry.is_dir() && name == Stage::Pairing.to_string() {
            pairing = StageCheck::open(Stage::Pairing, entry);
        } else if entry.is_dir() && name == Stage::Summary.to_string() {
            summary = StageCheck::open(Stage::Summary, entry);
        } else if entry.is_dir() && LIBRARY_DIR.is_match(&name) {
            libraries.push(LibraryCheck::open(name, &entry));
        } else {
            let _ = writeln!(report, "ignoring {}", entry.display());
        }
    }

    let mut all_complete = true;
    let mut log_parse_error = false;
    let mut parallel_run_time = 0u64;
    let mut total_run_time = 0u64;
    let mut library_stamps = Vec::new();

    for library in libraries.iter_mut() {
        let outcome = library.report(&mut report)?;
        all_complete &= outcome.all_complete;
        log_parse_error |= outcome.log_parse_error;
        parallel_run_time = parallel_run_time.max(outcome.parallel_run_time);
        total_run_time += outcome.total_run_time;
        library_stamps.push(outcome.stamps);
    }
    if libraries.is_empty() {
        let _ = writeln!(report, "no library directories found");
        all_complete = false;
    }

    let mut singleton = |stage: Stage, check: Option<StageCheck>| -> Result<Option<SystemTime>> {
        match check {
            Some(mut check) => {
                check.collect()?;
                let outcome = check.report(&mut report, 0);
                all_complete &= outcome.all_complete;
                log_parse_error |= outcome.log_parse_error;
                let run_time = outcome.max_run_time.unwrap_or(0);
                parallel_run_time += run_time;
                total_run_time += run_time;
                Ok(outcome.stamps.get(&None).copied())
            }
            None => {
                let _ = writeln!(report, "{} {}", stage, "FAIL".red());
                let _ = writeln!(report, "{}job not started (no log/stamp)", INDENT);
                all_complete = false;
                log_parse_error = true;
                Ok(None)
            }
        }
    };
    let pairing_stamp = singleton(Stage::Pairing, pairing)?;
    let summary_stamp = singleton(Stage::Summary, summary)?;

    let errors = ordering_errors(&library_stamps, pairing_stamp, summary_stamp);
    for error in &errors {
        let _ = writeln!(report, "{}", error);
    }

    let prefix = if log_parse_error { "min " } else { "" };
    let _ = writeln!(report, "{}parallel run time (s): {}", prefix, parallel_run_time);
    let _ = writeln!(report, "{}total run time (s): {}", prefix, total_run_time);

    Ok(CheckReport {
        success: all_complete && errors.is_empty(),
        report,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const BATCH: &str = "batch-aB3x";

    fn stamp(dir: &Path) {
        std::fs::write(dir.join(COMPLETE_STAMP), "").unwrap();
    }

    fn complete_single_stage(dir: &Path, run_time: u64) {
        std::fs::create_dir_all(dir).unwrap();
        stamp(dir);
        std::fs::write(
            dir.join("job.o100"),
            format!("working\nrun time (s): {}\n", run_time),
        )
        .unwrap();
    }

    fn library_dir(output: &Path) -> PathBuf {
        let dir = output.join("K562_diseased_genome");
        for stage in ["cluster", "validate", "annotate"] {
            std::fs::create_dir_all(dir.join(stage)).unwrap();
        }
        dir
    }

    fn complete_task(stage_dir: &Path, task: u32, run_time: u64) {
        let task_dir = stage_dir.join(format!("{}-{}", BATCH, task));
        std::fs::create_dir_all(&task_dir).unwrap();
        stamp(&task_dir);
        std::fs::write(
            task_dir.join("job.log"),
            format!("working\nrun time (s): {}\n", run_time),
        )
        .unwrap();
    }

    #[test]
    fn test_complete_pipeline_reports_success() {
        let tmp = tempfile::tempdir().unwrap();
        let output = tmp.path();
        let lib = library_dir(output);

        let cluster = lib.join("cluster");
        complete_single_stage(&cluster, 120);
        for task in 1..=2 {
            std::fs::write(cluster.join(format!("{}-{}.tab", BATCH, task)), "").unwrap();
            complete_task(&lib.join("validate"), task, 40 + task as u64);
            complete_task(&lib.join("annotate"), task, 10);
        }
        complete_single_stage(&output.join("pairing"), 30);
        complete_single_stage(&output.join("summary"), 10);

        let result = check_completion(output).unwrap();
        assert!(result.success, "report:\n{}", result.report);
        assert!(result.report.contains("checking library: K562_diseased_genome"));
        // library parallel: 120 + max(42+10, 41+10) = 172, plus 30 + 10
        assert!(result.report.contains("parallel run time (s): 212"));
        assert!(!result.report.contains("min parallel"));
        // library total: 120 + 51 + 52 = 223, plus 40
        assert!(result.report.contains("total run time (s): 263"));
    }

    #[test]
    fn test_checker_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        let output = tmp.path();
        let lib = library_dir(output);
        complete_single_stage(&lib.join("cluster"), 5);
        complete_single_stage(&output.join("pairing"), 1);
        complete_single_stage(&output.join("summary"), 1);

        let first = check_completion(output).unwrap();
        let second = check_completion(output).unwrap();
        assert_eq!(first.report, second.report);
    }

    #[test]
    fn test_crash_detection_across_tasks() {
        let tmp = tempfile::tempdir().unwrap();
        let output = tmp.path();
        let lib = library_dir(output);

        let cluster = lib.join("cluster");
        complete_single_stage(&cluster, 120);
        for task in 1..=3 {
            std::fs::write(cluster.join(format!("{}-{}.tab", BATCH, task)), "").unwrap();
        }

        let validate = lib.join("validate");
        // task 1: stamp and a log ending in the runtime marker
        complete_task(&validate, 1, 42);
        // task 2: crashed, log but no stamp
        let task2 = validate.join(format!("{}-2", BATCH));
        std::fs::create_dir_all(&task2).unwrap();
        std::fs::write(task2.join("job.log"), "working\nERROR: segfault\n").unwrap();
        // task 3: nothing at all

        complete_single_stage(&output.join("pairing"), 30);
        complete_single_stage(&output.join("summary"), 10);

        let result = check_completion(output).unwrap();
        assert!(!result.success);
        assert!(result.report.contains("1 tasks CRASHED (tasks: 2)"));
        assert!(result.report.contains("ERROR: segfault (tasks: 2)"));
        assert!(
            result.report.contains("not started (no log/stamp) (tasks: 3)"),
            "report:\n{}",
            result.report
        );
        // the crashed pipeline still renders bounded runtimes
        assert!(result.report.contains("min parallel run time (s):"));
    }

    #[test]
    fn test_expected_tasks_are_the_union_of_observed() {
        let tmp = tempfile::tempdir().unwrap();
        let output = tmp.path();
        let lib = library_dir(output);
        complete_single_stage(&lib.join("cluster"), 1);

        // annotate knows about task 2 even though cluster shows no partitions
        complete_task(&lib.join("annotate"), 2, 5);
        complete_single_stage(&output.join("pairing"), 1);
        complete_single_stage(&output.join("summary"), 1);

        let result = check_completion(output).unwrap();
        assert!(!result.success);
        // validate must account for the task annotate observed
        assert!(
            result
                .report
                .contains("1 tasks not started (no log/stamp) (tasks: 2)"),
            "report:\n{}",
            result.report
        );
    }

    #[test]
    fn test_unknown_entries_are_noticed() {
        let tmp = tempfile::tempdir().unwrap();
        let output = tmp.path();
        library_dir(output);
        std::fs::create_dir_all(output.join("scratch")).unwrap();

        let result = check_completion(output).unwrap();
        assert!(result.report.contains("ignoring"));
        assert!(result.report.contains("scratch"));
    }

    #[test]
    fn test_ordering_errors() {
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let later = |offset: u64| base + Duration::from_secs(offset);

        let good = LibraryStamps {
            name: "K562_diseased_genome".to_string(),
            cluster: Some(base),
            validate: [(1, later(10))].into_iter().collect(),
            annotate: [(1, later(20))].into_iter().collect(),
        };
        assert!(ordering_errors(&[good.clone()], Some(later(30)), Some(later(40))).is_empty());

        let cluster_late = LibraryStamps {
            name: "K562_diseased_genome".to_string(),
            cluster: Some(later(15)),
            validate: [(1, later(10))].into_iter().collect(),
            annotate: [(1, later(20))].into_iter().collect(),
        };
        let errors = ordering_errors(&[cluster_late], None, None);
        assert_eq!(1, errors.len());
        assert!(errors[0].contains("clustering completion stamp"));

        let annotate_early = LibraryStamps {
            name: "K562_diseased_genome".to_string(),
            cluster: Some(base),
            validate: [(1, later(20))].into_iter().collect(),
            annotate: [(1, later(10))].into_iter().collect(),
        };
        let errors = ordering_errors(&[annotate_early], None, None);
        assert!(errors[0].contains("task 1"));

        let errors = ordering_errors(&[good.clone()], Some(later(5)), Some(later(2)));
        assert_eq!(2, errors.len());
        assert!(errors[0].contains("pairing completion stamp"));
        assert!(errors[1].contains("summary completion stamp"));
    }
}
