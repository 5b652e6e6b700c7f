//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! SLURM back-end
//!
//! Command construction for `sbatch` and parsers for the `sacct` accounting
//! and `scontrol show job` outputs. SLURM docs: https://slurm.schedmd.com

use std::collections::BTreeMap;

use anyhow::anyhow;
use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;

use crate::error::MavisError;
use crate::schedule::job::Job;
use crate::schedule::job::JobStatus;
use crate::schedule::scheduler::render_stdout;
use crate::schedule::scheduler::PollRow;
use crate::util::format_elapsed;

lazy_static! {
    static ref SUBMIT_RESPONSE: Regex =
        Regex::new(r"(?i)^submitted batch job (\d+)$").unwrap();
}

pub(crate) fn submit_command(
    job: &Job,
    dependency_args: &[String],
    task_ident: Option<u32>,
) -> Vec<String> {
    let mut command = vec!["sbatch".to_string()];
    if let Some(queue) = job.queue() {
        command.push(format!("--partition={}", queue));
    }
    if let Some(memory) = job.memory_limit() {
        command.push("--mem".to_string());
        command.push(memory.to_string());
    }
    if let Some(time) = job.time_limit() {
        command.push("-t".to_string());
        command.push(format_elapsed(time));
    }
    if job.import_env() {
        command.push("--export=ALL".to_string());
    }
    command.extend(dependency_args.iter().cloned());
    command.push("-J".to_string());
    command.push(job.name().clone());
    if let Some(stdout) = job.stdout() {
        command.push("-o".to_string());
        command.push(render_stdout(
            stdout,
            "%x",
            if job.is_array() { "%A" } else { "%j" },
            "%a",
        ));
    }
    if let (Some(mail_type), Some(mail_user)) = (job.mail_type(), job.mail_user().as_ref()) {
        command.push(format!("--mail-type={}", mail_type));
        command.push(format!("--mail-user={}", mail_user));
    }
    if let Some(array) = job.array() {
        let cap = array
            .concurrency_limit()
            .map(|c| format!("%{}", c))
            .unwrap_or_default();
        match task_ident {
            None => command.push(format!("--array=1-{}{}", array.tasks(), cap)),
            Some(task) => command.push(format!("--array={}{}", task, cap)),
        }
    }
    command.push(job.script().display().to_string());
    command
}

pub(crate) fn parse_submit_response(content: &str) -> Result<String> {
    SUBMIT_RESPONSE
        .captures(content.trim())
        .map(|captures| captures[1].to_string())
        .ok_or_else(|| {
            anyhow!(MavisError::UnexpectedResponse(format!(
                "sbatch: '{}'",
                content.trim()
            )))
        })
}

pub(crate) fn map_state(code: &str) -> Result<JobStatus> {
    // sacct reports e.g. "CANCELLED by 1234"
    let code = code.split_whitespace().next().unwrap_or(code);
    Ok(match code {
        "PENDING" | "REQUEUED" | "RESIZING" => JobStatus::Pending,
        "RUNNING" | "COMPLETING" => JobStatus::Running,
        "COMPLETED" => JobStatus::Completed,
        "CANCELLED" => JobStatus::Cancelled,
        "FAILED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL" | "DEADLINE"
        | "PREEMPTED" => JobStatus::Failed,
        "SUSPENDED" => JobStatus::Error,
        other => {
            return Err(anyhow!(MavisError::UnexpectedResponse(format!(
                "unknown SLURM job state '{}'",
                other
            ))))
        }
    })
}

/// Parse `sacct --long --parsable2` output
///
/// The `.batch` sub-rows are folded into their parent rows: they only
/// contribute column values the parent left empty.
pub(crate) fn parse_sacct(content: &str) -> Result<Vec<PollRow>> {
    let mut lines = content.trim().lines().filter(|l| !l.trim().is_empty());
    let header: Vec<&str> = match lines.next() {
        Some(line) => line.split('|').collect(),
        None => return Ok(Vec::new()),
    };

    let mut raw: Vec<BTreeMap<&str, &str>> = Vec::new();
    for line in lines {
        raw.push(header.iter().copied().zip(line.split('|')).collect());
    }
    for row in &raw {
        for key in ["JobID", "JobName", "State"] {
            if !row.contains_key(key) {
                return Err(anyhow!(MavisError::UnexpectedResponse(format!(
                    "sacct output is missing the {} column",
                    key
                ))));
            }
        }
    }

    let strip_batch = |ident: &str| ident.trim_end_matches(".batch").to_string();

    let mut results: Vec<(String, BTreeMap<&str, &str>)> = Vec::new();
    for row in &raw {
        if row["JobName"] != "batch" {
            results.push((strip_batch(row["JobID"]), row.clone()));
        }
    }
    for row in &raw {
        if row["JobName"] != "batch" {
            continue;
        }
        let ident = strip_batch(row["JobID"]);
        if let Some((_, parent)) = results.iter_mut().find(|(i, _)| *i == ident) {
            for (column, value) in row.iter() {
                let current = parent.entry(*column).or_insert("");
                if current.is_empty() {
                    *current = *value;
                }
            }
        }
    }

    let mut rows = Vec::new();
    for (ident, row) in results {
        let (job_ident, task_ident) = split_task_ident(&ident)?;
        rows.push(PollRow {
            job_ident,
            task_ident,
            name: row["JobName"].to_string(),
            status: map_state(row["State"])?,
            status_comment: String::new(),
        });
    }
    Ok(rows)
}

/// Parse `scontrol show job <ID>` output: blank-line separated blocks of
/// whitespace-separated `Key=Value` pairs
pub(crate) fn parse_scontrol_show(content: &str) -> Result<Vec<PollRow>> {
    lazy_static! {
        static ref BLOCK_SPLIT: Regex = Regex::new(r"\n\s*\n").unwrap();
    }

    let mut rows = Vec::new();
    for block in BLOCK_SPLIT.split(content) {
        let block = block.trim();
        if block.is_empty() {
            continue;
        }
        let mut pairs: BTreeMap<&str, &str> = BTreeMap::new();
        for pair in block.split_whitespace() {
            if let Some((key, value)) = pair.split_once('=') {
                pairs.insert(key, value);
            }
        }
        fn fetch<'c>(pairs: &BTreeMap<&'c str, &'c str>, key: &str) -> Result<&'c str> {
            pairs.get(key).copied().ok_or_else(|| {
                anyhow!(MavisError::UnexpectedResponse(format!(
                    "scontrol output is missing {}",
                    key
                )))
            })
        }

        let reason = fetch(&pairs, "Reason")?;
        rows.push(PollRow {
            job_ident: fetch(&pairs, "JobId")?.to_string(),
            task_ident: pairs
                .get("ArrayTaskId")
                .map(|t| t.parse::<u32>())
                .transpose()
                .map_err(|e| {
                    anyhow!(MavisError::UnexpectedResponse(format!(
                        "bad ArrayTaskId in scontrol output: {}",
                        e
                    )))
                })?,
            name: fetch(&pairs, "JobName")?.to_string(),
            status: map_state(fetch(&pairs, "JobState")?)?,
            status_comment: if reason.eq_ignore_ascii_case("none") {
                String::new()
            } else {
                reason.to_string()
            },
        });
    }
    Ok(rows)
}

/// Split a sacct JobID of the form `1234_7` into ident and task index
///
/// Pending arrays report a summary row like `1234_[1-100]`, which is job
/// level information, not a task.
fn split_task_ident(ident: &str) -> Result<(String, Option<u32>)> {
    match ident.rsplit_once('_') {
        Some((job, task)) => match task.parse::<u32>() {
            Ok(task) => Ok((job.to_string(), Some(task))),
            Err(_) if task.starts_with('[') => Ok((job.to_string(), None)),
            Err(_) => Err(anyhow!(MavisError::UnexpectedResponse(format!(
                "bad task index in sacct JobID '{}'",
                ident
            )))),
        },
        None => Ok((ident.to_string(), None)),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::schedule::job::ArraySpec;
    use crate::schedule::job::Stage;

    #[test]
    fn test_submit_command_single_job() {
        let job = Job::builder()
            .name("X".to_string())
            .stage(Stage::Cluster)
            .script(PathBuf::from("/work/submit.sh"))
            .queue(Some("q".to_string()))
            .memory_limit(Some(4000))
            .time_limit(Some(3600))
            .import_env(false)
            .build();

        let command = submit_command(&job, &[], None).join(" ");
        assert!(command.contains("sbatch --partition=q --mem 4000 -t 1:00:00 -J X"));
        assert!(command.ends_with("/work/submit.sh"));
        assert!(!command.contains("--array"));
    }

    #[test]
    fn test_submit_command_inherits_the_environment() {
        let job = Job::builder()
            .name("X".to_string())
            .stage(Stage::Cluster)
            .script(PathBuf::from("/work/submit.sh"))
            .build();

        let command = submit_command(&job, &[], None).join(" ");
        assert!(command.contains("--export=ALL"));
    }

    #[test]
    fn test_submit_command_array_with_concurrency_cap() {
        let job = Job::builder()
            .name("V".to_string())
            .stage(Stage::Validate)
            .script(PathBuf::from("/work/submit.sh"))
            .stdout(Some("/work/{name}.o{job_ident}.{task_ident}".to_string()))
            .array(Some(ArraySpec::new(100, Some(10)).unwrap()))
            .build();

        let command = submit_command(&job, &[], None).join(" ");
        assert!(command.contains("--array=1-100%10"));
        assert!(command.contains("-o /work/%x.o%A.%a"));

        let command = submit_command(&job, &[], Some(7)).join(" ");
        assert!(command.contains("--array=7%10"));
    }

    #[test]
    fn test_parse_submit_response() {
        assert_eq!(
            "12345",
            parse_submit_response("Submitted batch job 12345\n").unwrap()
        );
        assert_eq!(
            "12345",
            parse_submit_response("submitted batch job 12345").unwrap()
        );
        assert!(parse_submit_response("sbatch: error").is_err());
    }

    #[test]
    fn test_map_state() {
        assert_eq!(JobStatus::Completed, map_state("COMPLETED").unwrap());
        assert_eq!(JobStatus::Cancelled, map_state("CANCELLED by 1234").unwrap());
        assert_eq!(JobStatus::Failed, map_state("TIMEOUT").unwrap());
        assert!(map_state("SOMETHING_NEW").is_err());
    }

    #[test]
    fn test_parse_sacct_folds_batch_rows() {
        let content = "JobID|JobName|State|ExitCode\n\
                       1234|cluster_K562|COMPLETED|0:0\n\
                       1234.batch|batch|COMPLETED|0:0\n\
                       1235_1|validate_K562|FAILED|1:0\n\
                       1235_2|validate_K562|RUNNING|0:0\n";
        let rows = parse_sacct(content).unwrap();

        assert_eq!(3, rows.len());
        assert_eq!("1234", rows[0].job_ident);
        assert_eq!(None, rows[0].task_ident);
        assert_eq!(JobStatus::Completed, rows[0].status);

        assert_eq!("1235", rows[1].job_ident);
        assert_eq!(Some(1), rows[1].task_ident);
        assert_eq!(JobStatus::Failed, rows[1].status);

        assert_eq!(Some(2), rows[2].task_ident);
        assert_eq!(JobStatus::Running, rows[2].status);
    }

    #[test]
    fn test_parse_sacct_pending_array_summary_row() {
        let content = "JobID|JobName|State|ExitCode\n\
                       1235_[1-100]|validate_K562|PENDING|0:0\n";
        let rows = parse_sacct(content).unwrap();
        assert_eq!("1235", rows[0].job_ident);
        assert_eq!(None, rows[0].task_ident);
        assert_eq!(JobStatus::Pending, rows[0].status);
    }

    #[test]
    fn test_parse_sacct_empty() {
        assert!(parse_sacct("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_scontrol_show() {
        let content = "JobId=1234 JobName=cluster_K562 JobState=PENDING Reason=Resources\n\
                       \n\
                       JobId=1235 JobName=other JobState=RUNNING Reason=None ArrayTaskId=3\n";
        let rows = parse_scontrol_show(content).unwrap();

        assert_eq!(2, rows.len());
        assert_eq!("1234", rows[0].job_ident);
        assert_eq!("Resources", rows[0].status_comment);
        assert_eq!(JobStatus::Pending, rows[0].status);
        assert_eq!(Some(3), rows[1].task_ident);
        assert_eq!("", rows[1].status_comment);
    }
}
