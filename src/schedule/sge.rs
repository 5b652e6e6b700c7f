//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! SGE (gridengine) back-end
//!
//! `qstat` prints a fixed-width table whose column widths are derived from
//! the header line. A job that left the active queue is only visible through
//! `qacct`. SGE state fields are multi-letter strings ("Eqw"); each letter
//! maps to a status and the letters fold through the cumulative-state rule.

use std::collections::BTreeMap;

use anyhow::anyhow;
use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;

use crate::error::MavisError;
use crate::schedule::job::cumulative_state;
use crate::schedule::job::Job;
use crate::schedule::job::JobStatus;
use crate::schedule::job::MailType;
use crate::schedule::scheduler::render_stdout;
use crate::schedule::scheduler::PollRow;
use crate::util::format_elapsed;

lazy_static! {
    // example: Your job-array 3760559.1-100:1 ("V") has been submitted
    // example: Your job 3766949 ("P") has been submitted
    static ref SUBMIT_RESPONSE: Regex =
        Regex::new(r"(?i)^your job(-array)? (\d+)(\.\d+-\d+:\d+)? .* has been submitted$")
            .unwrap();
}

const QSTAT_HEADER: [&str; 9] = [
    "job-ID",
    "prior",
    "name",
    "user",
    "state",
    "submit/start at",
    "queue",
    "slots",
    "ja-task-ID",
];

fn mail_type_code(mail_type: MailType) -> &'static str {
    match mail_type {
        MailType::Begin => "b",
        MailType::None => "n",
        MailType::Fail => "as",
        MailType::End => "e",
        MailType::All => "abes",
    }
}

pub(crate) fn submit_command(
    job: &Job,
    dependency_args: &[String],
    task_ident: Option<u32>,
) -> Vec<String> {
    // -j y joins stderr into the stdout log
    let mut command = vec!["qsub".to_string(), "-j".to_string(), "y".to_string()];
    if let Some(queue) = job.queue() {
        command.push("-q".to_string());
        command.push(queue.clone());
    }
    if let Some(memory) = job.memory_limit() {
        command.push("-l".to_string());
        command.push(format!(
            "mem_free={0}M,mem_token={0}M,h_vmem={0}M",
            memory
        ));
    }
    if let Some(time) = job.time_limit() {
        command.push("-l".to_string());
        command.push(format!("h_rt={}", format_elapsed(time)));
    }
    if job.import_env() {
        command.push("-V".to_string());
    }
    command.extend(dependency_args.iter().cloned());
    command.push("-N".to_string());
    command.push(job.name().clone());
    if let (Some(mail_type), Some(mail_user)) = (job.mail_type(), job.mail_user().as_ref()) {
        command.push("-m".to_string());
        command.push(mail_type_code(mail_type).to_string());
        command.push("-M".to_string());
        command.push(mail_user.clone());
    }
    if let Some(array) = job.array() {
        // gridengine has no per-array concurrency cap, the configured limit
        // is advisory here
        command.push("-t".to_string());
        match task_ident {
            None => command.push(format!("1-{}", array.tasks())),
            Some(task) => command.push(task.to_string()),
        }
    }
    if let Some(stdout) = job.stdout() {
        command.push("-o".to_string());
        command.push(render_stdout(stdout, "$JOB_NAME", "$JOB_ID", "$TASK_ID"));
    }
    command.push(job.script().display().to_string());
    command
}

pub(crate) fn parse_submit_response(content: &str) -> Result<String> {
    SUBMIT_RESPONSE
        .captures(content.trim())
        .map(|captures| captures[2].to_string())
        .ok_or_else(|| {
            anyhow!(MavisError::UnexpectedResponse(format!(
                "qsub: '{}'",
                content.trim()
            )))
        })
}

fn map_state_char(state: char) -> Result<JobStatus> {
    Ok(match state {
        'q' | 'h' | 'w' => JobStatus::Pending,
        'R' | 'r' | 't' => JobStatus::Running,
        'd' => JobStatus::Cancelled,
        's' | 'S' | 'E' | 'T' => JobStatus::Error,
        other => {
            return Err(anyhow!(MavisError::UnexpectedResponse(format!(
                "unknown SGE state code '{}'",
                other
            ))))
        }
    })
}

/// Fold a multi-letter state string ("Eqw") into one status
pub(crate) fn convert_state(state: &str) -> Result<JobStatus> {
    let mut states = Vec::new();
    for c in state.chars() {
        states.push(map_state_char(c)?);
    }
    Ok(cumulative_state(states))
}

/// Parse the fixed-width `qstat` table
pub(crate) fn parse_qstat(content: &str) -> Result<Vec<PollRow>> {
    let content = content.trim();
    if content.is_empty() {
        return Ok(Vec::new());
    }
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();

    // column widths are derived from the header line
    let header = lines[0];
    let mut column_sizes = Vec::new();
    for column in QSTAT_HEADER {
        let pattern = format!("{}\\s*", regex::escape(column));
        let found = Regex::new(&pattern)
            .expect("escaped column name is a valid regex")
            .find(header)
            .ok_or_else(|| {
                anyhow!(MavisError::UnexpectedResponse(format!(
                    "qstat header is missing the '{}' column",
                    column
                )))
            })?;
        column_sizes.push(found.as_str().len());
    }

    let mut rows = Vec::new();
    for line in &lines[1..] {
        if line.trim().chars().all(|c| c == '-') {
            continue; // dashed separator below the header
        }
        let mut row: BTreeMap<&str, String> = BTreeMap::new();
        let mut pos = 0;
        for (column, size) in QSTAT_HEADER.iter().zip(&column_sizes) {
            let end = (pos + size).min(line.len());
            row.insert(*column, line[pos.min(line.len())..end].trim().to_string());
            pos += size;
        }

        // a range or list in ja-task-ID summarizes pending tasks, which is
        // not attributable to a single task
        let task_ident = Some(row["ja-task-ID"].clone())
            .filter(|t| !t.is_empty())
            .filter(|t| !t.contains(|c| c == ',' || c == ':' || c == '-'))
            .map(|t| {
                t.parse::<u32>().map_err(|_| {
                    anyhow!(MavisError::UnexpectedResponse(format!(
                        "bad ja-task-ID '{}' in qstat output",
                        t
                    )))
                })
            })
            .transpose()?;

        rows.push(PollRow {
            job_ident: row["job-ID"].clone(),
            task_ident,
            name: row["name"].clone(),
            status: convert_state(&row["state"])?,
            status_comment: String::new(),
        });
    }
    Ok(rows)
}

/// Parse `qacct -j <ID>` accounting output
///
/// Returns an error when the accounting database has no record of the job
/// (old or bad job ID).
pub(crate) fn parse_qacct(content: &str) -> Result<Vec<PollRow>> {
    lazy_static! {
        static ref SECTION_SPLIT: Regex = Regex::new(r"=+\n").unwrap();
        static ref NOISE: Regex = Regex::new(r"^[\s=]*$").unwrap();
    }

    if content.trim_start().starts_with("Total System Usage") {
        return Err(anyhow!(MavisError::Scheduler(
            "no accounting information found for the job".to_string()
        )));
    }

    let mut rows = Vec::new();
    for section in SECTION_SPLIT.split(content).skip(1) {
        let mut fields: BTreeMap<&str, &str> = BTreeMap::new();
        for line in section.lines() {
            if NOISE.is_match(line) {
                continue;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            let key = parts.next().unwrap_or_default();
            let value = parts.next().unwrap_or_default().trim();
            fields.insert(key, if value == "undefined" { "" } else { value });
        }
        fn fetch<'c>(fields: &BTreeMap<&'c str, &'c str>, key: &str) -> Result<&'c str> {
            fields.get(key).copied().ok_or_else(|| {
                anyhow!(MavisError::UnexpectedResponse(format!(
                    "qacct output is missing the {} field",
                    key
                )))
            })
        }

        let exit_status = fetch(&fields, "exit_status")?;
        let failed = fetch(&fields, "failed")?;
        let status = if exit_status == "0" && failed == "0" {
            JobStatus::Completed
        } else if exit_status.contains("(Killed)") {
            JobStatus::Cancelled
        } else {
            JobStatus::Failed
        };
        let status_comment = failed
            .split_once(':')
            .map(|(_, comment)| comment.trim().to_string())
            .unwrap_or_default();

        let task_ident = Some(fetch(&fields, "taskid")?)
            .filter(|t| !t.is_empty())
            .map(|t| {
                t.parse::<u32>().map_err(|_| {
                    anyhow!(MavisError::UnexpectedResponse(format!(
                        "bad taskid '{}' in qacct output",
                        t
                    )))
                })
            })
            .transpose()?;

        rows.push(PollRow {
            job_ident: fetch(&fields, "jobnumber")?.to_string(),
            task_ident,
            name: fetch(&fields, "jobname")?.to_string(),
            status,
            status_comment,
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use indoc::indoc;

    use super::*;
    use crate::schedule::job::ArraySpec;
    use crate::schedule::job::Stage;

    #[test]
    fn test_submit_command_array() {
        let job = Job::builder()
            .name("J".to_string())
            .stage(Stage::Validate)
            .script(PathBuf::from("/work/submit.sh"))
            .queue(Some("transabyss.q".to_string()))
            .memory_limit(Some(16000))
            .array(Some(ArraySpec::new(100, Some(10)).unwrap()))
            .build();

        let command = submit_command(&job, &[], None).join(" ");
        assert!(command.starts_with("qsub -j y"));
        assert!(command.contains("-t 1-100"));
        assert!(!command.contains('%'), "concurrency is advisory on SGE");
        assert!(command.contains("-l mem_free=16000M,mem_token=16000M,h_vmem=16000M"));
        assert!(command.contains("-N J"));
    }

    #[test]
    fn test_parse_submit_response() {
        assert_eq!(
            "3760559",
            parse_submit_response(
                r#"Your job-array 3760559.1-100:1 ("J") has been submitted"#
            )
            .unwrap()
        );
        assert_eq!(
            "3766949",
            parse_submit_response(r#"Your job 3766949 ("P") has been submitted"#).unwrap()
        );
        assert!(parse_submit_response("qsub: would not submit").is_err());
    }

    #[test]
    fn test_convert_state_folds_letters() {
        assert_eq!(JobStatus::Error, convert_state("Eqw").unwrap());
        assert_eq!(JobStatus::Pending, convert_state("qw").unwrap());
        assert_eq!(JobStatus::Running, convert_state("r").unwrap());
        assert!(convert_state("zz").is_err());
    }

    #[test]
    fn test_parse_qstat_fixed_width() {
        let content = indoc!(
            "
            job-ID  prior   name       user         state submit/start at     queue                          slots ja-task-ID
            -----------------------------------------------------------------------------------------------------------------
            3760559 0.50000 validate_K mavisuser    r     04/02/2018 15:10:48 all.q@node1                        1 7
            3760560 0.00000 pairing_ba mavisuser    qw    04/02/2018 15:10:49                                    1
            "
        );
        let rows = parse_qstat(content).unwrap();

        assert_eq!(2, rows.len());
        assert_eq!("3760559", rows[0].job_ident);
        assert_eq!(Some(7), rows[0].task_ident);
        assert_eq!(JobStatus::Running, rows[0].status);
        assert_eq!("3760560", rows[1].job_ident);
        assert_eq!(None, rows[1].task_ident);
        assert_eq!(JobStatus::Pending, rows[1].status);
    }

    #[test]
    fn test_parse_qstat_task_ranges_are_not_tasks() {
        let content = indoc!(
            "
            job-ID  prior   name       user         state submit/start at     queue                          slots ja-task-ID
            -----------------------------------------------------------------------------------------------------------------
            3760559 0.50000 validate_K mavisuser    qw    04/02/2018 15:10:48 all.q@node1                        1 1-100:1
            "
        );
        let rows = parse_qstat(content).unwrap();
        assert_eq!(None, rows[0].task_ident);
    }

    #[test]
    fn test_parse_qacct() {
        let content = indoc!(
            "
            ==============================================================
            qname        all.q
            jobname      validate_K562
            jobnumber    3760559
            taskid       2
            qsub_time    Mon Apr  2 15:10:48 2018
            exit_status  1
            failed       100 : assumedly after job
            ==============================================================
            qname        all.q
            jobname      validate_K562
            jobnumber    3760559
            taskid       3
            exit_status  0
            failed       0
            "
        );
        let rows = parse_qacct(content).unwrap();

        assert_eq!(2, rows.len());
        assert_eq!(JobStatus::Failed, rows[0].status);
        assert_eq!("assumedly after job", rows[0].status_comment);
        assert_eq!(Some(2), rows[0].task_ident);
        assert_eq!(JobStatus::Completed, rows[1].status);
    }

    #[test]
    fn test_parse_qacct_no_record() {
        assert!(parse_qacct("Total System Usage\n    WALLCLOCK ...").is_err());
    }
}
