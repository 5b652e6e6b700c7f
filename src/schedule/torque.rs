//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Torque/PBS back-end
//!
//! `qsub` answers with the bare job ident and `qstat -f` prints indented
//! `key = value` blocks, one per job or array task.

use std::collections::BTreeMap;

use anyhow::anyhow;
use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;

use crate::error::MavisError;
use crate::schedule::job::Job;
use crate::schedule::job::JobStatus;
use crate::schedule::job::MailType;
use crate::schedule::scheduler::render_stdout;
use crate::schedule::scheduler::PollRow;
use crate::util::format_elapsed;

const TAB_SIZE: usize = 8;

lazy_static! {
    static ref SUBMIT_RESPONSE: Regex = Regex::new(r"^\d+(\[\])?(\.\S+)?$").unwrap();
    // 123[7].host -> job 123[].host, task 7
    static ref ARRAY_TASK_IDENT: Regex = Regex::new(r"^(\d+\[)(\d+)(\].*)$").unwrap();
    static ref BLOCK_SPLIT: Regex = Regex::new(r"\s*\n\n\s*").unwrap();
    static ref LINE_INDENT: Regex = Regex::new(r"^(\s*)(\S.*)$").unwrap();
}

fn mail_type_code(mail_type: MailType) -> &'static str {
    match mail_type {
        MailType::Begin => "b",
        MailType::None => "p",
        MailType::Fail => "fa",
        MailType::End => "e",
        MailType::All => "abef",
    }
}

pub(crate) fn submit_command(
    job: &Job,
    dependency_args: &[String],
    task_ident: Option<u32>,
) -> Vec<String> {
    // -j oe joins stderr into the stdout log
    let mut command = vec!["qsub".to_string(), "-j".to_string(), "oe".to_string()];
    if let Some(queue) = job.queue() {
        command.push("-q".to_string());
        command.push(queue.clone());
    }
    if let Some(memory) = job.memory_limit() {
        command.push("-l".to_string());
        command.push(format!("mem={}mb", memory));
    }
    if let Some(time) = job.time_limit() {
        command.push("-l".to_string());
        command.push(format!("walltime={}", format_elapsed(time)));
    }
    if job.import_env() {
        command.push("-V".to_string());
    }
    command.extend(dependency_args.iter().cloned());
    command.push("-N".to_string());
    command.push(job.name().clone());
    if let Some(stdout) = job.stdout() {
        command.push("-o".to_string());
        command.push(render_stdout(
            stdout,
            "$PBS_JOBNAME",
            "$PBS_JOBID",
            "$PBS_ARRAYID",
        ));
    }
    if let (Some(mail_type), Some(mail_user)) = (job.mail_type(), job.mail_user().as_ref()) {
        command.push("-m".to_string());
        command.push(mail_type_code(mail_type).to_string());
        command.push("-M".to_string());
        command.push(mail_user.clone());
    }
    if let Some(array) = job.array() {
        let cap = array
            .concurrency_limit()
            .map(|c| format!("%{}", c))
            .unwrap_or_default();
        command.push("-t".to_string());
        match task_ident {
            // a one-task array submits as a bare task, not a 1-1 range
            None if array.tasks() != 1 => {
                command.push(format!("1-{}{}", array.tasks(), cap))
            }
            None => command.push(format!("1{}", cap)),
            Some(task) => command.push(format!("{}{}", task, cap)),
        }
    }
    command.push(job.script().display().to_string());
    command
}

pub(crate) fn parse_submit_response(content: &str) -> Result<String> {
    let content = content.trim();
    if SUBMIT_RESPONSE.is_match(content) {
        Ok(content.to_string())
    } else {
        Err(anyhow!(MavisError::UnexpectedResponse(format!(
            "qsub: '{}'",
            content
        ))))
    }
}

fn map_state(code: &str) -> Result<JobStatus> {
    Ok(match code {
        "C" => JobStatus::Completed,
        "E" | "T" | "R" => JobStatus::Running,
        "H" | "Q" | "W" => JobStatus::Pending,
        "S" => JobStatus::Error,
        other => {
            return Err(anyhow!(MavisError::UnexpectedResponse(format!(
                "unknown Torque job state '{}'",
                other
            ))))
        }
    })
}

/// Parse `qstat -f [-t]` output into per-job/per-task rows
pub(crate) fn parse_qstat(content: &str) -> Result<Vec<PollRow>> {
    // torque renders with a tab size of 8
    let content = content.replace('\t', &" ".repeat(TAB_SIZE));
    let mut rows = Vec::new();

    for block in BLOCK_SPLIT.split(content.trim()) {
        if block.is_empty() || block.starts_with("request_version") {
            continue;
        }
        let mut lines = block.lines();
        let first = lines.next().unwrap_or_default();
        let full_ident = first
            .split_once(':')
            .map(|(_, ident)| ident.trim().to_string())
            .ok_or_else(|| {
                anyhow!(MavisError::UnexpectedResponse(format!(
                    "expected a 'Job Id: ...' line, got '{}'",
                    first
                )))
            })?;

        let (job_ident, task_ident) = match ARRAY_TASK_IDENT.captures(&full_ident) {
            Some(captures) => {
                let task = captures[2].parse::<u32>().map_err(|_| {
                    anyhow!(MavisError::UnexpectedResponse(format!(
                        "bad array task index in '{}'",
                        full_ident
                    )))
                })?;
                (format!("{}{}", &captures[1], &captures[3]), Some(task))
            }
            None => (full_ident, None),
        };

        // key = value fields at one fixed indent, deeper lines continue the
        // previous value
        let mut fields: Vec<(String, String)> = Vec::new();
        let mut indent: Option<usize> = None;
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let captures = LINE_INDENT
                .captures(line)
                .expect("non-empty line always matches");
            let current = captures[1].len();
            let indent = *indent.get_or_insert(current);

            if current > indent || !line.contains('=') {
                match fields.last_mut() {
                    Some((_, value)) => value.push_str(line.trim()),
                    None => {
                        return Err(anyhow!(MavisError::UnexpectedResponse(format!(
                            "unexpected continuation line in qstat output: '{}'",
                            line
                        ))))
                    }
                }
            } else if current == indent {
                let (key, value) = line.split_once('=').expect("checked above");
                fields.push((key.trim().to_string(), value.trim().to_string()));
            } else {
                return Err(anyhow!(MavisError::UnexpectedResponse(format!(
                    "unexpected indentation in qstat output: '{}'",
                    line
                ))));
            }
        }

        fn fetch<'f>(fields: &'f [(String, String)], key: &str) -> Result<&'f str> {
            fields
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
                .ok_or_else(|| {
                    anyhow!(MavisError::UnexpectedResponse(format!(
                        "qstat output is missing the {} field",
                        key
                    )))
                })
        }

        let mut status = map_state(fetch(&fields, "job_state")?)?;
        if status == JobStatus::Completed {
            // a completed state is only trustworthy with a zero exit
            match fields.iter().find(|(k, _)| k == "exit_status") {
                Some((_, exit_status)) if exit_status != "0" => status = JobStatus::Failed,
                Some(_) => {}
                None => status = JobStatus::Cancelled,
            }
        }

        rows.push(PollRow {
            job_ident,
            task_ident,
            name: fetch(&fields, "Job_Name")?.to_string(),
            status,
            status_comment: String::new(),
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
    fn test_submit_command_array_with_concurrency_cap() {
        let job = Job::builder()
            .name("V".to_string())
            .stage(Stage::Validate)
            .script(PathBuf::from("/work/submit.sh"))
            .memory_limit(Some(12000))
            .time_limit(Some(57600))
            .array(Some(ArraySpec::new(50, Some(5)).unwrap()))
            .build();

        let command = submit_command(&job, &[], None).join(" ");
        assert!(command.starts_with("qsub -j oe"));
        assert!(command.contains("-l mem=12000mb"));
        assert!(command.contains("-l walltime=16:00:00"));
        assert!(command.contains("-t 1-50%5"));
    }

    #[test]
    fn test_submit_command_single_task_array() {
        let job = Job::builder()
            .name("V".to_string())
            .stage(Stage::Validate)
            .script(PathBuf::from("/work/submit.sh"))
            .array(Some(ArraySpec::new(1, None).unwrap()))
            .build();

        let command = submit_command(&job, &[], None).join(" ");
        assert!(command.contains("-t 1 "));
        assert!(!command.contains("-t 1-1"));

        let command = submit_command(&job, &[], Some(1)).join(" ");
        assert!(command.contains("-t 1 "));
    }

    #[test]
    fn test_parse_submit_response() {
        assert_eq!("12345.host", parse_submit_response("12345.host\n").unwrap());
        assert_eq!("100[].host", parse_submit_response("100[].host").unwrap());
        assert_eq!("12345", parse_submit_response("12345").unwrap());
        assert!(parse_submit_response("qsub: submit error").is_err());
    }

    #[test]
    fn test_parse_qstat_blocks() {
        let content = indoc!(
            "
            Job Id: 104[1].torque1
                Job_Name = validate_K562
                Job_Owner = mavisuser@torque1
                job_state = C
                queue = batch
                exit_status = 0
                comment = Job started on Thu Jun 14 at 15:35

            Job Id: 104[2].torque1
                Job_Name = validate_K562
                Job_Owner = mavisuser@torque1
                job_state = C
                queue = batch
                exit_status = 1

            Job Id: 105.torque1
                Job_Name = pairing_batch
                Job_Owner = mavisuser@torque1
                job_state = Q
                Error_Path = torque1:/work/pairing_batch
                    .e105
            "
        );
        let rows = parse_qstat(content).unwrap();

        assert_eq!(3, rows.len());
        assert_eq!("104[].torque1", rows[0].job_ident);
        assert_eq!(Some(1), rows[0].task_ident);
        assert_eq!(JobStatus::Completed, rows[0].status);

        assert_eq!(Some(2), rows[1].task_ident);
        assert_eq!(JobStatus::Failed, rows[1].status);

        assert_eq!("105.torque1", rows[2].job_ident);
        assert_eq!(None, rows[2].task_ident);
        assert_eq!(JobStatus::Pending, rows[2].status);
    }

    #[test]
    fn test_parse_qstat_completed_without_exit_status_is_cancelled() {
        let content = indoc!(
            "
            Job Id: 42.torque1
                Job_Name = cluster_K562
                job_state = C
            "
        );
        let rows = parse_qstat(content).unwrap();
        assert_eq!(JobStatus::Cancelled, rows[0].status);
    }

    #[test]
    fn test_unknown_state_is_loud() {
        let content = indoc!(
            "
            Job Id: 42.torque1
                Job_Name = cluster_K562
                job_state = X
            "
        );
        assert!(parse_qstat(content).is_err());
    }
}
