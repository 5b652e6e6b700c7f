//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Build manifest serialization
//!
//! `build.cfg` is the single source of truth between invocations: a
//! `[general]` section with the pipeline-wide scalars and one section per
//! job, keyed by the job's unique name. Per-task statuses of array jobs are
//! inlined as range groups (`COMPLETED: 1-3, 7; FAILED: 4`). The file is
//! rewritten atomically after every state-changing operation and parsing is
//! the exact inverse of rendering.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use itertools::Itertools;

use crate::error::MavisError;
use crate::pipeline::Pipeline;
use crate::schedule::job::ArraySpec;
use crate::schedule::job::Job;
use crate::schedule::job::JobStatus;
use crate::schedule::job::MailType;
use crate::schedule::job::Stage;
use crate::schedule::job::Task;
use crate::schedule::scheduler::SchedulerKind;
use crate::util::atomic_write;
use crate::util::ini::non_empty;
use crate::util::ini::parse_bool;
use crate::util::ini::parse_opt;
use crate::util::ini::Document;
use crate::util::ini::Section;
use crate::util::ranges::convert_set_to_ranges;
use crate::util::ranges::parse_ranges;

const GENERAL_SECTION: &str = "general";
const TASK_COMMENT_PREFIX: &str = "task_comment_";

impl Pipeline {
    pub fn read_build_file(path: &Path) -> Result<Pipeline> {
        let document = Document::read(path)?;
        Pipeline::from_document(&document)
            .with_context(|| format!("Parsing build file {}", path.display()))
    }

    pub fn parse_build(content: &str) -> Result<Pipeline> {
        Pipeline::from_document(&Document::parse(content)?)
    }

    pub fn write_build_file(&self, path: &Path) -> Result<()> {
        atomic_write(path, &self.render_build())
            .with_context(|| format!("Writing build file {}", path.display()))
    }

    pub fn render_build(&self) -> String {
        self.to_document().render()
    }

    fn to_document(&self) -> Document {
        let mut document = Document::new();

        let mut general = Section::new(GENERAL_SECTION);
        general.push("output", self.output().display().to_string());
        general.push("scheduler", self.scheduler().to_string());
        general.push("batch_id", self.batch_id().clone());
        general.push("queue", self.queue().clone().unwrap_or_default());
        general.push("memory_limit", display_opt(self.memory_limit()));
        general.push("time_limit", display_opt(self.time_limit()));
        general.push("concurrency_limit", display_opt(self.concurrency_limit()));
        general.push("skip_validate", self.skip_validate().to_string());
        general.push("skip_pairing", self.skip_pairing().to_string());
        document.push(general);

        for job in self.jobs() {
            document.push(job_to_section(job));
        }
        document
    }

    fn from_document(document: &Document) -> Result<Pipeline> {
        let general = document.section(GENERAL_SECTION).ok_or_else(|| {
            anyhow!(MavisError::InvalidInput(
                "build file has no [general] section".to_string()
            ))
        })?;

        let scheduler = match non_empty(general, "scheduler") {
            Some(value) => value.parse::<SchedulerKind>().map_err(|_| {
                anyhow!(MavisError::InvalidInput(format!(
                    "unknown scheduler '{}'",
                    value
                )))
            })?,
            None => SchedulerKind::Slurm,
        };

        let mut pipeline = Pipeline {
            output: PathBuf::from(general.get("output").unwrap_or_default()),
            scheduler,
            batch_id: general.get("batch_id").unwrap_or_default().to_string(),
            queue: non_empty(general, "queue").map(str::to_string),
            memory_limit: parse_opt(general, "memory_limit")?,
            time_limit: parse_opt(general, "time_limit")?,
            concurrency_limit: parse_opt(general, "concurrency_limit")?,
            skip_validate: parse_bool(general, "skip_validate", false)?,
            skip_pairing: parse_bool(general, "skip_pairing", false)?,
            clusterings: Vec::new(),
            validations: Vec::new(),
            annotations: Vec::new(),
            pairing: None,
            summary: None,
        };

        for section in document.sections() {
            if section.title() == GENERAL_SECTION {
                continue;
            }
            let job = job_from_section(section)?;
            match job.stage() {
                Stage::Cluster => pipeline.clusterings.push(job),
                Stage::Validate => pipeline.validations.push(job),
                Stage::Annotate => pipeline.annotations.push(job),
                Stage::Pairing => {
                    if pipeline.pairing.replace(job).is_some() {
                        return Err(anyhow!(MavisError::Structural(
                            "build file defines more than one pairing job".to_string()
                        )));
                    }
                }
                Stage::Summary => {
                    if pipeline.summary.replace(job).is_some() {
                        return Err(anyhow!(MavisError::Structural(
                            "build file defines more than one summary job".to_string()
                        )));
                    }
                }
            }
        }

        pipeline.validate_structure()?;
        Ok(pipeline)
    }
}

fn job_to_section(job: &Job) -> Section {
    let mut section = Section::new(job.name().clone());
    section.push("stage", job.stage().to_string());
    section.push("script", job.script().display().to_string());
    section.push("name", job.name().clone());
    section.push("job_ident", job.job_ident().clone().unwrap_or_default());
    section.push("status", job.status().to_string());
    section.push("status_comment", job.status_comment().clone());
    section.push("queue", job.queue().clone().unwrap_or_default());
    section.push("memory_limit", display_opt(job.memory_limit()));
    section.push("time_limit", display_opt(job.time_limit()));
    section.push("import_env", job.import_env().to_string());
    section.push("stdout", job.stdout().clone().unwrap_or_default());
    section.push(
        "mail_type",
        job.mail_type().map(|m| m.to_string()).unwrap_or_default(),
    );
    section.push("mail_user", job.mail_user().clone().unwrap_or_default());
    section.push("dependencies", job.dependencies().join(","));

    if let Some(array) = job.array() {
        section.push("tasks", array.tasks().to_string());
        section.push("concurrency_limit", display_opt(array.concurrency_limit()));

        let mut by_status: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();
        for task in array.task_list() {
            by_status
                .entry(task.status().to_string())
                .or_default()
                .insert(task.task_ident());
        }
        let rendered = by_status
            .iter()
            .map(|(status, tasks)| format!("{}: {}", status, convert_set_to_ranges(tasks)))
            .join("; ");
        section.push("task_status", rendered);

        for task in array.task_list() {
            if !task.status_comment().is_empty() {
                section.push(
                    format!("{}{}", TASK_COMMENT_PREFIX, task.task_ident()),
                    task.status_comment().clone(),
                );
            }
        }
    }
    section
}

fn job_from_section(section: &Section) -> Result<Job> {
    let name = section.get("name").unwrap_or_else(|| section.title());
    let stage = section
        .get("stage")
        .ok_or_else(|| {
            anyhow!(MavisError::InvalidInput(format!(
                "job '{}' has no stage",
                name
            )))
        })?
        .parse::<Stage>()
        .map_err(|_| {
            anyhow!(MavisError::InvalidInput(format!(
                "job '{}' has an unknown stage '{}'",
                name,
                section.get("stage").unwrap_or_default()
            )))
        })?;

    let status = match non_empty(section, "status") {
        Some(value) => value.parse::<JobStatus>().map_err(|_| {
            anyhow!(MavisError::InvalidInput(format!(
                "job '{}' has an unknown status '{}'",
                name, value
            )))
        })?,
        None => JobStatus::NotSubmitted,
    };
    let mail_type = match non_empty(section, "mail_type") {
        Some(value) => Some(value.parse::<MailType>().map_err(|_| {
            anyhow!(MavisError::InvalidInput(format!(
                "job '{}' has an unknown mail_type '{}'",
                name, value
            )))
        })?),
        None => None,
    };

    let dependencies: Vec<String> = section
        .get("dependencies")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect();

    let array = match parse_opt::<u32>(section, "tasks")? {
        Some(tasks) => Some(parse_array(section, name, tasks)?),
        None => None,
    };

    Ok(Job::builder()
        .name(name.to_string())
        .stage(stage)
        .script(PathBuf::from(section.get("script").unwrap_or_default()))
        .queue(non_empty(section, "queue").map(str::to_string))
        .memory_limit(parse_opt(section, "memory_limit")?)
        .time_limit(parse_opt(section, "time_limit")?)
        .import_env(parse_bool(section, "import_env", true)?)
        .stdout(non_empty(section, "stdout").map(str::to_string))
        .mail_type(mail_type)
        .mail_user(non_empty(section, "mail_user").map(str::to_string))
        .dependencies(dependencies)
        .status(status)
        .status_comment(section.get("status_comment").unwrap_or_default().to_string())
        .job_ident(non_empty(section, "job_ident").map(str::to_string))
        .array(array)
        .build())
}

fn parse_array(section: &Section, name: &str, tasks: u32) -> Result<ArraySpec> {
    let mut array = ArraySpec::new(tasks, parse_opt(section, "concurrency_limit")?)?;

    if let Some(task_status) = non_empty(section, "task_status") {
        for group in task_status.split(';') {
            let group = group.trim();
            if group.is_empty() {
                continue;
            }
            let (status, ranges) = group.split_once(':').ok_or_else(|| {
                anyhow!(MavisError::InvalidInput(format!(
                    "job '{}' has a malformed task_status group '{}'",
                    name, group
                )))
            })?;
            let status = status.trim().parse::<JobStatus>().map_err(|_| {
                anyhow!(MavisError::InvalidInput(format!(
                    "job '{}' has an unknown task status '{}'",
                    name, status
                )))
            })?;
            for task_ident in parse_ranges(ranges)? {
                array
                    .task_mut(task_ident)
                    .ok_or_else(|| {
                        anyhow!(MavisError::Structural(format!(
                            "job '{}' lists task {} outside 1-{}",
                            name, task_ident, tasks
                        )))
                    })?
                    .set_status(status, "");
            }
        }
    }

    for (key, value) in section.entries() {
        if let Some(task_ident) = key.strip_prefix(TASK_COMMENT_PREFIX) {
            let task_ident: u32 = task_ident.parse().map_err(|_| {
                anyhow!(MavisError::InvalidInput(format!(
                    "job '{}' has a malformed task comment key '{}'",
                    name, key
                )))
            })?;
            let status = array
                .task(task_ident)
                .map(Task::status)
                .ok_or_else(|| {
                    anyhow!(MavisError::Structural(format!(
                        "job '{}' lists task {} outside 1-{}",
                        name, task_ident, tasks
                    )))
                })?;
            array
                .task_mut(task_ident)
                .expect("bounds checked above")
                .set_status(status, value);
        }
    }
    Ok(array)
}

fn display_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::schedule::scheduler::JobGraph;

    #[test]
    fn test_parse_basic_build_file() {
        let content = indoc!(
            "
            [general]
            output = temp

            [job1]
            stage = validate
            tasks = 1000
            name = job1

            [job2]
            stage = annotate
            name = job2
            dependencies = job1

            [job3]
            stage = pairing
            name = job3
            dependencies = job2

            [job4]
            stage = summary
            name = job4
            dependencies = job3
            "
        );
        let pipeline = Pipeline::parse_build(content).unwrap();

        assert_eq!("job1", pipeline.validations()[0].name());
        assert_eq!(
            Some(1000),
            pipeline.validations()[0].array().as_ref().map(|a| a.tasks())
        );
        assert_eq!("job2", pipeline.annotations()[0].name());
        assert_eq!(
            &vec!["job1".to_string()],
            pipeline.annotations()[0].dependencies()
        );
        assert_eq!("job3", pipeline.pairing().as_ref().unwrap().name());
        assert_eq!(
            &vec!["job3".to_string()],
            pipeline.summary().as_ref().unwrap().dependencies()
        );
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let content = indoc!(
            "
            [general]
            output = temp

            [job1]
            stage = pairing
            dependencies = missing
            "
        );
        let err = Pipeline::parse_build(content).unwrap_err();
        assert_eq!(1, crate::error::exit_code(&err));
    }

    #[test]
    fn test_task_index_out_of_bounds_is_rejected() {
        let content = indoc!(
            "
            [general]
            output = temp

            [job1]
            stage = validate
            tasks = 3
            task_status = COMPLETED: 1-4
            "
        );
        assert!(Pipeline::parse_build(content).is_err());
    }

    fn sample_pipeline() -> Pipeline {
        let content = indoc!(
            "
            [general]
            output = /work/out
            scheduler = SGE
            batch_id = batch-aB3x
            queue = all.q
            memory_limit = 16000
            time_limit = 57600
            concurrency_limit = 50
            skip_validate = false
            skip_pairing = false

            [cluster_K562_batch-aB3x]
            stage = cluster
            script = /work/out/K562_diseased_genome/cluster/submit.sh
            job_ident = 1000
            status = COMPLETED

            [validate_K562_batch-aB3x]
            stage = validate
            script = /work/out/K562_diseased_genome/validate/submit.sh
            job_ident = 1001
            status = FAILED
            dependencies = cluster_K562_batch-aB3x
            tasks = 4
            concurrency_limit = 2
            task_status = COMPLETED: 1, 3-4; FAILED: 2
            task_comment_2 = walltime exceeded

            [annotate_K562_batch-aB3x]
            stage = annotate
            script = /work/out/K562_diseased_genome/annotate/submit.sh
            dependencies = validate_K562_batch-aB3x
            tasks = 4

            [pairing_batch-aB3x]
            stage = pairing
            script = /work/out/pairing/submit.sh
            dependencies = annotate_K562_batch-aB3x

            [summary_batch-aB3x]
            stage = summary
            script = /work/out/summary/submit.sh
            dependencies = pairing_batch-aB3x
            "
        );
        Pipeline::parse_build(content).unwrap()
    }

    #[test]
    fn test_roundtrip_is_identity() {
        let pipeline = sample_pipeline();
        let rendered = pipeline.render_build();
        let reparsed = Pipeline::parse_build(&rendered).unwrap();
        assert_eq!(pipeline, reparsed);
        assert_eq!(rendered, reparsed.render_build());
    }

    #[test]
    fn test_task_state_is_restored() {
        let pipeline = sample_pipeline();
        let validate = pipeline.job("validate_K562_batch-aB3x").unwrap();
        assert_eq!(JobStatus::Failed, validate.status());
        assert_eq!(Some("1001"), validate.job_ident().as_deref());

        let array = validate.array().as_ref().unwrap();
        assert_eq!(JobStatus::Completed, array.task(1).unwrap().status());
        assert_eq!(JobStatus::Failed, array.task(2).unwrap().status());
        assert_eq!("walltime exceeded", array.task(2).unwrap().status_comment());
        assert_eq!(Some(2), array.concurrency_limit());
    }

    #[test]
    fn test_write_build_file_is_atomic_and_readable() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("build.cfg");
        let pipeline = sample_pipeline();

        pipeline.write_build_file(&path).unwrap();
        assert!(!path.with_extension("tmp").exists());
        assert_eq!(pipeline, Pipeline::read_build_file(&path).unwrap());
    }
}
