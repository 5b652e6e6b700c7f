//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Scheduler interaction
//!
//! The [Scheduler] drives one of three batch-system back-ends. Each back-end
//! contributes its constants (dependency syntax, header prefix, task-index
//! environment variable), its command construction and its output parsers;
//! dependency formatting, cascade submission and status application are
//! shared here.

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use parse_display::Display;
use parse_display::FromStr;
use tracing::debug;

use crate::error::MavisError;
use crate::schedule::job::Job;
use crate::schedule::job::JobStatus;
use crate::schedule::sge;
use crate::schedule::slurm;
use crate::schedule::torque;
use crate::util::process::CommandRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromStr)]
#[display(style = "UPPERCASE")]
pub enum SchedulerKind {
    Slurm,
    Sge,
    Torque,
}

impl SchedulerKind {
    /// Prefix for scheduler directives in emitted scripts
    pub fn header_prefix(&self) -> &'static str {
        match self {
            SchedulerKind::Slurm => "#SBATCH",
            SchedulerKind::Sge => "#$",
            SchedulerKind::Torque => "#PBS",
        }
    }

    /// The environment variable a task reads its 1-based index from
    pub fn env_task_ident(&self) -> &'static str {
        match self {
            SchedulerKind::Slurm => "SLURM_ARRAY_TASK_ID",
            SchedulerKind::Sge => "SGE_TASK_ID",
            SchedulerKind::Torque => "PBS_ARRAYID",
        }
    }

    pub fn dependency_delim(&self) -> &'static str {
        match self {
            SchedulerKind::Slurm => ":",
            SchedulerKind::Sge => ",",
            SchedulerKind::Torque => ":",
        }
    }

    pub fn submit_program(&self) -> &'static str {
        match self {
            SchedulerKind::Slurm => "sbatch",
            SchedulerKind::Sge => "qsub",
            SchedulerKind::Torque => "qsub",
        }
    }

    pub fn cancel_program(&self) -> &'static str {
        match self {
            SchedulerKind::Slurm => "scancel",
            SchedulerKind::Sge => "qdel",
            SchedulerKind::Torque => "qdel",
        }
    }

    /// The generic "run after these succeeded" flag
    fn job_dependency(&self, idents: &str) -> Vec<String> {
        match self {
            SchedulerKind::Slurm => vec![format!("--dependency=afterok:{}", idents)],
            SchedulerKind::Sge => vec!["-hold_jid".to_string(), idents.to_string()],
            SchedulerKind::Torque => {
                vec!["-W".to_string(), format!("depend=afterok:{}", idents)]
            }
        }
    }

    /// The per-task ("array correlated") dependency flag
    fn array_dependency(&self, ident: &str) -> Vec<String> {
        match self {
            SchedulerKind::Slurm => vec![format!("--dependency=aftercorr:{}", ident)],
            SchedulerKind::Sge => vec!["-hold_jid_ad".to_string(), ident.to_string()],
            SchedulerKind::Torque => {
                vec!["-W".to_string(), format!("depend=afterokarray:{}", ident)]
            }
        }
    }
}

/// Substitute the stdout path template placeholders with the back-end
/// specific tokens
pub(crate) fn render_stdout(
    template: &str,
    name: &str,
    job_ident: &str,
    task_ident: &str,
) -> String {
    template
        .replace("{name}", name)
        .replace("{job_ident}", job_ident)
        .replace("{task_ident}", task_ident)
}

/// One parsed row of a status/accounting command
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PollRow {
    pub job_ident: String,
    pub task_ident: Option<u32>,
    pub name: String,
    pub status: JobStatus,
    pub status_comment: String,
}

/// Resolves job names so that dependency formatting and cascade submission
/// can walk the graph
pub trait JobGraph {
    fn job(&self, name: &str) -> Option<&Job>;
    fn job_mut(&mut self, name: &str) -> Option<&mut Job>;
}

impl JobGraph for std::collections::BTreeMap<String, Job> {
    fn job(&self, name: &str) -> Option<&Job> {
        self.get(name)
    }

    fn job_mut(&mut self, name: &str) -> Option<&mut Job> {
        self.get_mut(name)
    }
}

pub struct Scheduler<'a> {
    kind: SchedulerKind,
    runner: &'a dyn CommandRunner,
}

impl<'a> Scheduler<'a> {
    pub fn new(kind: SchedulerKind, runner: &'a dyn CommandRunner) -> Self {
        Scheduler { kind, runner }
    }

    pub fn kind(&self) -> SchedulerKind {
        self.kind
    }

    /// Submit a job, or a single task of an array job
    ///
    /// Fails if the job was already submitted or if a dependency has no
    /// ident yet and `cascade` is false. With `cascade`, unsubmitted
    /// dependencies are submitted first.
    pub fn submit<G: JobGraph>(
        &self,
        graph: &mut G,
        name: &str,
        task_ident: Option<u32>,
        cascade: bool,
    ) -> Result<()> {
        let dependencies = {
            let job = lookup(graph, name)?;
            if let Some(ident) = job.job_ident() {
                return Err(anyhow!(MavisError::Structural(format!(
                    "job '{}' has already been submitted as {}",
                    name, ident
                ))));
            }
            job.dependencies().clone()
        };

        for dependency in &dependencies {
            if lookup(graph, dependency)?.job_ident().is_none() {
                if !cascade {
                    return Err(anyhow!(MavisError::Structural(format!(
                        "dependency '{}' of job '{}' must be submitted first",
                        dependency, name
                    ))));
                }
                self.submit(graph, dependency, None, cascade)?;
            }
        }

        let dependency_args = self.format_dependencies(graph, name, task_ident)?;
        let command = {
            let job = lookup(graph, name)?;
            match self.kind {
                SchedulerKind::Slurm => slurm::submit_command(job, &dependency_args, task_ident),
                SchedulerKind::Sge => sge::submit_command(job, &dependency_args, task_ident),
                SchedulerKind::Torque => torque::submit_command(job, &dependency_args, task_ident),
            }
        };

        let content = self
            .runner
            .check_output(&command)
            .with_context(|| MavisError::Scheduler(format!("submitting job '{}'", name)))?;
        let ident = match self.kind {
            SchedulerKind::Slurm => slurm::parse_submit_response(&content)?,
            SchedulerKind::Sge => sge::parse_submit_response(&content)?,
            SchedulerKind::Torque => torque::parse_submit_response(&content)?,
        };

        debug!("Job '{}' submitted as {}", name, ident);
        lookup_mut(graph, name)?.assign_ident(ident)
    }

    /// Refresh the job's (and its tasks') status from the scheduler
    pub fn update(&self, job: &mut Job) -> Result<()> {
        let ident = match job.job_ident() {
            Some(ident) => ident.clone(),
            None => return Ok(()),
        };

        let rows = match self.kind {
            SchedulerKind::Slurm => self.poll_slurm(&ident)?,
            SchedulerKind::Sge => self.poll_sge(job, &ident)?,
            SchedulerKind::Torque => self.poll_torque(job, &ident)?,
        };

        apply_rows(job, &ident, rows)
    }

    /// Cancel the job: the ident is cleared and the job (with all its
    /// tasks) becomes CANCELLED
    pub fn cancel(&self, job: &mut Job) -> Result<()> {
        let ident = job.job_ident().clone().ok_or_else(|| {
            anyhow!(MavisError::Structural(format!(
                "job '{}' has not been submitted, nothing to cancel",
                job.name()
            )))
        })?;

        let command = vec![self.kind.cancel_program().to_string(), ident];
        self.runner
            .check_output(&command)
            .with_context(|| MavisError::Scheduler(format!("cancelling job '{}'", job.name())))?;

        job.clear_ident();
        job.set_status(JobStatus::Cancelled, "");
        let tasks: Vec<u32> = job
            .array()
            .as_ref()
            .map(|a| a.task_list().iter().map(|t| t.task_ident()).collect())
            .unwrap_or_default();
        for task in tasks {
            job.update_task(task, JobStatus::Cancelled, "")?;
        }
        Ok(())
    }

    /// Build the dependency arguments for a submission
    ///
    /// A sole dependency on an array job of the same task count yields the
    /// per-task form; everything else yields the generic after-ok list.
    fn format_dependencies<G: JobGraph>(
        &self,
        graph: &G,
        name: &str,
        task_ident: Option<u32>,
    ) -> Result<Vec<String>> {
        let job = lookup(graph, name)?;
        if job.dependencies().is_empty() {
            return Ok(Vec::new());
        }

        if job.dependencies().len() == 1 && job.is_array() && task_ident.is_none() {
            let dependency = lookup(graph, &job.dependencies()[0])?;
            if dependency.is_array() {
                let own = job.array().as_ref().map(|a| a.tasks());
                let theirs = dependency.array().as_ref().map(|a| a.tasks());
                if own != theirs {
                    return Err(anyhow!(MavisError::Structural(format!(
                        "array job '{}' ({:?} tasks) may only depend on an array job \
                         with the same number of tasks, but '{}' has {:?}",
                        name,
                        own,
                        dependency.name(),
                        theirs
                    ))));
                }
                let ident = dependency.job_ident().as_deref().ok_or_else(|| {
                    anyhow!(MavisError::Structural(format!(
                        "dependency '{}' of job '{}' must be submitted first",
                        dependency.name(),
                        name
                    )))
                })?;
                return Ok(self.kind.array_dependency(ident));
            }
        }

        let mut idents = Vec::new();
        for dependency in job.dependencies() {
            let ident = lookup(graph, dependency)?
                .job_ident()
                .clone()
                .ok_or_else(|| {
                    anyhow!(MavisError::Structural(format!(
                        "dependency '{}' of job '{}' must be submitted first",
                        dependency, name
                    )))
                })?;
            idents.push(ident);
        }
        Ok(self
            .kind
            .job_dependency(&idents.join(self.kind.dependency_delim())))
    }

    fn poll_slurm(&self, ident: &str) -> Result<Vec<PollRow>> {
        let command = vec![
            "sacct".to_string(),
            "-j".to_string(),
            ident.to_string(),
            "--long".to_string(),
            "--parsable2".to_string(),
        ];
        let content = self
            .runner
            .check_output(&command)
            .with_context(|| MavisError::Scheduler(format!("polling job {}", ident)))?;
        let rows = slurm::parse_sacct(&content)?;
        if rows.iter().any(|r| r.job_ident == ident) {
            return Ok(rows);
        }

        // not in accounting yet, ask the controller directly
        let command = vec![
            "scontrol".to_string(),
            "show".to_string(),
            "job".to_string(),
            ident.to_string(),
        ];
        let content = self
            .runner
            .check_output(&command)
            .with_context(|| MavisError::Scheduler(format!("polling job {}", ident)))?;
        slurm::parse_scontrol_show(&content)
    }

    fn poll_sge(&self, job: &Job, ident: &str) -> Result<Vec<PollRow>> {
        let mut command = vec!["qstat".to_string()];
        if let Some(queue) = job.queue() {
            command.push("-q".to_string());
            command.push(queue.clone());
        }
        let content = self
            .runner
            .check_output(&command)
            .with_context(|| MavisError::Scheduler(format!("polling job {}", ident)))?;
        let rows: Vec<PollRow> = sge::parse_qstat(&content)?
            .into_iter()
            .filter(|r| r.job_ident == ident)
            .collect();
        if !rows.is_empty() {
            return Ok(rows);
        }

        // job left the active queue, check the accounting records
        let command = vec!["qacct".to_string(), "-j".to_string(), ident.to_string()];
        let content = self
            .runner
            .check_output(&command)
            .with_context(|| MavisError::Scheduler(format!("polling job {}", ident)))?;
        sge::parse_qacct(&content)
    }

    fn poll_torque(&self, job: &Job, ident: &str) -> Result<Vec<PollRow>> {
        let mut command = vec![
            "qstat".to_string(),
            "-f".to_string(),
            ident.to_string(),
        ];
        if job.is_array() {
            command.push("-t".to_string());
        }
        let content = self
            .runner
            .check_output(&command)
            .with_context(|| MavisError::Scheduler(format!("polling job {}", ident)))?;
        torque::parse_qstat(&content)
    }
}

fn lookup<'g, G: JobGraph>(graph: &'g G, name: &str) -> Result<&'g Job> {
    graph.job(name).ok_or_else(|| {
        anyhow!(MavisError::Structural(format!(
            "reference to unknown job '{}'",
            name
        )))
    })
}

fn lookup_mut<'g, G: JobGraph>(graph: &'g mut G, name: &str) -> Result<&'g mut Job> {
    graph.job_mut(name).ok_or_else(|| {
        anyhow!(MavisError::Structural(format!(
            "reference to unknown job '{}'",
            name
        )))
    })
}

/// Apply polled rows to the job: task rows update the indexed task, plain
/// rows the job itself. Array jobs without a direct row fold their task
/// statuses.
fn apply_rows(job: &mut Job, ident: &str, rows: Vec<PollRow>) -> Result<()> {
    let mut job_level_update = false;
    for row in rows.into_iter().filter(|r| r.job_ident == ident) {
        match row.task_ident {
            Some(task) if job.is_array() => {
                job.update_task(task, row.status, &row.status_comment)?;
            }
            _ => {
                job.set_status(row.status, &row.status_comment);
                job_level_update = true;
            }
        }
    }
    if !job_level_update && job.is_array() {
        job.refresh_cumulative_state();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use super::*;
    use crate::schedule::job::ArraySpec;
    use crate::schedule::job::Stage;
    use crate::util::process::test_support::ScriptedRunner;

    fn single(name: &str, dependencies: Vec<String>) -> Job {
        Job::builder()
            .name(name.to_string())
            .stage(Stage::Cluster)
            .script(PathBuf::from("/work/submit.sh"))
            .dependencies(dependencies)
            .build()
    }

    fn array(name: &str, tasks: u32, dependencies: Vec<String>) -> Job {
        Job::builder()
            .name(name.to_string())
            .stage(Stage::Validate)
            .script(PathBuf::from("/work/submit.sh"))
            .dependencies(dependencies)
            .array(Some(ArraySpec::new(tasks, None).unwrap()))
            .build()
    }

    fn graph(jobs: Vec<Job>) -> BTreeMap<String, Job> {
        jobs.into_iter().map(|j| (j.name().clone(), j)).collect()
    }

    #[test]
    fn test_scheduler_kind_wire_format() {
        assert_eq!("SLURM", SchedulerKind::Slurm.to_string());
        assert_eq!(SchedulerKind::Torque, "TORQUE".parse().unwrap());
    }

    #[test]
    fn test_submit_assigns_ident() {
        let runner = ScriptedRunner::new().respond("Submitted batch job 12345\n");
        let scheduler = Scheduler::new(SchedulerKind::Slurm, &runner);
        let mut jobs = graph(vec![single("a", vec![])]);

        scheduler.submit(&mut jobs, "a", None, false).unwrap();
        assert_eq!(Some("12345"), jobs["a"].job_ident().as_deref());
        assert_eq!(JobStatus::Submitted, jobs["a"].status());
    }

    #[test]
    fn test_submit_twice_is_an_error() {
        let runner = ScriptedRunner::new().respond("Submitted batch job 12345");
        let scheduler = Scheduler::new(SchedulerKind::Slurm, &runner);
        let mut jobs = graph(vec![single("a", vec![])]);

        scheduler.submit(&mut jobs, "a", None, false).unwrap();
        assert!(scheduler.submit(&mut jobs, "a", None, false).is_err());
    }

    #[test]
    fn test_unsubmitted_dependency_without_cascade() {
        let runner = ScriptedRunner::new();
        let scheduler = Scheduler::new(SchedulerKind::Slurm, &runner);
        let mut jobs = graph(vec![single("a", vec![]), single("b", vec!["a".to_string()])]);

        assert!(scheduler.submit(&mut jobs, "b", None, false).is_err());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_cascade_submits_dependencies_first() {
        let runner = ScriptedRunner::new()
            .respond("Submitted batch job 100")
            .respond("Submitted batch job 101");
        let scheduler = Scheduler::new(SchedulerKind::Slurm, &runner);
        let mut jobs = graph(vec![single("a", vec![]), single("b", vec!["a".to_string()])]);

        scheduler.submit(&mut jobs, "b", None, true).unwrap();
        assert_eq!(Some("100"), jobs["a"].job_ident().as_deref());
        assert_eq!(Some("101"), jobs["b"].job_ident().as_deref());
        assert!(runner.command_line(1).contains("--dependency=afterok:100"));
    }

    #[test]
    fn test_matched_arrays_use_per_task_dependency() {
        for (kind, response_a, response_b, expected) in [
            (
                SchedulerKind::Slurm,
                "Submitted batch job 100",
                "Submitted batch job 101",
                "--dependency=aftercorr:100",
            ),
            (
                SchedulerKind::Sge,
                r#"Your job-array 100.1-5:1 ("a") has been submitted"#,
                r#"Your job-array 101.1-5:1 ("b") has been submitted"#,
                "-hold_jid_ad 100",
            ),
            (
                SchedulerKind::Torque,
                "100[].host",
                "101[].host",
                "-W depend=afterokarray:100",
            ),
        ] {
            let runner = ScriptedRunner::new().respond(response_a).respond(response_b);
            let scheduler = Scheduler::new(kind, &runner);
            let mut jobs = graph(vec![
                array("a", 5, vec![]),
                array("b", 5, vec!["a".to_string()]),
            ]);

            scheduler.submit(&mut jobs, "a", None, false).unwrap();
            scheduler.submit(&mut jobs, "b", None, false).unwrap();
            let ident = match kind {
                SchedulerKind::Torque => "100[].host",
                _ => "100",
            };
            assert_eq!(Some(ident), jobs["a"].job_ident().as_deref());
            let expected = match kind {
                SchedulerKind::Torque => "-W depend=afterokarray:100[].host".to_string(),
                _ => expected.to_string(),
            };
            assert!(
                runner.command_line(1).contains(&expected),
                "{:?}: {}",
                kind,
                runner.command_line(1)
            );
        }
    }

    #[test]
    fn test_mismatched_array_sizes_are_rejected() {
        let runner = ScriptedRunner::new().respond("Submitted batch job 100");
        let scheduler = Scheduler::new(SchedulerKind::Slurm, &runner);
        let mut jobs = graph(vec![
            array("a", 5, vec![]),
            array("b", 7, vec!["a".to_string()]),
        ]);

        scheduler.submit(&mut jobs, "a", None, false).unwrap();
        assert!(scheduler.submit(&mut jobs, "b", None, false).is_err());
    }

    #[test]
    fn test_multiple_dependencies_use_the_generic_form() {
        let runner = ScriptedRunner::new()
            .respond("Submitted batch job 1")
            .respond("Submitted batch job 2")
            .respond("Submitted batch job 3");
        let scheduler = Scheduler::new(SchedulerKind::Slurm, &runner);
        let mut jobs = graph(vec![
            single("a", vec![]),
            single("b", vec![]),
            single("c", vec!["a".to_string(), "b".to_string()]),
        ]);

        scheduler.submit(&mut jobs, "a", None, false).unwrap();
        scheduler.submit(&mut jobs, "b", None, false).unwrap();
        scheduler.submit(&mut jobs, "c", None, false).unwrap();
        assert!(runner.command_line(2).contains("--dependency=afterok:1:2"));
    }

    #[test]
    fn test_cancel_clears_ident_and_marks_tasks() {
        let runner = ScriptedRunner::new()
            .respond("Submitted batch job 55")
            .respond("");
        let scheduler = Scheduler::new(SchedulerKind::Slurm, &runner);
        let mut jobs = graph(vec![array("a", 2, vec![])]);

        scheduler.submit(&mut jobs, "a", None, false).unwrap();
        let job = jobs.get_mut("a").unwrap();
        scheduler.cancel(job).unwrap();

        assert_eq!(None, job.job_ident().as_deref());
        assert_eq!(JobStatus::Cancelled, job.status());
        assert!(job
            .array()
            .as_ref()
            .unwrap()
            .task_list()
            .iter()
            .all(|t| t.status() == JobStatus::Cancelled));
        assert_eq!(vec!["scancel".to_string(), "55".to_string()], runner.calls()[1]);
    }

    #[test]
    fn test_scheduler_failure_carries_the_scheduler_kind() {
        let runner = ScriptedRunner::new().fail("sbatch: error: invalid partition");
        let scheduler = Scheduler::new(SchedulerKind::Slurm, &runner);
        let mut jobs = graph(vec![single("a", vec![])]);

        let err = scheduler.submit(&mut jobs, "a", None, false).unwrap_err();
        assert_eq!(2, crate::error::exit_code(&err));
    }

    #[test]
    fn test_unparseable_submit_response() {
        let runner = ScriptedRunner::new().respond("something unexpected");
        let scheduler = Scheduler::new(SchedulerKind::Slurm, &runner);
        let mut jobs = graph(vec![single("a", vec![])]);

        let err = scheduler.submit(&mut jobs, "a", None, false).unwrap_err();
        assert_eq!(2, crate::error::exit_code(&err));
    }

    #[test]
    fn test_render_stdout() {
        assert_eq!(
            "/out/%x.o%A.%a",
            render_stdout("/out/{name}.o{job_ident}.{task_ident}", "%x", "%A", "%a")
        );
    }
}
