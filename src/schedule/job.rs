//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The passive job model
//!
//! A [Job] is a plain value describing one scheduler submission. Array jobs
//! carry an [ArraySpec] with one [Task] record per task. The model enforces
//! the structural invariants (non-zero task counts, contiguous task indices,
//! single ident assignment) and nothing else; policy lives with the callers.

use std::path::PathBuf;

use anyhow::anyhow;
use anyhow::Result;
use getset::CopyGetters;
use getset::Getters;
use parse_display::Display;
use parse_display::FromStr;
use typed_builder::TypedBuilder;

use crate::error::MavisError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromStr)]
#[display(style = "SNAKE_CASE")]
pub enum JobStatus {
    NotSubmitted,
    Submitted,
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Error,
    Unknown,
}

impl JobStatus {
    /// A terminal status will not change without a new submission
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Error
        )
    }

    /// Statuses that allow (re-)submission of the job's failed tasks
    pub fn is_resubmittable(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// Fold a set of task states into one status, worst state wins
///
/// ERROR > FAILED > CANCELLED > RUNNING > PENDING > UNKNOWN > COMPLETED
pub fn cumulative_state<I>(states: I) -> JobStatus
where
    I: IntoIterator<Item = JobStatus>,
{
    let states: Vec<JobStatus> = states.into_iter().collect();
    let has = |status: JobStatus| states.contains(&status);

    if states.is_empty() {
        JobStatus::Unknown
    } else if has(JobStatus::Error) {
        JobStatus::Error
    } else if has(JobStatus::Failed) {
        JobStatus::Failed
    } else if has(JobStatus::Cancelled) {
        JobStatus::Cancelled
    } else if has(JobStatus::Running) {
        JobStatus::Running
    } else if has(JobStatus::Pending) || has(JobStatus::Submitted) {
        JobStatus::Pending
    } else if states.iter().all(|s| *s == JobStatus::Completed) {
        JobStatus::Completed
    } else {
        JobStatus::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromStr)]
#[display(style = "lowercase")]
pub enum Stage {
    Cluster,
    Validate,
    Annotate,
    Pairing,
    Summary,
}

impl Stage {
    /// Validate and annotate fan out as job arrays, the other stages are
    /// single submissions
    pub fn is_array(&self) -> bool {
        matches!(self, Stage::Validate | Stage::Annotate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromStr)]
#[display(style = "UPPERCASE")]
pub enum MailType {
    None,
    Begin,
    End,
    Fail,
    All,
}

/// One task of an array job, identified by its 1-based index
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct Task {
    #[getset(get_copy = "pub")]
    task_ident: u32,

    #[getset(get_copy = "pub")]
    status: JobStatus,

    #[getset(get = "pub")]
    status_comment: String,
}

impl Task {
    fn new(task_ident: u32) -> Self {
        Task {
            task_ident,
            status: JobStatus::NotSubmitted,
            status_comment: String::new(),
        }
    }

    pub(crate) fn set_status(&mut self, status: JobStatus, comment: &str) {
        self.status = status;
        self.status_comment = comment.to_string();
    }
}

/// The array part of an array job: the task count, an optional concurrency
/// cap and the per-task records
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct ArraySpec {
    #[getset(get_copy = "pub")]
    tasks: u32,

    #[getset(get_copy = "pub")]
    concurrency_limit: Option<u32>,

    task_list: Vec<Task>,
}

impl ArraySpec {
    pub fn new(tasks: u32, concurrency_limit: Option<u32>) -> Result<Self> {
        if tasks == 0 {
            return Err(anyhow!(MavisError::Structural(
                "array jobs must have at least one task".to_string()
            )));
        }
        Ok(ArraySpec {
            tasks,
            concurrency_limit,
            task_list: (1..=tasks).map(Task::new).collect(),
        })
    }

    pub fn task_list(&self) -> &[Task] {
        &self.task_list
    }

    pub fn task(&self, task_ident: u32) -> Option<&Task> {
        self.task_list.get(task_ident.checked_sub(1)? as usize)
    }

    pub(crate) fn task_mut(&mut self, task_ident: u32) -> Option<&mut Task> {
        self.task_list.get_mut(task_ident.checked_sub(1)? as usize)
    }

    /// The worst-wins status over all tasks
    pub fn cumulative_state(&self) -> JobStatus {
        cumulative_state(self.task_list.iter().map(Task::status))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters, TypedBuilder)]
pub struct Job {
    /// Unique within one pipeline
    #[getset(get = "pub")]
    name: String,

    #[getset(get_copy = "pub")]
    stage: Stage,

    #[getset(get = "pub")]
    script: PathBuf,

    #[builder(default)]
    #[getset(get = "pub")]
    queue: Option<String>,

    /// Memory in MB
    #[builder(default)]
    #[getset(get_copy = "pub")]
    memory_limit: Option<u64>,

    /// Wall time in seconds
    #[builder(default)]
    #[getset(get_copy = "pub")]
    time_limit: Option<u64>,

    #[builder(default = true)]
    #[getset(get_copy = "pub")]
    import_env: bool,

    /// Stdout path template with `{name}`, `{job_ident}` and `{task_ident}`
    /// placeholders, substituted per back-end on submission
    #[builder(default)]
    #[getset(get = "pub")]
    stdout: Option<String>,

    #[builder(default)]
    #[getset(get_copy = "pub")]
    mail_type: Option<MailType>,

    #[builder(default)]
    #[getset(get = "pub")]
    mail_user: Option<String>,

    /// Names of the jobs this job waits for
    #[builder(default)]
    #[getset(get = "pub")]
    dependencies: Vec<String>,

    #[builder(default = JobStatus::NotSubmitted)]
    #[getset(get_copy = "pub")]
    status: JobStatus,

    #[builder(default)]
    #[getset(get = "pub")]
    status_comment: String,

    /// Assigned by the scheduler on submission
    #[builder(default)]
    #[getset(get = "pub")]
    job_ident: Option<String>,

    /// Present iff this is an array job. Validate/annotate jobs built
    /// without a known task count carry `None` until the cluster output has
    /// been inspected.
    #[builder(default)]
    #[getset(get = "pub")]
    array: Option<ArraySpec>,
}

impl Job {
    pub fn is_array(&self) -> bool {
        self.array.is_some()
    }

    /// Record the scheduler-assigned ident
    ///
    /// The ident is set exactly once; re-assigning a non-empty ident is a
    /// structural error. Tasks of an array job move to SUBMITTED along with
    /// the job, except tasks that already COMPLETED (a resubmission only
    /// re-runs the others).
    pub fn assign_ident(&mut self, ident: String) -> Result<()> {
        if self.job_ident.is_some() {
            return Err(anyhow!(MavisError::Structural(format!(
                "job '{}' has already been submitted as {}",
                self.name,
                self.job_ident.as_deref().unwrap_or_default()
            ))));
        }
        self.job_ident = Some(ident);
        self.status = JobStatus::Submitted;
        self.status_comment.clear();
        if let Some(array) = self.array.as_mut() {
            for task in array.task_list.iter_mut() {
                if task.status != JobStatus::Completed {
                    task.set_status(JobStatus::Submitted, "");
                }
            }
        }
        Ok(())
    }

    pub fn clear_ident(&mut self) {
        self.job_ident = None;
    }

    pub fn set_status(&mut self, status: JobStatus, comment: &str) {
        self.status = status;
        self.status_comment = comment.to_string();
    }

    /// Mark one task of an array job with the status reported by the
    /// scheduler
    pub fn update_task(&mut self, task_ident: u32, status: JobStatus, comment: &str) -> Result<()> {
        let name = self.name.clone();
        self.array
            .as_mut()
            .and_then(|array| array.task_mut(task_ident))
            .ok_or_else(|| {
                anyhow!(MavisError::Structural(format!(
                    "job '{}' has no task {}",
                    name, task_ident
                )))
            })?
            .set_status(status, comment);
        Ok(())
    }

    /// Fold the task statuses into the job status (array jobs only)
    pub fn refresh_cumulative_state(&mut self) {
        if let Some(array) = self.array.as_ref() {
            self.status = array.cumulative_state();
        }
    }

    pub(crate) fn set_dependencies(&mut self, dependencies: Vec<String>) {
        self.dependencies = dependencies;
    }

    /// Attach the array spec once the task count is known
    pub fn set_array(&mut self, spec: ArraySpec) -> Result<()> {
        if self.array.is_some() {
            return Err(anyhow!(MavisError::Structural(format!(
                "job '{}' already has its task count fixed",
                self.name
            ))));
        }
        self.array = Some(spec);
        Ok(())
    }

    /// Task idents of all tasks in a resubmittable state
    pub fn failed_tasks(&self) -> Vec<u32> {
        self.array
            .as_ref()
            .map(|array| {
                array
                    .task_list()
                    .iter()
                    .filter(|t| t.status().is_resubmittable())
                    .map(Task::task_ident)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str) -> Job {
        Job::builder()
            .name(name.to_string())
            .stage(Stage::Cluster)
            .script(PathBuf::from("/tmp/submit.sh"))
            .build()
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!("NOT_SUBMITTED", JobStatus::NotSubmitted.to_string());
        assert_eq!("COMPLETED", JobStatus::Completed.to_string());
        assert_eq!(
            JobStatus::NotSubmitted,
            "NOT_SUBMITTED".parse::<JobStatus>().unwrap()
        );
        assert!("NOT A STATUS".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_stage_wire_format() {
        assert_eq!("validate", Stage::Validate.to_string());
        assert_eq!(Stage::Pairing, "pairing".parse::<Stage>().unwrap());
    }

    #[test]
    fn test_zero_tasks_rejected() {
        assert!(ArraySpec::new(0, None).is_err());
        assert!(ArraySpec::new(1, None).is_ok());
    }

    #[test]
    fn test_task_indices_are_contiguous() {
        let array = ArraySpec::new(5, Some(2)).unwrap();
        let idents: Vec<u32> = array.task_list().iter().map(Task::task_ident).collect();
        assert_eq!(vec![1, 2, 3, 4, 5], idents);
    }

    #[test]
    fn test_cumulative_state_worst_wins() {
        use JobStatus::*;

        assert_eq!(Error, cumulative_state(vec![Completed, Error, Running]));
        assert_eq!(Failed, cumulative_state(vec![Completed, Failed, Running]));
        assert_eq!(Cancelled, cumulative_state(vec![Cancelled, Running]));
        assert_eq!(Running, cumulative_state(vec![Completed, Running, Pending]));
        assert_eq!(Pending, cumulative_state(vec![Completed, Pending]));
        assert_eq!(Pending, cumulative_state(vec![Completed, Submitted]));
        assert_eq!(Completed, cumulative_state(vec![Completed, Completed]));
        assert_eq!(Unknown, cumulative_state(vec![Completed, NotSubmitted]));
        assert_eq!(Unknown, cumulative_state(Vec::new()));
    }

    #[test]
    fn test_cumulative_state_monotone_under_worse() {
        use JobStatus::*;

        // adding a worse state never improves the cumulative result
        let ladder = [Completed, Unknown, Pending, Running, Cancelled, Failed, Error];
        let rank = |status: JobStatus| ladder.iter().position(|s| *s == status).unwrap();

        for (i, worse) in ladder.iter().enumerate() {
            for better in &ladder[..=i] {
                let combined = cumulative_state(vec![*better, *worse]);
                assert!(
                    rank(combined) >= rank(*better),
                    "{:?} + {:?} -> {:?}",
                    better,
                    worse,
                    combined
                );
            }
        }
    }

    #[test]
    fn test_ident_is_assigned_exactly_once() {
        let mut j = job("cluster_K562");
        j.assign_ident("1234".to_string()).unwrap();
        assert_eq!(Some("1234"), j.job_ident().as_deref());
        assert_eq!(JobStatus::Submitted, j.status());
        assert!(j.assign_ident("5678".to_string()).is_err());

        j.clear_ident();
        assert!(j.assign_ident("5678".to_string()).is_ok());
    }

    #[test]
    fn test_array_status_follows_tasks() {
        let mut j = Job::builder()
            .name("validate_K562".to_string())
            .stage(Stage::Validate)
            .script(PathBuf::from("/tmp/submit.sh"))
            .array(Some(ArraySpec::new(3, None).unwrap()))
            .build();

        j.assign_ident("99".to_string()).unwrap();
        j.update_task(1, JobStatus::Completed, "").unwrap();
        j.update_task(2, JobStatus::Failed, "walltime").unwrap();
        j.update_task(3, JobStatus::Running, "").unwrap();
        j.refresh_cumulative_state();
        assert_eq!(JobStatus::Failed, j.status());
        assert_eq!(vec![2], j.failed_tasks());

        assert!(j.update_task(4, JobStatus::Completed, "").is_err());
    }
}
