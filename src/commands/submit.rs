//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The `submit` subcommand
//!
//! Reads the build manifest, refreshes scheduler state, fixes deferred
//! array sizes and submits every job whose dependencies are in place, in
//! topological order. The manifest is rewritten after every assignment so a
//! dependent job is never submitted before its dependency is on record.
//!
//! `--resubmit` additionally re-submits the FAILED/CANCELLED tasks of
//! finished jobs, task by task.

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use clap::ArgMatches;
use tracing::debug;
use tracing::info;

use crate::error::MavisError;
use crate::pipeline::Pipeline;
use crate::pipeline::BUILD_FILE;
use crate::schedule::scheduler::JobGraph;
use crate::schedule::scheduler::Scheduler;
use crate::util::process::SystemRunner;

pub fn submit(matches: &ArgMatches) -> Result<()> {
    let output = crate::commands::output_dir(matches);
    let resubmit = matches.get_flag("resubmit");
    let build_file = output.join(BUILD_FILE);

    let mut pipeline = Pipeline::read_build_file(&build_file)?;
    let kind = crate::commands::scheduler_override(matches)?.unwrap_or_else(|| pipeline.scheduler());
    which::which(kind.submit_program()).map_err(|_| {
        anyhow!(MavisError::Scheduler(format!(
            "scheduler command '{}' not found on PATH",
            kind.submit_program()
        )))
    })?;

    let runner = SystemRunner;
    let scheduler = Scheduler::new(kind, &runner);

    // refresh the state of everything the scheduler still knows about
    let names: Vec<String> = pipeline.jobs().map(|j| j.name().clone()).collect();
    for name in &names {
        let job = pipeline.job_mut(name).expect("name taken from the pipeline");
        if job.job_ident().is_some() && !job.status().is_terminal() {
            scheduler.update(job)?;
        }
    }
    pipeline.write_build_file(&build_file)?;

    pipeline.discover_array_tasks()?;

    let mut submitted = 0;
    let mut deferred = 0;
    for name in pipeline.submission_order()? {
        let job = pipeline.job(&name).expect("name from submission order");

        if job.job_ident().is_some() {
            if resubmit && job.status().is_resubmittable() {
                resubmit_job(&scheduler, &mut pipeline, &name)?;
                pipeline.write_build_file(&build_file)?;
                submitted += 1;
            }
            continue;
        }

        if job.stage().is_array() && job.array().is_none() {
            info!(
                "Deferring '{}': its task count is not known until clustering completes",
                name
            );
            deferred += 1;
            continue;
        }
        let waiting: Vec<String> = job
            .dependencies()
            .iter()
            .filter(|dependency| {
                pipeline
                    .job(dependency)
                    .map(|d| d.job_ident().is_none())
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        if !waiting.is_empty() {
            debug!("Deferring '{}': waiting for {:?}", name, waiting);
            deferred += 1;
            continue;
        }

        scheduler.submit(&mut pipeline, &name, None, false)?;
        pipeline.write_build_file(&build_file)?;
        info!(
            "Submitted '{}' as {}",
            name,
            pipeline
                .job(&name)
                .and_then(|j| j.job_ident().clone())
                .unwrap_or_default()
        );
        submitted += 1;
    }

    // persist discovered task counts even when nothing was submittable
    pipeline.write_build_file(&build_file)?;

    info!("{} jobs submitted, {} deferred", submitted, deferred);
    if deferred > 0 {
        info!("Run 'mavis submit' again once the deferred jobs become submittable");
    }
    Ok(())
}

/// Re-submit a job that finished in FAILED/CANCELLED state
///
/// Array jobs re-run only their failed tasks, one submission per task; the
/// stored ident follows the last submission. Single jobs are simply
/// submitted again.
fn resubmit_job(scheduler: &Scheduler<'_>, pipeline: &mut Pipeline, name: &str) -> Result<()> {
    let failed = pipeline
        .job(name)
        .expect("caller resolved the name")
        .failed_tasks();

    if failed.is_empty() {
        info!("Re-submitting '{}'", name);
        pipeline
            .job_mut(name)
            .expect("caller resolved the name")
            .clear_ident();
        return scheduler.submit(pipeline, name, None, false);
    }

    info!("Re-submitting {} failed tasks of '{}'", failed.len(), name);
    for task in failed {
        pipeline
            .job_mut(name)
            .expect("caller resolved the name")
            .clear_ident();
        scheduler
            .submit(pipeline, name, Some(task), false)
            .with_context(|| format!("re-submitting task {} of '{}'", task, name))?;
    }
    Ok(())
}
