//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Pipeline layout and job graph
//!
//! [Pipeline::build] materializes the output directory tree for a user
//! configuration, runs the input conversions, emits one worker script per
//! job and assembles the job graph:
//!
//! per library:  cluster -> validate\[N\] -> annotate\[N\] (per task)
//! across:       every annotate -> pairing -> summary
//!
//! The validate/annotate task count N is only known once the cluster job has
//! partitioned its input; [Pipeline::discover_array_tasks] fixes N during
//! the submit phase by counting the partition files.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use daggy::petgraph;
use daggy::Dag;
use getset::CopyGetters;
use getset::Getters;
use lazy_static::lazy_static;
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::Conversion;
use crate::config::LibraryConfig;
use crate::config::Protocol;
use crate::config::UserConfig;
use crate::error::MavisError;
use crate::schedule::job::ArraySpec;
use crate::schedule::job::Job;
use crate::schedule::job::JobStatus;
use crate::schedule::job::Stage;
use crate::schedule::scheduler::JobGraph;
use crate::schedule::scheduler::SchedulerKind;
use crate::util::expand_glob;
use crate::util::format_elapsed;
use crate::util::process::CommandRunner;

pub mod manifest;

pub const BUILD_FILE: &str = "build.cfg";
pub const CONVERTED_INPUTS_DIR: &str = "converted_inputs";

/// The analytic worker entry point invoked by the emitted scripts
pub const WORKER_PROGRAM: &str = "mavis";

const SCRIPT_NAME: &str = "submit.sh";
const VALIDATION_PASS_SUFFIX: &str = ".validation-passed.tab";

lazy_static! {
    static ref PARTITION_FILE: Regex = Regex::new(r"^batch-[0-9a-zA-Z-]+-(\d+)\.tab$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct Pipeline {
    #[getset(get = "pub")]
    output: PathBuf,

    #[getset(get_copy = "pub")]
    scheduler: SchedulerKind,

    /// Prefix naming this clustering run; per-task artifacts live in
    /// `<batch_id>-<k>` files and directories
    #[getset(get = "pub")]
    batch_id: String,

    #[getset(get = "pub")]
    queue: Option<String>,

    #[getset(get_copy = "pub")]
    memory_limit: Option<u64>,

    #[getset(get_copy = "pub")]
    time_limit: Option<u64>,

    #[getset(get_copy = "pub")]
    concurrency_limit: Option<u32>,

    #[getset(get_copy = "pub")]
    skip_validate: bool,

    #[getset(get_copy = "pub")]
    skip_pairing: bool,

    #[getset(get = "pub")]
    clusterings: Vec<Job>,

    #[getset(get = "pub")]
    validations: Vec<Job>,

    #[getset(get = "pub")]
    annotations: Vec<Job>,

    #[getset(get = "pub")]
    pairing: Option<Job>,

    #[getset(get = "pub")]
    summary: Option<Job>,
}

impl JobGraph for Pipeline {
    fn job(&self, name: &str) -> Option<&Job> {
        self.jobs().find(|j| j.name() == name)
    }

    fn job_mut(&mut self, name: &str) -> Option<&mut Job> {
        self.jobs_mut().find(|j| j.name() == name)
    }
}

impl Pipeline {
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.clusterings
            .iter()
            .chain(self.validations.iter())
            .chain(self.annotations.iter())
            .chain(self.pairing.iter())
            .chain(self.summary.iter())
    }

    pub fn jobs_mut(&mut self) -> impl Iterator<Item = &mut Job> {
        self.clusterings
            .iter_mut()
            .chain(self.validations.iter_mut())
            .chain(self.annotations.iter_mut())
            .chain(self.pairing.iter_mut())
            .chain(self.summary.iter_mut())
    }

    pub fn build_file(&self) -> PathBuf {
        self.output.join(BUILD_FILE)
    }

    /// Check the structural invariants: unique names, resolvable
    /// dependencies, no cycles, matched array-to-array dependencies
    pub fn validate_structure(&self) -> Result<()> {
        let mut names = BTreeSet::new();
        for job in self.jobs() {
            if !names.insert(job.name().clone()) {
                return Err(anyhow!(MavisError::Structural(format!(
                    "duplicate job name '{}'",
                    job.name()
                ))));
            }
        }

        for job in self.jobs() {
            let mut array_dependencies = 0;
            for dependency in job.dependencies() {
                let dependency = self.job(dependency).ok_or_else(|| {
                    anyhow!(MavisError::Structural(format!(
                        "job '{}' depends on unknown job '{}'",
                        job.name(),
                        dependency
                    )))
                })?;
                if dependency.is_array() {
                    array_dependencies += 1;
                }
            }
            if job.is_array() && array_dependencies > 1 {
                return Err(anyhow!(MavisError::Structural(format!(
                    "array job '{}' may depend on at most one array job",
                    job.name()
                ))));
            }
            if job.is_array() && job.dependencies().len() == 1 {
                let dependency = self.job(&job.dependencies()[0]).expect("checked above");
                if dependency.is_array() {
                    let own = job.array().as_ref().map(|a| a.tasks());
                    let theirs = dependency.array().as_ref().map(|a| a.tasks());
                    if own != theirs {
                        return Err(anyhow!(MavisError::Structural(format!(
                            "array job '{}' and its dependency '{}' must have the \
                             same number of tasks",
                            job.name(),
                            dependency.name()
                        ))));
                    }
                }
            }
        }

        self.submission_order().map(|_| ())
    }

    /// Topological order over the dependency graph, dependencies first
    pub fn submission_order(&self) -> Result<Vec<String>> {
        let mut dag: Dag<String, ()> = Dag::new();
        let mut indices = HashMap::new();
        for job in self.jobs() {
            let index = dag.add_node(job.name().clone());
            indices.insert(job.name().clone(), index);
        }
        for job in self.jobs() {
            for dependency in job.dependencies() {
                let from = indices.get(dependency).ok_or_else(|| {
                    anyhow!(MavisError::Structural(format!(
                        "job '{}' depends on unknown job '{}'",
                        job.name(),
                        dependency
                    )))
                })?;
                let to = indices
                    .get(job.name())
                    .expect("every job was added as a node");
                dag.add_edge(*from, *to, ()).map_err(|_| {
                    anyhow!(MavisError::Structural(format!(
                        "dependency cycle through job '{}'",
                        job.name()
                    )))
                })?;
            }
        }

        let sorted = petgraph::algo::toposort(dag.graph(), None)
            .map_err(|_| anyhow!(MavisError::Structural("dependency cycle".to_string())))?;
        Ok(sorted
            .into_iter()
            .map(|index| dag.graph()[index].clone())
            .collect())
    }

    /// Fix the task count of deferred validate/annotate arrays
    ///
    /// Once a cluster job is COMPLETED its `<batch>-<k>.tab` partitions are
    /// counted and the dependent arrays are sized accordingly. Arrays whose
    /// cluster job has not finished are left for a later invocation.
    pub fn discover_array_tasks(&mut self) -> Result<()> {
        let concurrency_limit = self.concurrency_limit;

        // validate (or annotate, when validation is skipped) arrays are
        // sized from the cluster partitions; annotate follows its validate
        let order = self.submission_order()?;
        for name in order {
            let job = self.job(&name).expect("name from submission order");
            if !job.stage().is_array() || job.is_array() {
                continue;
            }
            let dependency_name = match job.dependencies().first() {
                Some(dependency) => dependency.clone(),
                None => continue,
            };
            let dependency = self.job(&dependency_name).ok_or_else(|| {
                anyhow!(MavisError::Structural(format!(
                    "job '{}' depends on unknown job '{}'",
                    name, dependency_name
                )))
            })?;

            let tasks = match (dependency.stage(), dependency.array()) {
                // chained array: reuse the already-discovered size
                (_, Some(array)) => Some(array.tasks()),
                (Stage::Cluster, None) => {
                    if dependency.status() != JobStatus::Completed {
                        info!(
                            "Cluster job '{}' has not completed yet, task count of '{}' \
                             stays undetermined",
                            dependency_name, name
                        );
                        None
                    } else {
                        let cluster_dir = dependency
                            .script()
                            .parent()
                            .map(Path::to_path_buf)
                            .unwrap_or_default();
                        match count_partitions(&cluster_dir) {
                            0 => {
                                warn!(
                                    "Cluster job '{}' completed but produced no partition \
                                     files in {}",
                                    dependency_name,
                                    cluster_dir.display()
                                );
                                None
                            }
                            n => Some(n),
                        }
                    }
                }
                _ => None,
            };

            if let Some(tasks) = tasks {
                info!("Job '{}' fans out to {} tasks", name, tasks);
                let spec = ArraySpec::new(tasks, concurrency_limit)?;
                let stage_dir = self
                    .job(&name)
                    .expect("name from submission order")
                    .script()
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                let batch_id = self.batch_id.clone();
                for task in 1..=tasks {
                    let task_dir = stage_dir.join(format!("{}-{}", batch_id, task));
                    std::fs::create_dir_all(&task_dir)
                        .with_context(|| format!("Creating {}", task_dir.display()))?;
                }
                self.job_mut(&name)
                    .expect("name from submission order")
                    .set_array(spec)?;
            }
        }
        Ok(())
    }

    /// Set up the output tree, run conversions, write worker scripts and
    /// assemble the job graph
    pub fn build(
        config: &UserConfig,
        output: &Path,
        scheduler: Option<SchedulerKind>,
        dry: bool,
        runner: &dyn CommandRunner,
    ) -> Result<Pipeline> {
        let general = config.general();
        let scheduler = scheduler.unwrap_or_else(|| general.scheduler());
        let batch_id = reuse_or_generate_batch_id(output);
        info!("Setting up pipeline {} under {}", batch_id, output.display());

        let conversion_dir = output.join(CONVERTED_INPUTS_DIR);
        std::fs::create_dir_all(&conversion_dir)
            .with_context(|| format!("Creating {}", conversion_dir.display()))?;

        run_conversions(config, &conversion_dir, runner)?;

        let mut pipeline = Pipeline {
            output: output.to_path_buf(),
            scheduler,
            batch_id: batch_id.clone(),
            queue: general.queue().clone(),
            memory_limit: Some(general.memory_limit()),
            time_limit: Some(general.time_limit()),
            concurrency_limit: general.concurrency_limit(),
            skip_validate: general.skip_validate(),
            skip_pairing: general.skip_pairing(),
            clusterings: Vec::new(),
            validations: Vec::new(),
            annotations: Vec::new(),
            pairing: None,
            summary: None,
        };

        let emit = ScriptEmitter {
            config,
            scheduler,
            batch_id: &batch_id,
        };

        let mut annotate_names = Vec::new();
        let mut annotate_input_globs = Vec::new();
        for library in config.libraries() {
            let library_dir = output.join(format!(
                "{}_{}_{}",
                library.name(),
                library.disease_status(),
                library.protocol()
            ));
            info!(
                "Setting up the directory structure for {} as {}",
                library.name(),
                library_dir.display()
            );
            let cluster_dir = library_dir.join(Stage::Cluster.to_string());
            let validate_dir = library_dir.join(Stage::Validate.to_string());
            let annotate_dir = library_dir.join(Stage::Annotate.to_string());
            for dir in [&cluster_dir, &validate_dir, &annotate_dir] {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Creating {}", dir.display()))?;
            }

            let inputs = resolve_inputs(config, library, &conversion_dir)?;

            let cluster_name = format!("cluster_{}_{}", library.name(), batch_id);
            let cluster =
                emit.cluster_job(&cluster_name, &cluster_dir, library, &inputs)?;
            pipeline.clusterings.push(cluster);

            let dry_array = || -> Result<Option<ArraySpec>> {
                if dry {
                    ArraySpec::new(1, general.concurrency_limit()).map(Some)
                } else {
                    Ok(None)
                }
            };

            let validate_name = format!("validate_{}_{}", library.name(), batch_id);
            let annotate_name = format!("annotate_{}_{}", library.name(), batch_id);
            let annotate_depends_on = if general.skip_validate() {
                cluster_name.clone()
            } else {
                let validate = emit.validate_job(
                    &validate_name,
                    &validate_dir,
                    &cluster_dir,
                    library,
                    &cluster_name,
                    dry_array()?,
                )?;
                pipeline.validations.push(validate);
                validate_name.clone()
            };

            let annotate = emit.annotate_job(
                &annotate_name,
                &annotate_dir,
                &validate_dir,
                &cluster_dir,
                &annotate_depends_on,
                general.skip_validate(),
                dry_array()?,
            )?;
            pipeline.annotations.push(annotate);
            annotate_names.push(annotate_name);
            annotate_input_globs.push(
                annotate_dir
                    .join(format!("{}-*", batch_id))
                    .join("annotations.tab")
                    .display()
                    .to_string(),
            );

            if dry {
                for dir in [&validate_dir, &annotate_dir] {
                    let task_dir = dir.join(format!("{}-1", batch_id));
                    std::fs::create_dir_all(&task_dir)
                        .with_context(|| format!("Creating {}", task_dir.display()))?;
                }
            }
        }

        if pipeline.clusterings.is_empty() {
            return Err(anyhow!(MavisError::InvalidInput(
                "the configuration defines no libraries".to_string()
            )));
        }

        if general.skip_pairing() {
            // summary consumes the pairing output, skipping pairing skips both
            info!("Pairing is skipped, no pairing/summary jobs are set up");
        } else {
            let pairing_dir = output.join(Stage::Pairing.to_string());
            let summary_dir = output.join(Stage::Summary.to_string());
            for dir in [&pairing_dir, &summary_dir] {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Creating {}", dir.display()))?;
            }

            let pairing_name = format!("pairing_{}", batch_id);
            let pairing = emit.pairing_job(
                &pairing_name,
                &pairing_dir,
                &annotate_input_globs,
                annotate_names,
            )?;
            pipeline.pairing = Some(pairing);

            let summary_name = format!("summary_{}", batch_id);
            let summary =
                emit.summary_job(&summary_name, &summary_dir, &pairing_dir, &pairing_name)?;
            pipeline.summary = Some(summary);
        }

        pipeline.validate_structure()?;
        Ok(pipeline)
    }
}

/// Count the `<batch>-<k>.tab` partition files a cluster job wrote
///
/// The count is the highest task index seen, so a missing middle partition
/// still surfaces later as a failed task instead of shrinking the array.
fn count_partitions(cluster_dir: &Path) -> u32 {
    crate::util::dir_entries(cluster_dir)
        .iter()
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
        .filter_map(|name| PARTITION_FILE.captures(name))
        .filter_map(|captures| captures[1].parse::<u32>().ok())
        .max()
        .unwrap_or(0)
}

fn reuse_or_generate_batch_id(output: &Path) -> String {
    let build_file = output.join(BUILD_FILE);
    if build_file.is_file() {
        if let Ok(previous) = Pipeline::read_build_file(&build_file) {
            debug!("Re-using batch id {} from {}", previous.batch_id(), build_file.display());
            return previous.batch_id().clone();
        }
        warn!(
            "Existing build file {} could not be read, starting a new batch",
            build_file.display()
        );
    }
    generate_batch_id()
}

fn generate_batch_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("batch-{}", suffix)
}

/// Materialize every conversion alias referenced by a library input into
/// `converted_inputs/<alias>.tab`, skipping targets that already exist
fn run_conversions(
    config: &UserConfig,
    conversion_dir: &Path,
    runner: &dyn CommandRunner,
) -> Result<()> {
    let referenced: BTreeSet<&str> = config
        .libraries()
        .iter()
        .flat_map(|library| library.inputs().iter())
        .map(String::as_str)
        .filter(|input| config.conversions().contains_key(*input))
        .collect();

    for alias in referenced {
        let target = conversion_dir.join(format!("{}.tab", alias));
        if target.is_file() {
            debug!("Conversion target {} exists, skipping", target.display());
            continue;
        }
        let conversion = &config.conversions()[alias];
        info!("Converting input '{}' to {}", alias, target.display());
        match conversion {
            Conversion::Tool {
                input,
                tool,
                stranded,
            } => {
                let command = vec![
                    WORKER_PROGRAM.to_string(),
                    "convert".to_string(),
                    "--tool".to_string(),
                    tool.clone(),
                    "--input".to_string(),
                    input.clone(),
                    "--strand_specific".to_string(),
                    stranded.to_string(),
                    "--output".to_string(),
                    target.display().to_string(),
                ];
                runner.check_output(&command).with_context(|| {
                    MavisError::InvalidInput(format!("conversion of input '{}' failed", alias))
                })?;
            }
            Conversion::External { command } => {
                let command = format!("{} -o {}", command, target.display());
                runner.check_shell(&command).with_context(|| {
                    MavisError::InvalidInput(format!("conversion of input '{}' failed", alias))
                })?;
            }
        }
    }
    Ok(())
}

/// Turn the configured input names of a library into concrete file paths:
/// conversion aliases point at their converted target, anything else is a
/// path or glob that must match at least one existing file
fn resolve_inputs(
    config: &UserConfig,
    library: &LibraryConfig,
    conversion_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let mut resolved = Vec::new();
    for input in library.inputs() {
        if config.conversions().contains_key(input) {
            resolved.push(conversion_dir.join(format!("{}.tab", input)));
        } else {
            resolved.extend(expand_glob(input).with_context(|| {
                MavisError::InvalidInput(format!(
                    "input '{}' of library '{}' does not exist",
                    input,
                    library.name()
                ))
            })?);
        }
    }
    if resolved.is_empty() {
        return Err(anyhow!(MavisError::InvalidInput(format!(
            "library '{}' has no inputs",
            library.name()
        ))));
    }
    Ok(resolved)
}

/// Emits one shell script per job and builds the matching [Job] value
struct ScriptEmitter<'a> {
    config: &'a UserConfig,
    scheduler: SchedulerKind,
    batch_id: &'a str,
}

impl<'a> ScriptEmitter<'a> {
    fn cluster_job(
        &self,
        name: &str,
        cluster_dir: &Path,
        library: &LibraryConfig,
        inputs: &[PathBuf],
    ) -> Result<Job> {
        let mut args = vec!["-n".to_string()];
        args.extend(inputs.iter().map(|p| p.display().to_string()));
        args.extend(library_args(library));
        args.push("--batch_id".to_string());
        args.push(self.batch_id.to_string());
        self.push_reference(&mut args, &["annotations", "masking"]);
        args.push("--output".to_string());
        args.push(cluster_dir.display().to_string());

        self.emit(
            name,
            Stage::Cluster,
            cluster_dir,
            self.config.general().memory_limit(),
            None,
            args,
        )
    }

    fn validate_job(
        &self,
        name: &str,
        validate_dir: &Path,
        cluster_dir: &Path,
        library: &LibraryConfig,
        cluster_name: &str,
        array: Option<ArraySpec>,
    ) -> Result<Job> {
        let memory = match library.protocol() {
            Protocol::Transcriptome => self.config.general().trans_validation_memory(),
            Protocol::Genome => self.config.general().validation_memory(),
        };

        let mut args = vec![
            "-n".to_string(),
            format!(
                "{}/{}-${{TASK_ID}}.tab",
                cluster_dir.display(),
                self.batch_id
            ),
        ];
        args.extend(library_args(library));
        args.push("--bam_file".to_string());
        args.push(library.bam_file().display().to_string());
        args.push("--read_length".to_string());
        args.push(library.read_length().to_string());
        args.push("--median_fragment_size".to_string());
        args.push(library.median_fragment_size().to_string());
        args.push("--stdev_fragment_size".to_string());
        args.push(library.stdev_fragment_size().to_string());
        self.push_reference(
            &mut args,
            &["annotations", "reference_genome", "aligner_reference", "masking"],
        );
        args.push("--output".to_string());
        args.push(format!(
            "{}/{}-${{TASK_ID}}",
            validate_dir.display(),
            self.batch_id
        ));

        let mut job = self.emit(name, Stage::Validate, validate_dir, memory, array, args)?;
        job.set_dependencies(vec![cluster_name.to_string()]);
        Ok(job)
    }

    #[allow(clippy::too_many_arguments)]
    fn annotate_job(
        &self,
        name: &str,
        annotate_dir: &Path,
        validate_dir: &Path,
        cluster_dir: &Path,
        depends_on: &str,
        skip_validate: bool,
        array: Option<ArraySpec>,
    ) -> Result<Job> {
        let inputs = if skip_validate {
            format!(
                "{}/{}-${{TASK_ID}}.tab",
                cluster_dir.display(),
                self.batch_id
            )
        } else {
            format!(
                "{}/{}-${{TASK_ID}}/*{}",
                validate_dir.display(),
                self.batch_id,
                VALIDATION_PASS_SUFFIX
            )
        };

        let mut args = vec!["--inputs".to_string(), inputs];
        self.push_reference(
            &mut args,
            &["annotations", "reference_genome", "masking", "template_metadata"],
        );
        args.push("--output".to_string());
        args.push(format!(
            "{}/{}-${{TASK_ID}}",
            annotate_dir.display(),
            self.batch_id
        ));

        let mut job = self.emit(
            name,
            Stage::Annotate,
            annotate_dir,
            self.config.general().annotation_memory(),
            array,
            args,
        )?;
        job.set_dependencies(vec![depends_on.to_string()]);
        Ok(job)
    }

    fn pairing_job(
        &self,
        name: &str,
        pairing_dir: &Path,
        input_globs: &[String],
        dependencies: Vec<String>,
    ) -> Result<Job> {
        let mut args = vec!["--inputs".to_string()];
        args.extend(input_globs.iter().cloned());
        self.push_reference(&mut args, &["annotations"]);
        args.push("--output".to_string());
        args.push(pairing_dir.display().to_string());

        let mut job = self.emit(
            name,
            Stage::Pairing,
            pairing_dir,
            self.config.general().memory_limit(),
            None,
            args,
        )?;
        job.set_dependencies(dependencies);
        Ok(job)
    }

    fn summary_job(
        &self,
        name: &str,
        summary_dir: &Path,
        pairing_dir: &Path,
        pairing_name: &str,
    ) -> Result<Job> {
        let filters = self.config.general().filters();
        let mut args = vec![
            "--inputs".to_string(),
            format!("{}/mavis_paired*.tab", pairing_dir.display()),
            "--filter_min_remapped_reads".to_string(),
            filters.min_remapped_reads().to_string(),
            "--filter_min_spanning_reads".to_string(),
            filters.min_spanning_reads().to_string(),
            "--filter_min_flanking_reads".to_string(),
            filters.min_flanking_reads().to_string(),
            "--filter_min_split_reads".to_string(),
            filters.min_split_reads().to_string(),
            "--filter_min_linking_split_reads".to_string(),
            filters.min_linking_split_reads().to_string(),
        ];
        self.push_reference(&mut args, &["annotations", "dgv_annotation"]);
        args.push("--output".to_string());
        args.push(summary_dir.display().to_string());

        let mut job = self.emit(
            name,
            Stage::Summary,
            summary_dir,
            self.config.general().memory_limit(),
            None,
            args,
        )?;
        job.set_dependencies(vec![pairing_name.to_string()]);
        Ok(job)
    }

    fn push_reference(&self, args: &mut Vec<String>, keys: &[&str]) {
        for key in keys {
            if let Some(path) = self.config.reference().get(key) {
                args.push(format!("--{}", key));
                args.push(path.display().to_string());
            }
        }
    }

    /// Write the script and build the job value around it
    fn emit(
        &self,
        name: &str,
        stage: Stage,
        stage_dir: &Path,
        memory: u64,
        array: Option<ArraySpec>,
        worker_args: Vec<String>,
    ) -> Result<Job> {
        let general = self.config.general();
        let script = stage_dir.join(SCRIPT_NAME);
        let stdout = if stage.is_array() {
            format!("{}/{{name}}.o{{job_ident}}.{{task_ident}}", stage_dir.display())
        } else {
            format!("{}/{{name}}.o{{job_ident}}", stage_dir.display())
        };

        let content = render_script(
            self.scheduler,
            name,
            general.queue().as_deref(),
            memory,
            general.time_limit(),
            &stdout,
            stage,
            &worker_args,
        );
        info!("Writing {}", script.display());
        std::fs::write(&script, content)
            .with_context(|| format!("Writing {}", script.display()))?;

        Ok(Job::builder()
            .name(name.to_string())
            .stage(stage)
            .script(script)
            .queue(general.queue().clone())
            .memory_limit(Some(memory))
            .time_limit(Some(general.time_limit()))
            .import_env(general.import_env())
            .stdout(Some(stdout))
            .mail_type(general.mail_type())
            .mail_user(general.mail_user().clone())
            .array(array)
            .build())
    }
}

fn library_args(library: &LibraryConfig) -> Vec<String> {
    vec![
        "--library".to_string(),
        library.name().clone(),
        "--protocol".to_string(),
        library.protocol().to_string(),
        "--disease_status".to_string(),
        library.disease_status().to_string(),
        "--stranded_bam".to_string(),
        library.stranded_bam().to_string(),
    ]
}

/// Render a worker script: scheduler directives as header comments, the
/// task-index variable for arrays, then the worker invocation
#[allow(clippy::too_many_arguments)]
fn render_script(
    scheduler: SchedulerKind,
    name: &str,
    queue: Option<&str>,
    memory: u64,
    time: u64,
    stdout: &str,
    stage: Stage,
    worker_args: &[String],
) -> String {
    use crate::schedule::scheduler::render_stdout;

    let prefix = scheduler.header_prefix();
    let mut lines = vec!["#!/bin/bash".to_string()];
    match scheduler {
        SchedulerKind::Slurm => {
            lines.push(format!("{} -J {}", prefix, name));
            if let Some(queue) = queue {
                lines.push(format!("{} --partition={}", prefix, queue));
            }
            lines.push(format!("{} --mem {}", prefix, memory));
            lines.push(format!("{} -t {}", prefix, format_elapsed(time)));
            lines.push(format!("{} --export=ALL", prefix));
            lines.push(format!(
                "{} -o {}",
                prefix,
                render_stdout(stdout, "%x", if stage.is_array() { "%A" } else { "%j" }, "%a")
            ));
        }
        SchedulerKind::Sge => {
            lines.push(format!("{} -N {}", prefix, name));
            if let Some(queue) = queue {
                lines.push(format!("{} -q {}", prefix, queue));
            }
            lines.push(format!(
                "{0} -l mem_free={1}M,mem_token={1}M,h_vmem={1}M",
                prefix, memory
            ));
            lines.push(format!("{} -l h_rt={}", prefix, format_elapsed(time)));
            lines.push(format!("{} -V", prefix));
            lines.push(format!("{} -j y", prefix));
            lines.push(format!(
                "{} -o {}",
                prefix,
                render_stdout(stdout, "$JOB_NAME", "$JOB_ID", "$TASK_ID")
            ));
        }
        SchedulerKind::Torque => {
            lines.push(format!("{} -N {}", prefix, name));
            if let Some(queue) = queue {
                lines.push(format!("{} -q {}", prefix, queue));
            }
            lines.push(format!("{} -l mem={}mb", prefix, memory));
            lines.push(format!("{} -l walltime={}", prefix, format_elapsed(time)));
            lines.push(format!("{} -V", prefix));
            lines.push(format!("{} -j oe", prefix));
            lines.push(format!(
                "{} -o {}",
                prefix,
                render_stdout(
                    stdout,
                    "$PBS_JOBNAME",
                    "$PBS_JOBID",
                    "$PBS_ARRAYID"
                )
            ));
        }
    }
    lines.push(String::new());

    if stage.is_array() {
        lines.push(format!("TASK_ID=\"${{{}}}\"", scheduler.env_task_ident()));
        lines.push(String::new());
    }

    lines.push(format!(
        "{} {} {}",
        WORKER_PROGRAM,
        stage,
        worker_args.join(" \\\n\t")
    ));
    lines.push(String::new());
    lines.join("\n")
}
