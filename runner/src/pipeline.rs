use crate::{
    config::RunnerConfig,
    flow::{FlowError, FlowLogic, FlowLogicRegistry, RegistryError, TaskDescriptor, TaskResult},
    job::{JobContext, Params},
};
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use std::{
    any::Any,
    fs::File,
    io,
    panic::{catch_unwind, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
};
use thiserror::Error;
use tracing::{debug, error, info, instrument};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to read job context {path:?}: {error}")]
    LoadContext { path: PathBuf, error: io::Error },
    #[error("Job context is malformed: {0}")]
    ContextFormat(#[from] serde_yaml::Error),
    #[error(transparent)]
    Resolve(#[from] RegistryError),
    #[error("Failed to build worker pool: {0}")]
    ThreadPool(#[from] ThreadPoolBuildError),
    #[error("Task generation failed: {0}")]
    TaskGeneration(#[source] FlowError),
    #[error("Task {index} failed: {source}")]
    TaskExecution { index: usize, source: FlowError },
    #[error("Finalizing results failed: {0}")]
    Finalize(#[source] FlowError),
}

/// Drives one flow logic through generate, execute and finalize.
///
/// Generation and finalization happen on the calling thread, tasks are spread over a
/// dedicated pool. Workers share nothing mutable, every result travels back over a channel.
pub struct Pipeline {
    pool: ThreadPool,
    overrides: Params,
}

impl Pipeline {
    /// `overrides` are merged into every task descriptor and win on key collisions
    pub fn new(threads: usize, overrides: Params) -> Result<Self, PipelineError> {
        debug!("Starting thread pool with {threads} threads");

        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("hpcops-worker-{index}"))
            .build()?;

        Ok(Self { pool, overrides })
    }

    /// Run all phases, returns the number of results handed to `finalize`
    #[instrument(skip_all, level = "info")]
    pub fn run(&self, logic: &mut dyn FlowLogic) -> Result<usize, PipelineError> {
        let tasks = logic.generate_tasks().map_err(|e| {
            error!(error = %e, "Task generation failed");
            PipelineError::TaskGeneration(e)
        })?;

        info!("Generated {} tasks", tasks.len());

        let results = self.execute(logic, tasks)?;
        let count = results.len();

        logic.finalize(results).map_err(|e| {
            error!(error = %e, "Finalize failed");
            PipelineError::Finalize(e)
        })?;

        info!("Finalized {count} results");

        Ok(count)
    }

    /// Execute `tasks` on the pool, collecting results in completion order.
    ///
    /// The first failed task aborts the run: tasks that have not started yet are skipped,
    /// tasks already running finish and their results are dropped.
    pub fn execute(
        &self,
        logic: &dyn FlowLogic,
        tasks: Vec<TaskDescriptor>,
    ) -> Result<Vec<TaskResult>, PipelineError> {
        let total = tasks.len();
        let aborted = AtomicBool::new(false);

        self.pool.in_place_scope(|scope| {
            let (sender, receiver) = mpsc::channel();
            let aborted = &aborted;

            for (index, task) in tasks.into_iter().enumerate() {
                let sender = sender.clone();
                let task = self.merge(task);

                scope.spawn(move |_| {
                    if aborted.load(Ordering::SeqCst) {
                        return;
                    }

                    let outcome = catch_unwind(AssertUnwindSafe(|| logic.run_task(task)))
                        .unwrap_or_else(|panic| Err(FlowError::Panicked(panic_message(panic))));

                    if outcome.is_err() {
                        aborted.store(true, Ordering::SeqCst);
                    }

                    // fails once collection was aborted, nobody is listening anymore
                    let _ = sender.send((index, outcome));
                });
            }
            drop(sender);

            let mut results = Vec::with_capacity(total);

            for (index, outcome) in receiver {
                match outcome {
                    Ok(result) => {
                        results.push(result);
                        debug!("Done with {}/{total}", results.len());
                    }
                    Err(source) => {
                        error!(task = index, error = %source, "Task failed, aborting");

                        return Err(PipelineError::TaskExecution { index, source });
                    }
                }
            }

            Ok(results)
        })
    }

    fn merge(&self, mut task: TaskDescriptor) -> TaskDescriptor {
        task.extend(
            self.overrides
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );

        task
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("unknown panic payload")
    }
}

pub fn load_context(path: &Path) -> Result<JobContext, PipelineError> {
    let file = File::open(path).map_err(|error| PipelineError::LoadContext {
        path: path.to_path_buf(),
        error,
    })?;

    Ok(serde_yaml::from_reader(file)?)
}

/// Entry point of the job process: load the persisted context and run its flow logic
#[instrument(skip(config, registry), level = "info")]
pub fn run_job(
    context_path: &Path,
    config: &RunnerConfig,
    registry: &FlowLogicRegistry,
) -> Result<usize, PipelineError> {
    let context = load_context(context_path)?;

    run_context(&context, config, registry)
}

pub fn run_context(
    context: &JobContext,
    config: &RunnerConfig,
    registry: &FlowLogicRegistry,
) -> Result<usize, PipelineError> {
    info!(
        submission_id = %context.submission_id,
        flow_logic = %context.request.flow_logic,
        working_dir = ?context.working_dir,
        "Running job"
    );

    let mut logic = registry.resolve(&context.request.flow_logic, context)?;
    let pipeline = Pipeline::new(
        context.threads(&config.executor),
        context.request.params.clone(),
    )?;

    pipeline.run(logic.as_mut())
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
