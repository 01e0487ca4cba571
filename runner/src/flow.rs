//! Flow logics: the pluggable generate, execute, finalize phases run inside a job.

pub mod echo;
pub mod sweep;

use crate::job::{FlowLogicRef, JobContext, Params, LATEST_VERSION};
use std::{cmp::Ordering, collections::BTreeMap, fs::File, io, path::Path, time::Duration};
use thiserror::Error;
use tracing::{debug, info};

/// one unit of parallel work, parameter name -> value
pub type TaskDescriptor = Params;

/// whatever a single task produced, only ever handed back to `finalize`
pub type TaskResult = serde_yaml::Value;

/// name of the file built-in flow logics write their aggregated results to
pub const RESULTS_FILE: &str = "results.yaml";

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: String, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Failed to run task command: {0}")]
    Command(String),
    #[error("Task command exited with {status}: {stderr}")]
    TaskFailed { status: i32, stderr: String },
    #[error("Task did not finish within {0:?}")]
    Timeout(Duration),
    #[error("Task panicked: {0}")]
    Panicked(String),
}

impl FlowError {
    pub fn invalid(name: &str, reason: impl ToString) -> Self {
        Self::InvalidParameter {
            name: name.to_owned(),
            reason: reason.to_string(),
        }
    }
}

/// The three phases of an experiment.
///
/// `generate_tasks` and `finalize` run once, sequentially, and may block on I/O.
/// `run_task` is called concurrently from the worker pool for every generated descriptor
/// (already merged with the job parameters), so it only gets shared access.
pub trait FlowLogic: Send + Sync {
    fn generate_tasks(&mut self) -> Result<Vec<TaskDescriptor>, FlowError>;

    fn run_task(&self, task: TaskDescriptor) -> Result<TaskResult, FlowError>;

    fn finalize(&mut self, results: Vec<TaskResult>) -> Result<(), FlowError>;
}

pub type FlowLogicFactory =
    Box<dyn Fn(&JobContext) -> Result<Box<dyn FlowLogic>, FlowError> + Send + Sync>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("No flow logic registered as {0}")]
    NotFound(FlowLogicRef),
    #[error("Flow logic {reference} failed to load: {source}")]
    Load {
        reference: FlowLogicRef,
        source: FlowError,
    },
}

/// name -> version -> factory, filled once at process start
#[derive(Default)]
pub struct FlowLogicRegistry {
    logics: BTreeMap<String, BTreeMap<String, FlowLogicFactory>>,
}

impl FlowLogicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// registry with all flow logics shipped with the runner
    pub fn builtin() -> Self {
        let mut registry = Self::new();

        registry.register(echo::NAME, "1", echo::Echo::load);
        registry.register(sweep::NAME, "1", sweep::CommandSweep::load);

        registry
    }

    pub fn register<F>(&mut self, name: &str, version: &str, factory: F)
    where
        F: Fn(&JobContext) -> Result<Box<dyn FlowLogic>, FlowError> + Send + Sync + 'static,
    {
        debug!(name = name, version = version, "Registering flow logic");

        self.logics
            .entry(name.to_owned())
            .or_default()
            .insert(version.to_owned(), Box::new(factory));
    }

    pub fn identifiers(&self) -> Vec<FlowLogicRef> {
        self.logics
            .iter()
            .flat_map(|(name, versions)| {
                versions.keys().map(move |version| FlowLogicRef {
                    name: name.clone(),
                    version: version.clone(),
                })
            })
            .collect()
    }

    /// Instantiate the flow logic `reference` points to.
    ///
    /// `latest` resolves to the highest registered version unless a version is literally
    /// registered under that name.
    pub fn resolve(
        &self,
        reference: &FlowLogicRef,
        context: &JobContext,
    ) -> Result<Box<dyn FlowLogic>, RegistryError> {
        let versions = self
            .logics
            .get(&reference.name)
            .ok_or_else(|| RegistryError::NotFound(reference.clone()))?;

        let (version, factory) = match versions.get_key_value(&reference.version) {
            Some(entry) => entry,
            None if reference.version == LATEST_VERSION => versions
                .iter()
                .max_by(|(a, _), (b, _)| compare_versions(a, b))
                .ok_or_else(|| RegistryError::NotFound(reference.clone()))?,
            None => return Err(RegistryError::NotFound(reference.clone())),
        };

        info!(flow_logic = %reference, version = %version, "Loading flow logic");

        factory(context).map_err(|source| RegistryError::Load {
            reference: reference.clone(),
            source,
        })
    }
}

/// numeric comparison where both sides are (optionally `v` prefixed) numbers
fn compare_versions(a: &str, b: &str) -> Ordering {
    let numeric = |version: &str| version.trim_start_matches('v').parse::<u64>().ok();

    match (numeric(a), numeric(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// Write aggregated task results as a YAML sequence
pub fn write_results(path: &Path, results: &[TaskResult]) -> Result<(), FlowError> {
    let file = File::create(path)?;
    serde_yaml::to_writer(&file, results)?;
    file.sync_all()?;

    info!(path = ?path, results = results.len(), "Stored results");

    Ok(())
}
