use super::{write_results, FlowError, FlowLogic, TaskDescriptor, TaskResult, RESULTS_FILE};
use crate::job::{JobContext, Params};
use std::path::PathBuf;
use tracing::debug;

pub const NAME: &str = "echo";

/// job parameter holding the task descriptors
pub const TASKS_PARAM: &str = "tasks";

/// Hands every task descriptor back as its result.
///
/// Useful to check a cluster setup end to end without running anything expensive.
pub struct Echo {
    params: Params,
    results_path: PathBuf,
}

impl Echo {
    pub fn load(context: &JobContext) -> Result<Box<dyn FlowLogic>, FlowError> {
        Ok(Box::new(Self {
            params: context.request.params.clone(),
            results_path: context.working_dir.join(RESULTS_FILE),
        }))
    }
}

impl FlowLogic for Echo {
    fn generate_tasks(&mut self) -> Result<Vec<TaskDescriptor>, FlowError> {
        match self.params.get(TASKS_PARAM) {
            None => Ok(Vec::new()),
            Some(tasks) => serde_yaml::from_value(tasks.clone())
                .map_err(|error| FlowError::invalid(TASKS_PARAM, error)),
        }
    }

    fn run_task(&self, mut task: TaskDescriptor) -> Result<TaskResult, FlowError> {
        // the job parameters were merged in, including the task list itself
        task.remove(TASKS_PARAM);
        debug!(task = ?task, "Echoing task");

        Ok(serde_yaml::to_value(task)?)
    }

    fn finalize(&mut self, results: Vec<TaskResult>) -> Result<(), FlowError> {
        write_results(&self.results_path, &results)
    }
}
