use super::{write_results, FlowError, FlowLogic, TaskDescriptor, TaskResult, RESULTS_FILE};
use crate::{
    config::check_executable,
    job::JobContext,
    scheduler::command::{CommandRunner, GatewayError, SystemRunner},
};
use itertools::Itertools;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::{
    collections::BTreeMap,
    path::PathBuf,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

pub const NAME: &str = "command_sweep";

/// job parameter holding the sweep definition
pub const COMMAND_PARAM: &str = "command";

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct SweepCommand {
    exec: PathBuf,
    #[serde(default)]
    args: Vec<String>,
    /// per task, in seconds
    timeout: Option<u64>,
    #[serde(default)]
    grid: BTreeMap<String, Vec<Value>>,
}

/// Parameter sweep over an external executable.
///
/// Every point of the grid becomes one invocation of `exec`, the point (merged with the job
/// parameters) is passed as `--key=value` arguments and whatever the executable prints to
/// stdout is kept as YAML.
pub struct CommandSweep {
    command: SweepCommand,
    runner: SystemRunner,
    results_path: PathBuf,
}

impl CommandSweep {
    pub fn load(context: &JobContext) -> Result<Box<dyn FlowLogic>, FlowError> {
        let command: SweepCommand = context
            .request
            .params
            .get(COMMAND_PARAM)
            .cloned()
            .ok_or_else(|| FlowError::invalid(COMMAND_PARAM, "missing"))
            .and_then(|value| {
                serde_yaml::from_value(value).map_err(|error| FlowError::invalid(COMMAND_PARAM, error))
            })?;

        match check_executable(&command.exec) {
            Ok(true) => {}
            Ok(false) => {
                return Err(FlowError::invalid(
                    COMMAND_PARAM,
                    format!("{:?} is not executable", command.exec),
                ))
            }
            Err(error) => return Err(FlowError::invalid(COMMAND_PARAM, error)),
        }

        Ok(Box::new(Self {
            runner: SystemRunner::new(command.timeout.map(Duration::from_secs)),
            command,
            results_path: context.working_dir.join(RESULTS_FILE),
        }))
    }

    fn arguments(&self, task: &TaskDescriptor) -> Vec<String> {
        self.command
            .args
            .iter()
            .cloned()
            .chain(
                task.iter()
                    .filter(|(key, _)| key.as_str() != COMMAND_PARAM)
                    .map(|(key, value)| format!("--{key}={}", render(value))),
            )
            .collect()
    }
}

impl FlowLogic for CommandSweep {
    fn generate_tasks(&mut self) -> Result<Vec<TaskDescriptor>, FlowError> {
        if self.command.grid.is_empty() {
            return Ok(vec![TaskDescriptor::new()]);
        }

        let keys: Vec<&String> = self.command.grid.keys().collect();
        let tasks: Vec<TaskDescriptor> = self
            .command
            .grid
            .values()
            .map(|values| values.iter())
            .multi_cartesian_product()
            .map(|point| {
                keys.iter()
                    .map(|key| (*key).clone())
                    .zip(point.into_iter().cloned())
                    .collect()
            })
            .collect();

        info!(dimensions = keys.len(), tasks = tasks.len(), "Expanded parameter grid");

        Ok(tasks)
    }

    fn run_task(&self, task: TaskDescriptor) -> Result<TaskResult, FlowError> {
        let program = self.command.exec.to_string_lossy();
        let args = self.arguments(&task);
        let start = Instant::now();

        let output = self.runner.run(&program, &args).map_err(|error| match error {
            GatewayError::Timeout { timeout, .. } => FlowError::Timeout(timeout),
            other => FlowError::Command(other.to_string()),
        })?;
        let runtime = start.elapsed();

        if output.status != 0 {
            return Err(FlowError::TaskFailed {
                status: output.status,
                stderr: output.stderr,
            });
        }

        debug!(args = ?args, runtime = ?runtime, "Task command finished");

        let mut result = Mapping::new();
        result.insert("params".into(), serde_yaml::to_value(&task)?);
        result.insert("output".into(), parse_output(output.stdout));
        result.insert("runtime_ms".into(), Value::from(runtime.as_millis() as u64));

        Ok(Value::Mapping(result))
    }

    fn finalize(&mut self, results: Vec<TaskResult>) -> Result<(), FlowError> {
        write_results(&self.results_path, &results)
    }
}

/// command line form of a parameter value
fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(text) => text.clone(),
        nested => serde_yaml::to_string(nested)
            .map(|text| text.trim_end().to_owned())
            .unwrap_or_default(),
    }
}

fn parse_output(stdout: String) -> Value {
    if stdout.trim().is_empty() {
        return Value::Null;
    }

    match serde_yaml::from_str(&stdout) {
        Ok(value) => value,
        Err(error) => {
            warn!(error = %error, "Task output is not YAML, keeping it as text");

            Value::String(stdout)
        }
    }
}
