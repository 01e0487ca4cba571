//! Gateway to the batch scheduler's command line tools.
//!
//! Every failure of the scheduler tools is reported as data (exit code and message on the
//! returned record) rather than as an error: the scheduler is expected to be flaky and the
//! caller decides what to do about it. Nothing is retried here.

pub mod command;
pub mod record;
pub mod resources;
pub mod state;
pub mod status;

use crate::config::SchedulerConfig;
use command::{CommandRunner, SystemRunner, COMMAND_FAILED};
use resources::{parse_job_id, ResourceSpec};
use serde::{Deserialize, Serialize};
use state::StatusSource;
use status::{find_row, JobStatus};
use std::path::Path;
use tracing::{debug, error, info, instrument, warn};

/// Result of a submission attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub job_id: Option<String>,
    // raw stdout of the submission command, untouched
    pub output: String,
    pub status: i32,
}

#[derive(Debug, Clone)]
pub struct SchedulerGateway<R = SystemRunner> {
    runner: R,
    resource_group: String,
    submit_command: String,
    status_command: String,
    delete_command: String,
}

impl SchedulerGateway<SystemRunner> {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::with_runner(config, SystemRunner::new(config.timeout()))
    }
}

impl<R: CommandRunner> SchedulerGateway<R> {
    pub fn with_runner(config: &SchedulerConfig, runner: R) -> Self {
        Self {
            runner,
            resource_group: config.resource_group.clone(),
            submit_command: config.submit.clone(),
            status_command: config.status.clone(),
            delete_command: config.delete.clone(),
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Submit `script` with the given resources, stdout of the job ends up in `log`.
    #[instrument(skip(self), level = "info")]
    pub fn submit(&self, resources: &ResourceSpec, script: &Path, log: &Path) -> SubmitOutcome {
        let args = vec![
            "-L".to_owned(),
            resources.to_argument(&self.resource_group),
            "-j".to_owned(),
            "-o".to_owned(),
            log.to_string_lossy().into_owned(),
            script.to_string_lossy().into_owned(),
        ];

        info!(command = %self.submit_command, args = ?args, "Submitting job");

        match self.runner.run(&self.submit_command, &args) {
            Ok(output) => {
                let job_id = parse_job_id(&output.stdout);

                match &job_id {
                    Some(job_id) => info!(job_id = %job_id, "Scheduler accepted job"),
                    None => error!(
                        status = output.status,
                        stdout = %output.stdout,
                        stderr = %output.stderr,
                        "Submission produced no job id"
                    ),
                }

                SubmitOutcome {
                    job_id,
                    output: output.stdout,
                    status: output.status,
                }
            }
            Err(e) => {
                error!(error = ?e, "Failed to run the submission command");

                SubmitOutcome {
                    job_id: None,
                    output: e.to_string(),
                    status: COMMAND_FAILED,
                }
            }
        }
    }

    /// Current status of `job_id`, looked up in the active listing first and in the
    /// historical listing second.
    #[instrument(skip(self), level = "debug")]
    pub fn query(&self, job_id: &str) -> JobStatus {
        if job_id.is_empty() {
            return JobStatus::missing(job_id, COMMAND_FAILED, "job_id is empty");
        }

        let active = match self.runner.run(&self.status_command, &[]) {
            Ok(output) => output,
            Err(e) => {
                error!(error = ?e, "Failed to list active jobs");

                return JobStatus::failed(job_id, &e);
            }
        };

        if let Some((header, row)) = find_row(&active.stdout, job_id) {
            return observed(
                job_id,
                JobStatus::parse(header, row),
                StatusSource::Active,
                active.status,
                active.stdout.clone(),
            );
        }

        debug!("Job is not active, falling back to the historical listing");

        let args = ["-H".to_owned(), job_id.to_owned()];
        let history = match self.runner.run(&self.status_command, &args) {
            Ok(output) => output,
            Err(e) => {
                error!(error = ?e, "Failed to look up historical job");

                return JobStatus::failed(job_id, &e);
            }
        };

        // a header without any row means the same as no output at all
        let mut lines = history.stdout.lines().filter(|line| !line.trim().is_empty());
        let row = find_row(&history.stdout, job_id).or_else(|| lines.next().zip(lines.next()));

        match row {
            Some((header, row)) => observed(
                job_id,
                JobStatus::parse(header, row),
                StatusSource::History,
                history.status,
                history.stdout.clone(),
            ),
            None => {
                warn!(
                    status = history.status,
                    "Job exists neither among active nor historical jobs"
                );

                JobStatus::missing(
                    job_id,
                    history.status,
                    format!("job {job_id} does not exist among active or historical jobs"),
                )
            }
        }
    }

    /// Delete `job_id`. Deleting a job in a terminal state is a no-op returning its status.
    #[instrument(skip(self), level = "info")]
    pub fn delete(&self, job_id: &str) -> JobStatus {
        let before = self.query(job_id);

        if before.is_terminal() {
            info!(state = %before.state, "Job already finished or does not exist");

            return before;
        }

        let (status, message) = match self
            .runner
            .run(&self.delete_command, &[job_id.to_owned()])
        {
            Ok(output) if output.stdout.trim().is_empty() => (
                output.status,
                format!("job {job_id} already finished or does not exist."),
            ),
            Ok(output) => (output.status, output.stdout),
            Err(e) => {
                error!(error = ?e, "Failed to run the deletion command");

                (COMMAND_FAILED, e.to_string())
            }
        };

        info!(status = status, "Requested deletion");

        let mut after = self.query(job_id);
        after.status = status;
        after.message = message;

        after
    }
}

fn observed(
    job_id: &str,
    mut status: JobStatus,
    source: StatusSource,
    code: i32,
    message: String,
) -> JobStatus {
    if status.job_id.is_empty() {
        status.job_id = job_id.to_owned();
    }

    status.source = source;
    status.status = code;
    status.message = message;

    status
}

#[cfg(test)]
mod gateway_test;
