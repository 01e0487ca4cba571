use crate::{
    config::{ConfigErrors, RunnerConfig},
    job::{JobContext, JobHandle, JobRequest, RequestError},
    scheduler::{
        command::{CommandRunner, SystemRunner},
        resources::ResourceSpec,
        SchedulerGateway,
    },
};
use chrono::Local;
use rayon::prelude::*;
use std::{
    fs::{self, OpenOptions, Permissions},
    io::{self, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("Invalid job request: {0}")]
    InvalidRequest(#[from] RequestError),
    #[error("Failed to read job request {path:?}: {error}")]
    ReadRequest { path: PathBuf, error: io::Error },
    #[error("Failed to resolve the job entry executable: {0}")]
    Entry(#[from] ConfigErrors),
    #[error("Failed to create working directory {path:?}: {error}")]
    WorkingDirectory { path: PathBuf, error: io::Error },
    #[error("Failed to persist job context to {path:?}: {error}")]
    PersistContext { path: PathBuf, error: io::Error },
    #[error("Failed to (de)serialize job data: {0}")]
    Serialize(#[from] serde_yaml::Error),
    #[error("Failed to write launch script {path:?}: {error}")]
    LaunchScript { path: PathBuf, error: io::Error },
    #[error("Scheduler rejected the job (status {status}): {output}")]
    Rejected { status: i32, output: String },
}

/// One entry of a batch submission, `index` is the position of `request` in the batch
#[derive(Debug)]
pub struct PairedSubmission {
    pub index: usize,
    pub request: JobRequest,
    pub result: Result<JobHandle, SubmissionError>,
}

/// Turns job requests into scheduler jobs.
///
/// Each submission gets its own working directory holding the persisted context, the launch
/// script and the job log. Nothing reaches the scheduler before all three are in place.
pub struct SubmissionService<'a, R = SystemRunner> {
    config: &'a RunnerConfig,
    gateway: SchedulerGateway<R>,
}

impl<'a> SubmissionService<'a, SystemRunner> {
    pub fn new(config: &'a RunnerConfig) -> Self {
        Self::with_gateway(config, SchedulerGateway::from_config(&config.scheduler))
    }
}

impl<'a, R: CommandRunner> SubmissionService<'a, R> {
    pub fn with_gateway(config: &'a RunnerConfig, gateway: SchedulerGateway<R>) -> Self {
        Self { config, gateway }
    }

    pub fn gateway(&self) -> &SchedulerGateway<R> {
        &self.gateway
    }

    /// Create the working directory, context file and launch script without submitting.
    #[instrument(skip_all, fields(project = %request.project, flow_logic = %request.flow_logic))]
    pub fn prepare(&self, request: &JobRequest) -> Result<JobContext, SubmissionError> {
        request.validate()?;
        let entry = self.config.executor.entry()?;

        let submission_id = Uuid::new_v4();
        let created_at = Local::now();

        let jobs_dir = self.config.jobs_dir();
        fs::create_dir_all(&jobs_dir).map_err(|error| SubmissionError::WorkingDirectory {
            path: jobs_dir.clone(),
            error,
        })?;

        // the submission id makes the name unique, `create_dir` makes sure of it
        let working_dir = jobs_dir.join(format!(
            "{}_{submission_id}",
            created_at.format("%Y%m%d%H%M%S")
        ));
        fs::create_dir(&working_dir).map_err(|error| SubmissionError::WorkingDirectory {
            path: working_dir.clone(),
            error,
        })?;

        let context = JobContext {
            submission_id,
            created_at,
            hostname: hostname(),
            base_dir: self.config.base_dir.clone(),
            context_path: working_dir.join(format!("context_{submission_id}.yaml")),
            script_path: working_dir.join(format!("job_{submission_id}.sh")),
            log_path: working_dir.join(format!("result_{submission_id}.out")),
            working_dir,
            request: request.clone(),
            executor: self.config.executor.clone(),
        };

        if let Err(e) = write_context(&context).and_then(|_| write_launch_script(&context, &entry))
        {
            if let Err(cleanup) = fs::remove_dir_all(&context.working_dir) {
                warn!(error = ?cleanup, "Failed to remove incomplete working directory");
            }

            return Err(e);
        }

        info!(
            submission_id = %submission_id,
            working_dir = ?context.working_dir,
            context = ?context.context_path,
            script = ?context.script_path,
            log = ?context.log_path,
            "Prepared job"
        );

        Ok(context)
    }

    /// Prepare and submit a single job.
    ///
    /// A scheduler rejection is not an error here, the returned handle carries an empty job
    /// id and the raw scheduler output, see `JobHandle::check`.
    pub fn submit_job(&self, request: &JobRequest) -> Result<JobHandle, SubmissionError> {
        let context = self.prepare(request)?;
        let outcome = self.gateway.submit(
            &ResourceSpec::from(request),
            &context.script_path,
            &context.log_path,
        );

        if outcome.job_id.is_none() {
            error!(
                submission_id = %context.submission_id,
                output = %outcome.output,
                "submit error"
            );
        }

        Ok(JobHandle {
            submission_id: context.submission_id,
            job_id: outcome.job_id.unwrap_or_default(),
            working_dir: context.working_dir,
            context_path: context.context_path,
            script_path: context.script_path,
            log_path: context.log_path,
            submitted_at: context.created_at,
            status: outcome.status,
            message: outcome.output,
        })
    }

    /// Submit all requests concurrently.
    ///
    /// Results come back in input order and each one is paired with the request it belongs
    /// to, so equal responses can never be confused.
    pub fn submit_jobs(&self, requests: &[JobRequest]) -> Vec<PairedSubmission> {
        debug!("Submitting {} jobs", requests.len());

        requests
            .par_iter()
            .enumerate()
            .map(|(index, request)| PairedSubmission {
                index,
                request: request.clone(),
                result: self.submit_job(request),
            })
            .collect()
    }
}

fn write_context(context: &JobContext) -> Result<(), SubmissionError> {
    let persist_error = |error| SubmissionError::PersistContext {
        path: context.context_path.clone(),
        error,
    };

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&context.context_path)
        .map_err(persist_error)?;

    serde_yaml::to_writer(&mut file, context)?;
    file.sync_all().map_err(persist_error)
}

fn write_launch_script(context: &JobContext, entry: &Path) -> Result<(), SubmissionError> {
    let script_error = |error| SubmissionError::LaunchScript {
        path: context.script_path.clone(),
        error,
    };

    let script = format!(
        "#!/bin/sh\ncd {}\nexec {} run-job {}\n",
        shell_quote(&context.base_dir),
        shell_quote(entry),
        shell_quote(&context.context_path)
    );

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&context.script_path)
        .map_err(script_error)?;

    file.write_all(script.as_bytes()).map_err(script_error)?;
    file.sync_all().map_err(script_error)?;
    fs::set_permissions(&context.script_path, Permissions::from_mode(0o755)).map_err(script_error)
}

/// single quote a path for `sh`
fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

fn hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(hostname) => hostname.to_string_lossy().into_owned(),
        Err(error) => {
            warn!(error = ?error, "Failed to retrieve hostname for job context");

            String::from("unknown")
        }
    }
}

#[cfg(test)]
#[path = "submission_test.rs"]
mod submission_test;
