use clap::{Parser, Subcommand};
use hpcops_runner::{
    config::RunnerConfig,
    flow::FlowLogicRegistry,
    job::{JobHandle, JobRequest},
    pipeline::{run_context, run_job},
    scheduler::{record::JobRecord, state::StatusSource, status::JobStatus, SchedulerGateway},
    submission::SubmissionService,
};
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    thread,
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

#[cfg(feature = "ledger")]
use hpcops_runner::ledger::Ledger;

#[derive(Parser)]
#[command(name = "hpcops", author, version, about, long_about = None)]
/// Submit, track and execute batch jobs on a Fujitsu PJM cluster
struct Cli {
    /// Runner config, defaults to ./hpcops.yaml if present
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit job requests, several files are submitted in parallel
    Submit {
        #[arg(required = true)]
        requests: Vec<PathBuf>,
    },
    /// Query the scheduler for the status of jobs
    Status {
        #[arg(required = true)]
        job_ids: Vec<String>,
        /// Poll every SECONDS until all jobs reached a terminal state
        #[arg(long, value_name = "SECONDS")]
        watch: Option<u64>,
    },
    /// Delete jobs and report their status afterwards
    Delete {
        #[arg(required = true)]
        job_ids: Vec<String>,
    },
    /// Execute a prepared job, invoked by the launch script inside the scheduler job
    RunJob { context: PathBuf },
    /// Prepare a job and run it in this process, bypassing the scheduler
    RunLocal { request: PathBuf },
    /// List jobs recorded in the local job ledger
    Jobs {
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// List registered flow logics
    Logics,
}

#[derive(Serialize)]
struct SubmissionReport<'a> {
    index: usize,
    request: &'a Path,
    #[serde(skip_serializing_if = "Option::is_none")]
    handle: Option<&'a JobHandle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = RunnerConfig::load(cli.config.as_deref()).unwrap_or_log();

    let succeeded = match cli.command {
        Commands::Submit { requests } => submit(&config, &requests),
        Commands::Status { job_ids, watch } => status(&config, &job_ids, watch),
        Commands::Delete { job_ids } => delete(&config, &job_ids),
        Commands::RunJob { context } => execute(&config, &context),
        Commands::RunLocal { request } => run_local(&config, &request),
        Commands::Jobs { limit } => jobs(&config, limit),
        Commands::Logics => {
            let identifiers: Vec<String> = FlowLogicRegistry::builtin()
                .identifiers()
                .iter()
                .map(ToString::to_string)
                .collect();
            print_yaml(&identifiers);
            true
        }
    };

    if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_yaml<T: Serialize>(value: &T) {
    print!("{}", serde_yaml::to_string(value).unwrap_or_log());
}

fn submit(config: &RunnerConfig, paths: &[PathBuf]) -> bool {
    if config.preflight_checks() {
        error!("Preflight checks failed, nothing was submitted");
        return false;
    }

    let mut requests = Vec::with_capacity(paths.len());
    for path in paths {
        match JobRequest::from_file(path) {
            Ok(request) => requests.push(request),
            Err(e) => {
                error!(request = ?path, "{e}");
                return false;
            }
        }
    }

    let journal = Journal::open(config);
    let service = SubmissionService::new(config);
    let submissions = service.submit_jobs(&requests);

    let mut accepted = 0;
    let reports: Vec<SubmissionReport> = submissions
        .iter()
        .map(|submission| {
            let request = paths[submission.index].as_path();

            match &submission.result {
                Ok(handle) => {
                    journal.submission(handle);

                    if handle.is_submitted() {
                        accepted += 1;
                    }

                    SubmissionReport {
                        index: submission.index,
                        request,
                        handle: Some(handle),
                        error: None,
                    }
                }
                Err(e) => {
                    error!(request = ?request, "Submission failed: {e}");

                    SubmissionReport {
                        index: submission.index,
                        request,
                        handle: None,
                        error: Some(e.to_string()),
                    }
                }
            }
        })
        .collect();

    print_yaml(&reports);
    info!("Submitted {accepted}/{} jobs", requests.len());

    accepted == requests.len()
}

fn status(config: &RunnerConfig, job_ids: &[String], watch: Option<u64>) -> bool {
    let gateway = SchedulerGateway::from_config(&config.scheduler);
    let journal = Journal::open(config);
    let mut records: Vec<JobRecord> = job_ids.iter().map(JobRecord::new).collect();

    loop {
        for record in records.iter_mut() {
            journal.status(record.refresh(&gateway));
        }

        let pending = records.iter().filter(|record| !record.is_terminal()).count();

        match watch {
            Some(seconds) if pending > 0 => {
                info!("{pending} jobs not finished yet, polling again in {seconds}s");
                thread::sleep(Duration::from_secs(seconds));
            }
            _ => break,
        }
    }

    let statuses: Vec<&JobStatus> = records.iter().filter_map(JobRecord::last).collect();
    print_yaml(&statuses);

    reachable(statuses.iter().copied())
}

fn delete(config: &RunnerConfig, job_ids: &[String]) -> bool {
    let gateway = SchedulerGateway::from_config(&config.scheduler);
    let journal = Journal::open(config);

    let statuses: Vec<JobStatus> = job_ids
        .iter()
        .map(|job_id| {
            let status = gateway.delete(job_id);
            journal.status(&status);
            status
        })
        .collect();

    print_yaml(&statuses);

    reachable(&statuses)
}

/// false if the scheduler could not be asked about one of the jobs
fn reachable<'a>(statuses: impl IntoIterator<Item = &'a JobStatus>) -> bool {
    let failed = statuses
        .into_iter()
        .filter(|status| status.source == StatusSource::Failed)
        .count();

    if failed > 0 {
        error!("Scheduler could not be queried for {failed} jobs");
    }

    failed == 0
}

fn execute(config: &RunnerConfig, context: &Path) -> bool {
    match run_job(context, config, &FlowLogicRegistry::builtin()) {
        Ok(results) => {
            info!("Job finished with {results} results");
            true
        }
        Err(e) => {
            error!(context = ?context, "Job failed: {e}");
            false
        }
    }
}

fn run_local(config: &RunnerConfig, path: &Path) -> bool {
    let request = match JobRequest::from_file(path) {
        Ok(request) => request,
        Err(e) => {
            error!(request = ?path, "{e}");
            return false;
        }
    };

    let context = match SubmissionService::new(config).prepare(&request) {
        Ok(context) => context,
        Err(e) => {
            error!(request = ?path, "Failed to prepare local job: {e}");
            return false;
        }
    };

    let succeeded = match run_context(&context, config, &FlowLogicRegistry::builtin()) {
        Ok(results) => {
            info!("Local job finished with {results} results");
            true
        }
        Err(e) => {
            error!("Local job failed: {e}");
            false
        }
    };

    print_yaml(&context);

    succeeded
}

/// Caller side bookkeeping, a no-op with `ledger: ~` or without the `ledger` feature
struct Journal {
    #[cfg(feature = "ledger")]
    ledger: Option<Ledger>,
}

impl Journal {
    #[cfg(feature = "ledger")]
    fn open(config: &RunnerConfig) -> Self {
        let ledger = config.ledger.as_ref().and_then(|ledger| {
            let path = config.base_dir.join(&ledger.path);

            match Ledger::open(&path) {
                Ok(ledger) => Some(ledger),
                Err(e) => {
                    warn!(path = ?path, "Failed to open job ledger, jobs won't be recorded: {e}");
                    None
                }
            }
        });

        Self { ledger }
    }

    #[cfg(not(feature = "ledger"))]
    fn open(config: &RunnerConfig) -> Self {
        if config.ledger.is_some() {
            warn!("Built without ledger support, jobs won't be recorded");
        }

        Self {}
    }

    fn submission(&self, handle: &JobHandle) {
        #[cfg(feature = "ledger")]
        if let Some(Err(e)) = self.ledger.as_ref().map(|ledger| ledger.record_submission(handle)) {
            warn!(submission_id = %handle.submission_id, "Failed to record submission: {e}");
        }

        #[cfg(not(feature = "ledger"))]
        let _ = handle;
    }

    fn status(&self, status: &JobStatus) {
        #[cfg(feature = "ledger")]
        if let Some(Err(e)) = self.ledger.as_ref().map(|ledger| ledger.record_status(status)) {
            warn!(job_id = %status.job_id, "Failed to record status: {e}");
        }

        #[cfg(not(feature = "ledger"))]
        let _ = status;
    }
}

#[cfg(feature = "ledger")]
fn jobs(config: &RunnerConfig, limit: Option<usize>) -> bool {
    let Some(ledger) = &config.ledger else {
        error!("Job ledger is disabled in the config");
        return false;
    };

    match Ledger::open(&config.base_dir.join(&ledger.path)).and_then(|ledger| ledger.list(limit))
    {
        Ok(entries) => {
            print_yaml(&entries);
            true
        }
        Err(e) => {
            error!("Failed to read job ledger: {e}");
            false
        }
    }
}

#[cfg(not(feature = "ledger"))]
fn jobs(_config: &RunnerConfig, _limit: Option<usize>) -> bool {
    error!("Built without ledger support");
    false
}
