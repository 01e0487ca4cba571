use super::{command::CommandRunner, status::JobStatus, SchedulerGateway};
use crate::job::JobHandle;
use tracing::debug;
use uuid::Uuid;

/// Caller side view of one submitted job.
///
/// The record holds no transition table of its own, it mirrors whatever the last gateway
/// query returned. Once that is terminal it stops asking.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: String,
    pub submission_id: Option<Uuid>,
    last: Option<JobStatus>,
}

impl JobRecord {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            submission_id: None,
            last: None,
        }
    }

    pub fn from_handle(handle: &JobHandle) -> Self {
        Self {
            job_id: handle.job_id.clone(),
            submission_id: Some(handle.submission_id),
            last: None,
        }
    }

    pub fn last(&self) -> Option<&JobStatus> {
        self.last.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.last.as_ref().map_or(false, JobStatus::is_terminal)
    }

    /// Poll the scheduler, unless the job already reached a terminal state
    pub fn refresh<R: CommandRunner>(&mut self, gateway: &SchedulerGateway<R>) -> &JobStatus {
        if self.is_terminal() {
            debug!(job_id = %self.job_id, "Skipping poll of terminal job");
        } else {
            self.last = Some(gateway.query(&self.job_id));
        }

        self.last.get_or_insert_with(JobStatus::default)
    }

    pub fn delete<R: CommandRunner>(&mut self, gateway: &SchedulerGateway<R>) -> &JobStatus {
        if self.is_terminal() {
            debug!(job_id = %self.job_id, "Skipping deletion of terminal job");
        } else {
            self.last = Some(gateway.delete(&self.job_id));
        }

        self.last.get_or_insert_with(JobStatus::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::SchedulerConfig,
        scheduler::{
            command::{CommandOutput, GatewayError},
            state::JobState,
        },
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// every job is long gone
    #[derive(Default)]
    struct EmptyScheduler {
        calls: AtomicUsize,
    }

    impl CommandRunner for EmptyScheduler {
        fn run(&self, _program: &str, _args: &[String]) -> Result<CommandOutput, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            Ok(CommandOutput {
                status: 1,
                ..CommandOutput::default()
            })
        }
    }

    #[test]
    fn terminal_record_stops_polling() {
        let gateway =
            SchedulerGateway::with_runner(&SchedulerConfig::default(), EmptyScheduler::default());
        let mut record = JobRecord::new("777");

        assert_eq!(record.refresh(&gateway).state, JobState::Unknown);
        assert!(record.is_terminal());
        assert_eq!(gateway.runner().calls.load(Ordering::SeqCst), 2);

        record.refresh(&gateway);
        record.delete(&gateway);

        assert_eq!(gateway.runner().calls.load(Ordering::SeqCst), 2);
    }
}
