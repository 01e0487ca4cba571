use super::{
    command::{CommandOutput, CommandRunner, GatewayError},
    resources::ResourceSpec,
    state::{JobState, StatusSource},
    SchedulerGateway,
};
use crate::config::SchedulerConfig;
use parking_lot::Mutex;
use std::{
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

const HEADER: &str =
    "JOB_ID   JOB_NAME MD ST  USER   START_DATE     ELAPSE_LIM NODE_REQUIRE VNODE CORE V_MEM";

fn row(job_id: &str, state: &str) -> String {
    format!(
        "{:<9}{:<9}{:<3}{:<4}{:<7}{:<15}{:<11}{:<13}{:<6}{:<5}{}",
        job_id,
        "job.sh",
        "NM",
        state,
        "u0001",
        "01/15 10:00:00",
        "0001:00:00",
        "1",
        "-",
        "48",
        "-"
    )
}

/// Scheduler double: job 123456 runs until it is deleted, then only shows up as finished in
/// the historical listing.
#[derive(Default)]
struct FakeScheduler {
    deleted: AtomicBool,
    unavailable: bool,
    // pjdel accepts the job without printing anything
    silent_delete: bool,
    calls: Mutex<Vec<String>>,
}

impl FakeScheduler {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn count(&self, program: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.split(' ').next() == Some(program))
            .count()
    }
}

impl CommandRunner for FakeScheduler {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, GatewayError> {
        let call = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.lock().push(call);

        if self.unavailable {
            return Err(GatewayError::Spawn {
                command: program.to_owned(),
                error: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }

        let deleted = self.deleted.load(Ordering::SeqCst);
        let output = |status: i32, stdout: String| CommandOutput {
            status,
            stdout,
            stderr: String::new(),
        };

        Ok(match (program, args) {
            ("pjsub", _) => output(0, "[INFO] PJM 0000 pjsub Job 123456 submitted.\n".to_owned()),
            ("pjstat", []) if deleted => output(0, format!("{HEADER}\n")),
            ("pjstat", []) => output(0, format!("{HEADER}\n{}\n", row("123456", "RUN"))),
            ("pjstat", [flag, id]) if flag == "-H" && id == "123456" && deleted => {
                output(0, format!("{HEADER}\n{}\n", row("123456", "EXT")))
            }
            ("pjstat", [flag, _]) if flag == "-H" => output(1, String::new()),
            ("pjdel", [id]) if id == "123456" => {
                self.deleted.store(true, Ordering::SeqCst);

                if self.silent_delete {
                    output(0, String::new())
                } else {
                    output(0, "[INFO] PJM 0100 pjdel Accepted job 123456.\n".to_owned())
                }
            }
            ("pjdel", _) => output(1, String::new()),
            _ => output(127, String::new()),
        })
    }
}

fn gateway(fake: FakeScheduler) -> SchedulerGateway<FakeScheduler> {
    let config = SchedulerConfig {
        resource_group: "a-batch".to_owned(),
        ..SchedulerConfig::default()
    };

    SchedulerGateway::with_runner(&config, fake)
}

#[test]
pub fn submit_passes_clauses_log_and_script() {
    let gateway = gateway(FakeScheduler::default());
    let spec = ResourceSpec {
        node: Some(1),
        elapse: Some("02:00:00".to_owned()),
        ..ResourceSpec::default()
    };

    let outcome = gateway.submit(&spec, Path::new("/w/job.sh"), Path::new("/w/result.out"));

    assert_eq!(outcome.job_id.as_deref(), Some("123456"));
    assert_eq!(outcome.status, 0);
    assert_eq!(
        gateway.runner().calls(),
        vec!["pjsub -L rscgrp=a-batch,node=1,elapse=02:00:00 -j -o /w/result.out /w/job.sh"]
    );
}

#[test]
pub fn submit_failure_is_carried_as_data() {
    let gateway = gateway(FakeScheduler {
        unavailable: true,
        ..FakeScheduler::default()
    });

    let outcome = gateway.submit(
        &ResourceSpec::default(),
        Path::new("/w/job.sh"),
        Path::new("/w/result.out"),
    );

    assert_eq!(outcome.job_id, None);
    assert_eq!(outcome.status, super::command::COMMAND_FAILED);
    assert!(outcome.output.contains("pjsub"));
}

#[test]
pub fn query_reads_active_listing() {
    let gateway = gateway(FakeScheduler::default());

    let status = gateway.query("123456");

    assert_eq!(status.job_id, "123456");
    assert_eq!(status.state, JobState::Running);
    assert_eq!(status.source, StatusSource::Active);
    assert_eq!(status.core, "48");
    assert!(!status.is_terminal());
    assert_eq!(gateway.runner().calls(), vec!["pjstat"]);
}

#[test]
pub fn query_of_absent_job_is_unknown() {
    let gateway = gateway(FakeScheduler::default());

    let status = gateway.query("42");

    assert_eq!(status.state, JobState::Unknown);
    assert_eq!(status.source, StatusSource::Missing);
    assert_eq!(status.status, 1);
    assert!(status.message.contains("does not exist"));
    assert!(status.is_terminal());
    assert_eq!(gateway.runner().calls(), vec!["pjstat", "pjstat -H 42"]);
}

#[test]
pub fn query_of_empty_job_id_runs_nothing() {
    let gateway = gateway(FakeScheduler::default());

    let status = gateway.query("");

    assert!(status.is_terminal());
    assert!(gateway.runner().calls().is_empty());
}

#[test]
pub fn unavailable_scheduler_is_not_terminal() {
    let gateway = gateway(FakeScheduler {
        unavailable: true,
        ..FakeScheduler::default()
    });

    let status = gateway.query("123456");

    assert_eq!(status.source, StatusSource::Failed);
    assert!(!status.is_terminal());
}

#[test]
pub fn delete_is_idempotent() {
    let gateway = gateway(FakeScheduler::default());

    let first = gateway.delete("123456");

    assert_eq!(first.state, JobState::Finished);
    assert_eq!(first.source, StatusSource::History);
    assert_eq!(first.status, 0);
    assert!(first.message.contains("pjdel Accepted job 123456"));
    assert_eq!(first.job_name, "job.sh");
    assert_eq!(gateway.runner().count("pjdel"), 1);

    let second = gateway.delete("123456");

    assert_eq!(second.state, first.state);
    assert!(second.is_terminal());
    assert_eq!(gateway.runner().count("pjdel"), 1);
}

#[test]
pub fn delete_of_missing_job_issues_no_deletion() {
    let gateway = gateway(FakeScheduler::default());

    let status = gateway.delete("42");

    assert_eq!(status.state, JobState::Unknown);
    assert_eq!(gateway.runner().count("pjdel"), 0);
}

#[test]
pub fn silent_delete_reports_fallback_message() {
    let gateway = gateway(FakeScheduler {
        silent_delete: true,
        ..FakeScheduler::default()
    });

    let status = gateway.delete("123456");

    assert_eq!(status.message, "job 123456 already finished or does not exist.");
    assert_eq!(status.status, 0);
    assert_eq!(status.state, JobState::Finished);
    assert_eq!(status.job_name, "job.sh");
    assert_eq!(gateway.runner().count("pjdel"), 1);
}
