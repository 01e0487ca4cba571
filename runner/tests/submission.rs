use hpcops_runner::{
    config::{ExecutorConfig, RunnerConfig},
    flow::{FlowLogicRegistry, RESULTS_FILE},
    job::{JobContext, JobRequest},
    pipeline::run_job,
    scheduler::{
        command::{CommandOutput, CommandRunner, GatewayError},
        record::JobRecord,
        state::JobState,
        SchedulerGateway,
    },
    submission::SubmissionService,
};
use parking_lot::Mutex;
use std::{fs::File, path::PathBuf};

const HEADER: &str =
    "JOB_ID   JOB_NAME MD ST  USER   START_DATE     ELAPSE_LIM NODE_REQUIRE VNODE CORE V_MEM";

/// pjsub accepts everything as job 99999, which then shows up as queued
#[derive(Default)]
struct MockPjm {
    submissions: Mutex<Vec<Vec<String>>>,
}

impl CommandRunner for MockPjm {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, GatewayError> {
        let stdout = match program {
            "pjsub" => {
                self.submissions.lock().push(args.to_vec());
                "[INFO] pjsub Job 99999 submitted.\n".to_owned()
            }
            "pjstat" => format!(
                "{HEADER}\n{:<9}{:<9}{:<3}{:<4}{:<7}{:<15}{:<11}{:<13}{:<6}{:<5}{}\n",
                "99999", "job.sh", "NM", "QUE", "u0001", "-", "0002:00:00", "1", "-", "-", "-"
            ),
            _ => String::new(),
        };

        Ok(CommandOutput {
            status: 0,
            stdout,
            stderr: String::new(),
        })
    }
}

#[test]
fn submit_track_and_execute() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = RunnerConfig {
        base_dir: dir.path().to_path_buf(),
        executor: ExecutorConfig {
            threads: Some(2),
            entry: Some(PathBuf::from("/usr/local/bin/hpcops")),
        },
        ledger: None,
        ..RunnerConfig::default()
    };
    config.scheduler.resource_group = "a-batch".to_owned();

    let service = SubmissionService::with_gateway(
        &config,
        SchedulerGateway::with_runner(&config.scheduler, MockPjm::default()),
    );
    let request: JobRequest = serde_yaml::from_str(
        "node: 1
elapse: '02:00:00'
project: demo
flow_logic: echo:1
params:
  tasks:
    - {lr: 0.1}
    - {lr: 0.01}
",
    )
    .unwrap();

    let handle = service.submit_job(&request).unwrap().check().unwrap();

    assert_eq!(handle.job_id, "99999");
    assert!(handle.working_dir.starts_with(dir.path().join("tmp")));
    assert!(handle.working_dir.is_dir());
    assert!(handle.context_path.is_file());
    assert!(handle.script_path.is_file());

    let submissions = service.gateway().runner().submissions.lock().clone();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0][1], "rscgrp=a-batch,node=1,elapse=02:00:00");
    assert_eq!(
        submissions[0].last().map(String::as_str),
        handle.script_path.to_str()
    );

    let mut record = JobRecord::from_handle(&handle);
    assert_eq!(record.refresh(service.gateway()).state, JobState::Queued);
    assert!(!record.is_terminal());

    // what the launch script does once the scheduler starts the job
    let context: JobContext =
        serde_yaml::from_reader(File::open(&handle.context_path).unwrap()).unwrap();
    assert_eq!(context.request.project, "demo");

    let results = run_job(&handle.context_path, &config, &FlowLogicRegistry::builtin()).unwrap();

    assert_eq!(results, 2);
    assert!(handle.working_dir.join(RESULTS_FILE).is_file());
}
