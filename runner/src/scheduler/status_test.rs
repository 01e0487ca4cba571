use super::*;

const HEADER: &str =
    "JOB_ID   JOB_NAME MD ST  USER   START_DATE     ELAPSE_LIM NODE_REQUIRE VNODE CORE V_MEM";

fn aligned_row(values: [&str; 11]) -> String {
    format!(
        "{:<9}{:<9}{:<3}{:<4}{:<7}{:<15}{:<11}{:<13}{:<6}{:<5}{}",
        values[0],
        values[1],
        values[2],
        values[3],
        values[4],
        values[5],
        values[6],
        values[7],
        values[8],
        values[9],
        values[10]
    )
}

#[test]
pub fn parses_fields_by_label_offset() {
    let row = aligned_row([
        "123456",
        "run.sh",
        "NM",
        "RUN",
        "u0001",
        "01/15 10:00:00",
        "0002:00:00",
        "1",
        "-",
        "48",
        "28Gi",
    ]);
    let status = JobStatus::parse(HEADER, &row);

    assert_eq!(status.job_id, "123456");
    assert_eq!(status.job_name, "run.sh");
    assert_eq!(status.mode, "NM");
    assert_eq!(status.state_code, "RUN");
    assert_eq!(status.state, JobState::Running);
    assert_eq!(status.user, "u0001");
    assert_eq!(status.start_date, "01/15 10:00:00");
    assert_eq!(status.elapse_lim, "0002:00:00");
    assert_eq!(status.node_require, "1");
    assert_eq!(status.vnode, "-");
    assert_eq!(status.core, "48");
    assert_eq!(status.v_mem, "28Gi");
}

#[test]
pub fn short_line_leaves_trailing_fields_empty() {
    let status = JobStatus::parse(HEADER, "123456   run.sh   NM QUE");

    assert_eq!(status.job_id, "123456");
    assert_eq!(status.state, JobState::Queued);
    assert_eq!(status.user, "");
    assert_eq!(status.v_mem, "");
}

#[test]
pub fn malformed_header_degrades_to_empty_fields() {
    let status = JobStatus::parse("id name state", "123456 run.sh RUN");

    assert_eq!(status, JobStatus::default());
    assert_eq!(status.state, JobState::Unknown);
}

#[test]
pub fn non_ascii_values_do_not_panic() {
    let row = aligned_row(["123456", "ジョブ", "NM", "RUN", "", "", "", "", "", "", ""]);
    let status = JobStatus::parse(HEADER, &row);

    assert_eq!(status.job_id, "123456");
}

#[test]
pub fn finds_row_of_job_in_listing() {
    let listing = format!(
        "{HEADER}\n{}\n{}\n",
        aligned_row(["111", "a.sh", "NM", "QUE", "u", "", "", "", "", "", ""]),
        aligned_row(["1112", "b.sh", "NM", "RUN", "u", "", "", "", "", "", ""]),
    );

    let (header, row) = find_row(&listing, "1112").unwrap();

    assert_eq!(header, HEADER);
    assert_eq!(JobStatus::parse(header, row).job_name, "b.sh");
    assert!(find_row(&listing, "11").is_none());
    assert!(find_row("", "11").is_none());
}

#[test]
pub fn terminal_states() {
    let finished = JobStatus {
        state: JobState::Finished,
        source: StatusSource::History,
        ..JobStatus::default()
    };
    let held = JobStatus {
        state_code: "HLD".to_owned(),
        source: StatusSource::Active,
        ..JobStatus::default()
    };
    let failed = JobStatus::failed(
        "1",
        &GatewayError::Timeout {
            command: "pjstat".to_owned(),
            timeout: std::time::Duration::from_secs(1),
        },
    );

    assert!(finished.is_terminal());
    assert!(JobStatus::missing("1", 1, "gone").is_terminal());
    assert!(!held.is_terminal());
    assert!(!failed.is_terminal());
    assert_eq!(failed.status, COMMAND_FAILED);
}
