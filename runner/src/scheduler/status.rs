use super::{
    command::{GatewayError, COMMAND_FAILED},
    state::{JobState, StatusSource},
};
use serde::{Deserialize, Serialize};

/// Column labels of the status table, in table order.
///
/// The status tool prints fixed-width text whose widths depend on the values, so a field is
/// located by the offset of its label in the header line and ends where the next label
/// starts.
pub const STATUS_COLUMNS: [&str; 11] = [
    "JOB_ID",
    "JOB_NAME",
    "MD",
    "ST",
    "USER",
    "START_DATE",
    "ELAPSE_LIM",
    "NODE_REQUIRE",
    "VNODE",
    "CORE",
    "V_MEM",
];

/// Snapshot of a single job as reported by the scheduler, recomputed on every query
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct JobStatus {
    pub job_id: String,
    pub state: JobState,
    // raw `ST` column, kept for codes without a normalized state
    pub state_code: String,
    pub source: StatusSource,
    // exit code of the command the status/message pair stems from
    pub status: i32,
    pub message: String,

    pub job_name: String,
    pub mode: String,
    pub user: String,
    pub start_date: String,
    pub elapse_lim: String,
    pub node_require: String,
    pub vnode: String,
    pub core: String,
    pub v_mem: String,
}

impl JobStatus {
    /// Decode a data line of the status table against its header.
    ///
    /// Never fails: labels missing from the header, lines shorter than the header and
    /// slices off a char boundary all degrade to empty fields.
    pub fn parse(header: &str, line: &str) -> Self {
        let offsets = STATUS_COLUMNS.map(|label| header.find(label));
        let field = |index: usize| -> String {
            let Some(start) = offsets[index] else {
                return String::new();
            };

            let end = if index + 1 == STATUS_COLUMNS.len() {
                line.len()
            } else {
                match offsets[index + 1] {
                    Some(end) if end >= start => end.min(line.len()),
                    _ => return String::new(),
                }
            };

            line.get(start..end)
                .map(|value| value.trim().to_owned())
                .unwrap_or_default()
        };

        let state_code = field(3);

        Self {
            job_id: field(0),
            job_name: field(1),
            mode: field(2),
            state: JobState::from_code(&state_code),
            state_code,
            user: field(4),
            start_date: field(5),
            elapse_lim: field(6),
            node_require: field(7),
            vnode: field(8),
            core: field(9),
            v_mem: field(10),
            ..Self::default()
        }
    }

    /// status of a job neither listing knows about
    pub fn missing(job_id: &str, status: i32, message: impl Into<String>) -> Self {
        Self {
            job_id: job_id.to_owned(),
            source: StatusSource::Missing,
            status,
            message: message.into(),
            ..Self::default()
        }
    }

    /// status of a job whose status command could not be run
    pub fn failed(job_id: &str, error: &GatewayError) -> Self {
        Self {
            job_id: job_id.to_owned(),
            source: StatusSource::Failed,
            status: COMMAND_FAILED,
            message: error.to_string(),
            ..Self::default()
        }
    }

    /// A job that finished, or one that vanished from both listings, will not change again.
    pub fn is_terminal(&self) -> bool {
        match self.state {
            JobState::Finished => true,
            JobState::Unknown => self.source == StatusSource::Missing,
            _ => false,
        }
    }
}

/// Find the header and the row of `job_id` in a status listing.
///
/// The header is the first non-blank line, the row is the first following line whose first
/// token is the job id.
pub fn find_row<'a>(listing: &'a str, job_id: &str) -> Option<(&'a str, &'a str)> {
    let mut lines = listing.lines().filter(|line| !line.trim().is_empty());
    let header = lines.next()?;

    lines
        .find(|line| line.split_whitespace().next() == Some(job_id))
        .map(|line| (header, line))
}

#[cfg(test)]
#[path = "status_test.rs"]
mod status_test;
