use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Normalized job lifecycle, mapped from the two-letter `ST` column
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Starting,
    Running,
    Finishing,
    Finished,
    #[default]
    Unknown,
}

impl JobState {
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "QUE" => Self::Queued,
            "RNA" => Self::Starting,
            "RUN" => Self::Running,
            "RNO" => Self::Finishing,
            "EXT" => Self::Finished,
            _ => Self::Unknown,
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Queued => "QUEUED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Finishing => "FINISHING",
            Self::Finished => "FINISHED",
            Self::Unknown => "UNKNOWN",
        };

        f.write_str(name)
    }
}

/// Where a status record was taken from
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StatusSource {
    /// row of the active job listing
    Active,
    /// row of the by-id historical lookup
    History,
    /// neither listing knows the job, it won't show up again
    #[default]
    Missing,
    /// the status command itself could not be run
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_scheduler_codes() {
        assert_eq!(JobState::from_code("QUE"), JobState::Queued);
        assert_eq!(JobState::from_code("RNA"), JobState::Starting);
        assert_eq!(JobState::from_code("RNO"), JobState::Finishing);
        assert_eq!(JobState::from_code("EXT"), JobState::Finished);
        assert_eq!(JobState::Finished.to_string(), "FINISHED");
    }

    #[test]
    fn unrecognized_codes_are_unknown() {
        assert_eq!(JobState::from_code("HLD"), JobState::Unknown);
        assert_eq!(JobState::from_code(""), JobState::Unknown);
        assert_eq!(JobState::from_code(" RUN "), JobState::Running);
    }
}
