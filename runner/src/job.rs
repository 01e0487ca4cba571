use chrono::{DateTime, Local};
use serde::{Deserialize, Deserializer, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    fs::File,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;
use uuid::Uuid;

use crate::{config::ExecutorConfig, submission::SubmissionError};

/// free-form, arbitrarily nested job parameters
pub type Params = BTreeMap<String, serde_yaml::Value>;

pub const DEFAULT_ELAPSE: &str = "01:00:00";
pub const DEFAULT_PROJECT: &str = "hpc-ops";
pub const LATEST_VERSION: &str = "latest";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("at least one of node, vnode_core or gpu has to request a non-zero allocation")]
    NoResources,
    #[error("elapse must be formatted as HH:MM:SS, got '{0}'")]
    InvalidElapse(String),
    #[error("flow logic reference must look like <name>:<version>, got '{0}'")]
    InvalidFlowLogic(String),
}

/// Everything needed to submit a single job
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct JobRequest {
    pub node: Option<u32>,
    pub vnode_core: Option<u32>,
    pub gpu: Option<u32>,
    // `elapse: ~` means the default wall time as well
    #[serde(default = "default_elapse", deserialize_with = "elapse_or_default")]
    pub elapse: Option<String>,
    #[serde(default)]
    pub params: Params,

    // experiment tracking granularity
    #[serde(default = "default_project")]
    pub project: String,
    pub group: Option<String>,
    pub jobtype: Option<String>,
    pub run: Option<String>,

    #[serde(default)]
    pub flow_logic: FlowLogicRef,
}

impl Default for JobRequest {
    fn default() -> Self {
        Self {
            node: None,
            vnode_core: None,
            gpu: None,
            elapse: default_elapse(),
            params: Params::new(),
            project: default_project(),
            group: None,
            jobtype: None,
            run: None,
            flow_logic: FlowLogicRef::default(),
        }
    }
}

impl JobRequest {
    pub fn validate(&self) -> Result<(), RequestError> {
        let allocates = [self.node, self.vnode_core, self.gpu]
            .iter()
            .any(|dimension| matches!(dimension, Some(count) if *count > 0));

        if !allocates {
            return Err(RequestError::NoResources);
        }

        match &self.elapse {
            Some(elapse) if !is_wall_time(elapse) => {
                Err(RequestError::InvalidElapse(elapse.clone()))
            }
            _ => Ok(()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, SubmissionError> {
        let file = File::open(path).map_err(|error| SubmissionError::ReadRequest {
            path: path.to_path_buf(),
            error,
        })?;

        Ok(serde_yaml::from_reader(file)?)
    }
}

/// `HH:MM:SS`, hours may exceed 24 but minutes and seconds stay below 60
fn is_wall_time(value: &str) -> bool {
    let parts: Vec<&str> = value.split(':').collect();

    if parts.len() != 3 {
        return false;
    }

    parts.iter().enumerate().all(|(index, part)| {
        !part.is_empty()
            && part.len() <= if index == 0 { 4 } else { 2 }
            && part.bytes().all(|byte| byte.is_ascii_digit())
            && (index == 0 || part.parse::<u8>().map_or(false, |value| value < 60))
    })
}

fn default_elapse() -> Option<String> {
    Some(DEFAULT_ELAPSE.to_owned())
}

fn elapse_or_default<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.or_else(default_elapse))
}

fn default_project() -> String {
    DEFAULT_PROJECT.to_owned()
}

/// Reference to a flow logic, `<name>:<version>`
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct FlowLogicRef {
    pub name: String,
    pub version: String,
}

impl Default for FlowLogicRef {
    fn default() -> Self {
        Self {
            name: "echo".to_owned(),
            version: LATEST_VERSION.to_owned(),
        }
    }
}

impl FromStr for FlowLogicRef {
    type Err = RequestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (name, version) = match value.split_once(':') {
            Some((name, version)) => (name.trim(), version.trim()),
            None => (value.trim(), LATEST_VERSION),
        };

        if name.is_empty() || version.is_empty() || version.contains(':') {
            return Err(RequestError::InvalidFlowLogic(value.to_owned()));
        }

        Ok(Self {
            name: name.to_owned(),
            version: version.to_owned(),
        })
    }
}

impl TryFrom<String> for FlowLogicRef {
    type Error = RequestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FlowLogicRef> for String {
    fn from(value: FlowLogicRef) -> Self {
        value.to_string()
    }
}

impl Display for FlowLogicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

/// The job context as persisted next to the launch script.
///
/// Written once by the submitting process and read once by the job process, so it has to
/// carry everything the job needs besides the runner config.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct JobContext {
    pub submission_id: Uuid,
    pub created_at: DateTime<Local>,
    pub hostname: String,
    pub base_dir: PathBuf,
    pub working_dir: PathBuf,
    pub context_path: PathBuf,
    pub script_path: PathBuf,
    pub log_path: PathBuf,
    pub request: JobRequest,
    // executor settings of the submitting side, the job may not see the same config file
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl JobContext {
    /// worker pool size: the submitter's setting, else the job side config
    pub fn threads(&self, fallback: &ExecutorConfig) -> usize {
        self.executor
            .threads
            .unwrap_or_else(|| fallback.threads())
    }
}

/// Handle returned to the caller after a submission attempt
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct JobHandle {
    pub submission_id: Uuid,
    // empty as long as the scheduler did not accept the job
    pub job_id: String,
    pub working_dir: PathBuf,
    pub context_path: PathBuf,
    pub script_path: PathBuf,
    pub log_path: PathBuf,
    pub submitted_at: DateTime<Local>,
    pub status: i32,
    pub message: String,
}

impl JobHandle {
    pub fn is_submitted(&self) -> bool {
        !self.job_id.is_empty()
    }

    /// turn a rejected submission into an error, keeping the raw scheduler output
    pub fn check(self) -> Result<Self, SubmissionError> {
        if self.is_submitted() {
            Ok(self)
        } else {
            Err(SubmissionError::Rejected {
                status: self.status,
                output: self.message,
            })
        }
    }
}
