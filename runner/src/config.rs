use serde::{Deserialize, Serialize};
use std::{
    env,
    fs::File,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, warn};

/// config file picked up from the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "hpcops.yaml";

pub const ENV_BASE_DIR: &str = "HPCOPS_BASE_DIR";
pub const ENV_RESOURCE_GROUP: &str = "HPCOPS_RESOURCE_GROUP";

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::Io(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Failed to access file or metadata: {0}")]
    Io(#[from] Error),
    #[error("Config is not valid yaml: {0}")]
    InvalidConfig(#[from] serde_yaml::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // every job directory, launch script and the `cd` of the script is rooted here
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    // `ledger: ~` disables the job ledger
    #[serde(default = "default_ledger")]
    pub ledger: Option<LedgerConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub resource_group: String,
    #[serde(default = "default_submit_command")]
    pub submit: String,
    #[serde(default = "default_status_command")]
    pub status: String,
    #[serde(default = "default_delete_command")]
    pub delete: String,
    // seconds a single scheduler command may take, unbounded if unset
    pub timeout: Option<u64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    // size of the in-job worker pool, falls back to the number of cpus
    pub threads: Option<usize>,
    // executable the launch script hands the job context to
    pub entry: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            scheduler: SchedulerConfig::default(),
            executor: ExecutorConfig::default(),
            ledger: default_ledger(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            resource_group: String::new(),
            submit: default_submit_command(),
            status: default_status_command(),
            delete: default_delete_command(),
            timeout: None,
        }
    }
}

impl SchedulerConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

impl ExecutorConfig {
    pub fn threads(&self) -> usize {
        self.threads.unwrap_or_else(num_cpus::get)
    }

    /// executable written into launch scripts
    pub fn entry(&self) -> Result<PathBuf, ConfigErrors> {
        match &self.entry {
            Some(entry) => Ok(entry.clone()),
            None => Ok(env::current_exe()?),
        }
    }
}

impl RunnerConfig {
    /// Load the config from `path`, or from `hpcops.yaml` in the working directory if it
    /// exists, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigErrors> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);

                if fallback.is_file() {
                    Self::from_file(fallback)?
                } else {
                    debug!("No {DEFAULT_CONFIG_FILE} found, using defaults");
                    Self::default()
                }
            }
        };

        config.apply_env(|key| env::var(key).ok());

        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigErrors> {
        if !path.is_file() {
            return Err(ConfigErrors::FileNotFound(path.to_path_buf()));
        }

        let file = File::open(path)?;

        Ok(serde_yaml::from_reader(file)?)
    }

    /// overlay values taken from the environment, `lookup` is `env::var` outside of tests
    pub fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        if let Some(base_dir) = lookup(ENV_BASE_DIR).filter(|value| !value.is_empty()) {
            self.base_dir = PathBuf::from(base_dir);
        }

        if let Some(group) = lookup(ENV_RESOURCE_GROUP).filter(|value| !value.is_empty()) {
            self.scheduler.resource_group = group;
        }
    }

    /// Directory holding all per-job working directories
    pub fn jobs_dir(&self) -> PathBuf {
        self.base_dir.join("tmp")
    }

    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.scheduler.resource_group.trim().is_empty() {
            error!("scheduler.resource_group must be set (or {ENV_RESOURCE_GROUP})");
            contains_error = true;
        }

        if !self.base_dir.is_dir() {
            error!(
                "base_dir {} is not a directory, job directories can't be created",
                self.base_dir.to_string_lossy()
            );
            contains_error = true;
        }

        for (name, command) in [
            ("submit", &self.scheduler.submit),
            ("status", &self.scheduler.status),
            ("delete", &self.scheduler.delete),
        ] {
            if command.trim().is_empty() {
                error!("scheduler.{name} can't be an empty command");
                contains_error = true;
            }
        }

        if self.executor.threads == Some(0) {
            error!("executor.threads cannot be 0, no task would ever run");
            contains_error = true;
        }

        match self.executor.entry() {
            Ok(entry) => match check_executable(&entry) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        "executor.entry {} is not executable, launch scripts would fail",
                        entry.to_string_lossy()
                    );
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to determine if executor.entry ({}) is an executable: {e}",
                        entry.to_string_lossy()
                    );
                    contains_error = true;
                }
            },
            Err(e) => {
                error!("Failed to resolve the job entry executable: {e}");
                contains_error = true;
            }
        }

        if self.ledger.is_none() {
            warn!("Job ledger is disabled, submitted jobs will not be recorded locally");
        }

        contains_error
    }
}

fn default_base_dir() -> PathBuf {
    env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn default_submit_command() -> String {
    "pjsub".to_owned()
}

fn default_status_command() -> String {
    "pjstat".to_owned()
}

fn default_delete_command() -> String {
    "pjdel".to_owned()
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("hpcops.db")
}

fn default_ledger() -> Option<LedgerConfig> {
    Some(LedgerConfig {
        path: default_ledger_path(),
    })
}
