use std::{
    io::{self, Read},
    process::{Command, Stdio},
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, trace, warn};
use wait_timeout::ChildExt;

/// status reported whenever a scheduler command could not produce an exit code
pub const COMMAND_FAILED: i32 = -1;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Failed to spawn `{command}`: {error}")]
    Spawn { command: String, error: io::Error },
    #[error("Failed to wait for `{command}`: {error}")]
    Wait { command: String, error: io::Error },
    #[error("`{command}` did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// what a scheduler command left behind
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Seam between the gateway and the operating system.
///
/// The gateway only ever needs "run this program with these arguments and give me the exit
/// code and output", which keeps the scheduler protocol testable without a cluster.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, GatewayError>;
}

/// Runs scheduler commands as child processes, optionally bounded by a timeout
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    timeout: Option<Duration>,
}

impl SystemRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl CommandRunner for SystemRunner {
    #[tracing::instrument(level = "debug", skip(self))]
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, GatewayError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| GatewayError::Spawn {
                command: program.to_owned(),
                error,
            })?;

        // both pipes are drained while waiting, a full pipe would stall the child
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = match self.timeout {
            Some(timeout) => match child.wait_timeout(timeout) {
                Ok(Some(status)) => status,
                Ok(None) => {
                    warn!(command = program, "Scheduler command ran into timeout, killing it");

                    if let Err(error) = child.kill().and_then(|_| child.wait().map(|_| ())) {
                        warn!(error = ?error, "Failed to reap timed out scheduler command");
                    }

                    return Err(GatewayError::Timeout {
                        command: program.to_owned(),
                        timeout,
                    });
                }
                Err(error) => {
                    return Err(GatewayError::Wait {
                        command: program.to_owned(),
                        error,
                    })
                }
            },
            None => child.wait().map_err(|error| GatewayError::Wait {
                command: program.to_owned(),
                error,
            })?,
        };

        let output = CommandOutput {
            status: status.code().unwrap_or(COMMAND_FAILED),
            stdout: collect(stdout),
            stderr: collect(stderr),
        };

        debug!(command = program, status = output.status, "Scheduler command finished");
        trace!(stdout = %output.stdout, stderr = %output.stderr);

        Ok(output)
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();

        if let Err(error) = pipe.read_to_end(&mut buffer) {
            warn!(error = ?error, "Failed to read scheduler command output");
        }

        String::from_utf8_lossy(&buffer).into_owned()
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}
