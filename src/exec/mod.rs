//! External tool execution
//!
//! Every OS utility the agent drives (sfdisk, parted, mkfs.xfs, mount,
//! systemctl, journalctl) goes through [`CommandRunner`], so the provisioning
//! logic can be exercised against a scripted runner in tests.

pub mod mock;

use async_trait::async_trait;
use std::process::Stdio;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::AgentError;

/// Captured result of one tool invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stdout and stderr together, the way an operator would see them
    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{out}\n{err}"),
        }
    }

    /// Turn a non-zero exit into [`AgentError::CommandFailed`]
    pub fn check(self, program: &str, args: &[&str]) -> Result<Self, AgentError> {
        if self.success() {
            return Ok(self);
        }
        Err(AgentError::CommandFailed {
            command: render(program, args),
            status: self.status.unwrap_or(-1),
            output: self.combined(),
        })
    }
}

/// Runs external programs
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` to completion and capture its output.
    ///
    /// A non-zero exit is not an error here; callers decide which exits they
    /// tolerate. Only failing to run the program at all is an error.
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, AgentError>;
}

/// Runs programs on the host with `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner {
    cancel: CancellationToken,
}

impl SystemCommandRunner {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, AgentError> {
        let command = render(program, args);
        debug!("Running {}", command);

        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::command(&command, e))?;

        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.map_err(|e| AgentError::command(&command, e))?
            }
            _ = self.cancel.cancelled() => {
                return Err(AgentError::Cancelled(format!("running {command}")));
            }
        };

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Render a command line for logs and error messages
pub fn render(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}
