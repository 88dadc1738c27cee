//! Error types for vm-agent

use thiserror::Error;

/// Main error type for vm-agent operations
///
/// A handful of variants describe conditions that some callers tolerate
/// (`DeviceBusy`, `NoPartitionTable`, `FilesystemExists`, `NotADirectory`,
/// `IsADirectory`). Callers match on the variant, never on the message.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error on {path}: {source}")]
    IoAt {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}: {body}")]
    HttpStatus {
        url: String,
        status: u16,
        body: String,
    },

    #[error("Command execution failed: {0}")]
    Command(String),

    #[error("'{command}' exited with status {status}: {output}")]
    CommandFailed {
        command: String,
        status: i32,
        output: String,
    },

    #[error("Device {0} is busy")]
    DeviceBusy(String),

    #[error("Device {0} does not contain a recognized partition table")]
    NoPartitionTable(String),

    #[error("No partitions found on {0} after creating new partition")]
    PartitionsMissing(String),

    #[error("{0} appears to contain an existing filesystem")]
    FilesystemExists(String),

    #[error("{0} is not a directory")]
    NotADirectory(String),

    #[error("{0} is a directory")]
    IsADirectory(String),

    #[error("File {0} could not be found")]
    NotFound(String),

    #[error("{0} is on a read-only filesystem")]
    ReadOnly(String),

    #[error("Bytes written {written} to {path} does not match the number of bytes read {read} from the source file")]
    Integrity {
        path: String,
        written: usize,
        read: usize,
    },

    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("Service '{service}' failed to start (state: {state})")]
    ServiceFailed { service: String, state: String },

    #[error("Vault at {0} was not unsealed after submitting all unseal shares")]
    VaultSealed(String),

    #[error("Timeout waiting for {0}")]
    Timeout(String),

    #[error("Cancelled while {0}")]
    Cancelled(String),

    #[error("Role '{role}' failed: {message}")]
    Role { role: String, message: String },
}

impl AgentError {
    /// Wrap an IO error with the path it happened on
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::IoAt {
            path: path.into(),
            source,
        }
    }

    /// A program that could not be run at all
    pub fn command(command: &str, err: impl std::fmt::Display) -> Self {
        Self::Command(format!("{command}: {err}"))
    }

    /// Create a role error
    pub fn role(role: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Role {
            role: role.into(),
            message: message.into(),
        }
    }

    /// Whether this error only says the disk is already claimed by someone else
    pub fn is_device_busy(&self) -> bool {
        matches!(self, Self::DeviceBusy(_))
    }
}
