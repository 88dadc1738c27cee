//! systemd service orchestration

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::exec::CommandRunner;
use crate::poll::{pause, PollPolicy};
use crate::AgentError;

/// Journal lines captured when a service fails
pub const JOURNAL_LINES: &str = "25";

/// Lifecycle state of a service while it comes up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Starting,
    Active,
    Failed,
}

impl ServiceState {
    /// Classify `systemctl is-active` output
    pub fn from_status_text(text: &str) -> Self {
        match text.trim() {
            "activating" => Self::Starting,
            "active" => Self::Active,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Starting)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Active => write!(f, "active"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Starts services and waits for them to settle
pub struct ServiceOrchestrator {
    runner: Arc<dyn CommandRunner>,
    policy: PollPolicy,
    cancel: CancellationToken,
}

impl ServiceOrchestrator {
    pub fn new(runner: Arc<dyn CommandRunner>, policy: PollPolicy, cancel: CancellationToken) -> Self {
        Self {
            runner,
            policy,
            cancel,
        }
    }

    /// `systemctl start <name>`
    ///
    /// On failure the tail of the service journal is logged before the error
    /// is returned.
    pub async fn start_service(&self, name: &str) -> Result<(), AgentError> {
        let args = ["start", name];
        info!("Starting service {}", name);
        let output = self.runner.run("systemctl", &args).await?;
        if !output.combined().is_empty() {
            info!("{}", output.combined());
        }
        if let Err(e) = output.check("systemctl", &args) {
            error!("Failed to start service {}: {}", name, e);
            self.log_journal(name).await;
            return Err(e);
        }
        Ok(())
    }

    /// Current state of `name`
    ///
    /// `systemctl is-active` exits non-zero for anything but "active", so only
    /// the printed state is classified. A query that cannot run is a failure.
    pub async fn status(&self, name: &str) -> ServiceState {
        match self.runner.run("systemctl", &["is-active", name]).await {
            Ok(output) => {
                let state = ServiceState::from_status_text(&output.stdout);
                debug!("{} is {} ({})", name, output.stdout.trim(), state);
                state
            }
            Err(e) => {
                warn!("Failed to query status of {}: {}", name, e);
                ServiceState::Failed
            }
        }
    }

    /// Poll until `name` is active or failed
    pub async fn poll_until_terminal(&self, name: &str) -> Result<ServiceState, AgentError> {
        for attempt in 1..=self.policy.max_attempts {
            let state = self.status(name).await;
            if state.is_terminal() {
                return Ok(state);
            }
            debug!(
                "{} still starting (attempt {}/{})",
                name, attempt, self.policy.max_attempts
            );
            if attempt < self.policy.max_attempts {
                pause(self.policy.interval, &self.cancel, &format!("waiting for {name}")).await?;
            }
        }
        Err(AgentError::Timeout(format!("service {name} to become active")))
    }

    /// Wait for `name` and fail unless it ends up active
    pub async fn ensure_active(&self, name: &str) -> Result<(), AgentError> {
        match self.poll_until_terminal(name).await? {
            ServiceState::Active => {
                info!("Service {} is active", name);
                Ok(())
            }
            state => {
                error!("Service {} failed to start", name);
                self.log_journal(name).await;
                Err(AgentError::ServiceFailed {
                    service: name.to_string(),
                    state: state.to_string(),
                })
            }
        }
    }

    /// Start `name` and wait for it to become active
    pub async fn start_and_wait(&self, name: &str) -> Result<(), AgentError> {
        self.start_service(name).await?;
        self.ensure_active(name).await
    }

    /// Best effort; a journal that cannot be read is only logged
    async fn log_journal(&self, name: &str) {
        match self
            .runner
            .run("journalctl", &["-u", name, "-n", JOURNAL_LINES])
            .await
        {
            Ok(output) => {
                for line in output.combined().lines() {
                    info!("{}: {}", name, line);
                }
            }
            Err(e) => warn!("Failed to read journal of {}: {}", name, e),
        }
    }
}
