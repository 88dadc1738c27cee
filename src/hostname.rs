//! Hostname discovery
//!
//! On first boot the hostname is still `localhost` until the cloud layer has
//! written the real one, so the file is re-read until it changes.

use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::poll::{pause, PollPolicy};
use crate::AgentError;

/// Read the hostname from `path`, waiting while it is empty or `localhost`
pub async fn load_hostname(
    path: &Path,
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> Result<String, AgentError> {
    for attempt in 1..=policy.max_attempts {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AgentError::io(path.display().to_string(), e))?;
        let hostname = content.trim();
        if !hostname.is_empty() && hostname != "localhost" {
            info!("Hostname is {}", hostname);
            return Ok(hostname.to_string());
        }
        debug!(
            "Hostname not set yet (attempt {}/{})",
            attempt, policy.max_attempts
        );
        if attempt < policy.max_attempts {
            pause(policy.interval, cancel, "waiting for the hostname").await?;
        }
    }
    Err(AgentError::Timeout(format!(
        "a hostname other than localhost in {}",
        path.display()
    )))
}
