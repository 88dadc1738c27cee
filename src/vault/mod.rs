//! Vault unseal protocol
//!
//! Waits for the vault to report itself initialized, submits every held
//! unseal share in order, then confirms the vault is unsealed.

pub mod client;
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::poll::{pause, PollPolicy};
use crate::AgentError;

pub use client::VaultClient;

/// Payload of `GET /v1/sys/seal-status`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SealStatus {
    #[serde(rename = "type")]
    pub seal_type: String,
    pub initialized: bool,
    pub sealed: bool,
    /// Shares needed to unseal
    pub t: u32,
    /// Shares issued
    pub n: u32,
    /// Shares accepted so far
    pub progress: u32,
    pub nonce: String,
    pub version: String,
    pub build_date: Option<String>,
    pub migration: bool,
    pub recovery_seal: bool,
    pub storage_type: Option<String>,
}

/// One unseal key share
///
/// Never printed; `Debug` is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct UnsealShare(String);

impl UnsealShare {
    pub fn new(share: impl Into<String>) -> Self {
        Self(share.into().trim().to_string())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for UnsealShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UnsealShare(<redacted>)")
    }
}

/// The two vault endpoints the unseal protocol talks to
#[async_trait]
pub trait SealApi: Send + Sync {
    /// Where the vault lives, for logs and errors
    fn endpoint(&self) -> &str;

    async fn seal_status(&self) -> Result<SealStatus, AgentError>;

    /// Submit one share and return the resulting status
    async fn submit_unseal_share(&self, share: &UnsealShare) -> Result<SealStatus, AgentError>;
}

/// Unseal the vault behind `api` with `shares`
///
/// Returns the final seal status, which is always unsealed on success.
pub async fn unseal(
    api: &dyn SealApi,
    shares: &[UnsealShare],
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> Result<SealStatus, AgentError> {
    let status = wait_for_initialized(api, policy, cancel).await?;
    if !status.sealed {
        info!("Vault at {} is already unsealed", api.endpoint());
        return Ok(status);
    }

    info!(
        "Submitting {} unseal share(s) to {} (threshold {})",
        shares.len(),
        api.endpoint(),
        status.t
    );
    for (i, share) in shares.iter().enumerate() {
        let progress = api.submit_unseal_share(share).await?;
        debug!(
            "Share {} accepted, progress {}/{}",
            i + 1,
            progress.progress,
            progress.t
        );
    }

    let status = api.seal_status().await?;
    if status.sealed {
        return Err(AgentError::VaultSealed(api.endpoint().to_string()));
    }
    info!("Vault at {} is unsealed", api.endpoint());
    Ok(status)
}

async fn wait_for_initialized(
    api: &dyn SealApi,
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> Result<SealStatus, AgentError> {
    for attempt in 1..=policy.max_attempts {
        let status = api.seal_status().await?;
        if status.initialized {
            return Ok(status);
        }
        debug!(
            "Vault at {} not initialized yet (attempt {}/{})",
            api.endpoint(),
            attempt,
            policy.max_attempts
        );
        if attempt < policy.max_attempts {
            pause(policy.interval, cancel, "waiting for vault initialization").await?;
        }
    }
    Err(AgentError::Timeout(format!(
        "vault at {} to be initialized",
        api.endpoint()
    )))
}

#[cfg(test)]
mod tests {
    use super::mock::MockSealApi;
    use super::*;

    fn shares(n: usize) -> Vec<UnsealShare> {
        (1..=n).map(|i| UnsealShare::new(format!("key-{i}"))).collect()
    }

    #[test]
    fn test_share_debug_is_redacted() {
        let share = UnsealShare::new("s3cr3t\n");
        assert_eq!(share.expose(), "s3cr3t");
        assert!(!format!("{share:?}").contains("s3cr3t"));
    }

    #[test]
    fn test_seal_status_parses_vault_payload() {
        let json = r#"{
            "type": "shamir",
            "initialized": true,
            "sealed": true,
            "t": 3,
            "n": 5,
            "progress": 0,
            "nonce": "",
            "version": "1.15.2",
            "build_date": "2023-11-06T11:33:28Z",
            "migration": false,
            "recovery_seal": false,
            "storage_type": "raft"
        }"#;
        let status: SealStatus = serde_json::from_str(json).unwrap();
        assert_eq!(status.seal_type, "shamir");
        assert!(status.initialized && status.sealed);
        assert_eq!((status.t, status.n), (3, 5));
        assert_eq!(status.storage_type.as_deref(), Some("raft"));
    }

    #[test]
    fn test_seal_status_tolerates_missing_fields() {
        let status: SealStatus = serde_json::from_str(r#"{"initialized": false}"#).unwrap();
        assert!(!status.initialized);
        assert!(!status.sealed);
    }

    #[tokio::test]
    async fn test_quorum_unseals() {
        let api = MockSealApi::new(3).uninitialized_for(2);
        let status = unseal(&api, &shares(3), &PollPolicy::immediate(5), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!status.sealed);
        assert_eq!(api.submitted(), vec!["key-1", "key-2", "key-3"]);
    }

    #[tokio::test]
    async fn test_incomplete_shares_stay_sealed() {
        let api = MockSealApi::new(3);
        let result = unseal(&api, &shares(2), &PollPolicy::immediate(5), &CancellationToken::new()).await;
        assert!(matches!(result, Err(AgentError::VaultSealed(_))));
    }

    #[tokio::test]
    async fn test_already_unsealed_submits_nothing() {
        let api = MockSealApi::new(3).unsealed();
        unseal(&api, &shares(3), &PollPolicy::immediate(5), &CancellationToken::new())
            .await
            .unwrap();
        assert!(api.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_initialization_wait_is_bounded() {
        let api = MockSealApi::new(3).uninitialized_for(100);
        let result = unseal(&api, &shares(3), &PollPolicy::immediate(4), &CancellationToken::new()).await;
        assert!(matches!(result, Err(AgentError::Timeout(_))));
        assert!(api.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_reported_without_trailing_sleep() {
        let api = MockSealApi::new(3).uninitialized_for(100);
        let policy = PollPolicy::new(std::time::Duration::from_secs(3600), 1);

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            unseal(&api, &shares(3), &policy, &CancellationToken::new()),
        )
        .await
        .expect("timeout should be reported right after the last attempt");
        assert!(matches!(result, Err(AgentError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_rejected_share_aborts_submission() {
        let api = MockSealApi::new(3).reject("key-2");
        let result = unseal(&api, &shares(3), &PollPolicy::immediate(5), &CancellationToken::new()).await;
        assert!(matches!(result, Err(AgentError::HttpStatus { status: 400, .. })));
        assert_eq!(api.submitted(), vec!["key-1"]);
    }

    #[tokio::test]
    async fn test_cancelled_while_waiting() {
        let api = MockSealApi::new(3).uninitialized_for(100);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = PollPolicy::new(std::time::Duration::from_secs(2), 150);
        let result = unseal(&api, &shares(3), &policy, &cancel).await;
        assert!(matches!(result, Err(AgentError::Cancelled(_))));
    }
}
