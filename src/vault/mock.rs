//! Simulated vault for testing the unseal protocol

use async_trait::async_trait;
use std::sync::Mutex;

use super::{SealApi, SealStatus, UnsealShare};
use crate::AgentError;

#[derive(Debug)]
struct State {
    uninitialized_polls: u32,
    sealed: bool,
    progress: u32,
    submitted: Vec<String>,
}

/// A vault that unseals once `threshold` distinct shares have been submitted
///
/// # Example
/// ```
/// use vm_agent::vault::mock::MockSealApi;
///
/// let vault = MockSealApi::new(3).uninitialized_for(2);
/// ```
#[derive(Debug)]
pub struct MockSealApi {
    threshold: u32,
    rejected: Vec<String>,
    state: Mutex<State>,
}

impl MockSealApi {
    /// A sealed, initialized vault needing `threshold` shares
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            rejected: Vec::new(),
            state: Mutex::new(State {
                uninitialized_polls: 0,
                sealed: true,
                progress: 0,
                submitted: Vec::new(),
            }),
        }
    }

    /// Report `initialized: false` for the first `polls` status queries
    pub fn uninitialized_for(self, polls: u32) -> Self {
        self.lock().uninitialized_polls = polls;
        self
    }

    /// Start out unsealed
    pub fn unsealed(self) -> Self {
        self.lock().sealed = false;
        self
    }

    /// Answer 400 to this share
    pub fn reject(mut self, share: &str) -> Self {
        self.rejected.push(share.to_string());
        self
    }

    /// Shares accepted so far, in submission order
    pub fn submitted(&self) -> Vec<String> {
        self.lock().submitted.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn status(&self, state: &State, initialized: bool) -> SealStatus {
        SealStatus {
            seal_type: "shamir".to_string(),
            initialized,
            sealed: state.sealed,
            t: self.threshold,
            n: self.threshold + 2,
            progress: state.progress,
            ..SealStatus::default()
        }
    }
}

#[async_trait]
impl SealApi for MockSealApi {
    fn endpoint(&self) -> &str {
        "mock://vault"
    }

    async fn seal_status(&self) -> Result<SealStatus, AgentError> {
        let mut state = self.lock();
        if state.uninitialized_polls > 0 {
            state.uninitialized_polls -= 1;
            return Ok(self.status(&state, false));
        }
        Ok(self.status(&state, true))
    }

    async fn submit_unseal_share(&self, share: &UnsealShare) -> Result<SealStatus, AgentError> {
        if self.rejected.iter().any(|r| r == share.expose()) {
            return Err(AgentError::HttpStatus {
                url: "mock://vault/v1/sys/unseal".to_string(),
                status: 400,
                body: r#"{"errors":["invalid key"]}"#.to_string(),
            });
        }
        let mut state = self.lock();
        if !state.submitted.iter().any(|s| s == share.expose()) {
            state.submitted.push(share.expose().to_string());
            state.progress += 1;
        }
        if state.progress >= self.threshold {
            state.sealed = false;
            state.progress = 0;
        }
        Ok(self.status(&state, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_vault_counts_distinct_shares() {
        let vault = MockSealApi::new(2);
        vault.submit_unseal_share(&UnsealShare::new("a")).await.unwrap();
        vault.submit_unseal_share(&UnsealShare::new("a")).await.unwrap();
        assert!(vault.seal_status().await.unwrap().sealed);

        vault.submit_unseal_share(&UnsealShare::new("b")).await.unwrap();
        assert!(!vault.seal_status().await.unwrap().sealed);
    }

    #[tokio::test]
    async fn test_mock_vault_initializes_after_polls() {
        let vault = MockSealApi::new(1).uninitialized_for(1);
        assert!(!vault.seal_status().await.unwrap().initialized);
        assert!(vault.seal_status().await.unwrap().initialized);
    }
}
