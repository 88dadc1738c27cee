//! HTTP client for the vault seal endpoints

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use super::{SealApi, SealStatus, UnsealShare};
use crate::AgentError;

const SEAL_STATUS_PATH: &str = "/v1/sys/seal-status";
const UNSEAL_PATH: &str = "/v1/sys/unseal";

#[derive(Serialize)]
struct UnsealRequest<'a> {
    key: &'a str,
}

/// Talks to one vault over HTTPS
///
/// Certificate verification is off: the vault is reached by its internal
/// address before any CA material exists on this node.
pub struct VaultClient {
    client: Client,
    base_url: String,
}

impl VaultClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AgentError> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Use an existing HTTP client (useful for testing)
    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn parse(&self, url: &str, response: Response) -> Result<SealStatus, AgentError> {
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl SealApi for VaultClient {
    fn endpoint(&self) -> &str {
        &self.base_url
    }

    async fn seal_status(&self) -> Result<SealStatus, AgentError> {
        let url = format!("{}{}", self.base_url, SEAL_STATUS_PATH);
        debug!("GET {}", url);
        let response = self.client.get(&url).send().await?;
        self.parse(&url, response).await
    }

    async fn submit_unseal_share(&self, share: &UnsealShare) -> Result<SealStatus, AgentError> {
        let url = format!("{}{}", self.base_url, UNSEAL_PATH);
        debug!("PUT {}", url);
        let response = self
            .client
            .put(&url)
            .json(&UnsealRequest {
                key: share.expose(),
            })
            .send()
            .await?;
        self.parse(&url, response).await
    }
}
