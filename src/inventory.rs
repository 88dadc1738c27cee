//! Inventory service client
//!
//! The inventory service knows every VM by hostname and serves its record
//! and role tags as JSON.

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::AgentError;

/// Inventory record of one VM
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmDetails {
    pub vm_id: String,
    pub name: String,
    pub description: String,
    pub node_name: String,
    pub nameserver: String,
    pub default_user: String,
    pub tags: Vec<String>,
    pub ssh_keys: Vec<String>,
    pub cores: f64,
    pub memory: f64,
    pub sockets: f64,
    pub os_type: String,
    pub power_state: String,
    pub start_on_boot: bool,
    pub ip_config: Vec<IpConfig>,
    pub disk: Vec<DiskSpec>,
    pub network_interface: Vec<NetworkInterface>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpConfig {
    pub ip_address: String,
    pub gateway: String,
    pub order: u32,
}

/// A disk attached to the VM; `order` is its drive slot number
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskSpec {
    pub id: i64,
    pub order: u32,
    pub size: String,
    pub storage_location: String,
    pub bus_type: String,
    pub cache: String,
    pub import_from: String,
    pub read_only: bool,
    pub ssd_emulation: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkInterface {
    pub bridge: String,
    pub mac_address: String,
    pub mtu: u32,
    pub order: u32,
    #[serde(rename = "type")]
    pub interface_type: String,
}

/// Client for `{base}/state/vm/{hostname}`
pub struct InventoryClient {
    client: Client,
    base_url: String,
    hostname: String,
}

impl InventoryClient {
    pub fn new(base_url: &str, hostname: &str, timeout: Duration) -> Result<Self, AgentError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url, hostname))
    }

    /// Use an existing HTTP client (useful for testing)
    pub fn with_client(client: Client, base_url: &str, hostname: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            hostname: hostname.to_string(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Full record of this VM
    pub async fn vm_details(&self) -> Result<VmDetails, AgentError> {
        self.get_json(&format!("{}/state/vm/{}", self.base_url, self.hostname))
            .await
    }

    /// Role tags of this VM
    pub async fn tags(&self) -> Result<Vec<String>, AgentError> {
        self.get_json(&format!("{}/state/vm/{}/tags", self.base_url, self.hostname))
            .await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, AgentError> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

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
