//! Agent configuration
//!
//! Read from `/etc/vm-agent/agent.yaml`. Every field has a default, so an
//! absent file or an empty document is a valid configuration.

mod loader;

pub use loader::{load_config, ConfigLoader, DEFAULT_CONFIG_PATH, INVENTORY_URL_ENV};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::disk::DEFAULT_DEVICE_PREFIX;
use crate::poll::PollPolicy;
use crate::AgentError;

/// Main agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Base URL of the inventory service
    pub inventory_url: Option<String>,

    /// File holding this node's hostname
    pub hostname_file: PathBuf,

    /// Root of the tree being provisioned (`/` outside of tests)
    pub root_dir: PathBuf,

    /// Prefix of the stable device aliases; the drive slot is appended
    pub device_prefix: String,

    /// Seconds to wait for the kernel to re-read a new partition table
    pub settle_delay_secs: u64,

    /// Timeout of a single HTTP request, in seconds
    pub http_timeout_secs: u64,

    /// Polling of `systemctl is-active`
    pub service_poll: PollPolicy,

    /// Polling of the vault seal status until it reports initialized
    pub vault_init_poll: PollPolicy,

    /// Polling of the hostname file
    pub hostname_poll: PollPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            inventory_url: None,
            hostname_file: PathBuf::from("/etc/hostname"),
            root_dir: PathBuf::from("/"),
            device_prefix: DEFAULT_DEVICE_PREFIX.to_string(),
            settle_delay_secs: 5,
            http_timeout_secs: 10,
            service_poll: PollPolicy::default(),
            vault_init_poll: PollPolicy::new(Duration::from_secs(2), 150),
            hostname_poll: PollPolicy::new(Duration::from_secs(1), 120),
        }
    }
}

impl AgentConfig {
    /// Parse a YAML document; an empty document yields the defaults
    pub fn from_yaml(content: &str) -> Result<Self, AgentError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// The inventory URL, which `run` cannot do without
    pub fn require_inventory_url(&self) -> Result<&str, AgentError> {
        self.inventory_url.as_deref().ok_or_else(|| {
            AgentError::Config(format!(
                "no inventory URL configured (set inventory_url or {INVENTORY_URL_ENV})"
            ))
        })
    }
}
