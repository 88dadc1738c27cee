//! Agent config loader
//!
//! Reads the config file and applies environment overrides.

use super::AgentConfig;
use crate::AgentError;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Where the config lives unless `--config` says otherwise
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vm-agent/agent.yaml";

/// Environment variable overriding `inventory_url`
pub const INVENTORY_URL_ENV: &str = "INFRA_CONFIG_MAPPER_URL";

/// Load the config from `path`, or from the default location
///
/// A missing default file yields the defaults. A missing file that was asked
/// for explicitly is an error.
pub async fn load_config(path: Option<&Path>) -> Result<AgentConfig, AgentError> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = path {
        loader = loader.with_path(path);
    }
    loader.load().await
}

/// Config loader with builder pattern
pub struct ConfigLoader {
    path: PathBuf,
    explicit: bool,
    env: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_CONFIG_PATH),
            explicit: false,
            env: true,
        }
    }

    /// Read this file instead of the default one
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self.explicit = true;
        self
    }

    /// Ignore environment overrides (useful for testing)
    pub fn skip_env(mut self) -> Self {
        self.env = false;
        self
    }

    pub async fn load(self) -> Result<AgentConfig, AgentError> {
        let mut config = match fs::read_to_string(&self.path).await {
            Ok(content) => {
                debug!("Loaded config from {}", self.path.display());
                AgentConfig::from_yaml(&content).map_err(|e| {
                    AgentError::Config(format!("{}: {}", self.path.display(), e))
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !self.explicit => {
                debug!("No config at {}, using defaults", self.path.display());
                AgentConfig::default()
            }
            Err(e) => return Err(AgentError::io(self.path.display().to_string(), e)),
        };

        if self.env {
            apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        }
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_env_overrides(config: &mut AgentConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(url) = lookup(INVENTORY_URL_ENV).filter(|v| !v.trim().is_empty()) {
        info!("Using inventory URL from {}", INVENTORY_URL_ENV);
        config.inventory_url = Some(url.trim().to_string());
    }
}
