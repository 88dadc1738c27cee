//! Load balancer role (HAProxy behind keepalived)

use serde::Deserialize;
use tracing::{debug, info};

use super::{apply_mappings, AgentContext, FileMapping};
use crate::ownership::set_owner_recursive;
use crate::AgentError;

const HAPROXY_SLOT: &str = "scsi1";
const KEEPALIVED_SLOT: &str = "scsi2";
const HAPROXY_USER: &str = "haproxy";
const VM_CONFIG_PATH: &str = "/tmp/vm-config.json";

/// Directories created before anything is copied, with their modes
const HAPROXY_DIRS: &[(&str, u32)] = &[
    ("/etc/haproxy", 0o755),
    ("/etc/haproxy/conf.d", 0o755),
    ("/etc/haproxy/certs", 0o700),
];

const HAPROXY_FILES: &[FileMapping] = &[
    FileMapping::file("haproxy.cfg", "/etc/haproxy/haproxy.cfg", 0o644),
    FileMapping::dir("certs", "/etc/haproxy/certs", 0o700, 0o600),
    FileMapping::dir("conf.d", "/etc/haproxy/conf.d", 0o755, 0o644),
    FileMapping::file("vm-config.json", VM_CONFIG_PATH, 0o400),
];

const KEEPALIVED_FILES: &[FileMapping] = &[FileMapping::file(
    "keepalived.conf",
    "/etc/keepalived/keepalived.conf",
    0o600,
)];

/// Ports the load balancer exposes, from `vm-config.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    #[serde(alias = "Ports")]
    pub ports: Vec<PortConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    #[serde(alias = "Port")]
    pub port: u16,
    #[serde(alias = "Protocol")]
    pub protocol: String,
}

pub async fn setup(ctx: &AgentContext) -> Result<(), AgentError> {
    info!("Setting up as load balancer");
    create_directories(ctx)?;

    let haproxy = ctx.config_volume(HAPROXY_SLOT)?;
    apply_mappings(ctx, &haproxy, HAPROXY_FILES)?;

    let keepalived = ctx.config_volume(KEEPALIVED_SLOT)?;
    apply_mappings(ctx, &keepalived, KEEPALIVED_FILES)?;

    let vm_config = read_vm_config(ctx)?;
    for port in &vm_config.ports {
        debug!("Load balancer exposes {}/{}", port.port, port.protocol);
    }

    ctx.services.start_service("keepalived").await?;
    ctx.services.start_service("haproxy").await?;
    ctx.services.ensure_active("keepalived").await?;
    ctx.services.ensure_active("haproxy").await
}

fn create_directories(ctx: &AgentContext) -> Result<(), AgentError> {
    for (path, mode) in HAPROXY_DIRS {
        ctx.gateway
            .create_root_directory(ctx.root(), path, *mode, true)?;
        set_owner_recursive(ctx.root(), ctx.users.as_ref(), path, HAPROXY_USER, false)?;
    }
    ctx.gateway
        .create_root_directory(ctx.root(), "/etc/keepalived", 0o755, true)
}

/// Parse the VM config copied off the haproxy volume
pub fn read_vm_config(ctx: &AgentContext) -> Result<LoadBalancerConfig, AgentError> {
    let data = ctx.gateway.read_file_contents(ctx.root(), VM_CONFIG_PATH)?;
    Ok(serde_json::from_slice(&data)?)
}
