//! Kubernetes controller and worker roles
//!
//! Both roles share the node preparation: data volumes for the kubernetes
//! config, kubelet and etcd state, the container runtime, and the cluster CA.
//! Joining or initializing the cluster is left to kubeadm.

use serde::Deserialize;
use std::fmt;
use tracing::{debug, info};

use super::{provision_data_volume, write_file, AgentContext, VolumeOutcome};
use crate::AgentError;

const CONFIG_SLOT: &str = "scsi4";
const CONFIG_FILE: &str = "k8s-config.json";
const PKI_DIR: &str = "/etc/kubernetes/pki";
const CA_CERT: &str = "/etc/kubernetes/pki/ca.crt";
const CA_KEY: &str = "/etc/kubernetes/pki/ca.key";

/// Data disks every kubernetes node mounts, by drive slot
const DATA_VOLUMES: &[(&str, &str)] = &[
    ("scsi1", "/etc/kubernetes"),
    ("scsi2", "/var/lib/kubelet"),
    ("scsi3", "/var/lib/etcd"),
];

const REQUIRED_SERVICES: &[&str] = &["kubelet", "containerd"];

/// Cluster settings from `k8s-config.json`
#[derive(Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct K8sConfig {
    pub control_plane_endpoint: String,
    pub controller_ip_addresses: Vec<String>,
    pub k8s_init_token: String,
    pub k8s_ca_init_private_key: String,
    pub k8s_ca_init_public_cert: String,
    pub pod_network_cidr: String,
    pub service_network_cidr: String,
    pub worker_ip_addresses: Vec<String>,
    pub additional_volumes: Vec<AdditionalVolume>,
}

impl fmt::Debug for K8sConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("K8sConfig")
            .field("control_plane_endpoint", &self.control_plane_endpoint)
            .field("controller_ip_addresses", &self.controller_ip_addresses)
            .field("k8s_init_token", &"<redacted>")
            .field("k8s_ca_init_private_key", &"<redacted>")
            .field("pod_network_cidr", &self.pod_network_cidr)
            .field("service_network_cidr", &self.service_network_cidr)
            .field("worker_ip_addresses", &self.worker_ip_addresses)
            .field("additional_volumes", &self.additional_volumes)
            .finish_non_exhaustive()
    }
}

/// Extra data disk mounted on workers
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdditionalVolume {
    /// Drive slot number; the disk sits in `scsi<order>`
    pub order: u32,
    pub storage_location: String,
}

impl AdditionalVolume {
    pub fn slot(&self) -> String {
        format!("scsi{}", self.order)
    }
}

pub async fn setup_controller(ctx: &AgentContext) -> Result<(), AgentError> {
    info!("Setting up as kubernetes controller");
    let config = prepare_node(ctx).await?;
    debug!(
        "Control plane endpoint {}, {} controller(s)",
        config.control_plane_endpoint,
        config.controller_ip_addresses.len()
    );
    Ok(())
}

pub async fn setup_worker(ctx: &AgentContext) -> Result<(), AgentError> {
    info!("Setting up as kubernetes worker");
    let config = prepare_node(ctx).await?;
    for volume in &config.additional_volumes {
        if volume.storage_location.trim().is_empty() {
            debug!("Additional volume {} has no storage location, skipping", volume.slot());
            continue;
        }
        provision_data_volume(ctx, &volume.slot(), &volume.storage_location).await?;
    }
    Ok(())
}

/// Steps shared by controllers and workers
async fn prepare_node(ctx: &AgentContext) -> Result<K8sConfig, AgentError> {
    for (slot, mount_point) in DATA_VOLUMES {
        if provision_data_volume(ctx, slot, mount_point).await? == VolumeOutcome::SkippedBusy {
            debug!("{} already mounted on {}", slot, mount_point);
        }
    }
    for service in REQUIRED_SERVICES {
        ctx.services.start_and_wait(service).await?;
    }

    let config = load_config(ctx)?;
    install_ca(ctx, &config)?;
    Ok(config)
}

/// Read `k8s-config.json` from the config volume
pub fn load_config(ctx: &AgentContext) -> Result<K8sConfig, AgentError> {
    let volume = ctx.config_volume(CONFIG_SLOT)?;
    let data = ctx.gateway.read_file_contents(&volume, CONFIG_FILE)?;
    let config: K8sConfig = serde_json::from_slice(&data)?;
    debug!("Loaded {:?}", config);
    Ok(config)
}

/// Write the cluster CA unless a certificate is already in place
///
/// Returns whether anything was written.
pub fn install_ca(ctx: &AgentContext, config: &K8sConfig) -> Result<bool, AgentError> {
    match ctx.root().stat(CA_CERT) {
        Ok(_) => {
            info!("Kubernetes certs already exist, skipping");
            return Ok(false);
        }
        Err(AgentError::NotFound(_)) => {}
        Err(e) => return Err(e),
    }

    ctx.gateway
        .create_root_directory(ctx.root(), PKI_DIR, 0o751, true)?;
    write_file(ctx.root(), CA_CERT, config.k8s_ca_init_public_cert.as_bytes(), 0o644)?;
    write_file(ctx.root(), CA_KEY, config.k8s_ca_init_private_key.as_bytes(), 0o600)?;
    info!("Installed cluster CA in {}", PKI_DIR);
    Ok(true)
}
