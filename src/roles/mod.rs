//! Role dispatch
//!
//! A VM's inventory tags name the role it plays. Each role is a fixed
//! sequence of volume, copy, ownership and service steps run against one
//! [`AgentContext`].

pub mod dns;
pub mod k8s;
pub mod loadbalancer;
pub mod vault;

use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::copy::{copy_mapping, CopyMapping};
use crate::disk::{drive_path, partition_path, DeviceOpener, DiskManager};
use crate::exec::{CommandRunner, SystemCommandRunner};
use crate::filesystem::gateway::FilesystemGateway;
use crate::filesystem::root::RootFilesystem;
use crate::filesystem::volume::VolumeFilesystem;
use crate::filesystem::{components, Filesystem};
use crate::inventory::VmDetails;
use crate::ownership::{set_permissions_recursive, SystemUsers, UserDirectory};
use crate::service::ServiceOrchestrator;
use crate::AgentError;

/// Infrastructure roles a VM can be provisioned as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Dns,
    LoadBalancer,
    Vault,
    KubernetesController,
    KubernetesWorker,
}

impl Role {
    /// Role named by an inventory tag
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim() {
            "dns" => Some(Self::Dns),
            "loadbalancer" => Some(Self::LoadBalancer),
            "vault" => Some(Self::Vault),
            "k8s-controller" => Some(Self::KubernetesController),
            "k8s-worker" => Some(Self::KubernetesWorker),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Dns => "dns",
            Self::LoadBalancer => "loadbalancer",
            Self::Vault => "vault",
            Self::KubernetesController => "k8s-controller",
            Self::KubernetesWorker => "k8s-worker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// First tag naming a known role
pub fn select_role(tags: &[String]) -> Option<Role> {
    for tag in tags {
        match Role::from_tag(tag) {
            Some(role) => return Some(role),
            None => debug!("Tag {} is not a role, skipping", tag),
        }
    }
    None
}

/// Everything a role routine needs
pub struct AgentContext {
    pub config: AgentConfig,
    pub disks: DiskManager,
    pub gateway: FilesystemGateway,
    pub services: ServiceOrchestrator,
    pub users: Arc<dyn UserDirectory>,
    /// The tree being provisioned
    pub root: Arc<dyn Filesystem + Send + Sync>,
    pub cancel: CancellationToken,
}

impl AgentContext {
    pub fn new(
        config: AgentConfig,
        runner: Arc<dyn CommandRunner>,
        users: Arc<dyn UserDirectory>,
        root: Arc<dyn Filesystem + Send + Sync>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            disks: DiskManager::new(Arc::clone(&runner), config.settle_delay(), cancel.clone()),
            gateway: FilesystemGateway::new(Arc::clone(&runner)),
            services: ServiceOrchestrator::new(runner, config.service_poll, cancel.clone()),
            users,
            root,
            cancel,
            config,
        }
    }

    /// Context acting on the host: real tools, real users, the configured root
    pub fn system(config: AgentConfig, cancel: CancellationToken) -> Self {
        let root = Arc::new(RootFilesystem::with_base(&config.root_dir));
        Self::new(
            config,
            Arc::new(SystemCommandRunner::new(cancel.clone())),
            Arc::new(SystemUsers),
            root,
            cancel,
        )
    }

    /// Claim data disks through `opener`
    pub fn with_device_opener(mut self, opener: Arc<dyn DeviceOpener>) -> Self {
        self.disks = self.disks.with_opener(opener);
        self
    }

    pub fn root(&self) -> &dyn Filesystem {
        self.root.as_ref()
    }

    /// Host path of a path on the provisioned tree
    pub fn host_path(&self, path: &str) -> PathBuf {
        components(path).fold(self.config.root_dir.clone(), |acc, c| acc.join(c))
    }

    /// Device path of a drive slot such as `scsi1`
    pub fn drive(&self, slot: &str) -> PathBuf {
        drive_path(&self.config.device_prefix, slot)
    }

    /// Open the FAT config volume in drive `slot`
    pub fn config_volume(&self, slot: &str) -> Result<VolumeFilesystem, AgentError> {
        let path = self.drive(slot);
        debug!("Opening config volume {}", path.display());
        self.gateway.get_filesystem_from_device(&path)
    }
}

/// Provision `role` on this node
pub async fn run_role(ctx: &AgentContext, role: Role, vm: &VmDetails) -> Result<(), AgentError> {
    info!("Provisioning {} as {}", vm.name, role);
    match role {
        Role::Dns => dns::setup(ctx).await,
        Role::LoadBalancer => loadbalancer::setup(ctx).await,
        Role::Vault => vault::setup(ctx).await,
        Role::KubernetesController => k8s::setup_controller(ctx).await,
        Role::KubernetesWorker => k8s::setup_worker(ctx).await,
    }?;
    info!("{} provisioned as {}", vm.name, role);
    Ok(())
}

/// What happened to a data volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeOutcome {
    Provisioned,
    /// The disk was claimed already, so an earlier run mounted it
    SkippedBusy,
}

/// Partition, format and mount the data disk in `slot` on `mount_point`
pub async fn provision_data_volume(
    ctx: &AgentContext,
    slot: &str,
    mount_point: &str,
) -> Result<VolumeOutcome, AgentError> {
    let device_path = ctx.drive(slot);
    let device = match ctx.disks.open_disk(&device_path) {
        Ok(device) => device,
        Err(e) if e.is_device_busy() => {
            info!("Disk {} is busy, skipping", device_path.display());
            return Ok(VolumeOutcome::SkippedBusy);
        }
        Err(e) => return Err(e),
    };

    ctx.disks.ensure_data_partition(device).await?;
    ctx.gateway
        .create_root_directory(ctx.root(), mount_point, 0o755, true)?;

    let partition = partition_path(&device_path, 1);
    ctx.gateway.create_xfs_filesystem(&partition).await?;
    ctx.gateway
        .mount(&partition, &ctx.host_path(mount_point))
        .await?;
    Ok(VolumeOutcome::Provisioned)
}

/// A copy from a config volume plus the modes the result should end up with
#[derive(Debug, Clone, Copy)]
pub struct FileMapping {
    pub source: &'static str,
    pub dest: &'static str,
    /// Mode of the destination node itself
    pub mode: u32,
    /// Mode of every node beneath a destination directory
    pub entry_mode: Option<u32>,
}

impl FileMapping {
    pub const fn file(source: &'static str, dest: &'static str, mode: u32) -> Self {
        Self {
            source,
            dest,
            mode,
            entry_mode: None,
        }
    }

    pub const fn dir(source: &'static str, dest: &'static str, mode: u32, entry_mode: u32) -> Self {
        Self {
            source,
            dest,
            mode,
            entry_mode: Some(entry_mode),
        }
    }
}

/// Copy every mapping from `volume` onto the root and apply its modes
pub fn apply_mappings(
    ctx: &AgentContext,
    volume: &dyn Filesystem,
    mappings: &[FileMapping],
) -> Result<(), AgentError> {
    for mapping in mappings {
        copy_mapping(
            volume,
            ctx.root(),
            &CopyMapping::new(mapping.source, mapping.dest).recursive(),
        )?;
        if let Some(entry_mode) = mapping.entry_mode {
            set_permissions_recursive(ctx.root(), mapping.dest, entry_mode, true)?;
        }
        set_permissions_recursive(ctx.root(), mapping.dest, mapping.mode, false)?;
    }
    Ok(())
}

/// Write `data` to `path` and give it `mode`
pub fn write_file(fs: &dyn Filesystem, path: &str, data: &[u8], mode: u32) -> Result<(), AgentError> {
    {
        let mut writer = fs.create_file(path)?;
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|e| AgentError::io(path, e))?;
    }
    fs.set_mode(path, mode)
}
