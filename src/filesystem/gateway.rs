//! Filesystem gateway
//!
//! Hands out volume filesystems for devices and partitions, formats and
//! mounts data partitions, and prepares directories on the live root.

use std::path::Path;
use std::sync::Arc;

use fscommon::StreamSlice;
use tracing::{debug, info};

use super::volume::VolumeFilesystem;
use super::{components, join, normalize, read_to_end, Filesystem};
use crate::disk::BlockDevice;
use crate::exec::CommandRunner;
use crate::AgentError;

const EXISTING_FS_MARKER: &str = "appears to contain an existing filesystem";

pub struct FilesystemGateway {
    runner: Arc<dyn CommandRunner>,
}

impl FilesystemGateway {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Open the FAT filesystem spanning a whole device (no partition table)
    ///
    /// The root directory is listed before the handle is returned.
    pub fn get_filesystem_from_device(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<VolumeFilesystem, AgentError> {
        let fs = VolumeFilesystem::open(path)?;
        let entries = fs.read_dir("/")?;
        debug!("{}: {} root entries", fs.label(), entries.len());
        Ok(fs)
    }

    /// Open the FAT filesystem in partition `index` of an open device
    ///
    /// Index 0 is the whole disk. Any other index addresses a partition of the
    /// last table read through the device.
    pub fn get_filesystem_from_disk(
        &self,
        device: &BlockDevice,
        index: usize,
    ) -> Result<VolumeFilesystem, AgentError> {
        let label = device.path().display().to_string();
        let file = device
            .file()
            .try_clone()
            .map_err(|e| AgentError::io(&label, e))?;

        let fs = if index == 0 {
            VolumeFilesystem::from_storage(label, Box::new(file))?
        } else {
            let table = device
                .table()
                .ok_or_else(|| AgentError::NoPartitionTable(label.clone()))?;
            let partition = table
                .partition(index)
                .ok_or_else(|| AgentError::NotFound(format!("partition {index} on {label}")))?;
            let start = partition.start * table.sector_size;
            let end = start + partition.sectors * table.sector_size;
            let slice = StreamSlice::new(file, start, end)
                .map_err(|e| AgentError::io(&partition.node, e))?;
            VolumeFilesystem::from_storage(partition.node.clone(), Box::new(slice))?
        };

        fs.read_dir("/")?;
        Ok(fs)
    }

    /// Format `partition` as XFS
    ///
    /// A partition that already holds a filesystem is left as it is.
    pub async fn create_xfs_filesystem(&self, partition: &Path) -> Result<(), AgentError> {
        match self.format_xfs(partition).await {
            Err(AgentError::FilesystemExists(path)) => {
                info!("{} already contains a filesystem, keeping it", path);
                Ok(())
            }
            other => other,
        }
    }

    async fn format_xfs(&self, partition: &Path) -> Result<(), AgentError> {
        let path = partition.display().to_string();
        let args = [path.as_str()];
        info!("Creating XFS filesystem on {}", path);
        let output = self.runner.run("mkfs.xfs", &args).await?;
        if !output.success() && output.combined().contains(EXISTING_FS_MARKER) {
            return Err(AgentError::FilesystemExists(path));
        }
        output.check("mkfs.xfs", &args)?;
        Ok(())
    }

    pub async fn mount(&self, device: &Path, mount_point: &Path) -> Result<(), AgentError> {
        let device = device.display().to_string();
        let mount_point = mount_point.display().to_string();
        let args = [device.as_str(), mount_point.as_str()];
        info!("Mounting {} on {}", device, mount_point);
        self.runner.run("mount", &args).await?.check("mount", &args)?;
        Ok(())
    }

    /// Create the directory `path` on `fs`
    ///
    /// Existing components are left untouched. Missing intermediate
    /// components are created with mode 0755 when `recursive` is set and are
    /// an error otherwise. A newly created final component gets `mode`.
    pub fn create_root_directory(
        &self,
        fs: &dyn Filesystem,
        path: &str,
        mode: u32,
        recursive: bool,
    ) -> Result<(), AgentError> {
        let path = normalize(path);
        let parts: Vec<&str> = components(&path).collect();
        let mut current = String::from("/");

        for (i, part) in parts.iter().enumerate() {
            current = join(&current, part);
            let last = i + 1 == parts.len();
            match fs.stat(&current) {
                Ok(meta) if meta.is_dir() => {
                    debug!("Directory {} already exists, skipping", current);
                }
                Ok(_) => return Err(AgentError::NotADirectory(current)),
                Err(AgentError::NotFound(_)) if last => {
                    info!("Creating directory {} ({:o})", current, mode);
                    fs.create_dir(&current, mode)?;
                }
                Err(AgentError::NotFound(_)) if recursive => {
                    debug!("Creating directory {}", current);
                    fs.create_dir(&current, 0o755)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Read a whole (small) file
    pub fn read_file_contents(
        &self,
        fs: &dyn Filesystem,
        path: &str,
    ) -> Result<Vec<u8>, AgentError> {
        read_to_end(fs, path)
    }
}
