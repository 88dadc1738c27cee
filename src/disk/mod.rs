//! Disk and partition management
//!
//! Block devices are opened exclusively, so a disk that is mounted or held by
//! another process fails fast with [`AgentError::DeviceBusy`]. Partition
//! tables are read with `sfdisk --json` and written with `parted`.

pub mod mock;

use serde::Deserialize;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::exec::CommandRunner;
use crate::poll::pause;
use crate::AgentError;

/// Default stable alias prefix for virtio-scsi disks attached to the VM
pub const DEFAULT_DEVICE_PREFIX: &str = "/dev/disk/by-id/scsi-0QEMU_QEMU_HARDDISK_drive-";

/// First sector of the data partition
pub const PARTITION_START_SECTOR: u64 = 2048;

const NO_TABLE_MARKER: &str = "does not contain a recognized partition table";

/// Device path for a drive slot such as `scsi1`
pub fn drive_path(prefix: &str, slot: &str) -> PathBuf {
    PathBuf::from(format!("{prefix}{slot}"))
}

/// Device path of the `n`-th partition of `device`
pub fn partition_path(device: &Path, n: usize) -> PathBuf {
    PathBuf::from(format!("{}-part{n}", device.display()))
}

/// One partition of a table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// 1-based position in the table
    pub index: usize,
    /// Kernel device node, e.g. `/dev/sdb1`
    pub node: String,
    /// First sector
    pub start: u64,
    /// Length in sectors
    pub sectors: u64,
    pub type_id: String,
    pub uuid: Option<String>,
}

/// Partition table as reported by `sfdisk --json`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    /// `gpt` or `dos`
    pub label: String,
    pub sector_size: u64,
    pub partitions: Vec<Partition>,
}

impl PartitionTable {
    /// Parse the output of `sfdisk --json`
    pub fn from_sfdisk_json(json: &str) -> Result<Self, AgentError> {
        let dump: SfdiskDump = serde_json::from_str(json)?;
        let table = dump.partitiontable;
        Ok(Self {
            label: table.label,
            sector_size: table.sectorsize,
            partitions: table
                .partitions
                .into_iter()
                .enumerate()
                .map(|(i, p)| Partition {
                    index: i + 1,
                    node: p.node,
                    start: p.start,
                    sectors: p.size,
                    type_id: p.partition_type,
                    uuid: p.uuid,
                })
                .collect(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Partition by 1-based index
    pub fn partition(&self, index: usize) -> Option<&Partition> {
        index
            .checked_sub(1)
            .and_then(|i| self.partitions.get(i))
    }
}

#[derive(Deserialize)]
struct SfdiskDump {
    partitiontable: SfdiskTable,
}

#[derive(Deserialize)]
struct SfdiskTable {
    label: String,
    #[serde(default = "default_sector_size")]
    sectorsize: u64,
    #[serde(default)]
    partitions: Vec<SfdiskPartition>,
}

#[derive(Deserialize)]
struct SfdiskPartition {
    node: String,
    start: u64,
    size: u64,
    #[serde(rename = "type", default)]
    partition_type: String,
    #[serde(default)]
    uuid: Option<String>,
}

fn default_sector_size() -> u64 {
    512
}

/// An exclusively opened block device
///
/// Holds the last partition table read through it. Dropping or
/// [closing](BlockDevice::close) the device releases the exclusive claim.
#[derive(Debug)]
pub struct BlockDevice {
    path: PathBuf,
    file: File,
    table: Option<PartitionTable>,
}

impl BlockDevice {
    /// Open `path` read-only with `O_EXCL`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(OFlag::O_EXCL.bits())
            .open(path)
            .map_err(|e| {
                if e.raw_os_error() == Some(Errno::EBUSY as i32) {
                    AgentError::DeviceBusy(path.display().to_string())
                } else {
                    AgentError::io(path.display().to_string(), e)
                }
            })?;
        debug!("Opened {} exclusively", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            file,
            table: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last partition table read through this device
    pub fn table(&self) -> Option<&PartitionTable> {
        self.table.as_ref()
    }

    pub(crate) fn file(&self) -> &File {
        &self.file
    }

    /// Release the device
    pub fn close(self) {
        debug!("Closing {}", self.path.display());
    }
}

/// How block devices get claimed
pub trait DeviceOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<BlockDevice, AgentError>;
}

/// Claims devices through the kernel with `O_EXCL`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDevices;

impl DeviceOpener for SystemDevices {
    fn open(&self, path: &Path) -> Result<BlockDevice, AgentError> {
        BlockDevice::open(path)
    }
}

/// Reads and writes partition tables
pub struct DiskManager {
    runner: Arc<dyn CommandRunner>,
    opener: Arc<dyn DeviceOpener>,
    settle_delay: Duration,
    cancel: CancellationToken,
}

impl DiskManager {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        settle_delay: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner,
            opener: Arc::new(SystemDevices),
            settle_delay,
            cancel,
        }
    }

    /// Claim devices through `opener` instead of the kernel
    pub fn with_opener(mut self, opener: Arc<dyn DeviceOpener>) -> Self {
        self.opener = opener;
        self
    }

    pub fn open_disk(&self, path: impl AsRef<Path>) -> Result<BlockDevice, AgentError> {
        self.opener.open(path.as_ref())
    }

    /// Read the partition table of `device` and remember it on the device
    pub async fn partition_table(
        &self,
        device: &mut BlockDevice,
    ) -> Result<PartitionTable, AgentError> {
        let path = device.path.display().to_string();
        let args = ["--json", path.as_str()];
        let output = self.runner.run("sfdisk", &args).await?;

        if !output.success() && output.combined().contains(NO_TABLE_MARKER) {
            device.table = None;
            return Err(AgentError::NoPartitionTable(path));
        }
        let output = output.check("sfdisk", &args)?;

        let table = PartitionTable::from_sfdisk_json(&output.stdout)?;
        debug!(
            "{}: {} table with {} partition(s)",
            path,
            table.label,
            table.partitions.len()
        );
        device.table = Some(table.clone());
        Ok(table)
    }

    /// Write a fresh GPT label holding one partition that spans the disk
    ///
    /// Destroys whatever the disk held before.
    pub async fn create_partition(&self, path: &Path) -> Result<(), AgentError> {
        let path = path.display().to_string();
        let start = format!("{PARTITION_START_SECTOR}s");
        let args = [
            "--script",
            path.as_str(),
            "mklabel",
            "gpt",
            "mkpart",
            "primary",
            start.as_str(),
            "100%",
        ];
        info!("Creating partition on {}", path);
        self.runner.run("parted", &args).await?.check("parted", &args)?;

        let args = [path.as_str()];
        self.runner
            .run("partprobe", &args)
            .await?
            .check("partprobe", &args)?;
        Ok(())
    }

    /// Make sure `device` carries at least one partition
    ///
    /// A disk without a recognized table, or with an empty one, gets a single
    /// data partition. The device is closed before returning.
    pub async fn ensure_data_partition(
        &self,
        mut device: BlockDevice,
    ) -> Result<PartitionTable, AgentError> {
        let path = device.path.clone();
        match self.partition_table(&mut device).await {
            Ok(table) if !table.is_empty() => {
                info!(
                    "{} already has {} partition(s), skipping creation",
                    path.display(),
                    table.partitions.len()
                );
                device.close();
                return Ok(table);
            }
            Ok(_) => info!("{} has an empty partition table", path.display()),
            Err(AgentError::NoPartitionTable(_)) => {
                info!("{} has no partition table", path.display())
            }
            Err(e) => return Err(e),
        }

        self.create_partition(&path).await?;
        pause(
            self.settle_delay,
            &self.cancel,
            "waiting for the partition table re-read",
        )
        .await?;

        match self.partition_table(&mut device).await {
            Ok(table) if !table.is_empty() => {
                info!("Created partition {} on {}", table.partitions[0].node, path.display());
                device.close();
                Ok(table)
            }
            Ok(_) | Err(AgentError::NoPartitionTable(_)) => {
                Err(AgentError::PartitionsMissing(path.display().to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::mock::MockCommandRunner;
    use crate::exec::CommandOutput;
    use tempfile::NamedTempFile;

    const ONE_PARTITION: &str = r#"{
        "partitiontable": {
            "label": "gpt",
            "id": "5D3E3B4A-5B8B-4A43-9E0E-2B0C5C1E8F11",
            "device": "/dev/sdb",
            "unit": "sectors",
            "firstlba": 34,
            "lastlba": 20971486,
            "sectorsize": 512,
            "partitions": [
                {
                    "node": "/dev/sdb1",
                    "start": 2048,
                    "size": 20969439,
                    "type": "0FC63DAF-8483-4772-8E79-3D69D8477DE4",
                    "uuid": "8C3B3E0A-4A5D-4E0B-9F53-0E2C7C5D9A10",
                    "name": "primary"
                }
            ]
        }
    }"#;

    const EMPTY_TABLE: &str = r#"{
        "partitiontable": {
            "label": "dos",
            "id": "0x1a2b3c4d",
            "device": "/dev/sdb",
            "unit": "sectors"
        }
    }"#;

    const NO_TABLE: &str = "sfdisk: /dev/sdb: does not contain a recognized partition table";

    fn manager(runner: Arc<MockCommandRunner>) -> DiskManager {
        DiskManager::new(runner, Duration::ZERO, CancellationToken::new())
    }

    fn device() -> (NamedTempFile, BlockDevice) {
        let file = NamedTempFile::new().unwrap();
        let device = BlockDevice::open(file.path()).unwrap();
        (file, device)
    }

    #[test]
    fn test_drive_and_partition_paths() {
        let drive = drive_path(DEFAULT_DEVICE_PREFIX, "scsi1");
        assert_eq!(
            drive,
            PathBuf::from("/dev/disk/by-id/scsi-0QEMU_QEMU_HARDDISK_drive-scsi1")
        );
        assert_eq!(
            partition_path(&drive, 1),
            PathBuf::from("/dev/disk/by-id/scsi-0QEMU_QEMU_HARDDISK_drive-scsi1-part1")
        );
    }

    #[test]
    fn test_parse_sfdisk_json() {
        let table = PartitionTable::from_sfdisk_json(ONE_PARTITION).unwrap();
        assert_eq!(table.label, "gpt");
        assert_eq!(table.sector_size, 512);
        let first = table.partition(1).unwrap();
        assert_eq!(first.node, "/dev/sdb1");
        assert_eq!(first.start, 2048);
        assert_eq!(first.index, 1);
        assert!(table.partition(0).is_none());
        assert!(table.partition(2).is_none());
    }

    #[test]
    fn test_parse_table_without_partitions() {
        let table = PartitionTable::from_sfdisk_json(EMPTY_TABLE).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.sector_size, 512);
    }

    #[test]
    fn test_open_missing_device() {
        let result = BlockDevice::open("/nonexistent/vm-agent-disk");
        assert!(matches!(result, Err(AgentError::IoAt { .. })));
    }

    #[test]
    fn test_busy_device_from_opener() {
        let file = NamedTempFile::new().unwrap();
        let runner = Arc::new(MockCommandRunner::new());
        let disks = manager(runner)
            .with_opener(Arc::new(mock::MockDevices::new().busy(file.path())));

        let result = disks.open_disk(file.path());
        assert!(matches!(result, Err(AgentError::DeviceBusy(_))));
    }

    #[tokio::test]
    async fn test_unrecognized_table_is_typed() {
        let runner = Arc::new(MockCommandRunner::new().on("sfdisk", CommandOutput::failed(1, NO_TABLE)));
        let (_file, mut device) = device();

        let result = manager(runner).partition_table(&mut device).await;
        assert!(matches!(result, Err(AgentError::NoPartitionTable(_))));
        assert!(device.table().is_none());
    }

    #[tokio::test]
    async fn test_table_is_remembered_on_device() {
        let runner = Arc::new(MockCommandRunner::new().on("sfdisk", CommandOutput::ok(ONE_PARTITION)));
        let (_file, mut device) = device();

        manager(runner).partition_table(&mut device).await.unwrap();
        assert_eq!(device.table().unwrap().partitions.len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_keeps_existing_partition() {
        let runner = Arc::new(MockCommandRunner::new().on("sfdisk", CommandOutput::ok(ONE_PARTITION)));
        let (_file, device) = device();

        let table = manager(runner.clone())
            .ensure_data_partition(device)
            .await
            .unwrap();
        assert_eq!(table.partitions.len(), 1);
        assert!(runner.calls_to("parted").is_empty());
    }

    #[tokio::test]
    async fn test_ensure_partitions_blank_disk() {
        let runner = Arc::new(
            MockCommandRunner::new()
                .on("sfdisk", CommandOutput::failed(1, NO_TABLE))
                .on("sfdisk", CommandOutput::ok(ONE_PARTITION)),
        );
        let (file, device) = device();
        let path = file.path().display().to_string();

        let table = manager(runner.clone())
            .ensure_data_partition(device)
            .await
            .unwrap();

        assert_eq!(table.partitions.len(), 1);
        assert_eq!(
            runner.calls_to("parted"),
            vec![format!("parted --script {path} mklabel gpt mkpart primary 2048s 100%")]
        );
        assert_eq!(runner.calls_to("partprobe"), vec![format!("partprobe {path}")]);
        assert_eq!(runner.calls_to("sfdisk").len(), 2);
    }

    #[tokio::test]
    async fn test_ensure_partitions_empty_table() {
        let runner = Arc::new(
            MockCommandRunner::new()
                .on("sfdisk", CommandOutput::ok(EMPTY_TABLE))
                .on("sfdisk", CommandOutput::ok(ONE_PARTITION)),
        );
        let (_file, device) = device();

        let table = manager(runner.clone())
            .ensure_data_partition(device)
            .await
            .unwrap();
        assert_eq!(table.partitions[0].start, PARTITION_START_SECTOR);
        assert_eq!(runner.calls_to("parted").len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_fails_when_partition_never_appears() {
        let runner = Arc::new(MockCommandRunner::new().on("sfdisk", CommandOutput::ok(EMPTY_TABLE)));
        let (_file, device) = device();

        let result = manager(runner).ensure_data_partition(device).await;
        assert!(matches!(result, Err(AgentError::PartitionsMissing(_))));
    }

    #[tokio::test]
    async fn test_ensure_fails_when_table_stays_unrecognized() {
        let runner = Arc::new(MockCommandRunner::new().on("sfdisk", CommandOutput::failed(1, NO_TABLE)));
        let (_file, device) = device();

        let result = manager(runner).ensure_data_partition(device).await;
        assert!(matches!(result, Err(AgentError::PartitionsMissing(_))));
    }

    #[tokio::test]
    async fn test_ensure_propagates_other_read_errors() {
        let runner = Arc::new(
            MockCommandRunner::new().on("sfdisk", CommandOutput::failed(1, "sfdisk: cannot open /dev/sdb: Permission denied")),
        );
        let (_file, device) = device();

        let result = manager(runner.clone()).ensure_data_partition(device).await;
        assert!(matches!(result, Err(AgentError::CommandFailed { .. })));
        assert!(runner.calls_to("parted").is_empty());
    }

    #[tokio::test]
    async fn test_ensure_propagates_parted_failure() {
        let runner = Arc::new(
            MockCommandRunner::new()
                .on("sfdisk", CommandOutput::failed(1, NO_TABLE))
                .on("parted", CommandOutput::failed(1, "Error: Partition(s) on /dev/sdb are being used.")),
        );
        let (_file, device) = device();

        let result = manager(runner.clone()).ensure_data_partition(device).await;
        assert!(matches!(result, Err(AgentError::CommandFailed { .. })));
        assert!(runner.calls_to("partprobe").is_empty());
    }
}
