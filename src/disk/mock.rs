//! Device opener for testing
//!
//! Paths marked busy fail the way a mounted disk does; every other path is
//! opened for real, so plain files stand in for disks.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{BlockDevice, DeviceOpener};
use crate::AgentError;

#[derive(Debug, Default)]
pub struct MockDevices {
    busy: HashSet<PathBuf>,
    opened: Mutex<Vec<PathBuf>>,
}

impl MockDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `path` as held by someone else
    pub fn busy(mut self, path: impl AsRef<Path>) -> Self {
        self.busy.insert(path.as_ref().to_path_buf());
        self
    }

    /// Every path an open was attempted on, in order
    pub fn opened(&self) -> Vec<PathBuf> {
        self.opened.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl DeviceOpener for MockDevices {
    fn open(&self, path: &Path) -> Result<BlockDevice, AgentError> {
        self.opened
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(path.to_path_buf());
        if self.busy.contains(path) {
            return Err(AgentError::DeviceBusy(path.display().to_string()));
        }
        BlockDevice::open(path)
    }
}
