//! FAT volumes read straight from a disk or image

use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::Path;

use fatfs::{Dir, FileSystem, FsOptions};

use super::{components, normalize, FileEntry, FileKind, FileMetadata, Filesystem};
use crate::AgentError;

/// Byte source a volume can be read from
///
/// `fatfs` wants read, write and seek even for read-only use. Whole devices,
/// partition windows and in-memory images all qualify.
pub trait VolumeStorage: Read + Write + Seek {}

impl<T: Read + Write + Seek> VolumeStorage for T {}

/// A FAT filesystem read without mounting
///
/// Only ever used as a copy source; mutating operations return
/// [`AgentError::ReadOnly`].
pub struct VolumeFilesystem {
    label: String,
    fs: FileSystem<Box<dyn VolumeStorage>>,
}

impl std::fmt::Debug for VolumeFilesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeFilesystem")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl VolumeFilesystem {
    /// Open the FAT filesystem spanning the whole file or device at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref();
        let label = path.display().to_string();
        let file = File::open(path).map_err(|e| AgentError::io(&label, e))?;
        Self::from_storage(label, Box::new(file))
    }

    /// Open the FAT filesystem held by `storage`
    pub fn from_storage(
        label: impl Into<String>,
        storage: Box<dyn VolumeStorage>,
    ) -> Result<Self, AgentError> {
        let label = label.into();
        let fs = FileSystem::new(storage, FsOptions::new())
            .map_err(|e| AgentError::io(format!("{label}: not a FAT volume"), e))?;
        Ok(Self { label, fs })
    }

    /// Walk to the directory at `path`
    fn dir(&self, path: &str) -> Result<Dir<'_, Box<dyn VolumeStorage>>, AgentError> {
        let mut dir = self.fs.root_dir();
        let mut walked = String::new();
        for component in components(path) {
            walked.push('/');
            walked.push_str(component);
            let entry = self
                .find(&dir, component, &walked)?
                .ok_or_else(|| AgentError::NotFound(walked.clone()))?;
            if !entry.is_dir() {
                return Err(AgentError::NotADirectory(walked));
            }
            dir = entry.to_dir();
        }
        Ok(dir)
    }

    fn find<'a>(
        &self,
        dir: &Dir<'a, Box<dyn VolumeStorage>>,
        name: &str,
        walked: &str,
    ) -> Result<Option<fatfs::DirEntry<'a, Box<dyn VolumeStorage>>>, AgentError> {
        for entry in dir.iter() {
            let entry = entry.map_err(|e| self.io_err(walked, e))?;
            if self.names_match(&entry.file_name(), name) {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Look up the entry at `path`; the root has no entry
    fn entry(
        &self,
        path: &str,
    ) -> Result<Option<fatfs::DirEntry<'_, Box<dyn VolumeStorage>>>, AgentError> {
        let path = normalize(path);
        let (parent, name) = super::split_parent(&path);
        match name {
            None => Ok(None),
            Some(name) => {
                let dir = self.dir(&parent)?;
                self.find(&dir, &name, &path)?
                    .map(Some)
                    .ok_or(AgentError::NotFound(path))
            }
        }
    }

    fn io_err(&self, path: &str, err: std::io::Error) -> AgentError {
        AgentError::io(format!("{}:{}", self.label, path), err)
    }
}

impl Filesystem for VolumeFilesystem {
    fn label(&self) -> &str {
        &self.label
    }

    /// FAT names are case-insensitive
    fn names_match(&self, listed: &str, requested: &str) -> bool {
        listed.eq_ignore_ascii_case(requested)
    }

    fn read_dir(&self, path: &str) -> Result<Vec<FileEntry>, AgentError> {
        let dir = self.dir(path)?;
        let mut entries = Vec::new();
        for entry in dir.iter() {
            let entry = entry.map_err(|e| self.io_err(path, e))?;
            entries.push(FileEntry {
                name: entry.file_name(),
                kind: if entry.is_dir() {
                    FileKind::Directory
                } else {
                    FileKind::File
                },
                size: entry.len(),
            });
        }
        Ok(entries)
    }

    fn stat(&self, path: &str) -> Result<FileMetadata, AgentError> {
        let (kind, size) = match self.entry(path)? {
            None => (FileKind::Directory, 0),
            Some(entry) if entry.is_dir() => (FileKind::Directory, 0),
            Some(entry) => (FileKind::File, entry.len()),
        };
        Ok(FileMetadata {
            kind,
            size,
            uid: None,
            gid: None,
            mode: None,
        })
    }

    fn open_file(&self, path: &str) -> Result<Box<dyn Read + '_>, AgentError> {
        match self.entry(path)? {
            Some(entry) if entry.is_file() => Ok(Box::new(entry.to_file())),
            _ => Err(AgentError::IsADirectory(normalize(path))),
        }
    }
}
