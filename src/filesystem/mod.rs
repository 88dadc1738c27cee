//! Filesystem backends
//!
//! The copy engine and the ownership propagator only ever see the
//! [`Filesystem`] trait. Three backends implement it:
//!
//! - [`volume::VolumeFilesystem`]: a FAT volume read straight from a disk
//!   image, without mounting. Read-only; only ever a copy source.
//! - [`root::RootFilesystem`]: the live OS tree, optionally re-rooted under a
//!   base directory.
//! - [`memory::MemoryFilesystem`]: an in-memory tree for tests and dry runs.
//!
//! Paths are `/`-separated and absolute within the backend. Relative paths
//! are resolved against the backend root.

pub mod gateway;
pub mod memory;
pub mod root;
pub mod volume;

use std::io::{Read, Write};

use crate::AgentError;

/// Kind of a filesystem node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub kind: FileKind,
    pub size: u64,
}

impl FileEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// `.` and `..`, which must never be copied or recursed into
    pub fn is_pseudo(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// Result of a stat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub kind: FileKind,
    pub size: u64,
    /// Owner, when the backend tracks ownership
    pub uid: Option<u32>,
    /// Group, when the backend tracks ownership
    pub gid: Option<u32>,
    /// Permission bits, when the backend tracks them
    pub mode: Option<u32>,
}

impl FileMetadata {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// Capability surface shared by every filesystem backend
///
/// Read operations are required. Mutating operations default to
/// [`AgentError::ReadOnly`], which is what image-backed volumes return.
pub trait Filesystem {
    /// Short description for logs (device path, base directory, ...)
    fn label(&self) -> &str;

    /// List a directory.
    ///
    /// Fails with [`AgentError::NotADirectory`] when `path` names a file and
    /// [`AgentError::NotFound`] when it names nothing. Backends may include
    /// `.` and `..` in the result.
    fn read_dir(&self, path: &str) -> Result<Vec<FileEntry>, AgentError>;

    fn stat(&self, path: &str) -> Result<FileMetadata, AgentError>;

    /// Whether a listed entry name matches a requested one under this
    /// backend's lookup rules
    fn names_match(&self, listed: &str, requested: &str) -> bool {
        listed == requested
    }

    /// Open a regular file for reading
    fn open_file(&self, path: &str) -> Result<Box<dyn Read + '_>, AgentError>;

    /// Create or truncate a regular file for writing.
    ///
    /// Fails with [`AgentError::IsADirectory`] when `path` is an existing
    /// directory.
    fn create_file(&self, path: &str) -> Result<Box<dyn Write + '_>, AgentError> {
        Err(AgentError::ReadOnly(path.to_string()))
    }

    /// Create a single directory with exactly `mode`
    fn create_dir(&self, path: &str, mode: u32) -> Result<(), AgentError> {
        let _ = mode;
        Err(AgentError::ReadOnly(path.to_string()))
    }

    fn set_owner(&self, path: &str, uid: u32, gid: u32) -> Result<(), AgentError> {
        let _ = (uid, gid);
        Err(AgentError::ReadOnly(path.to_string()))
    }

    fn set_mode(&self, path: &str, mode: u32) -> Result<(), AgentError> {
        let _ = mode;
        Err(AgentError::ReadOnly(path.to_string()))
    }
}

/// Split a path into its non-empty components
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".")
}

/// Normalize to an absolute path without duplicate or trailing slashes
pub fn normalize(path: &str) -> String {
    let joined = components(path).collect::<Vec<_>>().join("/");
    format!("/{joined}")
}

/// Append `name` to `parent`
pub fn join(parent: &str, name: &str) -> String {
    normalize(&format!("{parent}/{name}"))
}

/// Split a path into (parent, base name). The root has no base name.
pub fn split_parent(path: &str) -> (String, Option<String>) {
    let mut parts: Vec<&str> = components(path).collect();
    let name = parts.pop().map(str::to_string);
    (format!("/{}", parts.join("/")), name)
}

/// Map an OS error on `path` to the typed variants callers match on
pub(crate) fn map_io(path: &str, err: std::io::Error) -> AgentError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::NotFound => AgentError::NotFound(path.to_string()),
        ErrorKind::NotADirectory => AgentError::NotADirectory(path.to_string()),
        ErrorKind::IsADirectory => AgentError::IsADirectory(path.to_string()),
        ErrorKind::ReadOnlyFilesystem => AgentError::ReadOnly(path.to_string()),
        _ => AgentError::io(path, err),
    }
}

/// Read a whole file from any backend
pub fn read_to_end(fs: &dyn Filesystem, path: &str) -> Result<Vec<u8>, AgentError> {
    let mut reader = fs.open_file(path)?;
    let mut data = Vec::new();
    reader
        .read_to_end(&mut data)
        .map_err(|e| AgentError::io(format!("{}:{}", fs.label(), path), e))?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/etc//named/"), "/etc/named");
        assert_eq!(normalize("vault.hcl"), "/vault.hcl");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("./conf.d/./a.cfg"), "/conf.d/a.cfg");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/etc/haproxy/conf.d/", "a.cfg"), "/etc/haproxy/conf.d/a.cfg");
        assert_eq!(join("/", "named.conf"), "/named.conf");
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(
            split_parent("/etc/named.conf"),
            ("/etc".to_string(), Some("named.conf".to_string()))
        );
        assert_eq!(
            split_parent("vault.hcl"),
            ("/".to_string(), Some("vault.hcl".to_string()))
        );
        assert_eq!(split_parent("/"), ("/".to_string(), None));
    }

    #[test]
    fn test_pseudo_entries() {
        let dot = FileEntry {
            name: "..".to_string(),
            kind: FileKind::Directory,
            size: 0,
        };
        assert!(dot.is_pseudo());
        assert!(dot.is_dir());
    }
}
