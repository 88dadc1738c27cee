//! Live root filesystem backend

use std::fs::{self, DirBuilder, File, Permissions};
use std::io::{Read, Write};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use super::{components, map_io, FileEntry, FileKind, FileMetadata, Filesystem};
use crate::AgentError;

/// The live OS tree
///
/// Backend paths are resolved under `base`, which is `/` in production and a
/// scratch directory in tests.
#[derive(Debug, Clone)]
pub struct RootFilesystem {
    base: PathBuf,
    label: String,
}

impl Default for RootFilesystem {
    fn default() -> Self {
        Self::new()
    }
}

impl RootFilesystem {
    pub fn new() -> Self {
        Self::with_base("/")
    }

    /// Re-root every path under `base` (useful for testing)
    pub fn with_base(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref().to_path_buf();
        Self {
            label: base.display().to_string(),
            base,
        }
    }

    /// Host path for a backend path
    pub fn host_path(&self, path: &str) -> PathBuf {
        components(path).fold(self.base.clone(), |acc, c| acc.join(c))
    }
}

impl Filesystem for RootFilesystem {
    fn label(&self) -> &str {
        &self.label
    }

    fn read_dir(&self, path: &str) -> Result<Vec<FileEntry>, AgentError> {
        let host = self.host_path(path);
        let mut entries = Vec::new();
        for entry in fs::read_dir(&host).map_err(|e| map_io(path, e))? {
            let entry = entry.map_err(|e| map_io(path, e))?;
            let metadata = entry.metadata().map_err(|e| map_io(path, e))?;
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind: if metadata.is_dir() {
                    FileKind::Directory
                } else {
                    FileKind::File
                },
                size: metadata.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn stat(&self, path: &str) -> Result<FileMetadata, AgentError> {
        let metadata = fs::metadata(self.host_path(path)).map_err(|e| map_io(path, e))?;
        Ok(FileMetadata {
            kind: if metadata.is_dir() {
                FileKind::Directory
            } else {
                FileKind::File
            },
            size: metadata.len(),
            uid: Some(metadata.uid()),
            gid: Some(metadata.gid()),
            mode: Some(metadata.mode() & 0o7777),
        })
    }

    fn open_file(&self, path: &str) -> Result<Box<dyn Read + '_>, AgentError> {
        let host = self.host_path(path);
        if host.is_dir() {
            return Err(AgentError::IsADirectory(path.to_string()));
        }
        let file = File::open(host).map_err(|e| map_io(path, e))?;
        Ok(Box::new(file))
    }

    fn create_file(&self, path: &str) -> Result<Box<dyn Write + '_>, AgentError> {
        let file = File::create(self.host_path(path)).map_err(|e| map_io(path, e))?;
        Ok(Box::new(file))
    }

    fn create_dir(&self, path: &str, mode: u32) -> Result<(), AgentError> {
        let host = self.host_path(path);
        DirBuilder::new()
            .mode(mode)
            .create(&host)
            .map_err(|e| map_io(path, e))?;
        // DirBuilder is subject to the umask
        fs::set_permissions(&host, Permissions::from_mode(mode)).map_err(|e| map_io(path, e))
    }

    fn set_owner(&self, path: &str, uid: u32, gid: u32) -> Result<(), AgentError> {
        std::os::unix::fs::chown(self.host_path(path), Some(uid), Some(gid))
            .map_err(|e| map_io(path, e))
    }

    fn set_mode(&self, path: &str, mode: u32) -> Result<(), AgentError> {
        fs::set_permissions(self.host_path(path), Permissions::from_mode(mode))
            .map_err(|e| map_io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths_are_rerooted() {
        let root = RootFilesystem::with_base("/tmp/provision");
        assert_eq!(
            root.host_path("/etc/named.conf"),
            PathBuf::from("/tmp/provision/etc/named.conf")
        );
        assert_eq!(root.host_path("/"), PathBuf::from("/tmp/provision"));
    }

    #[test]
    fn test_create_dir_applies_exact_mode() {
        let temp = TempDir::new().unwrap();
        let root = RootFilesystem::with_base(temp.path());

        root.create_dir("/etc", 0o755).unwrap();
        root.create_dir("/etc/named", 0o750).unwrap();

        let meta = root.stat("/etc/named").unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.mode, Some(0o750));
    }

    #[test]
    fn test_read_dir_on_file_is_typed() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("named.conf"), "options {};").unwrap();
        let root = RootFilesystem::with_base(temp.path());

        let result = root.read_dir("/named.conf");
        assert!(matches!(result, Err(AgentError::NotADirectory(_))));
    }

    #[test]
    fn test_create_file_on_directory_is_typed() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("zones")).unwrap();
        let root = RootFilesystem::with_base(temp.path());

        let result = root.create_file("/zones");
        assert!(matches!(result, Err(AgentError::IsADirectory(_))));
    }

    #[test]
    fn test_missing_path_is_not_found() {
        let temp = TempDir::new().unwrap();
        let root = RootFilesystem::with_base(temp.path());
        assert!(matches!(root.stat("/nope"), Err(AgentError::NotFound(_))));
    }

    #[test]
    fn test_set_owner_to_self() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("tls.crt"), "cert").unwrap();
        let root = RootFilesystem::with_base(temp.path());

        let meta = root.stat("/tls.crt").unwrap();
        let (uid, gid) = (meta.uid.unwrap(), meta.gid.unwrap());
        root.set_owner("/tls.crt", uid, gid).unwrap();
        root.set_mode("/tls.crt", 0o600).unwrap();

        assert_eq!(root.stat("/tls.crt").unwrap().mode, Some(0o600));
    }
}
