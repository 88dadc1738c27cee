//! Recursive copy between filesystem backends
//!
//! A source path may name a directory or a single file; the engine finds out
//! by trying to list it. Every file is read completely into memory before the
//! destination is written, and the byte count written must match the count
//! read.

use std::io::{ErrorKind, Read, Write};
use tracing::{debug, info};

use crate::filesystem::{join, normalize, split_parent, Filesystem};
use crate::AgentError;

/// Read chunk size
pub const CHUNK_SIZE: usize = 4096;

/// A source path on a volume and where it lands on the root filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyMapping {
    pub source: String,
    pub dest: String,
    pub recursive: bool,
}

impl CopyMapping {
    pub fn new(source: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
            recursive: false,
        }
    }

    /// Descend into subdirectories of the source
    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }
}

/// What a copy did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyReport {
    pub files: usize,
    pub bytes: u64,
}

impl std::ops::AddAssign for CopyReport {
    fn add_assign(&mut self, other: Self) {
        self.files += other.files;
        self.bytes += other.bytes;
    }
}

/// Copy the file or directory at `mapping.source` on `source` to `dest`
pub fn copy_mapping(
    source: &dyn Filesystem,
    dest: &dyn Filesystem,
    mapping: &CopyMapping,
) -> Result<CopyReport, AgentError> {
    let report = copy_tree(source, dest, &mapping.source, &mapping.dest, mapping.recursive)?;
    info!(
        "Copied {}:{} to {} ({} files, {} bytes)",
        source.label(),
        mapping.source,
        mapping.dest,
        report.files,
        report.bytes
    );
    Ok(report)
}

/// Copy `source_path` on `source` to `dest_path` on `dest`
///
/// For a directory source, every file in it is copied to `dest_path/<name>`;
/// `dest_path` must already exist. Subdirectories are mirrored when
/// `recursive` is set and skipped otherwise.
///
/// For a file source, the file is copied to `dest_path`, or to
/// `dest_path/<name>` when `dest_path` is an existing directory.
pub fn copy_tree(
    source: &dyn Filesystem,
    dest: &dyn Filesystem,
    source_path: &str,
    dest_path: &str,
    recursive: bool,
) -> Result<CopyReport, AgentError> {
    let source_path = normalize(source_path);
    let entries = match source.read_dir(&source_path) {
        Ok(entries) => entries,
        Err(AgentError::NotADirectory(_)) => {
            return copy_single(source, dest, &source_path, dest_path);
        }
        Err(e) => return Err(e),
    };

    let mut report = CopyReport::default();
    for entry in entries.iter().filter(|e| !e.is_pseudo()) {
        let child_source = join(&source_path, &entry.name);
        let child_dest = join(dest_path, &entry.name);

        if entry.is_dir() {
            if !recursive {
                debug!("Skipping subdirectory {}", child_source);
                continue;
            }
            ensure_mirror_dir(dest, &child_dest)?;
            report += copy_tree(source, dest, &child_source, &child_dest, recursive)?;
        } else {
            report.bytes += copy_file(source, dest, &child_source, &child_dest)? as u64;
            report.files += 1;
        }
    }
    Ok(report)
}

/// Copy a source that turned out to be a single file
///
/// The file is located through its parent's listing, since not every
/// backend can stat a bare path.
fn copy_single(
    source: &dyn Filesystem,
    dest: &dyn Filesystem,
    source_path: &str,
    dest_path: &str,
) -> Result<CopyReport, AgentError> {
    let (parent, name) = split_parent(source_path);
    let name = name.ok_or_else(|| AgentError::NotFound(source_path.to_string()))?;
    let entry = source
        .read_dir(&parent)?
        .into_iter()
        .find(|e| !e.is_pseudo() && !e.is_dir() && source.names_match(&e.name, &name))
        .ok_or_else(|| {
            AgentError::NotFound(format!("{} on {}", source_path, source.label()))
        })?;

    let bytes = copy_file(source, dest, &join(&parent, &entry.name), dest_path)?;
    Ok(CopyReport {
        files: 1,
        bytes: bytes as u64,
    })
}

fn ensure_mirror_dir(dest: &dyn Filesystem, path: &str) -> Result<(), AgentError> {
    match dest.stat(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(AgentError::NotADirectory(path.to_string())),
        Err(AgentError::NotFound(_)) => {
            debug!("Creating directory {}", path);
            dest.create_dir(path, 0o755)
        }
        Err(e) => Err(e),
    }
}

/// Copy one file and return the number of bytes copied
pub fn copy_file(
    source: &dyn Filesystem,
    dest: &dyn Filesystem,
    source_path: &str,
    dest_path: &str,
) -> Result<usize, AgentError> {
    let data = read_all(source, source_path)?;

    let (dest_path, mut writer) = match dest.create_file(dest_path) {
        Ok(writer) => (dest_path.to_string(), writer),
        Err(AgentError::IsADirectory(_)) => {
            let (_, name) = split_parent(source_path);
            let target = join(dest_path, name.as_deref().unwrap_or_default());
            let writer = dest.create_file(&target)?;
            (target, writer)
        }
        Err(e) => return Err(e),
    };

    let written = write_all_counted(writer.as_mut(), &data)
        .map_err(|e| AgentError::io(&dest_path, e))?;
    writer.flush().map_err(|e| AgentError::io(&dest_path, e))?;

    if written != data.len() {
        return Err(AgentError::Integrity {
            path: dest_path,
            written,
            read: data.len(),
        });
    }
    debug!("Copied {} to {} ({} bytes)", source_path, dest_path, written);
    Ok(written)
}

fn read_all(source: &dyn Filesystem, path: &str) -> Result<Vec<u8>, AgentError> {
    let mut reader = source.open_file(path)?;
    let mut data = Vec::new();
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => data.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(AgentError::io(format!("{}:{}", source.label(), path), e)),
        }
    }
    Ok(data)
}

/// Write until everything is accepted or the writer stops taking bytes
fn write_all_counted(writer: &mut dyn Write, data: &[u8]) -> std::io::Result<usize> {
    let mut written = 0;
    while written < data.len() {
        match writer.write(&data[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::memory::MemoryFilesystem;

    fn dns_volume() -> MemoryFilesystem {
        MemoryFilesystem::new()
            .with_file("/named.conf", "options { directory \"/var/named\"; };")
            .with_file("/named.conf.internal", "zone \"example.internal\" {};")
            .with_file("/zonefile.db", "$TTL 3600")
    }

    #[test]
    fn test_copy_directory_tree() {
        let source = MemoryFilesystem::new()
            .with_file("/conf.d/a.cfg", "frontend a")
            .with_file("/conf.d/extra/b.cfg", "backend b")
            .with_file("/conf.d/extra/deeper/c.cfg", "listen c");
        let dest = MemoryFilesystem::new().with_dir("/etc/haproxy/conf.d");

        let report = copy_tree(&source, &dest, "/conf.d", "/etc/haproxy/conf.d", true).unwrap();

        assert_eq!(report.files, 3);
        assert_eq!(report.bytes, 27);
        assert_eq!(dest.contents("/etc/haproxy/conf.d/a.cfg").unwrap(), b"frontend a");
        assert_eq!(
            dest.contents("/etc/haproxy/conf.d/extra/b.cfg").unwrap(),
            b"backend b"
        );
        assert_eq!(
            dest.contents("/etc/haproxy/conf.d/extra/deeper/c.cfg").unwrap(),
            b"listen c"
        );
        assert!(!dest.paths().iter().any(|p| p.ends_with("/.") || p.ends_with("/..")));
    }

    #[test]
    fn test_copy_is_idempotent() {
        let source = dns_volume();
        let dest = MemoryFilesystem::new().with_dir("/zones");

        let first = copy_tree(&source, &dest, "/", "/zones", true).unwrap();
        let paths = dest.paths();
        let second = copy_tree(&source, &dest, "/", "/zones", true).unwrap();

        assert_eq!(first, second);
        assert_eq!(dest.paths(), paths);
        assert_eq!(dest.contents("/zones/zonefile.db").unwrap(), b"$TTL 3600");
    }

    #[test]
    fn test_non_recursive_skips_subdirectories() {
        let source = MemoryFilesystem::new()
            .with_file("/haproxy.cfg", "global")
            .with_file("/certs/site.pem", "pem");
        let dest = MemoryFilesystem::new().with_dir("/etc/haproxy");

        let report = copy_tree(&source, &dest, "/", "/etc/haproxy", false).unwrap();

        assert_eq!(report.files, 1);
        assert!(dest.contents("/etc/haproxy/haproxy.cfg").is_some());
        assert!(dest.stat("/etc/haproxy/certs").is_err());
    }

    #[test]
    fn test_single_file_to_file_path() {
        let source = dns_volume();
        let dest = MemoryFilesystem::new().with_dir("/etc");

        let report = copy_tree(&source, &dest, "named.conf", "/etc/named.conf", false).unwrap();

        assert_eq!(report.files, 1);
        let files: Vec<String> = dest
            .paths()
            .into_iter()
            .filter(|p| dest.contents(p).is_some())
            .collect();
        assert_eq!(files, vec!["/etc/named.conf"]);
    }

    #[test]
    fn test_single_file_into_existing_directory() {
        let source = MemoryFilesystem::new().with_file("/keepalived.conf", "vrrp_instance VI_1 {}");
        let dest = MemoryFilesystem::new().with_dir("/etc/keepalived");

        copy_tree(&source, &dest, "/keepalived.conf", "/etc/keepalived", false).unwrap();

        assert_eq!(
            dest.contents("/etc/keepalived/keepalived.conf").unwrap(),
            b"vrrp_instance VI_1 {}"
        );
    }

    #[test]
    fn test_single_file_in_subdirectory() {
        let source = MemoryFilesystem::new().with_file("/certs/site.pem", "pem");
        let dest = MemoryFilesystem::new().with_dir("/etc");

        copy_tree(&source, &dest, "/certs/site.pem", "/etc/site.pem", false).unwrap();
        assert_eq!(dest.contents("/etc/site.pem").unwrap(), b"pem");
    }

    #[test]
    fn test_missing_source_file() {
        let source = dns_volume();
        let dest = MemoryFilesystem::new().with_dir("/etc");

        let result = copy_tree(&source, &dest, "/vault.hcl", "/etc/vault.hcl", false);
        assert!(matches!(result, Err(AgentError::NotFound(_))));
    }

    #[test]
    fn test_large_file_is_copied_across_chunks() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let source = MemoryFilesystem::new().with_file("/tls.pem", &payload);
        let dest = MemoryFilesystem::new();

        let report = copy_tree(&source, &dest, "/tls.pem", "/tls.pem", false).unwrap();

        assert_eq!(report.bytes, 10_000);
        assert_eq!(dest.contents("/tls.pem").unwrap(), payload);
    }

    #[test]
    fn test_short_write_is_integrity_error() {
        let source = MemoryFilesystem::new().with_file("/vault-private.pem", "0123456789");
        let dest = MemoryFilesystem::new()
            .with_dir("/etc/vault.d")
            .short_write_on("/etc/vault.d/tls.pem", 4);

        let err = copy_tree(&source, &dest, "/vault-private.pem", "/etc/vault.d/tls.pem", false)
            .unwrap_err();

        match err {
            AgentError::Integrity { written, read, .. } => {
                assert_eq!(written, 4);
                assert_eq!(read, 10);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_source_read_failure_propagates() {
        let source = dns_volume().fail_on("/zonefile.db");
        let dest = MemoryFilesystem::new().with_dir("/zones");

        let result = copy_tree(&source, &dest, "/", "/zones", false);
        assert!(matches!(result, Err(AgentError::IoAt { .. })));
    }

    #[test]
    fn test_copy_mapping() {
        let source = dns_volume();
        let dest = MemoryFilesystem::new().with_dir("/etc");

        let mapping = CopyMapping::new("/named.conf", "/etc/named.conf");
        assert!(!mapping.recursive);
        let report = copy_mapping(&source, &dest, &mapping).unwrap();
        assert_eq!(report.files, 1);
        assert!(CopyMapping::new("/", "/x").recursive().recursive);
    }
}
