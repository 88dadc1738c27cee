//! In-memory filesystem for testing and dry runs

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{components, join, normalize, split_parent, FileEntry, FileKind, FileMetadata, Filesystem};
use crate::AgentError;

#[derive(Debug, Clone)]
struct Node {
    kind: FileKind,
    data: Vec<u8>,
    mode: u32,
    uid: u32,
    gid: u32,
}

impl Node {
    fn dir(mode: u32) -> Self {
        Self {
            kind: FileKind::Directory,
            data: Vec::new(),
            mode,
            uid: 0,
            gid: 0,
        }
    }

    fn file(data: Vec<u8>) -> Self {
        Self {
            kind: FileKind::File,
            data,
            mode: 0o644,
            uid: 0,
            gid: 0,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    failing: Vec<String>,
    short_writes: HashMap<String, usize>,
    ops: Vec<String>,
}

/// A filesystem held entirely in memory
///
/// Directory listings of non-root directories include `.` and `..`, the way
/// FAT volumes report them. Every mutation is recorded in an operation log so
/// tests can check the order changes were applied in.
///
/// # Example
/// ```
/// use vm_agent::filesystem::memory::MemoryFilesystem;
/// use vm_agent::filesystem::Filesystem;
///
/// let fs = MemoryFilesystem::new()
///     .with_file("/named.conf", "options {};")
///     .with_dir("/zones");
/// assert!(fs.stat("/zones").unwrap().is_dir());
/// ```
#[derive(Debug, Clone)]
pub struct MemoryFilesystem {
    label: String,
    state: Arc<Mutex<State>>,
}

impl Default for MemoryFilesystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFilesystem {
    /// Create an empty filesystem holding only `/`
    pub fn new() -> Self {
        let mut state = State::default();
        state.nodes.insert("/".to_string(), Node::dir(0o755));
        Self {
            label: "memory".to_string(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Add a file, creating missing parent directories
    pub fn with_file(self, path: &str, data: impl AsRef<[u8]>) -> Self {
        let path = normalize(path);
        self.ensure_parents(&path);
        self.lock()
            .nodes
            .insert(path, Node::file(data.as_ref().to_vec()));
        self
    }

    /// Add a directory, creating missing parent directories
    pub fn with_dir(self, path: &str) -> Self {
        let path = normalize(path);
        self.ensure_parents(&path);
        self.lock().nodes.entry(path).or_insert(Node::dir(0o755));
        self
    }

    /// Make every operation touching `path` fail
    pub fn fail_on(self, path: &str) -> Self {
        self.lock().failing.push(normalize(path));
        self
    }

    /// Make writes to `path` stop accepting bytes after `limit`
    pub fn short_write_on(self, path: &str, limit: usize) -> Self {
        self.lock().short_writes.insert(normalize(path), limit);
        self
    }

    /// Contents of a file, if it exists
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.lock()
            .nodes
            .get(&normalize(path))
            .filter(|n| n.kind == FileKind::File)
            .map(|n| n.data.clone())
    }

    /// Every path present, sorted
    pub fn paths(&self) -> Vec<String> {
        self.lock().nodes.keys().cloned().collect()
    }

    /// Mutations applied so far, in order
    pub fn ops(&self) -> Vec<String> {
        self.lock().ops.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_parents(&self, path: &str) {
        let mut state = self.lock();
        let mut current = String::new();
        let parts: Vec<&str> = components(path).collect();
        for part in parts.iter().take(parts.len().saturating_sub(1)) {
            current = join(&current, part);
            state
                .nodes
                .entry(current.clone())
                .or_insert(Node::dir(0o755));
        }
    }

    /// Look up a node, checking the failure list and that every ancestor is a directory
    fn node(&self, state: &State, path: &str) -> Result<Node, AgentError> {
        if state.failing.iter().any(|f| f == path) {
            return Err(AgentError::io(
                path,
                io::Error::new(io::ErrorKind::PermissionDenied, "injected failure"),
            ));
        }
        let mut current = String::new();
        for part in components(path) {
            if !current.is_empty() {
                match state.nodes.get(&current) {
                    Some(n) if n.kind == FileKind::File => {
                        return Err(AgentError::NotADirectory(current));
                    }
                    _ => {}
                }
            }
            current = join(&current, part);
        }
        state
            .nodes
            .get(path)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(path.to_string()))
    }

    fn update(&self, path: &str, op: String, apply: impl FnOnce(&mut Node)) -> Result<(), AgentError> {
        let path = normalize(path);
        let mut state = self.lock();
        self.node(&state, &path)?;
        if let Some(node) = state.nodes.get_mut(&path) {
            apply(node);
        }
        state.ops.push(op);
        Ok(())
    }
}

impl Filesystem for MemoryFilesystem {
    fn label(&self) -> &str {
        &self.label
    }

    fn read_dir(&self, path: &str) -> Result<Vec<FileEntry>, AgentError> {
        let path = normalize(path);
        let state = self.lock();
        let node = self.node(&state, &path)?;
        if node.kind != FileKind::Directory {
            return Err(AgentError::NotADirectory(path));
        }

        let mut entries = Vec::new();
        if path != "/" {
            for pseudo in [".", ".."] {
                entries.push(FileEntry {
                    name: pseudo.to_string(),
                    kind: FileKind::Directory,
                    size: 0,
                });
            }
        }
        for (child, node) in &state.nodes {
            let (parent, name) = split_parent(child);
            if let Some(name) = name
                && parent == path
            {
                entries.push(FileEntry {
                    name,
                    kind: node.kind,
                    size: node.data.len() as u64,
                });
            }
        }
        Ok(entries)
    }

    fn stat(&self, path: &str) -> Result<FileMetadata, AgentError> {
        let path = normalize(path);
        let node = self.node(&self.lock(), &path)?;
        Ok(FileMetadata {
            kind: node.kind,
            size: node.data.len() as u64,
            uid: Some(node.uid),
            gid: Some(node.gid),
            mode: Some(node.mode),
        })
    }

    fn open_file(&self, path: &str) -> Result<Box<dyn Read + '_>, AgentError> {
        let path = normalize(path);
        let node = self.node(&self.lock(), &path)?;
        if node.kind == FileKind::Directory {
            return Err(AgentError::IsADirectory(path));
        }
        Ok(Box::new(io::Cursor::new(node.data)))
    }

    fn create_file(&self, path: &str) -> Result<Box<dyn Write + '_>, AgentError> {
        let path = normalize(path);
        let mut state = self.lock();
        match self.node(&state, &path) {
            Ok(node) if node.kind == FileKind::Directory => {
                return Err(AgentError::IsADirectory(path));
            }
            Ok(_) => {}
            Err(AgentError::NotFound(_)) => {
                let (parent, _) = split_parent(&path);
                let parent_node = self.node(&state, &parent)?;
                if parent_node.kind != FileKind::Directory {
                    return Err(AgentError::NotADirectory(parent));
                }
            }
            Err(e) => return Err(e),
        }

        let existing = state.nodes.get(&path).cloned();
        let mut node = Node::file(Vec::new());
        if let Some(existing) = existing {
            node.mode = existing.mode;
            node.uid = existing.uid;
            node.gid = existing.gid;
        }
        state.nodes.insert(path.clone(), node);
        state.ops.push(format!("create {path}"));
        let limit = state.short_writes.get(&path).copied();

        Ok(Box::new(MemoryWriter {
            state: Arc::clone(&self.state),
            path,
            limit,
        }))
    }

    fn create_dir(&self, path: &str, mode: u32) -> Result<(), AgentError> {
        let path = normalize(path);
        let mut state = self.lock();
        if state.nodes.contains_key(&path) {
            return Err(AgentError::io(
                &path,
                io::Error::new(io::ErrorKind::AlreadyExists, "file exists"),
            ));
        }
        let (parent, _) = split_parent(&path);
        let parent_node = self.node(&state, &parent)?;
        if parent_node.kind != FileKind::Directory {
            return Err(AgentError::NotADirectory(parent));
        }
        state.nodes.insert(path.clone(), Node::dir(mode));
        state.ops.push(format!("mkdir {path} {mode:o}"));
        Ok(())
    }

    fn set_owner(&self, path: &str, uid: u32, gid: u32) -> Result<(), AgentError> {
        let op = format!("chown {} {uid}:{gid}", normalize(path));
        self.update(path, op, |node| {
            node.uid = uid;
            node.gid = gid;
        })
    }

    fn set_mode(&self, path: &str, mode: u32) -> Result<(), AgentError> {
        let op = format!("chmod {} {mode:o}", normalize(path));
        self.update(path, op, |node| node.mode = mode)
    }
}

/// Appends written bytes to a file node
struct MemoryWriter {
    state: Arc<Mutex<State>>,
    path: String,
    limit: Option<usize>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let node = state
            .nodes
            .get_mut(&self.path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, self.path.clone()))?;
        let accepted = match self.limit {
            Some(limit) => buf.len().min(limit.saturating_sub(node.data.len())),
            None => buf.len(),
        };
        node.data.extend_from_slice(&buf[..accepted]);
        Ok(accepted)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
