//! Ownership and permission propagation
//!
//! Changes are applied depth-first: every descendant of a directory is
//! handled before the directory itself. The first failure aborts the walk.

use std::collections::HashMap;

use nix::unistd::User;
use tracing::debug;

use crate::filesystem::{join, normalize, Filesystem};
use crate::AgentError;

/// Resolves user names to numeric ids
pub trait UserDirectory: Send + Sync {
    fn uid_for(&self, name: &str) -> Result<u32, AgentError>;
}

/// The OS user database (`getpwnam`)
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemUsers;

impl UserDirectory for SystemUsers {
    fn uid_for(&self, name: &str) -> Result<u32, AgentError> {
        match User::from_name(name) {
            Ok(Some(user)) => Ok(user.uid.as_raw()),
            Ok(None) => Err(AgentError::UnknownUser(name.to_string())),
            Err(errno) => Err(AgentError::UnknownUser(format!("{name}: {errno}"))),
        }
    }
}

/// Fixed user table for testing
///
/// # Example
/// ```
/// use vm_agent::ownership::{StaticUsers, UserDirectory};
///
/// let users = StaticUsers::new().with_user("named", 25);
/// assert_eq!(users.uid_for("named").unwrap(), 25);
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticUsers {
    users: HashMap<String, u32>,
}

impl StaticUsers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, name: &str, uid: u32) -> Self {
        self.users.insert(name.to_string(), uid);
        self
    }
}

impl UserDirectory for StaticUsers {
    fn uid_for(&self, name: &str) -> Result<u32, AgentError> {
        self.users
            .get(name)
            .copied()
            .ok_or_else(|| AgentError::UnknownUser(name.to_string()))
    }
}

/// Give `path` (and with `recursive`, everything below it) to `owner`
///
/// The group of every node is preserved. Returns the number of nodes changed.
pub fn set_owner_recursive(
    fs: &dyn Filesystem,
    users: &dyn UserDirectory,
    path: &str,
    owner: &str,
    recursive: bool,
) -> Result<usize, AgentError> {
    let uid = users.uid_for(owner)?;
    let path = normalize(path);
    let visited = walk_depth_first(fs, &path, recursive, &mut |node: &str| {
        let gid = fs.stat(node)?.gid.unwrap_or(0);
        fs.set_owner(node, uid, gid)
    })?;
    debug!("Set owner of {} node(s) under {} to {}", visited, path, owner);
    Ok(visited)
}

/// Set the permission bits of `path` (and with `recursive`, everything below it)
///
/// Returns the number of nodes changed.
pub fn set_permissions_recursive(
    fs: &dyn Filesystem,
    path: &str,
    mode: u32,
    recursive: bool,
) -> Result<usize, AgentError> {
    let path = normalize(path);
    let visited = walk_depth_first(fs, &path, recursive, &mut |node: &str| fs.set_mode(node, mode))?;
    debug!("Set mode {:o} on {} node(s) under {}", mode, visited, path);
    Ok(visited)
}

fn walk_depth_first(
    fs: &dyn Filesystem,
    path: &str,
    recursive: bool,
    apply: &mut dyn FnMut(&str) -> Result<(), AgentError>,
) -> Result<usize, AgentError> {
    let meta = fs.stat(path)?;
    let mut visited = 0;
    if meta.is_dir() && recursive {
        for entry in fs.read_dir(path)? {
            if entry.is_pseudo() {
                continue;
            }
            visited += walk_depth_first(fs, &join(path, &entry.name), recursive, apply)?;
        }
    }
    apply(path)?;
    Ok(visited + 1)
}
