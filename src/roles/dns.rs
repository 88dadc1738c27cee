//! DNS server role (BIND)

use tracing::{debug, info};

use super::AgentContext;
use crate::copy::copy_tree;
use crate::filesystem::Filesystem;
use crate::ownership::{set_owner_recursive, set_permissions_recursive, UserDirectory};
use crate::AgentError;

const CONFIG_SLOT: &str = "scsi1";
const NAMED_USER: &str = "named";
const ZONES_DIR: &str = "/etc/named/zones";

pub async fn setup(ctx: &AgentContext) -> Result<(), AgentError> {
    info!("Setting up as DNS server");
    ctx.gateway
        .create_root_directory(ctx.root(), ZONES_DIR, 0o750, true)?;

    let volume = ctx.config_volume(CONFIG_SLOT)?;
    copy_named_config(&volume, ctx.root(), ctx.users.as_ref())?;

    ctx.services.start_and_wait("named").await
}

/// Place the BIND config files from `volume` on `root`
///
/// `named.conf` goes to `/etc`, `named.conf.*` includes to `/etc/named` and
/// everything else except `vm-config.json` is a zone file. Returns the number
/// of files copied.
pub fn copy_named_config(
    volume: &dyn Filesystem,
    root: &dyn Filesystem,
    users: &dyn UserDirectory,
) -> Result<usize, AgentError> {
    let mut copied = 0;
    for entry in volume.read_dir("/")? {
        if entry.is_pseudo() {
            continue;
        }
        if entry.is_dir() {
            debug!("Skipping directory {} on the config volume", entry.name);
            continue;
        }

        let name = entry.name.as_str();
        let source = format!("/{name}");
        let dest = if name == "named.conf" {
            "/etc/named.conf".to_string()
        } else if name.starts_with("named.conf.") {
            format!("/etc/named/{name}")
        } else if name == "vm-config.json" {
            continue;
        } else {
            format!("{ZONES_DIR}/{name}")
        };

        copy_tree(volume, root, &source, &dest, false)?;
        if name == "named.conf" {
            set_owner_recursive(root, users, &dest, NAMED_USER, false)?;
        }
        set_permissions_recursive(root, &dest, 0o640, false)?;
        copied += 1;
    }

    set_owner_recursive(root, users, "/etc/named", NAMED_USER, true)?;
    set_permissions_recursive(root, "/etc/named", 0o750, false)?;
    info!("Copied {} named config file(s)", copied);
    Ok(copied)
}
