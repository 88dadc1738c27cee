//! Vault server role

use tracing::{debug, info};

use super::{apply_mappings, provision_data_volume, AgentContext, FileMapping};
use crate::filesystem::gateway::FilesystemGateway;
use crate::filesystem::Filesystem;
use crate::ownership::set_owner_recursive;
use crate::vault::{unseal, UnsealShare, VaultClient};
use crate::AgentError;

const DATA_SLOT: &str = "scsi1";
const CONFIG_SLOT: &str = "scsi2";
const DATA_DIR: &str = "/opt/vault";
const CONFIG_DIR: &str = "/etc/vault.d";
const VAULT_USER: &str = "vault";
const SHARE_PREFIX: &str = "vault-key-";
const API_URL_FILE: &str = "vault-api-url";

const VAULT_FILES: &[FileMapping] = &[
    FileMapping::file("vault.hcl", "/etc/vault.d/vault.hcl", 0o644),
    FileMapping::file("vault-public.pem", "/etc/vault.d/tls.crt", 0o644),
    FileMapping::file("vault-private.pem", "/etc/vault.d/tls.pem", 0o600),
];

pub async fn setup(ctx: &AgentContext) -> Result<(), AgentError> {
    info!("Setting up as vault server");
    let volume = ctx.config_volume(CONFIG_SLOT)?;

    provision_data_volume(ctx, DATA_SLOT, DATA_DIR).await?;
    set_owner_recursive(ctx.root(), ctx.users.as_ref(), DATA_DIR, VAULT_USER, true)?;

    ctx.gateway
        .create_root_directory(ctx.root(), CONFIG_DIR, 0o755, true)?;
    apply_mappings(ctx, &volume, VAULT_FILES)?;

    ctx.services.start_and_wait("vault").await?;

    let shares = read_unseal_shares(&ctx.gateway, &volume)?;
    if shares.is_empty() {
        return Err(AgentError::role("vault", "no unseal shares on the config volume"));
    }
    let url = read_api_url(&ctx.gateway, &volume)?;
    let client = VaultClient::new(&url, ctx.config.http_timeout())?;
    unseal(&client, &shares, &ctx.config.vault_init_poll, &ctx.cancel).await?;
    Ok(())
}

/// Every `vault-key-<N>` file on `volume`, ordered by N
pub fn read_unseal_shares(
    gateway: &FilesystemGateway,
    volume: &dyn Filesystem,
) -> Result<Vec<UnsealShare>, AgentError> {
    let mut numbered: Vec<(u32, String)> = volume
        .read_dir("/")?
        .into_iter()
        .filter(|e| !e.is_dir())
        .filter_map(|e| {
            let index: u32 = e
                .name
                .to_ascii_lowercase()
                .strip_prefix(SHARE_PREFIX)?
                .parse()
                .ok()?;
            Some((index, e.name))
        })
        .collect();
    numbered.sort_by_key(|(index, _)| *index);

    let mut shares = Vec::with_capacity(numbered.len());
    for (index, name) in numbered {
        debug!("Reading unseal share {}", index);
        let data = gateway.read_file_contents(volume, &name)?;
        shares.push(UnsealShare::new(String::from_utf8_lossy(&data)));
    }
    Ok(shares)
}

/// Base URL of the vault API, from `vault-api-url`
pub fn read_api_url(gateway: &FilesystemGateway, volume: &dyn Filesystem) -> Result<String, AgentError> {
    let data = gateway.read_file_contents(volume, API_URL_FILE)?;
    let url = String::from_utf8_lossy(&data).trim().to_string();
    if url.is_empty() {
        return Err(AgentError::role("vault", format!("{API_URL_FILE} is empty")));
    }
    Ok(url)
}
