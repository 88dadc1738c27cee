//! vm-agent - first-boot provisioning agent for infrastructure VMs

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use vm_agent::config::{load_config, AgentConfig};
use vm_agent::hostname::load_hostname;
use vm_agent::inventory::{InventoryClient, VmDetails};
use vm_agent::roles::{run_role, select_role, AgentContext};
use vm_agent::vault::{SealApi, VaultClient};
use vm_agent::Role;

#[derive(Parser)]
#[command(name = "vm-agent")]
#[command(author, version, about = "First-boot provisioning agent for infrastructure VMs", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Agent config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Look this node up in the inventory and provision its role
    Run,
    /// Provision a role directly, without asking the inventory
    Role {
        /// Role tag (dns, loadbalancer, vault, k8s-controller, k8s-worker)
        tag: String,
    },
    /// Print the seal status of a vault
    SealStatus {
        /// Vault base URL, e.g. https://10.0.0.5:8200
        #[arg(long)]
        url: String,
    },
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Failed to set tracing subscriber");
    }
}

/// Cancel `token` on SIGINT so polling loops and child processes stop
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            token.cancel();
        }
    });
}

async fn run(config: AgentConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let hostname = load_hostname(&config.hostname_file, &config.hostname_poll, &cancel)
        .await
        .context("failed to determine hostname")?;
    let url = config.require_inventory_url()?;
    let inventory = InventoryClient::new(url, &hostname, config.http_timeout())?;
    let vm = inventory
        .vm_details()
        .await
        .with_context(|| format!("failed to look up {hostname} in the inventory"))?;

    let Some(role) = select_role(&vm.tags) else {
        info!("No role tag on {}, nothing to do", vm.name);
        return Ok(());
    };

    let ctx = AgentContext::system(config, cancel);
    run_role(&ctx, role, &vm).await?;
    Ok(())
}

async fn run_direct(config: AgentConfig, cancel: CancellationToken, tag: &str) -> anyhow::Result<()> {
    let Some(role) = Role::from_tag(tag) else {
        bail!("unknown role '{tag}'");
    };
    let vm = VmDetails {
        name: local_name(&config).await,
        tags: vec![role.tag().to_string()],
        ..VmDetails::default()
    };
    let ctx = AgentContext::system(config, cancel);
    run_role(&ctx, role, &vm).await?;
    Ok(())
}

async fn local_name(config: &AgentConfig) -> String {
    tokio::fs::read_to_string(&config.hostname_file)
        .await
        .map(|h| h.trim().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

async fn seal_status(config: &AgentConfig, url: &str) -> anyhow::Result<()> {
    let client = VaultClient::new(url, config.http_timeout())?;
    let status = client.seal_status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref()).await?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting vm-agent");
            run(config, cancel).await
        }
        Commands::Role { tag } => {
            info!("Provisioning role {} directly", tag);
            run_direct(config, cancel, &tag).await
        }
        Commands::SealStatus { url } => seal_status(&config, &url).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
