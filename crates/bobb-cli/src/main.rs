use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod launcher;

use bobb_channels::{ConnectionManager, DiscordTransport};
use bobb_core::{DirMailbox, Registry, RegistryStore};
use bobb_gateway::GatewayServer;
use bobb_runtime::{ActivationWatcher, ProcessSupervisor};
use config::{BobbConfig, expand_path};
use launcher::{AgentLauncher, LaunchSpec};

#[derive(Parser)]
#[command(name = "bobb")]
#[command(version)]
#[command(about = "BoBB - a supervisor for many Discord agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the supervisor
    Start,

    /// Initialize config directory and default config
    Init,

    /// Show current configuration (tokens masked)
    Config,

    /// List registered agents
    Agents,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Agents => cmd_agents(&cli.config).await,
        Commands::Start => cmd_start(&cli.config).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        info!("Created default config at {}", config_path.display());
    }

    let agents_dir = config_dir.join("agents");
    tokio::fs::create_dir_all(&agents_dir).await?;

    println!("BoBB initialized at {}", config_dir.display());
    println!("Export BOBB_DISCORD_TOKEN (and optionally OBB_DISCORD_TOKEN), then run `bobb start`.");
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = BobbConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg.masked())?);
    Ok(())
}

async fn cmd_agents(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = BobbConfig::load(config_path)?;
    let store = RegistryStore::new(
        expand_path(&cfg.registry.path),
        cfg.registry.child_port_start,
    );
    let data = store.load().await.context("Failed to read registry")?;

    if data.agents.is_empty() {
        println!("No agents registered ({}).", store.path().display());
        return Ok(());
    }

    println!("{:<24} {:<24} {:>6}  {:<15} identity", "id", "name", "port", "status");
    for agent in data.agents.values() {
        println!(
            "{:<24} {:<24} {:>6}  {:<15} {}",
            agent.id,
            agent.name,
            agent.port,
            agent.status,
            agent.network_identity.as_deref().unwrap_or("-"),
        );
    }
    println!("next port: {}", data.next_port);
    Ok(())
}

async fn cmd_start(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = BobbConfig::load(config_path)?;
    info!("Starting BoBB supervisor...");

    if cfg.primary.token.trim().is_empty() {
        anyhow::bail!("No token for the primary agent. Set BOBB_DISCORD_TOKEN or [primary].token.");
    }

    let cancel = CancellationToken::new();

    // Registry actor
    let mailbox = Arc::new(DirMailbox::new(expand_path(&cfg.registry.activations_dir)));
    let registry = Registry::new(
        RegistryStore::new(
            expand_path(&cfg.registry.path),
            cfg.registry.child_port_start,
        ),
        mailbox.clone(),
        Some(cfg.orchestrator_seed()),
    )
    .spawn();
    let agent_count = registry
        .list()
        .await
        .context("Failed to load agent registry")?
        .len();
    info!("Registry loaded ({} agents)", agent_count);

    let supervisor = Arc::new(
        ProcessSupervisor::new(cfg.supervisor_config())
            .context("Failed to initialize process supervisor")?,
    );
    let connections = ConnectionManager::new(
        Arc::new(DiscordTransport::new(cfg.routing.broadcast_marker.clone())),
        registry.clone(),
        cfg.manager_config(),
    );
    let launcher = Arc::new(AgentLauncher::new(
        supervisor.clone(),
        connections.clone(),
        registry.clone(),
        expand_path(&cfg.agents_dir),
        cfg.prompt_limits(),
    ));

    // Primary backend first; nothing works without it
    let primary_dir = expand_path(&cfg.primary.dir);
    supervisor
        .start_server(&cfg.primary.id, cfg.primary.port, &primary_dir)
        .await
        .with_context(|| format!("Failed to start backend for {}", cfg.primary.id))?;

    // Boundary API
    let gateway = GatewayServer::new(cfg.gateway_addr()?, registry.clone(), connections.clone());
    let gateway_handle = gateway.spawn(cancel.clone());

    // Activation watcher
    let watcher = ActivationWatcher::new(mailbox.clone(), launcher.clone());
    let watcher_handle = match watcher.start().await {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!("Activation watcher failed to start: {}", e);
            None
        }
    };

    // Primary presence; the backend is already up so only the bridge and
    // presence remain
    let primary = LaunchSpec {
        id: cfg.primary.id.clone(),
        name: cfg.primary.name.clone(),
        token: cfg.primary.token.clone(),
        port: cfg.primary.port,
        cwd: primary_dir,
        tracked: false,
    };
    if let Err(e) = launcher.bring_up(primary).await {
        error!("Primary agent failed to connect: {}", e);
        shutdown(&cancel, &watcher, &connections, &supervisor).await;
        return Err(anyhow::anyhow!(e).context("Failed to connect the primary agent"));
    }

    if cfg.has_orchestrator() {
        let orchestrator = LaunchSpec {
            id: cfg.orchestrator.id.clone(),
            name: cfg.orchestrator.name.clone(),
            token: cfg.orchestrator.token.clone(),
            port: cfg.orchestrator.port,
            cwd: expand_path(&cfg.orchestrator.dir),
            tracked: false,
        };
        if let Err(e) = launcher.bring_up(orchestrator).await {
            warn!("Orchestrator unavailable, escalations will be handled locally: {}", e);
        }
    } else {
        info!("No orchestrator token configured");
    }

    match launcher.bring_up_registered().await {
        Ok(n) => info!("Started {} registered agent(s)", n),
        Err(e) => error!("Failed to start registered agents: {}", e),
    }

    info!(
        "BoBB running with {} agent(s) online",
        connections.online_agents().await.len()
    );

    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    shutdown(&cancel, &watcher, &connections, &supervisor).await;

    if let Some(handle) = watcher_handle {
        let _ = handle.await;
    }
    match gateway_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Boundary API exited with error: {}", e),
        Err(e) => warn!("Boundary API task failed: {}", e),
    }

    println!("BoBB stopped.");
    Ok(())
}

async fn shutdown(
    cancel: &CancellationToken,
    watcher: &ActivationWatcher,
    connections: &ConnectionManager,
    supervisor: &ProcessSupervisor,
) {
    watcher.stop();
    cancel.cancel();
    connections.stop_all().await;
    supervisor.stop_all().await;
}
