use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use herald_channels::ProviderFactory;
use herald_scheduler::{JobRunner, JobRunnerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod manager;

use config::HeraldConfig;
use manager::ChatManager;

#[derive(Parser)]
#[command(name = "herald")]
#[command(version)]
#[command(about = "Herald, a chat bridge for IRC and Discord")]
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
    /// Connect every enabled bot and run until Ctrl+C
    Start,

    /// Initialize config directory and default config
    Init,

    /// Show current configuration with secrets masked
    Config,

    /// Validate every enabled bot without connecting
    Check,
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
        Commands::Check => cmd_check(&cli.config).await,
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

    println!("Herald initialized at {}", config_dir.display());
    println!("Edit {} to configure your bots and channels.", config_path.display());
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = HeraldConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg.masked())?);
    Ok(())
}

fn build_factory(cfg: &HeraldConfig) -> (Arc<JobRunner>, ProviderFactory) {
    let jobs = Arc::new(JobRunner::with_config(JobRunnerConfig::from(&cfg.jobs)));
    let factory = ProviderFactory::new(jobs.clone());
    (jobs, factory)
}

async fn cmd_check(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = HeraldConfig::load(config_path)?;
    let (_jobs, factory) = build_factory(&cfg);

    let mut failures = 0;
    for bot in &cfg.bots {
        if !bot.enabled {
            println!("  - {} ({}): disabled", bot.name, bot.provider);
            continue;
        }
        match factory.create(bot) {
            Ok(provider) => println!(
                "  ok {} ({}): {} channel(s)",
                bot.name,
                provider.kind(),
                bot.limited_channels().len()
            ),
            Err(e) => {
                failures += 1;
                println!("  !! {} ({}): {}", bot.name, bot.provider, e);
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} bot(s) are misconfigured", failures);
    }
    println!("Configuration OK.");
    Ok(())
}

async fn cmd_start(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = HeraldConfig::load(config_path)?;
    info!("Starting herald...");

    let (jobs, factory) = build_factory(&cfg);
    let manager = ChatManager::build(&factory, cfg.enabled_bots())?;
    if manager.bots().is_empty() {
        warn!("No enabled bots in config, nothing to do");
        return Ok(());
    }
    info!("Running {} bot(s)", manager.bots().len());

    let cancel = CancellationToken::new();
    let main_loop = tokio::spawn(manager.run(cancel.clone()));

    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    cancel.cancel();

    let _ = main_loop.await;
    jobs.shutdown();

    println!("Herald stopped.");
    Ok(())
}
