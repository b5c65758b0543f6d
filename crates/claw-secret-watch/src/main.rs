//! claw-secret-watch - Clawbernetes file-backed secret cache
//!
//! Loads secrets from mounted files and follows them as they rotate.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use claw_secret_watch::{resolver, SecretStore, SecretsConfig, StoreOptions};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "claw-secret-watch")]
#[command(about = "Clawbernetes file-backed secret cache")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the configured secrets until interrupted
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/claw-secret-watch/config.json")]
        config: PathBuf,
    },

    /// Validate a config file and show where each secret is read from
    Check {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/claw-secret-watch/config.json")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("claw_secret_watch=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(&config).await?,
        Commands::Check { config } => check(&config)?,
    }

    Ok(())
}

async fn run(config_path: &Path) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting claw-secret-watch");

    let config = SecretsConfig::from_file(config_path)?;

    let mut options = StoreOptions::new();
    for (id, secret) in &config.secrets {
        if secret.directory.is_some() {
            let name = id.to_string();
            options = options.on_rotate(id.as_str(), move |value| {
                info!(secret_name = %name, bytes = value.expose().len(), "rotation delivered");
            });
        }
    }

    let store = SecretStore::start(config, options).await?;

    for status in store.list().await? {
        info!(
            secret_name = %status.id,
            state = %status.state,
            version = status.metadata.version,
            "secret loaded"
        );
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

fn check(config_path: &Path) -> anyhow::Result<()> {
    let config = SecretsConfig::from_file(config_path)?;
    let resolution = resolver::resolve(&config)?;

    println!("{:<32} {:<10} PATH", "SECRET", "STATE");
    for secret in &resolution.secrets {
        let path = secret
            .watched_path
            .as_ref()
            .map_or_else(|| "-".to_string(), |p| p.display().to_string());
        println!("{:<32} {:<10} {path}", secret.id, secret.slot.state());
    }

    println!();
    println!(
        "{} secrets, {} watched in {} directories",
        resolution.secrets.len(),
        resolution.index.len(),
        resolution.directories.len()
    );
    Ok(())
}
