use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use grange::{Config, GrangeServer};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "grange")]
#[command(about = "Multi-node git hosting service", long_about = None)]
struct Cli {
    /// Path to the node configuration file
    #[arg(long, default_value = "grange.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node
    Serve,
    /// Validate the configuration and print the effective settings
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            if config.cluster.credential.is_empty() {
                anyhow::bail!("cluster.credential must be set in {}", cli.config.display());
            }
            tracing::info!(
                "starting node {} with {} projects",
                config.advertised_address(),
                config.projects.len()
            );
            let server = GrangeServer::new(&config).context("failed to assemble server")?;
            server.run().await
        }
        Commands::CheckConfig => {
            config.owner_table()?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
