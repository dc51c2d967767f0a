use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use strata_app::commands;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "strata", version, about = "Multi-tenant agent execution coordinator")]
struct Cli {
    /// YAML configuration file; defaults plus STRATA_* overrides when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate configuration and probe every component
    Health,
    /// Run concurrent simulated users and verify per-user isolation
    Simulate {
        #[arg(long, default_value_t = 10)]
        users: usize,
        /// Simulated agent latency in milliseconds
        #[arg(long, default_value_t = 50)]
        agent_delay_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = commands::load(cli.config.as_deref())?;

    match cli.command {
        Command::Health => commands::health::run(config).await,
        Command::Simulate {
            users,
            agent_delay_ms,
        } => commands::simulate::run(config, users, Duration::from_millis(agent_delay_ms)).await,
    }
}
