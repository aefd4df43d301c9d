use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mev_searcher_core::config::Config;
use mev_searcher_core::logging::setup_logging;
use tracing::{error, info};

/// Searcher execution core: scan, simulate, bundle and submit.
#[derive(Parser, Debug)]
#[command(name = "searcher")]
struct Cli {
    /// TOML configuration file; environment variables override it.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Log level or full `RUST_LOG`-style filter.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    /// Serve Prometheus metrics on this address.
    #[cfg(feature = "with-metrics")]
    #[arg(long, default_value = "127.0.0.1:9000")]
    metrics_addr: std::net::SocketAddr,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run against the configured node and relays
    Run,
    /// Dry run over a synthetic chain with an always-including relay
    Simulate {
        /// How long to run, in seconds
        #[arg(long, default_value_t = 30)]
        seconds: u64,
        /// Seed for the synthetic reserve walk
        #[arg(long, default_value_t = 7)]
        seed: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level, cli.json_logs);

    #[cfg(feature = "with-metrics")]
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(cli.metrics_addr)
        .install()?;

    let config = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("starting searcher");
            match mev_searcher_core::run(config).await {
                Ok(stats) => info!(?stats, "searcher exited"),
                Err(e) => {
                    error!(error = %e, "searcher failed");
                    return Err(e);
                }
            }
        }
        Commands::Simulate { seconds, seed } => {
            info!(seconds, seed, "starting dry run");
            let stats = mev_searcher_core::simulate(config, Duration::from_secs(seconds), seed).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}
