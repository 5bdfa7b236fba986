use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use spark_app_exporter::{agent, config};

/// Prometheus exporter for Spark applications running on YARN.
#[derive(Parser)]
#[command(name = "spark-app-exporter", about)]
struct Cli {
    /// Path to an optional YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// YARN ResourceManager hostname.
    #[arg(long)]
    yarn_host: Option<String>,

    /// Spark history server hostname (defaults to the YARN host).
    #[arg(long)]
    spark_history_host: Option<String>,

    /// Port to expose metrics on.
    #[arg(long)]
    port: Option<u16>,

    /// Scrape interval in seconds.
    #[arg(long)]
    interval: Option<u64>,

    /// Logging verbosity level (trace, debug, info, warn/warning, error).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected by build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash, or "unknown".
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

impl Cli {
    /// Overlay command-line flags onto the file (or default) configuration.
    fn apply(&self, cfg: &mut config::Config) {
        if let Some(host) = &self.yarn_host {
            cfg.yarn.host.clone_from(host);
        }
        if let Some(host) = &self.spark_history_host {
            cfg.history.host.clone_from(host);
        }
        if let Some(port) = self.port {
            cfg.exporter.addr = format!(":{port}");
        }
        if let Some(secs) = self.interval {
            cfg.scrape_interval = std::time::Duration::from_secs(secs);
        }
        if let Some(level) = &self.log_level {
            cfg.log_level.clone_from(level);
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("spark-app-exporter {}", version::full());
        return Ok(());
    }

    let mut cfg = match &cli.config {
        Some(path) => config::Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => config::Config::default(),
    };
    cli.apply(&mut cfg);

    // Initialize tracing.
    let level = cfg.log_level_filter()?;
    let filter = EnvFilter::new(level.to_string());

    fmt().with_env_filter(filter).with_target(true).init();

    cfg.validate().context("invalid configuration")?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting spark-app-exporter",
    );
    tracing::info!(
        yarn = %cfg.yarn_base_url(),
        history = ?cfg.history_base_urls(),
        addr = %cfg.exporter.addr,
        interval = ?cfg.scrape_interval,
        "configuration loaded",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: config::Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Start the agent.
    let mut agent = agent::Agent::new(cfg)?;
    agent.start().await?;

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown.
    agent.stop().await?;

    tracing::info!("spark-app-exporter stopped");

    Ok(())
}
