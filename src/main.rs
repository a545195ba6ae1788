use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use tpsmon::config::{Config, Consensus};
use tpsmon::monitor::Monitor;

/// Transactions-per-second monitor for JSON-RPC blockchain nodes.
#[derive(Parser)]
#[command(name = "tpsmon", about)]
struct Cli {
    /// Path to the YAML configuration file. Flags override file values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Shorthand for --log-level debug.
    #[arg(long)]
    debug: bool,

    /// JSON-RPC endpoint of the node.
    #[arg(long)]
    rpc_endpoint: Option<String>,

    /// Consensus family of the chain (raft or ibft).
    #[arg(long)]
    consensus: Option<String>,

    /// First block of a historical range.
    #[arg(long)]
    from: Option<u64>,

    /// Last block of a historical range.
    #[arg(long)]
    to: Option<u64>,

    /// Path of the CSV report file.
    #[arg(long)]
    report: Option<String>,

    /// Port of the TPS query server.
    #[arg(long)]
    port: Option<u16>,

    /// Port of the Prometheus metrics endpoint. Enables it when positive.
    #[arg(long)]
    prometheus_port: Option<u16>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
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
    /// Applies command-line overrides on top of the file configuration.
    fn apply(&self, cfg: &mut Config) -> Result<()> {
        if let Some(level) = &self.log_level {
            cfg.log_level = level.clone();
        }
        if self.debug {
            cfg.log_level = "debug".to_string();
        }
        if let Some(endpoint) = &self.rpc_endpoint {
            cfg.rpc.endpoint = endpoint.clone();
        }
        if let Some(consensus) = &self.consensus {
            cfg.consensus = Some(consensus.parse::<Consensus>()?);
        }
        if let Some(from) = self.from {
            cfg.range.from_block = from;
        }
        if let Some(to) = self.to {
            cfg.range.to_block = to;
        }
        if let Some(report) = &self.report {
            cfg.report.path = report.clone();
        }
        if let Some(port) = self.port {
            cfg.server.addr = format!(":{port}");
        }
        if let Some(port) = self.prometheus_port.filter(|p| *p > 0) {
            cfg.sinks.prometheus.enabled = true;
            cfg.sinks.prometheus.addr = format!(":{port}");
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("tpsmon {}", version::full());
        return Ok(());
    }

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    cli.apply(&mut cfg)?;

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting tpsmon",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let mut monitor = Monitor::new(cfg)?;

    // Set up signal handling.
    let cancel = monitor.cancel_token();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
            _ = cancel.cancelled() => return,
        }

        cancel.cancel();
    });

    monitor.start().await?;

    let result = monitor.run().await;
    if let Err(e) = &result {
        tracing::error!(error = %format!("{e:#}"), "tps monitor failed");
    }

    // Graceful shutdown.
    monitor.stop();

    tracing::info!("tpsmon stopped");

    result
}
