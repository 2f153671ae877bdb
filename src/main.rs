use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use probec::agent::Agent;
use probec::config::{Config, Overrides};

/// Release version for the code.
const RELEASE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Measures how late consensus nodes report chain events and forwards the
/// measurements to downstream collectors.
#[derive(Parser)]
#[command(name = "probec", about)]
struct Cli {
    /// Base directory for configuration files.
    #[arg(long = "base-dir")]
    base_dir: Option<PathBuf>,

    /// Show version and exit.
    #[arg(long)]
    version: bool,

    /// Minimum level of messages to log.
    #[arg(long = "log-level")]
    log_level: Option<String>,

    /// Redirect log output to a file.
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,

    /// Enable reporting of block delays.
    #[arg(long = "blocks.enable", num_args = 0..=1, default_missing_value = "true")]
    blocks_enable: Option<bool>,

    /// Enable reporting of head delays.
    #[arg(long = "heads.enable", num_args = 0..=1, default_missing_value = "true")]
    heads_enable: Option<bool>,

    /// Enable reporting of attestations and their delays.
    #[arg(long = "attestations.enable", num_args = 0..=1, default_missing_value = "true")]
    attestations_enable: Option<bool>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            base_dir: self.base_dir.clone(),
            log_level: self.log_level.clone(),
            log_file: self.log_file.clone(),
            blocks_enable: self.blocks_enable,
            heads_enable: self.heads_enable,
            attestations_enable: self.attestations_enable,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("{RELEASE_VERSION}");
        return Ok(());
    }

    let cfg = Config::load(&cli.overrides()).context("failed to fetch configuration")?;

    init_logging(&cfg)?;

    tracing::info!(version = RELEASE_VERSION, "starting probec");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

fn init_logging(cfg: &Config) -> Result<()> {
    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;

    let builder = fmt().with_env_filter(filter).with_target(true);

    match &cfg.log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            builder.with_writer(Arc::new(file)).init();
        }
        None => builder.init(),
    }

    Ok(())
}

async fn run(cfg: Config) -> Result<()> {
    let mut agent = Agent::new(cfg);
    agent.start().await?;

    tracing::info!("all services operational");

    // Wait for a termination signal.
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    agent.stop();

    tracing::info!("probec stopped");

    Ok(())
}
