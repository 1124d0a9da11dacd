//! drover-minion — agent entry point.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use drover_minion::{Agent, MinionConfig};

/// drover minion: executes commands dispatched by a master.
#[derive(Parser, Debug)]
#[command(name = "drover-minion")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the minion configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Minion name, overriding the config file.
    #[arg(short, long)]
    name: Option<String>,

    /// Master dispatch address, overriding the config file.
    #[arg(short, long)]
    master: Option<String>,

    /// Data directory, overriding the config file.
    #[arg(short, long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut cfg = match &args.config {
        Some(path) => MinionConfig::load(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => MinionConfig::default(),
    };
    if let Some(name) = args.name {
        cfg.name = name;
    }
    if let Some(master) = args.master {
        cfg.master = master;
    }
    if let Some(dir) = args.data_dir {
        cfg.data_dir = dir;
    }

    let mut agent = Agent::new(cfg).context("initialize agent")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(async move { agent.run(shutdown_rx).await });

    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = sigterm.recv() => info!("termination requested"),
    }

    let _ = shutdown_tx.send(true);
    let _ = run.await;
    info!("minion stopped");
    Ok(())
}
