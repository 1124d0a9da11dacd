//! drover-master — master daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use drover_master::operator::OperatorServer;
use drover_master::sched::Scheduler;
use drover_master::{server, Keystore, MasterConfig};

/// drover master: accepts minion streams and dispatches commands.
#[derive(Parser, Debug)]
#[command(name = "drover-master")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the master configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dispatch listen address, overriding the config file.
    #[arg(short, long)]
    listen: Option<String>,

    /// Trust-store root directory, overriding the config file.
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Operator socket path, overriding the config file.
    #[arg(long)]
    operator_socket: Option<PathBuf>,

    /// Approve every minion automatically at first contact.
    #[arg(long)]
    auto_sign: bool,
}

fn load_config(args: &Args) -> Result<MasterConfig> {
    let mut cfg = match &args.config {
        Some(path) => MasterConfig::load(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => MasterConfig::default(),
    };
    if let Some(listen) = &args.listen {
        cfg.listen = listen.clone();
    }
    if let Some(dir) = &args.data_dir {
        cfg.data_dir = dir.clone();
    }
    if let Some(path) = &args.operator_socket {
        cfg.operator_socket = path.clone();
    }
    if args.auto_sign {
        cfg.auto_sign = true;
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let cfg = load_config(&args)?;

    let store = Arc::new(Keystore::open(&cfg.data_dir).context("open trust store")?);
    let (sched, sched_loop) = Scheduler::new(
        Arc::clone(&store),
        cfg.auto_sign,
        cfg.auto_denied,
        cfg.call_timeout_default,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sched_task = tokio::spawn(sched_loop.run(shutdown_rx.clone()));

    let listener = TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("bind {}", cfg.listen))?;
    let dispatch_task = tokio::spawn(server::run(
        listener,
        Arc::clone(&sched),
        Arc::clone(&store),
        shutdown_rx.clone(),
    ));

    let operator = Arc::new(OperatorServer::new(
        Arc::clone(&store),
        sched,
        cfg.operator_socket.clone(),
    ));
    let operator_task = tokio::spawn(operator.run(shutdown_rx));

    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = sigterm.recv() => info!("termination requested"),
    }

    let _ = shutdown_tx.send(true);
    let _ = sched_task.await;
    let _ = dispatch_task.await;
    let _ = operator_task.await;
    info!("master stopped");
    Ok(())
}
