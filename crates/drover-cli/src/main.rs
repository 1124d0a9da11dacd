//! droverctl — operator CLI for the drover master.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use drover_core::proto::{OperatorRequest, PingRequest};

mod client;
mod commands;

use client::OperatorClient;
use commands::call::CallArgs;
use commands::key::KeyCommand;

/// Operator CLI for the drover master.
#[derive(Parser, Debug)]
#[command(name = "droverctl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path of the master's operator socket.
    #[arg(short, long, default_value = "/run/drover/operator.sock")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the master is alive.
    Ping,
    /// Manage minion keys and trust state.
    #[command(subcommand)]
    Key(KeyCommand),
    /// Dispatch a command to selected minions.
    Call(CallArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let mut client = OperatorClient::connect(&cli.socket).await?;

    match cli.command {
        Command::Ping => {
            client.request(OperatorRequest::Ping(PingRequest {})).await?;
            println!("pong");
        }
        Command::Key(command) => commands::key::run(&mut client, command).await?,
        Command::Call(args) => commands::call::run(&mut client, args).await?,
    }
    Ok(())
}
