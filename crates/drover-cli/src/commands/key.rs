//! Key-management subcommands: the operator's enrollment workflow.

use anyhow::{bail, Result};
use clap::Subcommand;

use drover_core::proto::{
    AcceptMinionRequest, DeleteMinionRequest, ListMinionsRequest, OperatorRequest,
    OperatorResponse, PrintMinionRequest, RejectMinionRequest,
};

use crate::client::OperatorClient;

/// Trust-store operations on minion keys.
#[derive(Subcommand, Debug)]
pub enum KeyCommand {
    /// List minion names grouped by trust state.
    List {
        /// Restrict to these states (unaccepted, accepted, auto_sign,
        /// denied, rejected). All five when omitted.
        #[arg(short, long)]
        state: Vec<String>,
    },
    /// Accept minions awaiting approval.
    Accept {
        /// Names to accept.
        names: Vec<String>,
        /// Accept every unaccepted minion.
        #[arg(long)]
        all: bool,
        /// Also accept from the rejected bucket.
        #[arg(long)]
        include_rejected: bool,
        /// Also accept from the denied bucket.
        #[arg(long)]
        include_denied: bool,
    },
    /// Reject minions.
    Reject {
        /// Names to reject.
        names: Vec<String>,
        /// Reject every unaccepted minion.
        #[arg(long)]
        all: bool,
        /// Also reject currently accepted or auto-signed minions.
        #[arg(long)]
        include_accepted: bool,
        /// Also reject from the denied bucket.
        #[arg(long)]
        include_denied: bool,
    },
    /// Delete minion records entirely.
    Delete {
        /// Names to delete.
        names: Vec<String>,
        /// Delete every known minion.
        #[arg(long)]
        all: bool,
    },
    /// Print full key records.
    Print {
        /// Names to print.
        names: Vec<String>,
        /// Print every known minion.
        #[arg(long)]
        all: bool,
    },
}

fn require_targets(names: &[String], all: bool) -> Result<()> {
    if names.is_empty() && !all {
        bail!("specify minion names or --all");
    }
    Ok(())
}

/// Runs a key subcommand against the operator socket.
pub async fn run(client: &mut OperatorClient, command: KeyCommand) -> Result<()> {
    match command {
        KeyCommand::List { state } => {
            let response = client
                .request(OperatorRequest::ListMinions(ListMinionsRequest {
                    states: state,
                }))
                .await?;
            let OperatorResponse::ListMinions(list) = response else {
                bail!("unexpected response type");
            };
            for (label, names) in [
                ("unaccepted", &list.unaccepted),
                ("accepted", &list.accepted),
                ("auto_sign", &list.auto_sign),
                ("denied", &list.denied),
                ("rejected", &list.rejected),
            ] {
                println!("{label}:");
                for name in names {
                    println!("  {name}");
                }
            }
        }

        KeyCommand::Accept {
            names,
            all,
            include_rejected,
            include_denied,
        } => {
            require_targets(&names, all)?;
            let response = client
                .request(OperatorRequest::AcceptMinion(AcceptMinionRequest {
                    names,
                    all,
                    include_rejected,
                    include_denied,
                }))
                .await?;
            let OperatorResponse::AcceptMinion(rsp) = response else {
                bail!("unexpected response type");
            };
            for name in rsp.accepted {
                println!("accepted: {name}");
            }
        }

        KeyCommand::Reject {
            names,
            all,
            include_accepted,
            include_denied,
        } => {
            require_targets(&names, all)?;
            let response = client
                .request(OperatorRequest::RejectMinion(RejectMinionRequest {
                    names,
                    all,
                    include_accepted,
                    include_denied,
                }))
                .await?;
            let OperatorResponse::RejectMinion(rsp) = response else {
                bail!("unexpected response type");
            };
            for name in rsp.rejected {
                println!("rejected: {name}");
            }
        }

        KeyCommand::Delete { names, all } => {
            require_targets(&names, all)?;
            let response = client
                .request(OperatorRequest::DeleteMinion(DeleteMinionRequest {
                    names,
                    all,
                }))
                .await?;
            let OperatorResponse::DeleteMinion(rsp) = response else {
                bail!("unexpected response type");
            };
            for name in rsp.deleted {
                println!("deleted: {name}");
            }
        }

        KeyCommand::Print { names, all } => {
            require_targets(&names, all)?;
            let response = client
                .request(OperatorRequest::PrintMinion(PrintMinionRequest {
                    names,
                    all,
                }))
                .await?;
            let OperatorResponse::PrintMinion(rsp) = response else {
                bail!("unexpected response type");
            };
            for key in rsp.keys {
                let name = key
                    .minion
                    .as_ref()
                    .map(|m| m.name.clone())
                    .unwrap_or_default();
                println!("{name} [{}]", key.state);
                println!("{}", key.public_key);
            }
        }
    }
    Ok(())
}
