//! The `call` subcommand: dispatch a command and print the report.

use anyhow::{bail, Result};
use clap::Args;

use drover_core::proto::{CallCommandRequest, OperatorRequest, OperatorResponse};

use crate::client::OperatorClient;

/// Dispatch a command to selected minions.
#[derive(Args, Debug)]
pub struct CallArgs {
    /// Target selection expression, e.g. `'*'` or `'G@os:linux and N@web'`.
    #[arg(short = 'C', long = "selection", default_value = "*")]
    pub selection: String,

    /// Call timeout in seconds (0 means the server default).
    #[arg(short, long, default_value_t = 0)]
    pub timeout: i64,

    /// Print the report as JSON instead of text.
    #[arg(long)]
    pub json: bool,

    /// Function (command) to run.
    pub function: String,

    /// Arguments for the function.
    #[arg(trailing_var_arg = true)]
    pub args: Vec<String>,
}

/// Runs a call and renders its report.
pub async fn run(client: &mut OperatorClient, args: CallArgs) -> Result<()> {
    let response = client
        .request(OperatorRequest::Call(CallCommandRequest {
            function: args.function,
            args: args.args,
            timeout: args.timeout,
            selection: args.selection,
        }))
        .await?;
    let OperatorResponse::Call(rsp) = response else {
        bail!("unexpected response type");
    };

    let report = rsp.report.unwrap_or_default();
    if args.json {
        let items: Vec<serde_json::Value> = report
            .items
            .iter()
            .map(|item| {
                serde_json::json!({
                    "minion": item.minion,
                    "result": item.result,
                    "data": String::from_utf8_lossy(&item.data),
                    "error": item.error,
                })
            })
            .collect();
        let doc = serde_json::json!({
            "total": report.total,
            "items": items,
            "error": rsp.error,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        for item in &report.items {
            if item.result {
                println!("{}:", item.minion);
                println!("    {}", String::from_utf8_lossy(&item.data));
            } else {
                println!("{}: [failed] {}", item.minion, item.error);
            }
        }
    }

    if !rsp.error.is_empty() {
        bail!("call incomplete ({}): {}", rsp.error_kind, rsp.error);
    }
    Ok(())
}
