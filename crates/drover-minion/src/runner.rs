//! Shell execution of dispatched calls.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use drover_core::{CallRequest, CallResponse, ResultType};

/// Runs `/bin/bash -c "<function> <args...>"` under the call deadline
/// and captures the combined output.
///
/// A clean exit yields `Ok` with the output (trailing newline trimmed);
/// a non-zero exit or spawn failure yields `Error` with the output in
/// the error text; a fired deadline kills the child and yields `Error`.
pub async fn run_command(call: &CallRequest) -> CallResponse {
    let mut shell = call.function.clone();
    for arg in &call.args {
        shell.push(' ');
        shell.push_str(arg);
    }

    #[allow(clippy::cast_sign_loss)] // effective_timeout() is ≥ 1
    let deadline = Duration::from_secs(call.effective_timeout() as u64);

    let mut command = Command::new("/bin/bash");
    command
        .arg("-c")
        .arg(&shell)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut response = CallResponse {
        id: call.id,
        ..CallResponse::default()
    };

    match timeout(deadline, command.output()).await {
        Err(_) => {
            response.result_type = ResultType::Error;
            response.ret_code = -1;
            response.error = format!("command timed out after {}s", deadline.as_secs());
        }
        Ok(Err(e)) => {
            response.result_type = ResultType::Error;
            response.ret_code = -1;
            response.error = format!("spawn /bin/bash: {e}");
        }
        Ok(Ok(output)) => {
            let mut combined = output.stdout;
            combined.extend_from_slice(&output.stderr);
            response.ret_code = output.status.code().unwrap_or(-1);
            if output.status.success() {
                if combined.last() == Some(&b'\n') {
                    combined.pop();
                }
                response.result_type = ResultType::Ok;
                response.result = combined;
            } else {
                response.result_type = ResultType::Error;
                response.error = String::from_utf8_lossy(&combined).into_owned();
            }
        }
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::SelectionOptions;

    fn call(function: &str, args: &[&str], timeout: i64) -> CallRequest {
        CallRequest {
            id: 1,
            function: function.to_string(),
            args: args.iter().map(|s| (*s).to_string()).collect(),
            timeout,
            options: SelectionOptions::parse("*").unwrap(),
        }
    }

    #[tokio::test]
    async fn echo_succeeds_with_trimmed_output() {
        let rsp = run_command(&call("echo", &["hi"], 5)).await;
        assert_eq!(rsp.result_type, ResultType::Ok);
        assert_eq!(rsp.ret_code, 0);
        assert_eq!(rsp.result, b"hi");
        assert!(rsp.error.is_empty());
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error_with_captured_output() {
        let rsp = run_command(&call("echo nope >&2; exit 3", &[], 5)).await;
        assert_eq!(rsp.result_type, ResultType::Error);
        assert_eq!(rsp.ret_code, 3);
        assert!(rsp.error.contains("nope"));
    }

    #[tokio::test]
    async fn deadline_kills_the_child() {
        let started = std::time::Instant::now();
        let rsp = run_command(&call("sleep", &["30"], 1)).await;
        assert_eq!(rsp.result_type, ResultType::Error);
        assert!(rsp.error.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
