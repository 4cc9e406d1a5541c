//! `process_list` and `process_kill` handlers.

use crate::shell::run_shell;
use agent_proto::CommandResult;
use serde_json::{json, Value};

const PROCESS_LIST_TIMEOUT_MS: u64 = 10_000;

pub async fn handle_process_list() -> CommandResult {
    #[cfg(unix)]
    let command = "ps aux";
    #[cfg(windows)]
    let command = "tasklist /fo csv /nh";

    match run_shell(command, None, PROCESS_LIST_TIMEOUT_MS).await {
        Ok(out) if out.exit_code == Some(0) => CommandResult::success(json!(out.stdout)),
        Ok(out) => CommandResult::failure_with_data(
            out.stderr_or_exit_message(),
            json!(out.stdout),
        ),
        Err(e) => CommandResult::failure(e.to_string()),
    }
}

trait ShellOutputExt {
    fn stderr_or_exit_message(&self) -> String;
}

impl ShellOutputExt for crate::shell::ShellOutput {
    fn stderr_or_exit_message(&self) -> String {
        if !self.stderr.is_empty() {
            self.stderr.clone()
        } else {
            format!("Process exited with code {}", self.exit_code.unwrap_or(-1))
        }
    }
}

/// Parses a PID strictly: must be present and a positive integer — `0`,
/// negative, fractional, or non-numeric values are all rejected.
fn parse_pid(payload: &Value) -> Result<i64, String> {
    const INVALID: &str = "Invalid PID: must be a positive integer";
    match payload.get("pid") {
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                if i >= 1 {
                    Ok(i)
                } else {
                    Err(INVALID.to_string())
                }
            } else {
                Err(INVALID.to_string())
            }
        }
        _ => Err(INVALID.to_string()),
    }
}

pub async fn handle_process_kill(payload: &Value) -> CommandResult {
    let pid = match parse_pid(payload) {
        Ok(pid) => pid,
        Err(e) => return CommandResult::failure(e),
    };
    let signal_name = payload
        .get("signal")
        .and_then(|v| v.as_str())
        .unwrap_or("SIGTERM");

    if let Err(e) = agent_safety::validate_signal(signal_name) {
        return CommandResult::failure(e.to_string());
    }

    match send_signal(pid, signal_name) {
        Ok(()) => CommandResult::success_empty(),
        Err(e) => CommandResult::failure(e),
    }
}

#[cfg(unix)]
fn send_signal(pid: i64, signal_name: &str) -> Result<(), String> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = match signal_name {
        "SIGTERM" => Signal::SIGTERM,
        "SIGUSR1" => Signal::SIGUSR1,
        "SIGUSR2" => Signal::SIGUSR2,
        "SIGINT" => Signal::SIGINT,
        "SIGHUP" => Signal::SIGHUP,
        _ => return Err("Signal not allowed".to_string()),
    };
    kill(Pid::from_raw(pid as i32), signal).map_err(|e| e.to_string())
}

#[cfg(not(unix))]
fn send_signal(_pid: i64, _signal_name: &str) -> Result<(), String> {
    Err("process signalling is not supported on this platform".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_negative_fractional_and_string_pids() {
        for bad in [json!(0), json!(-1), json!(1.5), json!("abc"), Value::Null] {
            let payload = json!({"pid": bad});
            assert!(parse_pid(&payload).is_err());
        }
    }

    #[test]
    fn accepts_positive_integer_pid() {
        assert_eq!(parse_pid(&json!({"pid": 42})), Ok(42));
    }

    #[tokio::test]
    async fn rejects_disallowed_signal() {
        let result = handle_process_kill(&json!({"pid": 1, "signal": "SIGKILL"})).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap(), "Signal not allowed");
    }

    #[tokio::test]
    async fn process_list_returns_output() {
        let result = handle_process_list().await;
        assert!(result.success);
    }
}
