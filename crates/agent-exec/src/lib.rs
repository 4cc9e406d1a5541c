//! Dispatches a typed [`Command`] to its shell / file / process / chat
//! handler. Every handler returns a [`CommandResult`] — no error ever
//! propagates out of [`dispatch`]; safety and execution failures are
//! folded into `success: false` at the point they occur.

#![forbid(unsafe_code)]

mod files;
mod process;
mod shell;

use agent_proto::{Command, CommandResult, CommandType};
use async_trait::async_trait;
use serde_json::Value;
use shell::{run_shell, ShellError};
use std::path::PathBuf;

const MIN_TIMEOUT_MS: u64 = 1;
const MAX_TIMEOUT_MS: u64 = 600_000;
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Callbacks the project runtime supplies for commands that need more
/// context than the executor owns: `chat` needs the active chat backend
/// and conversation history; `setup`/`config_sync` are pure forwards.
#[async_trait]
pub trait ExecutorHooks: Send + Sync {
    async fn chat(&self, command_id: &str, payload: Value) -> CommandResult;
    async fn setup(&self, payload: Value) -> CommandResult;
    async fn config_sync(&self, payload: Value) -> CommandResult;
}

pub async fn dispatch(command: &Command, hooks: &dyn ExecutorHooks) -> CommandResult {
    match command.kind {
        CommandType::ExecuteCommand => handle_execute_command(&command.payload).await,
        CommandType::FileRead => files::handle_file_read(&command.payload).await,
        CommandType::FileWrite => files::handle_file_write(&command.payload).await,
        CommandType::FileList => files::handle_file_list(&command.payload).await,
        CommandType::ProcessList => process::handle_process_list().await,
        CommandType::ProcessKill => process::handle_process_kill(&command.payload).await,
        CommandType::Chat => hooks.chat(&command.command_id, command.payload.clone()).await,
        CommandType::Setup => hooks.setup(command.payload.clone()).await,
        CommandType::ConfigSync => hooks.config_sync(command.payload.clone()).await,
    }
}

fn parse_timeout(payload: &Value) -> Result<u64, String> {
    match payload.get("timeout") {
        None => Ok(DEFAULT_TIMEOUT_MS),
        Some(v) => {
            let ms = v
                .as_i64()
                .ok_or_else(|| "Timeout must be between 1 and 600000ms".to_string())?;
            if ms < MIN_TIMEOUT_MS as i64 || ms > MAX_TIMEOUT_MS as i64 {
                Err("Timeout must be between 1 and 600000ms".to_string())
            } else {
                Ok(ms as u64)
            }
        }
    }
}

async fn handle_execute_command(payload: &Value) -> CommandResult {
    let command = match payload.get("command").and_then(|v| v.as_str()) {
        Some(c) if !c.is_empty() => c,
        _ => return CommandResult::failure("No command specified"),
    };

    let timeout_ms = match parse_timeout(payload) {
        Ok(ms) => ms,
        Err(e) => return CommandResult::failure(e),
    };

    if let Err(e) = agent_safety::validate_command(command) {
        return CommandResult::failure(e.to_string());
    }

    let cwd: Option<PathBuf> = match payload.get("cwd").and_then(|v| v.as_str()) {
        Some(raw) => match agent_safety::validate_path(raw) {
            Ok(p) => Some(p),
            Err(e) => return CommandResult::failure(e.to_string()),
        },
        None => None,
    };

    match run_shell(command, cwd.as_deref(), timeout_ms).await {
        Ok(out) if out.exit_code == Some(0) => CommandResult::success(serde_json::json!(out.stdout)),
        Ok(out) => {
            let error = if !out.stderr.is_empty() {
                out.stderr
            } else {
                format!("Process exited with code {}", out.exit_code.unwrap_or(-1))
            };
            CommandResult::failure_with_data(error, serde_json::json!(out.stdout))
        }
        Err(ShellError::TimedOut(ms)) => CommandResult::failure(format!("Command timed out after {ms}ms")),
        Err(e) => CommandResult::failure(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHooks;

    #[async_trait]
    impl ExecutorHooks for NoopHooks {
        async fn chat(&self, _command_id: &str, _payload: Value) -> CommandResult {
            CommandResult::success_empty()
        }
        async fn setup(&self, _payload: Value) -> CommandResult {
            CommandResult::success_empty()
        }
        async fn config_sync(&self, _payload: Value) -> CommandResult {
            CommandResult::success_empty()
        }
    }

    #[tokio::test]
    async fn dispatches_execute_command() {
        let command = Command {
            command_id: "c1".into(),
            kind: CommandType::ExecuteCommand,
            payload: serde_json::json!({"command": "echo hi"}),
        };
        let result = dispatch(&command, &NoopHooks).await;
        assert!(result.success);
        assert_eq!(result.data, Some(serde_json::json!("hi\n")));
    }

    #[tokio::test]
    async fn execute_command_denies_dangerous_pattern() {
        let command = Command {
            command_id: "c2".into(),
            kind: CommandType::ExecuteCommand,
            payload: serde_json::json!({"command": "rm -rf /"}),
        };
        let result = dispatch(&command, &NoopHooks).await;
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("Blocked dangerous command pattern"));
    }

    #[tokio::test]
    async fn execute_command_rejects_out_of_range_timeout() {
        let command = Command {
            command_id: "c3".into(),
            kind: CommandType::ExecuteCommand,
            payload: serde_json::json!({"command": "echo hi", "timeout": 700_000}),
        };
        let result = dispatch(&command, &NoopHooks).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap(), "Timeout must be between 1 and 600000ms");
    }

    #[tokio::test]
    async fn missing_command_field_is_rejected() {
        let command = Command {
            command_id: "c4".into(),
            kind: CommandType::ExecuteCommand,
            payload: serde_json::json!({}),
        };
        let result = dispatch(&command, &NoopHooks).await;
        assert_eq!(result.error.unwrap(), "No command specified");
    }

    #[tokio::test]
    async fn setup_and_config_sync_forward_to_hooks() {
        let setup = Command {
            command_id: "c5".into(),
            kind: CommandType::Setup,
            payload: serde_json::json!({}),
        };
        assert!(dispatch(&setup, &NoopHooks).await.success);

        let sync = Command {
            command_id: "c6".into(),
            kind: CommandType::ConfigSync,
            payload: serde_json::json!({}),
        };
        assert!(dispatch(&sync, &NoopHooks).await.success);
    }
}
