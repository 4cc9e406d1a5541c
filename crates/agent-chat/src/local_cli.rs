//! Runs the chat turn through a local coding CLI subprocess (`claude`,
//! by default) and streams its stdout line by line as `delta` chunks.

use crate::{ChatBackend, ChatRequest, ChunkEmitter};
use agent_proto::{ChunkType, CommandResult};
use async_trait::async_trait;
use serde_json::json;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

const CLI_BINARY: &str = "claude";
const RUN_TIMEOUT: Duration = Duration::from_secs(120);
const GRACE_PERIOD: Duration = Duration::from_secs(5);

pub struct LocalCliBackend {
    binary: String,
}

impl LocalCliBackend {
    pub fn new() -> Self {
        Self { binary: CLI_BINARY.to_string() }
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Default for LocalCliBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalCliBackend {
    /// Bounded `--version` probe used by capability detection at runtime
    /// start-up; never returns an error, only whether the binary looks
    /// usable.
    pub async fn is_available(&self) -> bool {
        let probe = Command::new(&self.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        matches!(tokio::time::timeout(Duration::from_secs(5), probe).await, Ok(Ok(status)) if status.success())
    }
}

fn build_args(request: &ChatRequest) -> Vec<String> {
    let mut args = vec!["-p".to_string(), request.message.clone()];

    for tool in &request.allowed_tools {
        args.push("--allowedTools".to_string());
        args.push(tool.clone());
    }

    let home = dirs::home_dir();
    for dir in &request.add_dirs {
        let expanded = match (dir.strip_prefix("~/"), &home) {
            (Some(rest), Some(home)) => home.join(rest).to_string_lossy().into_owned(),
            _ => dir.clone(),
        };
        args.push("--add-dir".to_string());
        args.push(expanded);
    }

    if let Some(locale) = &request.locale {
        args.push("--append-system-prompt".to_string());
        args.push(format!("Respond in {locale}."));
    }

    if let Some(mcp_config) = &request.mcp_config_path {
        args.push("--mcp-config".to_string());
        args.push(mcp_config.clone());
    }

    args
}

/// Parent environment minus the coding CLI's own nested-invocation
/// markers, plus any AWS credentials the caller resolved for this
/// command.
fn build_clean_env(aws_env: &std::collections::HashMap<String, String>) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = std::env::vars()
        .filter(|(k, _)| {
            k != "CLAUDECODE" && !(k.starts_with("CLAUDE_CODE_") && k != "CLAUDE_CODE_OAUTH_TOKEN")
        })
        .collect();
    for (k, v) in aws_env {
        env.retain(|(ek, _)| ek != k);
        env.push((k.clone(), v.clone()));
    }
    env
}

#[async_trait]
impl ChatBackend for LocalCliBackend {
    async fn run(&self, request: &ChatRequest, emitter: &ChunkEmitter<'_>) -> CommandResult {
        let args = build_args(request);
        let mut command = Command::new(&self.binary);
        command
            .args(&args)
            .env_clear()
            .envs(build_clean_env(&request.aws_env))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let start = std::time::Instant::now();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let message = format!("CLI not found: {}", self.binary);
                emitter.emit(ChunkType::Error, message.clone()).await;
                return CommandResult::failure(message);
            }
            Err(e) => {
                let message = format!("Failed to spawn {}: {e}", self.binary);
                emitter.emit(ChunkType::Error, message.clone()).await;
                return CommandResult::failure(message);
            }
        };

        let stdout = child.stdout.take().expect("stdout piped");
        let mut stderr = child.stderr.take().expect("stderr piped");

        let stream_stdout = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut accumulated = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                accumulated.push_str(&line);
                accumulated.push('\n');
                emitter.emit(ChunkType::Delta, line).await;
            }
            accumulated
        };

        let drain_stderr = async {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        };

        let run = async { tokio::join!(stream_stdout, drain_stderr, child.wait()) };
        tokio::pin!(run);

        let (stdout_text, stderr_text, status) = match tokio::time::timeout(RUN_TIMEOUT, &mut run).await {
            Ok(result) => result,
            Err(_) => {
                let _ = child.start_kill();
                match tokio::time::timeout(GRACE_PERIOD, child.wait()).await {
                    Ok(_) => {}
                    Err(_) => {
                        let _ = child.kill().await;
                        let _ = child.wait().await;
                    }
                }
                let message = "Chat command timed out after 120000ms".to_string();
                emitter.emit(ChunkType::Error, message.clone()).await;
                return CommandResult::failure(message);
            }
        };

        let exit_code = status.ok().and_then(|s| s.code());
        let duration_ms = start.elapsed().as_millis() as u64;

        if exit_code == Some(0) {
            let data = json!({
                "text": stdout_text.trim_end(),
                "metadata": {
                    "args": redact_message(&args),
                    "exitCode": 0,
                    "hasStderr": !stderr_text.is_empty(),
                    "durationMs": duration_ms,
                }
            });
            emitter.emit(ChunkType::Done, data.to_string()).await;
            CommandResult::success(data)
        } else {
            let tail: String = stderr_text.lines().rev().take(20).collect::<Vec<_>>().join("\n");
            let message = if tail.is_empty() {
                format!("{} exited with code {:?}", self.binary, exit_code)
            } else {
                tail
            };
            emitter.emit(ChunkType::Error, message.clone()).await;
            CommandResult::failure(message)
        }
    }
}

/// Strips the message body out of the recorded args so the result's
/// metadata doesn't duplicate (potentially large) user content.
fn redact_message(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        out.push(arg.clone());
        if arg == "-p" {
            iter.next();
            out.push("<redacted>".to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_allowed_tools_and_add_dir_args() {
        let request = ChatRequest {
            allowed_tools: vec!["Bash".to_string(), "Read".to_string()],
            add_dirs: vec!["/tmp/proj".to_string()],
            message: "hi".to_string(),
            ..Default::default()
        };
        let args = build_args(&request);
        assert_eq!(args[0], "-p");
        assert_eq!(args[1], "hi");
        assert!(args.windows(2).any(|w| w == ["--allowedTools", "Bash"]));
        assert!(args.windows(2).any(|w| w == ["--allowedTools", "Read"]));
        assert!(args.windows(2).any(|w| w == ["--add-dir", "/tmp/proj"]));
    }

    #[test]
    fn redacts_message_body_from_recorded_args() {
        let args = vec!["-p".to_string(), "secret task details".to_string(), "--allowedTools".to_string(), "Bash".to_string()];
        let redacted = redact_message(&args);
        assert_eq!(redacted[1], "<redacted>");
        assert!(!redacted.contains(&"secret task details".to_string()));
    }

    #[test]
    fn clean_env_drops_claude_code_markers_except_oauth_token() {
        std::env::set_var("CLAUDECODE", "1");
        std::env::set_var("CLAUDE_CODE_ENTRYPOINT", "cli");
        std::env::set_var("CLAUDE_CODE_OAUTH_TOKEN", "tok");
        let env = build_clean_env(&std::collections::HashMap::new());
        assert!(!env.iter().any(|(k, _)| k == "CLAUDECODE"));
        assert!(!env.iter().any(|(k, _)| k == "CLAUDE_CODE_ENTRYPOINT"));
        assert!(env.iter().any(|(k, _)| k == "CLAUDE_CODE_OAUTH_TOKEN"));
        std::env::remove_var("CLAUDECODE");
        std::env::remove_var("CLAUDE_CODE_ENTRYPOINT");
        std::env::remove_var("CLAUDE_CODE_OAUTH_TOKEN");
    }

    #[tokio::test]
    async fn missing_binary_produces_not_found_error() {
        struct NullSink;
        #[async_trait]
        impl crate::ChunkSink for NullSink {
            async fn send(&self, _command_id: &str, _chunk: agent_proto::ChatChunk) {}
        }
        let sink = NullSink;
        let emitter = ChunkEmitter::new("c1", &sink);
        let backend = LocalCliBackend::with_binary("definitely-not-a-real-binary-xyz");
        let request = ChatRequest { message: "hi".to_string(), ..Default::default() };
        let result = backend.run(&request, &emitter).await;
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("CLI not found"));
    }

    #[tokio::test]
    async fn is_available_false_for_missing_binary() {
        let backend = LocalCliBackend::with_binary("definitely-not-a-real-binary-xyz");
        assert!(!backend.is_available().await);
    }
}
