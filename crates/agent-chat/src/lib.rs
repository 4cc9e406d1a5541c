//! Streaming chat pipeline. A chat command produces an ordered chunk
//! stream delivered through a [`ChunkSink`] (the control-plane client's
//! chunk-submission endpoint, in production) plus a final
//! [`agent_proto::CommandResult`] for the owning command.

#![forbid(unsafe_code)]

mod local_cli;
mod remote_api;
mod sse;

pub use local_cli::LocalCliBackend;
pub use remote_api::RemoteApiBackend;

use agent_proto::{ChatChunk, ChunkType, CommandResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Receives chunks as they are produced. Submission failures are the
/// sink's concern to log and swallow — fire-and-forget, so one lost
/// chunk never aborts the stream.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn send(&self, command_id: &str, chunk: ChatChunk);
}

/// Per-command monotonic chunk counter, starting at 0, incremented after
/// each emission.
pub struct ChunkEmitter<'a> {
    command_id: String,
    sink: &'a dyn ChunkSink,
    next_index: AtomicU64,
}

impl<'a> ChunkEmitter<'a> {
    pub fn new(command_id: impl Into<String>, sink: &'a dyn ChunkSink) -> Self {
        Self {
            command_id: command_id.into(),
            sink,
            next_index: AtomicU64::new(0),
        }
    }

    pub async fn emit(&self, kind: ChunkType, content: impl Into<String>) {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        self.sink
            .send(&self.command_id, ChatChunk { index, kind, content: content.into() })
            .await;
    }
}

#[derive(Debug, Clone)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

/// Everything a backend needs to run one chat turn.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub agent_id: String,
    pub message: String,
    pub history: Vec<HistoryMessage>,
    pub system: Option<String>,
    pub locale: Option<String>,
    pub allowed_tools: Vec<String>,
    pub add_dirs: Vec<String>,
    pub mcp_config_path: Option<String>,
    pub aws_env: HashMap<String, String>,
}

/// The project-config-derived half of a chat dispatch: tools, directories,
/// MCP config path and AWS credential overlay, all of which come from the
/// synced project config rather than the per-command payload (§4.6 step 6).
#[derive(Debug, Clone, Default)]
pub struct ChatDefaults {
    pub allowed_tools: Vec<String>,
    pub add_dirs: Vec<String>,
    pub mcp_config_path: Option<String>,
    pub aws_env: HashMap<String, String>,
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn run(&self, request: &ChatRequest, emitter: &ChunkEmitter<'_>) -> CommandResult;
}

/// Parses the command payload, enforces the two required-field checks
/// common to both backends, and runs the selected backend. `active_mode`
/// of `"api"` selects the remote API backend; anything else selects the
/// local CLI backend (§4.3 dispatch rule).
pub async fn dispatch_chat(
    command_id: &str,
    payload: &serde_json::Value,
    active_mode: &str,
    defaults: &ChatDefaults,
    local_backend: &dyn ChatBackend,
    api_backend: Option<&dyn ChatBackend>,
    sink: &dyn ChunkSink,
) -> CommandResult {
    let agent_id = match payload.get("agentId").and_then(|v| v.as_str()) {
        Some(id) if !id.is_empty() => id,
        _ => return CommandResult::failure("agentId is required for chat command"),
    };
    let message = match payload.get("message").and_then(|v| v.as_str()) {
        Some(m) if !m.is_empty() => m,
        _ => return CommandResult::failure("message is required"),
    };

    let history = payload
        .get("history")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|m| {
                    let role = m.get("role").and_then(|v| v.as_str())?;
                    let content = m.get("content").and_then(|v| v.as_str())?.to_string();
                    let role = if role == "assistant" { "assistant" } else { "user" };
                    Some(HistoryMessage { role: role.to_string(), content })
                })
                .collect()
        })
        .unwrap_or_default();

    let request = ChatRequest {
        agent_id: agent_id.to_string(),
        message: message.to_string(),
        history,
        system: payload.get("system").and_then(|v| v.as_str()).map(str::to_string),
        locale: payload.get("locale").and_then(|v| v.as_str()).map(str::to_string),
        allowed_tools: defaults.allowed_tools.clone(),
        add_dirs: defaults.add_dirs.clone(),
        mcp_config_path: defaults.mcp_config_path.clone(),
        aws_env: defaults.aws_env.clone(),
    };

    let emitter = ChunkEmitter::new(command_id, sink);

    if active_mode == "api" {
        match api_backend {
            Some(backend) => backend.run(&request, &emitter).await,
            None => CommandResult::failure("ANTHROPIC_API_KEY is not configured for this agent"),
        }
    } else {
        local_backend.run(&request, &emitter).await
    }
}
