//! Wire types shared between the project runtime, the control-plane client
//! and the realtime subscriber.
//!
//! Command payloads are kept as raw [`serde_json::Value`] rather than a
//! per-variant typed struct: each executor coerces its own required fields
//! (string-or-null, int-or-null) at the point of use, so no shared payload
//! type needs to leak across crate boundaries.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod logging;

// ─── Project registration & agent configuration ───────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRegistration {
    pub project_code: String,
    pub token: String,
    #[serde(rename = "apiURL")]
    pub api_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfiguration {
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<DateTime<Utc>>,
    pub projects: Vec<ProjectRegistration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_update: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_project_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_chat_mode: Option<String>,
}

/// Root-level `{token, apiUrl}` shape with no `projects` array — the
/// pre-multi-project config format. Detected and migrated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyAgentConfiguration {
    pub token: String,
    pub api_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

pub const LEGACY_PROJECT_CODE: &str = "default";

// ─── Server-side project config snapshot ───────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    pub config_hash: String,
    pub project: ProjectInfo,
    pub agent: AgentSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub databases: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documentation: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    pub project_code: String,
    pub name: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSection {
    pub agent_enabled: bool,
    pub builtin_agent_enabled: bool,
    pub builtin_fallback_enabled: bool,
    pub external_agent_enabled: bool,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claude_code_config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsSection {
    #[serde(default)]
    pub accounts: Vec<AwsAccount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cli: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsAccount {
    pub account_id: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ─── Commands ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    ExecuteCommand,
    FileRead,
    FileWrite,
    FileList,
    ProcessList,
    ProcessKill,
    Chat,
    Setup,
    ConfigSync,
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self).unwrap_or_default();
        write!(f, "{}", s.as_str().unwrap_or("unknown"))
    }
}

/// A command summary as returned by `GET /commands/pending` — the type is
/// known but the payload has not been fetched yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSummary {
    pub command_id: String,
    #[serde(rename = "type")]
    pub kind: CommandType,
}

/// Full command detail as returned by `GET /commands/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub command_id: String,
    #[serde(rename = "type")]
    pub kind: CommandType,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Result of executing one command. Never carries a Rust `Err` across an
/// API boundary — failures are folded into `success: false` here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    pub fn success(data: impl Into<serde_json::Value>) -> Self {
        Self {
            success: true,
            data: Some(data.into()),
            error: None,
        }
    }

    pub fn success_empty() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn failure_with_data(error: impl Into<String>, data: impl Into<serde_json::Value>) -> Self {
        Self {
            success: false,
            data: Some(data.into()),
            error: Some(error.into()),
        }
    }
}

// ─── Chat chunks ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Delta,
    ToolCall,
    ToolResult,
    Done,
    Error,
    System,
}

impl ChunkType {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChunkType::Done | ChunkType::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChunk {
    pub index: u64,
    #[serde(rename = "type")]
    pub kind: ChunkType,
    pub content: String,
}

// ─── Realtime notifications ─────────────────────────────────────────────────

pub const NOTIFICATION_AGENT_COMMAND: &str = "agent-command";
pub const NOTIFICATION_CONFIG_UPDATE: &str = "config-update";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub table: String,
    pub pk: String,
    pub sk: String,
    pub tenant_code: String,
    pub action: String,
    pub content: serde_json::Value,
}

impl Notification {
    /// Whether this notification is one the runtime acts on; all other
    /// actions are ignored.
    pub fn is_actionable(&self) -> bool {
        matches!(
            self.action.as_str(),
            NOTIFICATION_AGENT_COMMAND | NOTIFICATION_CONFIG_UPDATE
        )
    }

    pub fn command_id(&self) -> Option<&str> {
        if self.action != NOTIFICATION_AGENT_COMMAND {
            return None;
        }
        self.content.get("commandId").and_then(|v| v.as_str())
    }
}

// ─── Registration / heartbeat wire shapes ──────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    Polling,
    Realtime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub project_code: String,
    pub hostname: String,
    pub agent_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeConnectionInfo {
    pub endpoint: String,
    pub api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub agent_id: String,
    pub transport_mode: TransportMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realtime: Option<RealtimeConnectionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub project_code: String,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub system_info: serde_json::Value,
    pub available_chat_modes: Vec<String>,
    pub active_chat_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatusRequest {
    pub project_code: String,
    pub connected: bool,
    pub transport: TransportMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsCredentialsResponse {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_registration_uses_api_url_exact_casing() {
        let reg = ProjectRegistration {
            project_code: "p1".into(),
            token: "t".into(),
            api_url: "http://s".into(),
            project_dir: None,
        };
        let json = serde_json::to_string(&reg).expect("serialize");
        assert!(json.contains("\"apiURL\":\"http://s\""));
        assert!(!json.contains("projectDir"));
    }

    #[test]
    fn command_type_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(CommandType::ExecuteCommand).unwrap(),
            serde_json::json!("execute_command")
        );
        assert_eq!(CommandType::FileRead.to_string(), "file_read");
    }

    #[test]
    fn command_result_omits_absent_fields() {
        let ok = CommandResult::success(serde_json::json!("hi\n"));
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json, serde_json::json!({"success": true, "data": "hi\n"}));

        let err = CommandResult::failure("boom");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json, serde_json::json!({"success": false, "error": "boom"}));
    }

    #[test]
    fn notification_only_acts_on_known_actions() {
        let n = Notification {
            id: "1".into(),
            table: "t".into(),
            pk: "pk".into(),
            sk: "sk".into(),
            tenant_code: "tc".into(),
            action: "agent-command".into(),
            content: serde_json::json!({"commandId": "c1"}),
        };
        assert!(n.is_actionable());
        assert_eq!(n.command_id(), Some("c1"));

        let ignored = Notification {
            action: "something-else".into(),
            ..n
        };
        assert!(!ignored.is_actionable());
    }

    #[test]
    fn chunk_type_terminal() {
        assert!(ChunkType::Done.is_terminal());
        assert!(ChunkType::Error.is_terminal());
        assert!(!ChunkType::Delta.is_terminal());
    }

    #[test]
    fn register_response_roundtrips() {
        let resp = RegisterResponse {
            agent_id: "a".into(),
            transport_mode: TransportMode::Realtime,
            realtime: Some(RealtimeConnectionInfo {
                endpoint: "wss://x/realtime".into(),
                api_key: "key".into(),
                tenant_code: Some("p1".into()),
            }),
            config_hash: Some("h1".into()),
        };
        let json = serde_json::to_string(&resp).unwrap();
        let back: RegisterResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.agent_id, "a");
        assert_eq!(back.transport_mode, TransportMode::Realtime);
    }
}
