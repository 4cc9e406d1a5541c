//! One project's lifecycle: capability probe, registration, transport
//! selection, the poll/heartbeat timers, per-command dispatch and the
//! debounced config resync.
//!
//! Shared mutable state (cached config hash, active chat mode, the last
//! applied project config) lives behind an `Arc<RwLock<_>>`, the same
//! shape the teacher uses for its fleet state, with entirely different
//! contents.

#![forbid(unsafe_code)]

use agent_chat::{dispatch_chat, ChatBackend, ChatDefaults, ChunkSink, LocalCliBackend, RemoteApiBackend};
use agent_config::ProjectConfigCache;
use agent_exec::ExecutorHooks;
use agent_proto::{
    ChatChunk, CommandResult, ConnectionStatusRequest, HeartbeatRequest, Notification,
    ProjectConfig, RegisterRequest, TransportMode, NOTIFICATION_AGENT_COMMAND,
    NOTIFICATION_CONFIG_UPDATE,
};
use async_trait::async_trait;
use control_client::ControlClient;
use realtime_client::{RealtimeClient, RealtimeEvent};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};

const MIN_INTERVAL_MS: u64 = 1_000;
const MAX_INTERVAL_MS: u64 = 300_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 3_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 60_000;
const CONFIG_DEBOUNCE: Duration = Duration::from_secs(2);
const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

fn clamp_interval(ms: u64) -> u64 {
    ms.clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS)
}

/// Static configuration for one project runtime, fixed for its lifetime.
pub struct RuntimeConfig {
    pub project_code: String,
    pub token: String,
    pub api_url: String,
    pub agent_version: String,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// `agentChatMode` from local config, if the operator pinned one.
    pub preferred_chat_mode: Option<String>,
}

impl RuntimeConfig {
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(clamp_interval(self.poll_interval_ms))
    }

    fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(clamp_interval(self.heartbeat_interval_ms))
    }
}

#[derive(Default)]
struct RuntimeState {
    active_chat_mode: String,
    available_chat_modes: Vec<String>,
    config_hash: Option<String>,
    project_config: Option<ProjectConfig>,
    /// Environment overlay built from the synced project config's AWS
    /// account(s), applied to subsequent chat dispatches.
    aws_env: HashMap<String, String>,
}

pub struct ProjectRuntime {
    config: RuntimeConfig,
    client: ControlClient,
    cache: ProjectConfigCache,
    local_backend: LocalCliBackend,
    api_backend: Option<RemoteApiBackend>,
    state: Arc<RwLock<RuntimeState>>,
}

impl ProjectRuntime {
    pub fn new(config: RuntimeConfig, config_dir: &Path) -> Self {
        let client = ControlClient::new(config.api_url.clone(), config.token.clone());
        let cache = ProjectConfigCache::new(config_dir);
        let api_backend = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .map(|key| RemoteApiBackend::new(ANTHROPIC_API_URL, key));
        Self {
            config,
            client,
            cache,
            local_backend: LocalCliBackend::new(),
            api_backend,
            state: Arc::new(RwLock::new(RuntimeState::default())),
        }
    }

    pub fn project_code(&self) -> &str {
        &self.config.project_code
    }

    /// Spawns the runtime's dispatch loop and returns a handle that stops
    /// it cleanly.
    pub fn start(self) -> RuntimeHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let join = tokio::spawn(run(self, stop_rx));
        RuntimeHandle { stop_tx: Some(stop_tx), join }
    }
}

pub struct RuntimeHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    join: tokio::task::JoinHandle<()>,
}

impl RuntimeHandle {
    /// Signals the loop to stop and waits for it to unwind.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.join.await;
    }
}

/// Chooses the active mode: the operator's pinned preference if it is
/// among the detected modes, else the first detected mode (local
/// preferred over API, per the detection order), else a hard default.
fn select_active_mode(available: &[String], preferred: Option<&str>) -> String {
    if let Some(p) = preferred {
        if available.iter().any(|m| m == p) {
            return p.to_string();
        }
    }
    available.first().cloned().unwrap_or_else(|| "claude_code".to_string())
}

async fn probe_chat_modes(local_backend: &LocalCliBackend, api_backend_present: bool) -> Vec<String> {
    let mut modes = Vec::new();
    if local_backend.is_available().await {
        modes.push("claude_code".to_string());
    }
    if api_backend_present {
        modes.push("api".to_string());
    }
    modes
}

fn hostname_string() -> String {
    hostname::get().map(|h| h.to_string_lossy().to_string()).unwrap_or_else(|_| "unknown".to_string())
}

fn system_info_json() -> serde_json::Value {
    use sysinfo::System;
    let mut sys = System::new_all();
    sys.refresh_all();
    serde_json::json!({
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "cpuCount": sys.cpus().len(),
        "totalMemoryBytes": sys.total_memory(),
        "usedMemoryBytes": sys.used_memory(),
    })
}

/// Builds the tools/dirs/MCP-config/AWS-env half of a chat dispatch from
/// the last-synced project config and credential overlay (§4.6 step 6).
/// `claude_code_config`'s `addDirs`/`mcpConfigPath` fields follow the
/// wire's general camelCase convention; neither is defined further by the
/// server-side config schema beyond naming the section.
fn chat_defaults_from_state(state: &RuntimeState) -> ChatDefaults {
    let Some(config) = &state.project_config else {
        return ChatDefaults::default();
    };
    let claude_code_config = config.agent.claude_code_config.as_ref();
    let add_dirs = claude_code_config
        .and_then(|v| v.get("addDirs"))
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    let mcp_config_path = claude_code_config
        .and_then(|v| v.get("mcpConfigPath"))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    ChatDefaults {
        allowed_tools: config.agent.allowed_tools.clone(),
        add_dirs,
        mcp_config_path,
        aws_env: state.aws_env.clone(),
    }
}

/// Fetches credentials for the first configured AWS account (if any) and
/// builds the environment overlay the chat subprocess is run with. A
/// project config with more than one account only overlays the first —
/// the control plane names a single "selected" account per project in
/// every example payload seen, and `ChatRequest::aws_env` carries one
/// flat map, not an account-keyed one.
async fn fetch_aws_env(client: &ControlClient, config: &ProjectConfig) -> HashMap<String, String> {
    let Some(account) = config.aws.as_ref().and_then(|aws| aws.accounts.first()) else {
        return HashMap::new();
    };
    match client.aws_credentials(&account.account_id).await {
        Ok(creds) => {
            let mut env = HashMap::new();
            env.insert("AWS_ACCESS_KEY_ID".to_string(), creds.access_key_id);
            env.insert("AWS_SECRET_ACCESS_KEY".to_string(), creds.secret_access_key);
            if let Some(token) = creds.session_token {
                env.insert("AWS_SESSION_TOKEN".to_string(), token);
            }
            env
        }
        Err(e) => {
            warn!(account_id = %account.account_id, error = %e, "failed to fetch aws credentials");
            HashMap::new()
        }
    }
}

struct ChunkSubmitter<'a> {
    client: &'a ControlClient,
}

#[async_trait]
impl ChunkSink for ChunkSubmitter<'_> {
    async fn send(&self, command_id: &str, chunk: ChatChunk) {
        if let Err(e) = self.client.submit_chunk(command_id, &chunk).await {
            warn!(command_id, error = %e, "failed to submit chat chunk");
        }
    }
}

/// Bridges the executor's generic hooks to this runtime's chat backends
/// and shared state. `config_sync` only raises a flag the dispatch loop
/// polls after each command, since the actual resync timer lives there.
struct RuntimeHooks<'a> {
    client: &'a ControlClient,
    local_backend: &'a LocalCliBackend,
    api_backend: Option<&'a RemoteApiBackend>,
    state: &'a Arc<RwLock<RuntimeState>>,
    resync_requested: &'a AtomicBool,
}

#[async_trait]
impl ExecutorHooks for RuntimeHooks<'_> {
    async fn chat(&self, command_id: &str, payload: serde_json::Value) -> CommandResult {
        let (active_mode, defaults) = {
            let s = self.state.read().await;
            (s.active_chat_mode.clone(), chat_defaults_from_state(&s))
        };
        let sink = ChunkSubmitter { client: self.client };
        dispatch_chat(
            command_id,
            &payload,
            &active_mode,
            &defaults,
            self.local_backend,
            self.api_backend.map(|b| b as &dyn ChatBackend),
            &sink,
        )
        .await
    }

    async fn setup(&self, _payload: serde_json::Value) -> CommandResult {
        let available = probe_chat_modes(self.local_backend, self.api_backend.is_some()).await;
        let mut state = self.state.write().await;
        let preferred = state.active_chat_mode.clone();
        state.active_chat_mode = select_active_mode(&available, Some(&preferred));
        state.available_chat_modes = available;
        CommandResult::success_empty()
    }

    async fn config_sync(&self, _payload: serde_json::Value) -> CommandResult {
        self.resync_requested.store(true, Ordering::SeqCst);
        CommandResult::success_empty()
    }
}

async fn process_command_id(command_id: &str, client: &ControlClient, hooks: &RuntimeHooks<'_>) {
    let result = match client.fetch_command(command_id).await {
        Ok(command) => agent_exec::dispatch(&command, hooks).await,
        Err(e) => CommandResult::failure(format!("failed to fetch command: {e}")),
    };
    if let Err(e) = client.submit_result(command_id, &result).await {
        warn!(command_id, error = %e, "failed to submit command result");
    }
}

async fn poll_once(client: &ControlClient, hooks: &RuntimeHooks<'_>) {
    let pending = match client.pending_commands().await {
        Ok(list) => list,
        Err(e) => {
            warn!(error = %e, "failed to fetch pending commands");
            return;
        }
    };
    for summary in pending {
        process_command_id(&summary.command_id, client, hooks).await;
    }
}

async fn handle_notification(
    notification: Notification,
    client: &ControlClient,
    hooks: &RuntimeHooks<'_>,
    resync_deadline: &mut Option<Instant>,
) {
    if !notification.is_actionable() {
        return;
    }
    match notification.action.as_str() {
        NOTIFICATION_AGENT_COMMAND => {
            if let Some(command_id) = notification.command_id() {
                process_command_id(command_id, client, hooks).await;
            }
        }
        NOTIFICATION_CONFIG_UPDATE => {
            *resync_deadline = Some(Instant::now() + CONFIG_DEBOUNCE);
        }
        _ => {}
    }
}

/// Fetches `GET /project-config`, and on a hash change applies it to the
/// shared state and writes it back to the per-project cache.
async fn sync_project_config(
    client: &ControlClient,
    cache: &ProjectConfigCache,
    project_code: &str,
    state: &Arc<RwLock<RuntimeState>>,
) {
    let config = match client.project_config().await {
        Ok(c) => c,
        Err(e) => {
            warn!(project_code, error = %e, "project config sync failed");
            return;
        }
    };
    let unchanged = cache.cached_hash(project_code).as_deref() == Some(config.config_hash.as_str());
    if !unchanged {
        cache.put(project_code, &config);
    }
    let aws_env = fetch_aws_env(client, &config).await;

    let mut s = state.write().await;
    s.config_hash = Some(config.config_hash.clone());
    s.aws_env = aws_env;
    s.project_config = Some(config);
}

async fn send_heartbeat(
    client: &ControlClient,
    project_code: &str,
    agent_id: &str,
    state: &Arc<RwLock<RuntimeState>>,
) -> bool {
    let (active_mode, available_modes) = {
        let s = state.read().await;
        (s.active_chat_mode.clone(), s.available_chat_modes.clone())
    };
    let request = HeartbeatRequest {
        project_code: project_code.to_string(),
        agent_id: agent_id.to_string(),
        ip: None,
        system_info: system_info_json(),
        available_chat_modes: available_modes,
        active_chat_mode: active_mode,
    };
    match client.heartbeat(&request).await {
        Ok(resp) => match resp.config_hash {
            Some(hash) => {
                let mut s = state.write().await;
                let changed = s.config_hash.as_deref() != Some(hash.as_str());
                s.config_hash = Some(hash);
                changed
            }
            None => false,
        },
        Err(e) => {
            warn!(project_code, error = %e, "heartbeat failed");
            false
        }
    }
}

async fn report_connection_status(client: &ControlClient, project_code: &str, connected: bool, transport: TransportMode) {
    let request = ConnectionStatusRequest { project_code: project_code.to_string(), connected, transport };
    if let Err(e) = client.connection_status(&request).await {
        warn!(project_code, error = %e, "failed to report connection status");
    }
}

/// Resolves to the next realtime event, or never, when there is no
/// subscriber — keeps the `tokio::select!` loop shape uniform whether or
/// not realtime transport is active.
async fn recv_realtime(rx: &mut Option<tokio::sync::mpsc::UnboundedReceiver<RealtimeEvent>>) -> Option<RealtimeEvent> {
    match rx {
        Some(r) => r.recv().await,
        None => std::future::pending().await,
    }
}

async fn run(runtime: ProjectRuntime, mut stop_rx: oneshot::Receiver<()>) {
    let ProjectRuntime { config, client, cache, local_backend, api_backend, state } = runtime;

    let available = probe_chat_modes(&local_backend, api_backend.is_some()).await;
    let active = select_active_mode(&available, config.preferred_chat_mode.as_deref());
    {
        let mut s = state.write().await;
        s.available_chat_modes = available;
        s.active_chat_mode = active;
    }

    let register_request = RegisterRequest {
        project_code: config.project_code.clone(),
        hostname: hostname_string(),
        agent_version: config.agent_version.clone(),
    };
    let registration = match client.register(&register_request).await {
        Ok(r) => r,
        Err(e) => {
            warn!(project_code = %config.project_code, error = %e, "registration failed, stopping runtime");
            return;
        }
    };
    info!(
        project_code = %config.project_code,
        agent_id = %registration.agent_id,
        transport = ?registration.transport_mode,
        "registered"
    );

    let mut subscriber: Option<RealtimeClient> = None;
    let mut realtime_events: Option<tokio::sync::mpsc::UnboundedReceiver<RealtimeEvent>> = None;
    let mut polling = true;
    let mut active_transport = TransportMode::Polling;

    if registration.transport_mode == TransportMode::Realtime {
        if let Some(realtime_info) = &registration.realtime {
            let (handle, rx) = RealtimeClient::start(realtime_info.endpoint.clone(), realtime_info.api_key.clone());
            let tenant = realtime_info.tenant_code.clone().unwrap_or_else(|| config.project_code.clone());
            handle.subscribe(tenant);
            subscriber = Some(handle);
            realtime_events = Some(rx);
            polling = false;
            active_transport = TransportMode::Realtime;
        } else {
            warn!(project_code = %config.project_code, "realtime advertised with no endpoint, falling back to polling");
        }
    }
    report_connection_status(&client, &config.project_code, true, active_transport).await;

    if let Some(hash) = registration.config_hash {
        state.write().await.config_hash = Some(hash);
    }
    sync_project_config(&client, &cache, &config.project_code, &state).await;

    let mut poll_timer = tokio::time::interval(config.poll_interval());
    poll_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut heartbeat_timer = tokio::time::interval(config.heartbeat_interval());
    heartbeat_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut resync_deadline: Option<Instant> = None;
    let resync_requested = AtomicBool::new(false);
    let hooks = RuntimeHooks {
        client: &client,
        local_backend: &local_backend,
        api_backend: api_backend.as_ref(),
        state: &state,
        resync_requested: &resync_requested,
    };

    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                break;
            }
            // The loop awaits each tick's work to completion before
            // returning to `select!`, so ticks for the same timer can
            // never run concurrently — single-flight falls out of the
            // architecture rather than needing an explicit guard.
            _ = poll_timer.tick(), if polling => {
                poll_once(&client, &hooks).await;
            }
            _ = heartbeat_timer.tick() => {
                if send_heartbeat(&client, &config.project_code, &registration.agent_id, &state).await {
                    resync_deadline = Some(Instant::now() + CONFIG_DEBOUNCE);
                }
            }
            event = recv_realtime(&mut realtime_events) => {
                match event {
                    Some(RealtimeEvent::Notification(n)) => {
                        handle_notification(n, &client, &hooks, &mut resync_deadline).await;
                    }
                    Some(RealtimeEvent::Reconnected) => {
                        poll_once(&client, &hooks).await;
                    }
                    Some(RealtimeEvent::Terminal) | None => {
                        if realtime_events.is_some() {
                            warn!(project_code = %config.project_code, "realtime subscriber gave up, falling back to polling");
                        }
                        realtime_events = None;
                        polling = true;
                    }
                }
            }
            _ = async { tokio::time::sleep_until(resync_deadline.expect("guarded by is_some")).await }, if resync_deadline.is_some() => {
                resync_deadline = None;
                sync_project_config(&client, &cache, &config.project_code, &state).await;
            }
        }

        if resync_requested.swap(false, Ordering::SeqCst) {
            resync_deadline = Some(Instant::now() + CONFIG_DEBOUNCE);
        }
    }

    if let Some(sub) = subscriber.take() {
        sub.disconnect();
    }
    report_connection_status(&client, &config.project_code, false, active_transport).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_interval_bounds_both_directions() {
        assert_eq!(clamp_interval(10), MIN_INTERVAL_MS);
        assert_eq!(clamp_interval(10_000_000), MAX_INTERVAL_MS);
        assert_eq!(clamp_interval(5_000), 5_000);
    }

    #[test]
    fn select_active_mode_prefers_pinned_choice_when_available() {
        let available = vec!["claude_code".to_string(), "api".to_string()];
        assert_eq!(select_active_mode(&available, Some("api")), "api");
    }

    #[test]
    fn select_active_mode_falls_back_to_first_detected() {
        let available = vec!["api".to_string()];
        assert_eq!(select_active_mode(&available, Some("claude_code")), "api");
    }

    #[test]
    fn select_active_mode_falls_back_to_hard_default_when_nothing_detected() {
        assert_eq!(select_active_mode(&[], None), "claude_code");
    }

    #[test]
    fn runtime_config_clamps_poll_and_heartbeat_intervals() {
        let config = RuntimeConfig {
            project_code: "p1".into(),
            token: "t".into(),
            api_url: "http://s".into(),
            agent_version: "0.1.0".into(),
            poll_interval_ms: 1,
            heartbeat_interval_ms: 999_999_999,
            preferred_chat_mode: None,
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(MIN_INTERVAL_MS));
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(MAX_INTERVAL_MS));
    }

    #[test]
    fn system_info_json_reports_platform() {
        let info = system_info_json();
        assert_eq!(info["platform"], serde_json::json!(std::env::consts::OS));
    }

    fn sample_project_config() -> ProjectConfig {
        ProjectConfig {
            config_hash: "h1".into(),
            project: agent_proto::ProjectInfo {
                project_code: "p1".into(),
                name: "Project One".into(),
                extra: serde_json::Map::new(),
            },
            agent: agent_proto::AgentSection {
                agent_enabled: true,
                builtin_agent_enabled: true,
                builtin_fallback_enabled: false,
                external_agent_enabled: false,
                allowed_tools: vec!["bash".to_string(), "str_replace_editor".to_string()],
                claude_code_config: Some(serde_json::json!({
                    "addDirs": ["/srv/app", "~/notes"],
                    "mcpConfigPath": "/etc/mcp.json",
                })),
            },
            aws: None,
            databases: None,
            documentation: None,
        }
    }

    #[test]
    fn chat_defaults_from_state_reads_tools_dirs_and_mcp_path() {
        let mut state = RuntimeState::default();
        state.project_config = Some(sample_project_config());
        let defaults = chat_defaults_from_state(&state);
        assert_eq!(defaults.allowed_tools, vec!["bash".to_string(), "str_replace_editor".to_string()]);
        assert_eq!(defaults.add_dirs, vec!["/srv/app".to_string(), "~/notes".to_string()]);
        assert_eq!(defaults.mcp_config_path, Some("/etc/mcp.json".to_string()));
    }

    #[test]
    fn chat_defaults_from_state_carries_aws_env_overlay() {
        let mut state = RuntimeState::default();
        state.project_config = Some(sample_project_config());
        state.aws_env.insert("AWS_ACCESS_KEY_ID".to_string(), "AKIA_TEST".to_string());
        let defaults = chat_defaults_from_state(&state);
        assert_eq!(defaults.aws_env.get("AWS_ACCESS_KEY_ID"), Some(&"AKIA_TEST".to_string()));
    }

    #[test]
    fn chat_defaults_from_state_is_empty_before_first_sync() {
        let state = RuntimeState::default();
        let defaults = chat_defaults_from_state(&state);
        assert!(defaults.allowed_tools.is_empty());
        assert!(defaults.add_dirs.is_empty());
        assert!(defaults.mcp_config_path.is_none());
    }
}
