//! Agent configuration loading, legacy migration, and the per-project
//! server-config cache.
//!
//! The on-disk schema is `config.json` under the config directory (`0o600`,
//! directory `0o700`, enforced by `agent-persist::write_json`). A
//! pre-multi-project config — root-level `{token, apiUrl}` with no
//! `projects` array — is detected and migrated in place into a one-entry
//! `projects` list under project code `"default"`.

#![forbid(unsafe_code)]

use agent_proto::{AgentConfiguration, LegacyAgentConfiguration, ProjectConfig, ProjectRegistration, LEGACY_PROJECT_CODE};
use chrono::Utc;
use rand::Rng;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config.json: {0}")]
    Malformed(String),
    #[error("no configured projects and no AGENT_TOKEN/AGENT_API_URL fallback")]
    NoProjects,
}

const CONFIG_FILE_NAME: &str = "config.json";

/// Resolves `$AGENT_CONFIG_DIR` (absolute, `~`-prefixed, or relative to
/// CWD) or the default `$HOME/.ai-support-agent`.
pub fn resolve_config_dir() -> PathBuf {
    if let Ok(raw) = std::env::var("AGENT_CONFIG_DIR") {
        return expand_path(&raw);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ai-support-agent")
}

fn expand_path(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        return dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest);
    }
    let p = PathBuf::from(raw);
    if p.is_absolute() {
        p
    } else {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")).join(p)
    }
}

fn config_file_path(config_dir: &Path) -> PathBuf {
    config_dir.join(CONFIG_FILE_NAME)
}

/// `{hostname-sanitised}-{16-hex}`, generated once and then persisted.
pub fn generate_agent_id() -> String {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "agent".to_string());
    let sanitised: String = hostname
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let mut rng = rand::thread_rng();
    let suffix: String = (0..16)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect();
    format!("{sanitised}-{suffix}")
}

/// Load `config.json`, migrating a legacy single-project shape in place.
/// Returns `Ok(None)` if no config file exists yet.
pub fn load(config_dir: &Path) -> Result<Option<AgentConfiguration>, ConfigError> {
    let path = config_file_path(config_dir);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ConfigError::Io(e)),
    };

    if let Ok(cfg) = serde_json::from_str::<AgentConfiguration>(&raw) {
        return Ok(Some(cfg));
    }

    let legacy: LegacyAgentConfiguration = serde_json::from_str(&raw)
        .map_err(|e| ConfigError::Malformed(e.to_string()))?;
    info!("migrating legacy single-project config to projects[] schema");

    let migrated = AgentConfiguration {
        agent_id: legacy.agent_id.unwrap_or_else(generate_agent_id),
        created_at: Utc::now(),
        last_connected: None,
        projects: vec![ProjectRegistration {
            project_code: LEGACY_PROJECT_CODE.to_string(),
            token: legacy.token,
            api_url: legacy.api_url,
            project_dir: None,
        }],
        auto_update: None,
        default_project_dir: None,
        agent_chat_mode: None,
    };
    save(config_dir, &migrated)?;
    Ok(Some(migrated))
}

/// Atomically persist `config.json` (`0o600`, directory `0o700`).
pub fn save(config_dir: &Path, config: &AgentConfiguration) -> Result<(), ConfigError> {
    let path = config_file_path(config_dir);
    agent_persist::write_json(&path, config)?;
    Ok(())
}

/// Update `lastConnected` to now and persist. Per-agent, not per-project
/// (see SPEC_FULL.md §9 open-question decision).
pub fn touch_last_connected(config_dir: &Path, config: &mut AgentConfiguration) -> Result<(), ConfigError> {
    config.last_connected = Some(Utc::now());
    save(config_dir, config)
}

/// Build a fresh single-project configuration for the CLI-direct or
/// env-default fallback paths (§4.7 selection rules 1 and 2).
pub fn synthetic_single_project(project_code: &str, token: String, api_url: String) -> AgentConfiguration {
    AgentConfiguration {
        agent_id: generate_agent_id(),
        created_at: Utc::now(),
        last_connected: None,
        projects: vec![ProjectRegistration {
            project_code: project_code.to_string(),
            token,
            api_url,
            project_dir: None,
        }],
        auto_update: None,
        default_project_dir: None,
        agent_chat_mode: None,
    }
}

// ─── Per-project server-config cache (§4.8) ────────────────────────────────

/// Caches the last-applied [`ProjectConfig`] per project, keyed by
/// `projectCode`, written atomically through `agent-persist`.
pub struct ProjectConfigCache {
    store: agent_persist::JsonStore,
}

impl ProjectConfigCache {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            store: agent_persist::JsonStore::new(config_dir, "project_config_cache"),
        }
    }

    pub fn get(&self, project_code: &str) -> Option<ProjectConfig> {
        let mut map: std::collections::HashMap<String, ProjectConfig> = self.store.load();
        map.remove(project_code)
    }

    pub fn cached_hash(&self, project_code: &str) -> Option<String> {
        self.get(project_code).map(|c| c.config_hash)
    }

    pub fn put(&self, project_code: &str, config: &ProjectConfig) {
        let mut map: std::collections::HashMap<String, ProjectConfig> = self.store.load();
        map.insert(project_code.to_string(), config.clone());
        if let Err(e) = self.store.save(&map) {
            warn!(project_code, error = %e, "failed to persist project config cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_proto::{AgentSection, ProjectInfo};

    #[test]
    fn generate_agent_id_has_hyphenated_16_hex_suffix() {
        let id = generate_agent_id();
        let (_, suffix) = id.rsplit_once('-').expect("has a dash");
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn load_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = synthetic_single_project("p1", "tok".into(), "http://s".into());
        save(dir.path(), &cfg).unwrap();

        let loaded = load(dir.path()).unwrap().expect("present");
        assert_eq!(loaded.agent_id, cfg.agent_id);
        assert_eq!(loaded.projects.len(), 1);
        assert_eq!(loaded.projects[0].project_code, "p1");
    }

    #[test]
    fn legacy_config_migrates_to_projects_array() {
        let dir = tempfile::tempdir().unwrap();
        let legacy_path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(&legacy_path, r#"{"token":"legacy-tok","apiUrl":"http://legacy"}"#).unwrap();

        let migrated = load(dir.path()).unwrap().expect("migrated");
        assert_eq!(migrated.projects.len(), 1);
        assert_eq!(migrated.projects[0].project_code, LEGACY_PROJECT_CODE);
        assert_eq!(migrated.projects[0].token, "legacy-tok");

        let raw = std::fs::read_to_string(&legacy_path).unwrap();
        assert!(!raw.contains("\"token\":\"legacy-tok\""), "root-level token must be gone");
        assert!(raw.contains("\"projects\""));
    }

    #[test]
    fn resolve_config_dir_expands_tilde() {
        std::env::set_var("AGENT_CONFIG_DIR", "~/custom-agent-dir");
        let dir = resolve_config_dir();
        std::env::remove_var("AGENT_CONFIG_DIR");
        assert!(dir.ends_with("custom-agent-dir"));
        assert!(dir.is_absolute());
    }

    #[test]
    fn project_config_cache_roundtrips_and_detects_hash_change() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProjectConfigCache::new(dir.path());
        assert!(cache.cached_hash("p1").is_none());

        let cfg = ProjectConfig {
            config_hash: "h1".into(),
            project: ProjectInfo {
                project_code: "p1".into(),
                name: "Project One".into(),
                extra: Default::default(),
            },
            agent: AgentSection {
                agent_enabled: true,
                builtin_agent_enabled: true,
                builtin_fallback_enabled: false,
                external_agent_enabled: false,
                allowed_tools: vec!["bash".into()],
                claude_code_config: None,
            },
            aws: None,
            databases: None,
            documentation: None,
        };
        cache.put("p1", &cfg);
        assert_eq!(cache.cached_hash("p1"), Some("h1".to_string()));
        assert_ne!(cache.cached_hash("p1"), Some("h2".to_string()));
    }
}
