//! Safety gate for filesystem paths and shell commands: resolves a path to
//! its real location before any I/O and rejects anything under a fixed
//! denylist (including through a symlink), rejects shell commands matching
//! a small set of destructive patterns, and builds a scrubbed environment
//! for spawned children containing only a fixed whitelist of variables.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SafetyError {
    #[error("Access denied: {0} paths are blocked")]
    PathDenied(String),
    #[error("Blocked dangerous command pattern: {0}")]
    CommandDenied(String),
    #[error("Signal not allowed")]
    SignalDenied,
}

/// Fixed, absolute path prefixes that are always denied.
const STATIC_DENIED_PREFIXES: &[&str] = &[
    "/etc/",
    "/proc/",
    "/sys/",
    "/dev/",
    "/private/etc/",
    "/private/var/db/",
];

/// Suffixes appended to `$HOME` that are always denied.
const HOME_DENIED_SUFFIXES: &[&str] = &[".ssh/", ".aws/", ".gnupg/", ".config/gcloud/"];

fn denied_prefixes() -> Vec<String> {
    let mut prefixes: Vec<String> = STATIC_DENIED_PREFIXES.iter().map(|s| s.to_string()).collect();
    if let Some(home) = dirs::home_dir() {
        for suffix in HOME_DENIED_SUFFIXES {
            let mut p = home.to_string_lossy().to_string();
            if !p.ends_with('/') {
                p.push('/');
            }
            p.push_str(suffix);
            prefixes.push(p);
        }
    }
    prefixes
}

/// Resolve `p` to a real path the way the spec requires: if the leaf
/// exists, canonicalise it directly (following symlinks); if it does not,
/// canonicalise the parent and re-join the leaf's file name.
fn resolve_real_path(p: &Path) -> std::io::Result<PathBuf> {
    match p.canonicalize() {
        Ok(resolved) => Ok(resolved),
        Err(_) => {
            let parent = p.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let resolved_parent = parent.canonicalize()?;
            match p.file_name() {
                Some(name) => Ok(resolved_parent.join(name)),
                None => Ok(resolved_parent),
            }
        }
    }
}

/// Returns the resolved, real path if it is allowed, otherwise the
/// structured denial.
pub fn validate_path(p: impl AsRef<Path>) -> Result<PathBuf, SafetyError> {
    let resolved = resolve_real_path(p.as_ref()).map_err(|e| {
        SafetyError::PathDenied(format!("unresolved ({e})"))
    })?;
    let resolved_str = resolved.to_string_lossy().to_string();

    for prefix in denied_prefixes() {
        let trimmed_prefix = prefix.trim_end_matches('/');
        if resolved_str == trimmed_prefix || resolved_str.starts_with(&prefix) {
            return Err(SafetyError::PathDenied(prefix));
        }
    }
    Ok(resolved)
}

struct DenylistEntry {
    pattern: regex::Regex,
    description: &'static str,
}

static COMMAND_DENYLIST: LazyLock<Vec<DenylistEntry>> = LazyLock::new(|| {
    let specs: &[(&str, &str)] = &[
        (r"rm\s+(-[a-zA-Z]*r[a-zA-Z]*f[a-zA-Z]*|-[a-zA-Z]*f[a-zA-Z]*r[a-zA-Z]*)\s+/(\s|$)", "rm -rf /"),
        (r"\bmkfs(\.\w+)?\b", "mkfs"),
        (r"\bdd\b[^\n]*\bof=/dev/", "dd to a block device"),
        (r">\s*/dev/(sd|nvme|hd|disk)\w*", "redirect to a block device"),
        (r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:", "fork bomb"),
    ];
    specs
        .iter()
        .map(|(pattern, description)| DenylistEntry {
            pattern: regex::Regex::new(pattern).expect("static denylist regex is valid"),
            description,
        })
        .collect()
});

/// Rejects `s` if it matches any of the destructive-command regexes.
pub fn validate_command(s: &str) -> Result<(), SafetyError> {
    for entry in COMMAND_DENYLIST.iter() {
        if entry.pattern.is_match(s) {
            return Err(SafetyError::CommandDenied(entry.description.to_string()));
        }
    }
    Ok(())
}

const SIGNAL_ALLOWLIST: &[&str] = &["SIGTERM", "SIGUSR1", "SIGUSR2", "SIGINT", "SIGHUP"];

/// Rejects `SIGKILL` / `SIGSTOP` and anything outside the allowed set.
pub fn validate_signal(name: &str) -> Result<(), SafetyError> {
    if SIGNAL_ALLOWLIST.contains(&name) {
        Ok(())
    } else {
        Err(SafetyError::SignalDenied)
    }
}

/// Environment variables that may cross into a spawned child.
const ENV_WHITELIST: &[&str] = &[
    "PATH", "HOME", "USER", "SHELL", "LANG", "LC_ALL", "LC_MESSAGES", "TERM", "TMPDIR", "TMP",
    "TEMP", "NODE_ENV", "SystemRoot", "USERPROFILE", "APPDATA", "PATHEXT", "COMSPEC",
];

/// Returns only the whitelisted environment variables present in the
/// parent process's environment. No secret-bearing variable can cross
/// this boundary.
pub fn build_safe_env() -> HashMap<String, String> {
    ENV_WHITELIST
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
        .collect()
}
