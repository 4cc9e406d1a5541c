//! `file_read`, `file_write`, `file_list` handlers.

use agent_proto::CommandResult;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::path::Path;

const MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;
const MAX_LIST_ENTRIES: usize = 1000;

fn required_str<'a>(payload: &'a Value, field: &str, missing_message: &str) -> Result<&'a str, String> {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| missing_message.to_string())
}

pub async fn handle_file_read(payload: &Value) -> CommandResult {
    let raw_path = match required_str(payload, "path", "No file path specified") {
        Ok(p) => p,
        Err(e) => return CommandResult::failure(e),
    };
    let resolved = match agent_safety::validate_path(raw_path) {
        Ok(p) => p,
        Err(e) => return CommandResult::failure(e.to_string()),
    };

    let metadata = match tokio::fs::metadata(&resolved).await {
        Ok(m) => m,
        Err(e) => return CommandResult::failure(format!("{e}")),
    };
    if metadata.len() > MAX_FILE_BYTES {
        return CommandResult::failure("File exceeds maximum size of 10MiB");
    }

    match tokio::fs::read_to_string(&resolved).await {
        Ok(contents) => CommandResult::success(json!(contents)),
        Err(e) => CommandResult::failure(format!("{e}")),
    }
}

pub async fn handle_file_write(payload: &Value) -> CommandResult {
    let raw_path = match required_str(payload, "path", "No file path specified") {
        Ok(p) => p,
        Err(e) => return CommandResult::failure(e),
    };
    let content = match payload.get("content").and_then(|v| v.as_str()) {
        Some(c) => c,
        None => return CommandResult::failure("No content specified"),
    };
    if content.len() as u64 > MAX_FILE_BYTES {
        return CommandResult::failure("Content exceeds maximum size of 10MiB");
    }
    let create_directories = payload
        .get("createDirectories")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let resolved = match agent_safety::validate_path(raw_path) {
        Ok(p) => p,
        Err(e) => return CommandResult::failure(e.to_string()),
    };

    if create_directories {
        if let Some(parent) = resolved.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return CommandResult::failure(format!("{e}"));
            }
        }
    }

    match tokio::fs::write(&resolved, content).await {
        Ok(()) => CommandResult::success_empty(),
        Err(e) => CommandResult::failure(format!("{e}")),
    }
}

pub async fn handle_file_list(payload: &Value) -> CommandResult {
    let raw_path = payload.get("path").and_then(|v| v.as_str()).unwrap_or(".");
    let resolved = match agent_safety::validate_path(raw_path) {
        Ok(p) => p,
        Err(e) => return CommandResult::failure(e.to_string()),
    };

    let mut entries = match tokio::fs::read_dir(&resolved).await {
        Ok(rd) => rd,
        Err(e) => return CommandResult::failure(format!("{e}")),
    };

    let mut all = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        all.push(entry);
    }

    let total = all.len();
    let truncated = total > MAX_LIST_ENTRIES;
    let mut items = Vec::with_capacity(total.min(MAX_LIST_ENTRIES));

    for entry in all.into_iter().take(MAX_LIST_ENTRIES) {
        let name = entry.file_name().to_string_lossy().to_string();
        let (kind, size, modified) = describe_entry(&entry.path()).await;
        items.push(json!({
            "name": name,
            "type": kind,
            "size": size,
            "modified": modified,
        }));
    }

    CommandResult::success(json!({
        "items": items,
        "truncated": truncated,
        "total": total,
    }))
}

async fn describe_entry(path: &Path) -> (&'static str, u64, String) {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => {
            let kind = if meta.is_dir() { "directory" } else { "file" };
            let modified = meta
                .modified()
                .ok()
                .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
                .unwrap_or_default();
            (kind, meta.len(), modified)
        }
        Err(_) => ("file", 0, String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_write_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");

        let write_payload = json!({"path": path.to_string_lossy(), "content": "hello"});
        let result = handle_file_write(&write_payload).await;
        assert!(result.success);

        let read_payload = json!({"path": path.to_string_lossy()});
        let result = handle_file_read(&read_payload).await;
        assert!(result.success);
        assert_eq!(result.data, Some(json!("hello")));
    }

    #[tokio::test]
    async fn write_rejects_content_over_cap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.txt");
        let oversized = "a".repeat((MAX_FILE_BYTES + 1) as usize);
        let payload = json!({"path": path.to_string_lossy(), "content": oversized});
        let result = handle_file_write(&payload).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap(), "Content exceeds maximum size of 10MiB");
    }

    #[tokio::test]
    async fn read_denies_etc_passwd() {
        let result = handle_file_read(&json!({"path": "/etc/passwd"})).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap(), "Access denied: /etc/ paths are blocked");
    }

    #[tokio::test]
    async fn list_truncates_over_1000_entries() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..1001 {
            std::fs::write(dir.path().join(format!("f{i}")), b"x").unwrap();
        }
        let result = handle_file_list(&json!({"path": dir.path().to_string_lossy()})).await;
        assert!(result.success);
        let data = result.data.unwrap();
        assert_eq!(data["truncated"], json!(true));
        assert_eq!(data["total"], json!(1001));
        assert_eq!(data["items"].as_array().unwrap().len(), 1000);
    }

    #[tokio::test]
    async fn list_exactly_1000_is_not_truncated() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..1000 {
            std::fs::write(dir.path().join(format!("f{i}")), b"x").unwrap();
        }
        let result = handle_file_list(&json!({"path": dir.path().to_string_lossy()})).await;
        let data = result.data.unwrap();
        assert_eq!(data["truncated"], json!(false));
        assert_eq!(data["items"].as_array().unwrap().len(), 1000);
    }
}
