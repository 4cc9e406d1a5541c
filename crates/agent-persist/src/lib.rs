//! Atomic JSON file persistence.
//!
//! Every write goes through [`write_atomic`]: write to a sibling temp file,
//! fsync it, then rename over the target. A crash mid-write leaves either
//! the previous valid file or the new one — never a half-written one.
//! Files are written `0o600`; their parent directory is forced to `0o700`
//! on every save.

#![forbid(unsafe_code)]

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[cfg(unix)]
fn secure_dir_permissions(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn secure_dir_permissions(_dir: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn secure_file_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn secure_file_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Write `contents` to `path` atomically: a sibling `.tmp-<pid>` file is
/// written and fsynced, then renamed over `path`. The parent directory is
/// created (mode `0o700`) if missing.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    std::fs::create_dir_all(parent)?;
    secure_dir_permissions(parent)?;

    let tmp_path = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("state"),
        std::process::id()
    ));

    {
        let mut f = std::fs::File::create(&tmp_path)?;
        use std::io::Write;
        f.write_all(contents)?;
        f.sync_all()?;
    }
    secure_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Read and parse a JSON file; `None` if it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(raw) => {
            let value = serde_json::from_str(&raw).map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidData, format!("malformed JSON in {}: {e}", path.display()))
            })?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Serialize `value` and write it atomically as pretty JSON.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let rendered = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_atomic(path, &rendered)
}

/// A keyed snapshot store: `{state_path}/state/{domain}.json` holding a
/// `HashMap<String, T>`, loaded whole into memory and rewritten whole on
/// every mutation. Mirrors the shape of a small embedded key/value cache;
/// suitable for the per-project config cache (§4.8) and similar small,
/// infrequently-written domains.
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new(state_path: &Path, domain: &str) -> Self {
        Self {
            path: state_path.join("state").join(format!("{domain}.json")),
        }
    }

    pub fn load<T: DeserializeOwned>(&self) -> HashMap<String, T> {
        match read_json::<HashMap<String, T>>(&self.path) {
            Ok(Some(map)) => map,
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to load state, starting empty");
                HashMap::new()
            }
        }
    }

    pub fn save<T: Serialize>(&self, records: &HashMap<String, T>) -> io::Result<()> {
        debug!(path = %self.path.display(), count = records.len(), "snapshotting state");
        write_json(&self.path, records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Rec {
        value: String,
    }

    #[test]
    fn roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path(), "widgets");

        let mut records = HashMap::new();
        records.insert(
            "w1".to_string(),
            Rec {
                value: "hello".into(),
            },
        );
        store.save(&records).expect("save");

        let loaded: HashMap<String, Rec> = store.load();
        assert_eq!(loaded, records);
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path(), "nope");
        let loaded: HashMap<String, Rec> = store.load();
        assert!(loaded.is_empty());
    }

    #[test]
    fn load_corrupt_file_warns_and_empties() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state_dir = dir.path().join("state");
        std::fs::create_dir_all(&state_dir).unwrap();
        std::fs::write(state_dir.join("broken.json"), b"not json").unwrap();

        let store = JsonStore::new(dir.path(), "broken");
        let loaded: HashMap<String, Rec> = store.load();
        assert!(loaded.is_empty());
    }

    #[test]
    fn write_atomic_leaves_no_tmp_file_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        write_atomic(&path, b"{\"a\":1}").expect("write");

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("config.json")]);
    }

    #[cfg(unix)]
    #[test]
    fn write_atomic_sets_secure_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sub").join("config.json");
        write_atomic(&path, b"{}").expect("write");

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);

        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn write_atomic_overwrites_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        write_atomic(&path, b"{\"v\":1}").unwrap();
        write_atomic(&path, b"{\"v\":2}").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "{\"v\":2}");
    }
}
