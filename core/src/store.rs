use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Persisted per-watch record: the snapshot from the last successful run
/// plus an error side-channel. A failed run never displaces `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchState {
    /// Snapshot from the most recent successful run.
    pub data: Option<Map<String, Value>>,
    /// When this record was last written.
    pub timestamp: DateTime<Utc>,
    /// Error from the most recent failed run, cleared on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// File-per-watch JSON store rooted at the state directory.
#[derive(Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Open a store rooted at `dir`, creating it if missing.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let root = dir.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("create state dir {}", root.display()))?;
        Ok(StateStore { root })
    }

    fn path_for(&self, watch_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize_id(watch_id)))
    }

    /// Load the persisted record. Missing files and malformed JSON both
    /// read as "no prior state".
    pub fn load(&self, watch_id: &str) -> Option<WatchState> {
        let path = self.path_for(watch_id);
        let text = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&text) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!("discarding malformed state {}: {err}", path.display());
                None
            }
        }
    }

    /// Persist a successful run's snapshot, clearing any error annotation.
    pub fn save_snapshot(&self, watch_id: &str, data: &Map<String, Value>) -> Result<()> {
        self.write(
            watch_id,
            &WatchState {
                data: Some(data.clone()),
                timestamp: Utc::now(),
                last_error: None,
            },
        )
    }

    /// Annotate a failed run. The last successful snapshot is retained so
    /// the next success still has something to diff against.
    pub fn record_error(&self, watch_id: &str, error: &str) -> Result<()> {
        let data = self.load(watch_id).and_then(|s| s.data);
        self.write(
            watch_id,
            &WatchState {
                data,
                timestamp: Utc::now(),
                last_error: Some(error.to_string()),
            },
        )
    }

    fn write(&self, watch_id: &str, state: &WatchState) -> Result<()> {
        let path = self.path_for(watch_id);
        let body = serde_json::to_vec_pretty(state)?;
        // Write-then-rename keeps readers away from partial files.
        let tmp = path.with_extension("tmp");
        {
            let mut f = fs::File::create(&tmp)
                .with_context(|| format!("create {}", tmp.display()))?;
            f.write_all(&body)
                .with_context(|| format!("write {}", tmp.display()))?;
            f.sync_all().ok();
        }
        fs::rename(&tmp, &path)
            .with_context(|| format!("rename {} into place", tmp.display()))?;
        Ok(())
    }
}

/// Map an arbitrary watch id onto a safe file stem.
pub fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        assert!(store.load("w1").is_none());

        let data = snapshot(&[("price", json!(120)), ("items", json!(["a", "b"]))]);
        store.save_snapshot("w1", &data).unwrap();
        let state = store.load("w1").unwrap();
        assert_eq!(state.data, Some(data));
        assert!(state.last_error.is_none());
    }

    #[test]
    fn errors_keep_the_last_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let data = snapshot(&[("count", json!(3))]);
        store.save_snapshot("w1", &data).unwrap();

        store.record_error("w1", "navigation timed out").unwrap();
        let state = store.load("w1").unwrap();
        assert_eq!(state.data, Some(data));
        assert_eq!(state.last_error.as_deref(), Some("navigation timed out"));

        // Success clears the annotation again.
        store.save_snapshot("w1", &snapshot(&[("count", json!(4))])).unwrap();
        assert!(store.load("w1").unwrap().last_error.is_none());
    }

    #[test]
    fn error_without_prior_snapshot_has_null_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store.record_error("fresh", "boom").unwrap();
        let state = store.load("fresh").unwrap();
        assert!(state.data.is_none());
    }

    #[test]
    fn malformed_state_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        fs::write(dir.path().join("w1.json"), "{ nope").unwrap();
        assert!(store.load("w1").is_none());
    }

    #[test]
    fn ids_are_sanitized_for_the_filesystem() {
        assert_eq!(sanitize_id("a/b\\c:d"), "a-b-c-d");
        assert_eq!(sanitize_id("watch_1.prod"), "watch_1.prod");
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store.save_snapshot("../evil", &snapshot(&[])).unwrap();
        assert!(dir.path().join("..-evil.json").exists());
    }
}
