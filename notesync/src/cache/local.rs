//! Local session cache: one JSON blob per notebook.
//!
//! Reads never fail (a missing or malformed blob is an empty cache). Writes
//! replace the whole blob, so concurrent writers resolve as last-write-wins.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::models::{Session, Timestamp};

const CACHE_SUBDIR: &str = "notesync";
const BLOB_SUFFIX: &str = ".sessions.json";

/// Contents of one notebook's cache blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default, alias = "currentSessionId")]
    pub current_session_id: Option<String>,
    #[serde(default, alias = "savedAt")]
    pub saved_at: Timestamp,
}

impl CacheSnapshot {
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.current_session_id.is_none()
    }
}

/// File-backed cache of notebook sessions.
#[derive(Debug, Clone)]
pub struct LocalCache {
    dir: PathBuf,
}

impl LocalCache {
    /// Open the cache in the user's local data directory.
    pub fn open_default() -> Result<Self> {
        let base = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| SyncError::Config("could not find a local data directory".into()))?;
        Self::open_at(base.join(CACHE_SUBDIR).join("cache"))
    }

    /// Open (creating if needed) the cache at a specific directory.
    pub fn open_at(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the blob for a notebook id.
    pub fn blob_path(&self, notebook_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}{BLOB_SUFFIX}", urlencoding::encode(notebook_id)))
    }

    /// Read a notebook's snapshot. Absent or malformed blobs yield an empty snapshot.
    pub fn load(&self, notebook_id: &str) -> CacheSnapshot {
        let path = self.blob_path(notebook_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(notebook_id, "no cached sessions");
                return CacheSnapshot::default();
            }
            Err(e) => {
                warn!(notebook_id, error = %e, "failed to read session cache, ignoring it");
                return CacheSnapshot::default();
            }
        };

        match serde_json::from_str::<CacheSnapshot>(&content) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(notebook_id, error = %e, "malformed session cache, treating as empty");
                CacheSnapshot::default()
            }
        }
    }

    /// Overwrite a notebook's snapshot.
    pub fn save(
        &self,
        notebook_id: &str,
        sessions: &[Session],
        current_session_id: Option<&str>,
    ) -> Result<()> {
        let snapshot = CacheSnapshot {
            sessions: sessions.to_vec(),
            current_session_id: current_session_id.map(String::from),
            saved_at: Timestamp::now(),
        };
        self.save_snapshot(notebook_id, &snapshot)
    }

    /// Overwrite a notebook's snapshot with a prepared value.
    pub fn save_snapshot(&self, notebook_id: &str, snapshot: &CacheSnapshot) -> Result<()> {
        let path = self.blob_path(notebook_id);
        let json = serde_json::to_vec(snapshot)?;

        // Write-then-rename so a reader never sees a half-written blob.
        let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        debug!(notebook_id, sessions = snapshot.sessions.len(), "saved session cache");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatMessage;

    fn session(id: &str, offset: i64) -> Session {
        let mut s = Session::new(id, Timestamp::from_millis(1_700_000_000_000 + offset));
        s.messages.push(ChatMessage::user(format!("hi from {id}")));
        s
    }

    #[test]
    fn missing_blob_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::open_at(dir.path()).unwrap();
        assert!(cache.load("nb-1").is_empty());
    }

    #[test]
    fn round_trips_sessions_and_current_id() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::open_at(dir.path()).unwrap();
        let sessions = vec![session("a", 1), session("b", 2)];
        cache.save("nb-1", &sessions, Some("b")).unwrap();

        let loaded = cache.load("nb-1");
        assert_eq!(loaded.sessions, sessions);
        assert_eq!(loaded.current_session_id.as_deref(), Some("b"));
    }

    #[test]
    fn truncated_blob_is_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::open_at(dir.path()).unwrap();
        cache.save("nb-1", &[session("a", 1)], Some("a")).unwrap();

        let path = cache.blob_path("nb-1");
        let full = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, &full[..full.len() / 2]).unwrap();

        let loaded = cache.load("nb-1");
        assert!(loaded.sessions.is_empty());
        assert!(loaded.current_session_id.is_none());
    }

    #[test]
    fn last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let tab_one = LocalCache::open_at(dir.path()).unwrap();
        let tab_two = LocalCache::open_at(dir.path()).unwrap();

        tab_one.save("nb-1", &[session("a", 1)], Some("a")).unwrap();
        tab_two
            .save("nb-1", &[session("b", 2), session("c", 3)], Some("c"))
            .unwrap();

        let loaded = tab_one.load("nb-1");
        let ids: Vec<_> = loaded.sessions.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, ["b", "c"]);
        assert_eq!(loaded.current_session_id.as_deref(), Some("c"));
    }

    #[test]
    fn notebook_ids_are_path_safe() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::open_at(dir.path()).unwrap();
        cache.save("../escape/nb", &[], None).unwrap();
        assert!(cache.blob_path("../escape/nb").starts_with(dir.path()));
        assert!(cache.load("../escape/nb").sessions.is_empty());
    }
}
