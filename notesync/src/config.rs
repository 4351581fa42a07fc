//! Layered client configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`SyncConfig::default()`]
//! 2. If the config file exists, deep-merge its values over the defaults
//! 3. Apply `NOTESYNC_*` environment overrides
//! 4. CLI flags are applied last by the caller

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SyncError};

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the backend API, e.g. `http://127.0.0.1:8001/api/v1`.
    pub api_base: String,
    /// Directory for the local session cache. Defaults to the user data dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    /// Coalescing window for routine session persists.
    pub debounce_ms: u64,
    pub connect_timeout_secs: u64,
    /// Upper bound for one research job before it is failed locally.
    pub job_timeout_secs: u64,
    /// Delay between a lost transport and the first recovery attempt.
    pub recovery_delay_ms: u64,
    /// Retry interval while the status endpoint says the job is still running.
    pub recovery_retry_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:8001/api/v1".to_string(),
            cache_dir: None,
            debounce_ms: 1_200,
            connect_timeout_secs: 15,
            job_timeout_secs: 30 * 60,
            recovery_delay_ms: 3_000,
            recovery_retry_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

impl SyncConfig {
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub const fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub const fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    pub const fn recovery_retry(&self) -> Duration {
        Duration::from_secs(self.recovery_retry_secs)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// WebSocket base derived from the HTTP API base.
    pub fn ws_base(&self) -> Result<String> {
        let base = self.api_base.trim_end_matches('/');
        if let Some(rest) = base.strip_prefix("https://") {
            Ok(format!("wss://{rest}"))
        } else if let Some(rest) = base.strip_prefix("http://") {
            Ok(format!("ws://{rest}"))
        } else {
            Err(SyncError::Config(format!(
                "api_base must start with http:// or https://: {base}"
            )))
        }
    }

    /// Default path of the config file (`<config dir>/notesync/config.json`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("notesync").join("config.json"))
    }

    /// Load from the default path with env overrides.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from_path(&path),
            None => {
                let mut config = Self::default();
                config.apply_env_overrides();
                Ok(config)
            }
        }
    }

    /// Load from a specific path with env overrides.
    ///
    /// A missing file yields defaults; an unparsable one is an error.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let defaults = serde_json::to_value(Self::default())?;

        let merged = if path.exists() {
            debug!(?path, "loading config from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        } else {
            debug!(?path, "config file not found, using defaults");
            defaults
        };

        let mut config: Self = serde_json::from_value(merged)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from a key lookup. Invalid values are ignored.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("NOTESYNC_API_BASE").filter(|v| !v.trim().is_empty()) {
            self.api_base = v.trim().to_string();
        }
        if let Some(v) = lookup("NOTESYNC_CACHE_DIR").filter(|v| !v.trim().is_empty()) {
            self.cache_dir = Some(PathBuf::from(v));
        }
        let read_u64 = |key: &str, min: u64, max: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|n| (min..=max).contains(n))
        };
        if let Some(v) = read_u64("NOTESYNC_DEBOUNCE_MS", 0, 60_000) {
            self.debounce_ms = v;
        }
        if let Some(v) = read_u64("NOTESYNC_CONNECT_TIMEOUT_SECS", 1, 300) {
            self.connect_timeout_secs = v;
        }
        if let Some(v) = read_u64("NOTESYNC_JOB_TIMEOUT_SECS", 1, 86_400) {
            self.job_timeout_secs = v;
        }
        if let Some(v) = read_u64("NOTESYNC_RECOVERY_DELAY_MS", 0, 600_000) {
            self.recovery_delay_ms = v;
        }
    }
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, arrays and primitives are replaced, nulls in
/// `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deep_merge_skips_nulls() {
        let merged = deep_merge(
            json!({"a": 1, "b": {"c": 2, "d": 3}}),
            json!({"a": null, "b": {"c": 5}}),
        );
        assert_eq!(merged, json!({"a": 1, "b": {"c": 5, "d": 3}}));
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"debounce_ms": 50, "api_base": "https://x.example/api"}"#)
            .unwrap();
        let config = SyncConfig::load_from_path(&path).unwrap();
        assert_eq!(config.debounce_ms, 50);
        assert_eq!(config.connect_timeout_secs, 15);
        assert_eq!(config.ws_base().unwrap(), "wss://x.example/api");
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::load_from_path(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config.job_timeout_secs, 1_800);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(SyncConfig::load_from_path(&path).is_err());
    }

    #[test]
    fn overrides_ignore_invalid_values() {
        let mut config = SyncConfig::default();
        config.apply_overrides(|key| match key {
            "NOTESYNC_DEBOUNCE_MS" => Some("abc".into()),
            "NOTESYNC_CONNECT_TIMEOUT_SECS" => Some("5".into()),
            "NOTESYNC_JOB_TIMEOUT_SECS" => Some("0".into()),
            _ => None,
        });
        assert_eq!(config.debounce_ms, 1_200);
        assert_eq!(config.connect_timeout_secs, 5);
        assert_eq!(config.job_timeout_secs, 1_800);
    }

    #[test]
    fn ws_base_requires_http_scheme() {
        let config = SyncConfig {
            api_base: "ftp://nope".into(),
            ..SyncConfig::default()
        };
        assert!(config.ws_base().is_err());
    }
}
