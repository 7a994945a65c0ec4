//! Cache configuration.
//!
//! Settings can be built in code, loaded from a TOML file, or read from
//! environment variables. Persistence defaults to on, which makes
//! `cache_dir` required.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, KilnError, KilnResult, StorageError};

/// Default interval for the stat-polling change notifier.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

fn default_persist() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    /// Whether populated records are written to disk.
    #[serde(default = "default_persist")]
    pub persist: bool,

    /// Directory holding one file per key. Required when `persist` is set.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Poll interval for the default change notifier, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            persist: true,
            cache_dir: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl CacheSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persisting settings rooted at `cache_dir`.
    pub fn persistent(cache_dir: impl Into<PathBuf>) -> Self {
        Self::default().with_cache_dir(cache_dir)
    }

    /// Memory-only settings.
    pub fn in_memory() -> Self {
        Self::default().with_persist(false)
    }

    /// Set the cache directory.
    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(cache_dir.into());
        self
    }

    /// Enable or disable persistence.
    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Create settings from environment variables.
    ///
    /// Environment variables:
    /// - `KILN_CACHE_DIR`: cache directory (no default)
    /// - `KILN_PERSIST`: "true" or "false" (default: true)
    /// - `KILN_POLL_INTERVAL_MS`: notifier poll interval (default: 100)
    pub fn from_env() -> Self {
        let cache_dir = std::env::var("KILN_CACHE_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let persist = std::env::var("KILN_PERSIST")
            .ok()
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(true);

        let poll_interval_ms = std::env::var("KILN_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);

        Self {
            persist,
            cache_dir,
            poll_interval_ms,
        }
    }

    /// Parse settings from TOML text.
    pub fn from_toml_str(contents: &str) -> KilnResult<Self> {
        toml::from_str(contents).map_err(|e| {
            KilnError::Config(ConfigError::InvalidValue {
                field: "settings".to_string(),
                value: "<toml>".to_string(),
                reason: e.to_string(),
            })
        })
    }

    /// Load settings from a TOML file.
    pub fn from_path(path: &Path) -> KilnResult<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| StorageError::from_io(path, e))?;
        Self::from_toml_str(&contents)
    }

    /// Validate the settings.
    ///
    /// Validates:
    /// - `cache_dir` is present and non-empty when `persist` is set
    /// - `poll_interval_ms` > 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.persist {
            match &self.cache_dir {
                None => {
                    return Err(ConfigError::MissingRequired {
                        field: "cache_dir".to_string(),
                    })
                }
                Some(dir) if dir.as_os_str().is_empty() => {
                    return Err(ConfigError::InvalidValue {
                        field: "cache_dir".to_string(),
                        value: String::new(),
                        reason: "must not be empty".to_string(),
                    })
                }
                Some(_) => {}
            }
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "poll_interval_ms".to_string(),
                value: "0".to_string(),
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EnvVarGuard {
        key: &'static str,
        original: Option<String>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: Option<&str>) -> Self {
            let original = std::env::var(key).ok();
            match value {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
            Self { key, original }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            match self.original.as_deref() {
                Some(v) => std::env::set_var(self.key, v),
                None => std::env::remove_var(self.key),
            }
        }
    }

    #[test]
    fn test_default_settings() {
        let settings = CacheSettings::default();
        assert!(settings.persist);
        assert!(settings.cache_dir.is_none());
        assert_eq!(settings.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_persist_requires_cache_dir() {
        let err = CacheSettings::default().validate().unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingRequired {
                field: "cache_dir".to_string()
            }
        );
    }

    #[test]
    fn test_in_memory_ignores_cache_dir() {
        assert!(CacheSettings::in_memory().validate().is_ok());
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let settings = CacheSettings::persistent("/tmp/kiln").with_poll_interval(Duration::ZERO);
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "poll_interval_ms"
        ));
    }

    #[test]
    fn test_empty_cache_dir_rejected() {
        let settings = CacheSettings::persistent("");
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "cache_dir"
        ));
    }

    // One test owns every KILN_* variable so parallel tests never race on them.
    #[test]
    fn test_from_env() {
        {
            let _dir = EnvVarGuard::set("KILN_CACHE_DIR", None);
            let _persist = EnvVarGuard::set("KILN_PERSIST", None);
            let _poll = EnvVarGuard::set("KILN_POLL_INTERVAL_MS", None);
            assert_eq!(CacheSettings::from_env(), CacheSettings::default());
        }
        {
            let _dir = EnvVarGuard::set("KILN_CACHE_DIR", Some("/var/cache/kiln"));
            let _persist = EnvVarGuard::set("KILN_PERSIST", Some("FALSE"));
            let _poll = EnvVarGuard::set("KILN_POLL_INTERVAL_MS", Some("250"));
            let settings = CacheSettings::from_env();
            assert_eq!(settings.cache_dir, Some(PathBuf::from("/var/cache/kiln")));
            assert!(!settings.persist);
            assert_eq!(settings.poll_interval(), Duration::from_millis(250));
        }
        {
            let _dir = EnvVarGuard::set("KILN_CACHE_DIR", Some("   "));
            let _persist = EnvVarGuard::set("KILN_PERSIST", Some("yes"));
            let _poll = EnvVarGuard::set("KILN_POLL_INTERVAL_MS", Some("soon"));
            let settings = CacheSettings::from_env();
            assert!(settings.cache_dir.is_none());
            assert!(settings.persist);
            assert_eq!(settings.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        }
    }

    #[test]
    fn test_from_toml_str() {
        let settings = CacheSettings::from_toml_str(
            r#"
            cache_dir = "/var/cache/kiln"
            poll_interval_ms = 250
            "#,
        )
        .unwrap();
        assert!(settings.persist);
        assert_eq!(settings.cache_dir, Some(PathBuf::from("/var/cache/kiln")));
        assert_eq!(settings.poll_interval_ms, 250);
    }

    #[test]
    fn test_from_toml_rejects_unknown_fields() {
        let err = CacheSettings::from_toml_str("colour = \"red\"").unwrap_err();
        assert!(matches!(err, KilnError::Config(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_from_path_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = CacheSettings::from_path(&dir.path().join("kiln.toml")).unwrap_err();
        assert!(err.is_not_found());
    }
}
