//! Config loading and persistence.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for the local blob store. Defaults to the data dir.
    pub root_dir: Option<PathBuf>,
    /// Email identity of the local user; enables sharing and peer channels.
    pub email: Option<String>,
    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: None,
            email: None,
            sync: SyncConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Delay between the end of one pull cycle and the start of the next.
    pub pull_interval_secs: u64,
    /// Idle window after the last emitted event before an aggregated push.
    pub push_debounce_secs: u64,
    /// Blob count above which a backend is consolidated into a single blob.
    pub gather_blob_threshold: usize,
    /// Liveness ping period on the peer channel.
    pub web_ping_secs: u64,
    /// Period between peer channel re-establishments.
    pub web_refresh_secs: u64,
    /// Upper bound on concurrent per-backend pulls.
    pub pull_workers: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pull_interval_secs: 5,
            push_debounce_secs: 5,
            gather_blob_threshold: 10,
            web_ping_secs: 30,
            web_refresh_secs: 60,
            pull_workers: 4,
        }
    }
}

impl SyncConfig {
    pub fn pull_interval(&self) -> Duration {
        Duration::from_secs(self.pull_interval_secs)
    }

    pub fn push_debounce(&self) -> Duration {
        Duration::from_secs(self.push_debounce_secs)
    }

    pub fn web_ping_interval(&self) -> Duration {
        Duration::from_secs(self.web_ping_secs)
    }

    pub fn web_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.web_refresh_secs)
    }
}

impl Config {
    /// Effective root directory for the local blob store.
    pub fn root_dir(&self) -> PathBuf {
        self.root_dir
            .clone()
            .unwrap_or_else(crate::paths::data_dir)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub fn config_path() -> PathBuf {
    crate::paths::config_dir().join("config.toml")
}

pub fn load() -> Result<Config, ConfigError> {
    let path = config_path();
    load_from(&path)
}

pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        source: e,
    })?;
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        source: e,
    })
}

/// Load the config, writing defaults on first run and falling back to
/// defaults if the existing file fails to parse.
pub fn load_or_init() -> Config {
    let path = config_path();
    if path.exists() {
        match load_from(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                tracing::warn!("config load failed, using defaults: {e}");
                return Config::default();
            }
        }
    }

    let cfg = Config::default();
    if let Err(e) = write_config(&path, &cfg) {
        tracing::warn!("failed to write default config: {e}");
    }
    cfg
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| ConfigError::Write {
        path: dir.display().to_string(),
        source: e,
    })?;
    let contents = toml::to_string_pretty(cfg).map_err(|e| ConfigError::Write {
        path: path.display().to_string(),
        source: std::io::Error::other(e),
    })?;
    atomic_write(path, dir, contents.as_bytes())
}

fn atomic_write(path: &Path, dir: &Path, data: &[u8]) -> Result<(), ConfigError> {
    let err = |source: std::io::Error| ConfigError::Write {
        path: path.display().to_string(),
        source,
    };
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(err)?;
    fs::write(temp.path(), data).map_err(err)?;
    temp.persist(path)
        .map_err(|e| err(std::io::Error::other(e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        let cfg = Config {
            root_dir: Some(PathBuf::from("/tmp/plait-test")),
            email: Some("alice@example.com".to_string()),
            sync: SyncConfig {
                pull_interval_secs: 2,
                push_debounce_secs: 1,
                gather_blob_threshold: 7,
                web_ping_secs: 11,
                web_refresh_secs: 13,
                pull_workers: 3,
            },
        };
        write_config(&path, &cfg).expect("write config");
        let loaded = load_from(&path).expect("load config");
        assert_eq!(loaded.email.as_deref(), Some("alice@example.com"));
        assert_eq!(loaded.sync.pull_interval_secs, 2);
        assert_eq!(loaded.sync.gather_blob_threshold, 7);
    }

    #[test]
    fn defaults_match_sync_intervals() {
        let cfg = Config::default();
        assert_eq!(cfg.sync.pull_interval(), Duration::from_secs(5));
        assert_eq!(cfg.sync.push_debounce(), Duration::from_secs(5));
        assert_eq!(cfg.sync.gather_blob_threshold, 10);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let parsed: Config =
            toml::from_str("email = \"a@b.c\"\n[sync]\npull_interval_secs = 9\n")
                .expect("parse");
        assert_eq!(parsed.sync.pull_interval_secs, 9);
        assert_eq!(parsed.sync.push_debounce_secs, 5);
    }
}
