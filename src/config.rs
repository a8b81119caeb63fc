//! Server configuration and its persistence capability.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_PORT: u16 = 3240;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub port: u16,
    /// Busids the operator has exported, independent of device presence.
    pub allowed_devices: BTreeSet<String>,
    pub auto_bind_devices: bool,
    pub log_level: String,
    pub max_connections: usize,
    pub urb_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub max_transfer_bytes: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            allowed_devices: BTreeSet::new(),
            auto_bind_devices: false,
            log_level: "info".to_string(),
            max_connections: 64,
            urb_timeout_secs: 30,
            idle_timeout_secs: 300,
            shutdown_grace_secs: 5,
            max_transfer_bytes: 8 << 20,
        }
    }
}

impl ServerConfig {
    pub fn urb_timeout(&self) -> Duration {
        Duration::from_secs(self.urb_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config corrupt: {0}")]
    Corrupt(String),
}

/// Persistence capability for [`ServerConfig`].
///
/// Writes must be atomic: a crash mid-store may lose the update but must
/// never leave a partial file behind.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<ServerConfig, ConfigError>;
    fn store(&self, config: &ServerConfig) -> Result<(), ConfigError>;
}

/// JSON file store with write-then-rename persistence.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl ConfigStore for JsonFileStore {
    fn load(&self) -> Result<ServerConfig, ConfigError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no config file, using defaults");
                return Ok(ServerConfig::default());
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| ConfigError::Corrupt(e.to_string()))
    }

    fn store(&self, config: &ServerConfig) -> Result<(), ConfigError> {
        let json = serde_json::to_vec_pretty(config)
            .map_err(|e| ConfigError::Corrupt(e.to_string()))?;

        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "config persisted");
        Ok(())
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<ServerConfig>,
}

impl MemStore {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: Mutex::new(config),
        }
    }
}

impl ConfigStore for MemStore {
    fn load(&self) -> Result<ServerConfig, ConfigError> {
        Ok(self.inner.lock().clone())
    }

    fn store(&self, config: &ServerConfig) -> Result<(), ConfigError> {
        *self.inner.lock() = config.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_uses_camel_case_fields() {
        let mut cfg = ServerConfig::default();
        cfg.allowed_devices.insert("1-1".to_string());
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"allowedDevices\""));
        assert!(json.contains("\"autoBindDevices\""));
        assert!(json.contains("\"maxConnections\""));
    }

    #[test]
    fn file_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("usbwire.json"));

        let mut cfg = ServerConfig::default();
        cfg.port = 3241;
        cfg.allowed_devices.insert("2-3".to_string());
        store.store(&cfg).unwrap();

        assert_eq!(store.load().unwrap(), cfg);
        // No temp file left behind.
        assert!(!dir.path().join("usbwire.json.tmp").exists());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nope.json"));
        assert_eq!(store.load().unwrap(), ServerConfig::default());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, b"{ not json").unwrap();
        let store = JsonFileStore::new(path);
        assert!(matches!(store.load(), Err(ConfigError::Corrupt(_))));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: ServerConfig = serde_json::from_str(r#"{"port": 9999}"#).unwrap();
        assert_eq!(cfg.port, 9999);
        assert_eq!(cfg.max_connections, 64);
        assert!(cfg.allowed_devices.is_empty());
    }
}
