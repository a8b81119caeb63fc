//! The binding registry: which local devices the operator has exported.
//!
//! Bindings are independent of device presence. They live inside the
//! server config and every mutation is persisted through the
//! [`ConfigStore`] before the call returns.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::config::{ConfigError, ConfigStore, ServerConfig};
use crate::device::Busid;

pub struct BindingStore {
    store: Arc<dyn ConfigStore>,
    state: Mutex<ServerConfig>,
    /// Serializes persistence without holding the state lock over file IO.
    persist: Mutex<()>,
}

impl BindingStore {
    /// Load state from the store. A corrupt store is fatal at startup.
    pub fn open(store: Arc<dyn ConfigStore>) -> Result<Self, ConfigError> {
        let config = store.load()?;
        Ok(Self {
            store,
            state: Mutex::new(config),
            persist: Mutex::new(()),
        })
    }

    /// Snapshot of the whole config (readers never see partial updates).
    pub fn config(&self) -> ServerConfig {
        self.state.lock().clone()
    }

    pub fn is_bound(&self, busid: &Busid) -> bool {
        self.state
            .lock()
            .allowed_devices
            .contains(&busid.to_string())
    }

    /// Consistent snapshot of the bound set for devlist filtering.
    pub fn bound_set(&self) -> BTreeSet<String> {
        self.state.lock().allowed_devices.clone()
    }

    /// Bound busids in numeric order. Entries that don't parse as busids
    /// (hand-edited config) are skipped.
    pub fn list(&self) -> Vec<Busid> {
        let mut ids: Vec<Busid> = self
            .state
            .lock()
            .allowed_devices
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        ids.sort();
        ids
    }

    /// Mark a device exportable. Returns false if it already was. Binding
    /// an absent device is allowed; it takes effect when it appears.
    pub fn bind(&self, busid: Busid) -> Result<bool, ConfigError> {
        let snapshot = {
            let mut state = self.state.lock();
            if !state.allowed_devices.insert(busid.to_string()) {
                return Ok(false);
            }
            state.clone()
        };
        self.persist_config(&snapshot)?;
        info!(busid = %busid, "device bound");
        Ok(true)
    }

    /// Remove a device from the exportable set. Returns false if it was
    /// not bound. Does not touch claims; unbinding a claimed device only
    /// prevents future imports.
    pub fn unbind(&self, busid: &Busid) -> Result<bool, ConfigError> {
        let snapshot = {
            let mut state = self.state.lock();
            if !state.allowed_devices.remove(&busid.to_string()) {
                return Ok(false);
            }
            state.clone()
        };
        self.persist_config(&snapshot)?;
        info!(busid = %busid, "device unbound");
        Ok(true)
    }

    fn persist_config(&self, config: &ServerConfig) -> Result<(), ConfigError> {
        let _guard = self.persist.lock();
        self.store.store(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JsonFileStore, MemStore};

    fn busid(s: &str) -> Busid {
        s.parse().unwrap()
    }

    #[test]
    fn bind_unbind_cycle() {
        let store = Arc::new(MemStore::default());
        let bindings = BindingStore::open(store).unwrap();

        assert!(!bindings.is_bound(&busid("1-1")));
        assert!(bindings.bind(busid("1-1")).unwrap());
        assert!(bindings.is_bound(&busid("1-1")));
        // Idempotent.
        assert!(!bindings.bind(busid("1-1")).unwrap());

        assert!(bindings.unbind(&busid("1-1")).unwrap());
        assert!(!bindings.is_bound(&busid("1-1")));
        assert!(!bindings.unbind(&busid("1-1")).unwrap());
    }

    #[test]
    fn binding_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usbwire.json");

        {
            let store = Arc::new(JsonFileStore::new(&path));
            let bindings = BindingStore::open(store).unwrap();
            bindings.bind(busid("3-7")).unwrap();
        }

        // Crash-equivalent restart: fresh store over the same file.
        let store = Arc::new(JsonFileStore::new(&path));
        let bindings = BindingStore::open(store).unwrap();
        assert!(bindings.is_bound(&busid("3-7")));
    }

    #[test]
    fn absent_devices_may_be_bound() {
        let bindings = BindingStore::open(Arc::new(MemStore::default())).unwrap();
        assert!(bindings.bind(busid("9-9")).unwrap());
        assert!(bindings.is_bound(&busid("9-9")));
    }

    #[test]
    fn list_is_numerically_sorted() {
        let bindings = BindingStore::open(Arc::new(MemStore::default())).unwrap();
        for id in ["10-1", "2-1", "1-10", "1-2"] {
            bindings.bind(busid(id)).unwrap();
        }
        let listed: Vec<String> = bindings.list().iter().map(|b| b.to_string()).collect();
        assert_eq!(listed, ["1-2", "1-10", "2-1", "10-1"]);
    }
}
