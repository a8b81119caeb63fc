//! Exclusive device claims.
//!
//! A device may be imported only while it is bound, present, and not
//! claimed by anyone else. The check-and-reserve window is atomic with
//! respect to other claim attempts: a `Pending` slot is parked in the
//! table before the backend call so a racing claimer sees the device as
//! taken even while the (non-blocking) backend claim is in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::backend::{DeviceHandle, UsbBackend};
use crate::bindings::BindingStore;
use crate::device::{Busid, DeviceRegistry, UsbDevice};
use crate::error::{Error, Result};

pub type ConnectionId = u64;

#[derive(Debug, Clone)]
pub struct ClaimedDevice {
    pub device: UsbDevice,
    pub owner: ConnectionId,
    pub handle: DeviceHandle,
    pub claimed_at: Instant,
}

enum Slot {
    /// Backend claim in flight.
    Pending(ConnectionId),
    Held(ClaimedDevice),
}

impl Slot {
    fn owner(&self) -> ConnectionId {
        match self {
            Slot::Pending(owner) => *owner,
            Slot::Held(claim) => claim.owner,
        }
    }
}

pub struct ClaimManager {
    backend: Arc<dyn UsbBackend>,
    registry: Arc<DeviceRegistry>,
    bindings: Arc<BindingStore>,
    table: Mutex<HashMap<Busid, Slot>>,
}

impl ClaimManager {
    pub fn new(
        backend: Arc<dyn UsbBackend>,
        registry: Arc<DeviceRegistry>,
        bindings: Arc<BindingStore>,
    ) -> Self {
        Self {
            backend,
            registry,
            bindings,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Try to claim `busid` for `owner`.
    pub async fn claim(&self, busid: Busid, owner: ConnectionId) -> Result<ClaimedDevice> {
        let device = {
            let mut table = self.table.lock();
            if table.contains_key(&busid) {
                return Err(Error::ClaimUnavailable(busid));
            }
            if !self.bindings.is_bound(&busid) {
                return Err(Error::NotBound(busid));
            }
            let device = self
                .registry
                .lookup(&busid)
                .ok_or(Error::NotPresent(busid))?;
            table.insert(busid, Slot::Pending(owner));
            device
        };

        match self.backend.claim(&busid).await {
            Ok(handle) => {
                let claim = ClaimedDevice {
                    device,
                    owner,
                    handle,
                    claimed_at: Instant::now(),
                };
                self.table.lock().insert(busid, Slot::Held(claim.clone()));
                debug!(busid = %busid, owner, "device claimed");
                Ok(claim)
            }
            Err(e) => {
                self.table.lock().remove(&busid);
                Err(e.into())
            }
        }
    }

    /// Release the claim on `busid`. Idempotent: releasing an unclaimed
    /// device is a no-op.
    pub async fn release(&self, busid: Busid) {
        let taken = self.table.lock().remove(&busid);
        if let Some(Slot::Held(claim)) = taken {
            if let Err(e) = self.backend.release(claim.handle).await {
                warn!(busid = %busid, error = %e, "backend release failed");
            }
            debug!(busid = %busid, owner = claim.owner, "device released");
        }
    }

    /// Release everything owned by a connection. Called on teardown.
    pub async fn release_all_owned_by(&self, owner: ConnectionId) {
        let owned: Vec<Busid> = self
            .table
            .lock()
            .iter()
            .filter(|(_, slot)| slot.owner() == owner)
            .map(|(busid, _)| *busid)
            .collect();
        for busid in owned {
            self.release(busid).await;
        }
    }

    /// Force-release every claim. Used by server stop after the grace
    /// period expires.
    pub async fn release_all(&self) {
        let all: Vec<Busid> = self.table.lock().keys().copied().collect();
        for busid in all {
            self.release(busid).await;
        }
    }

    pub fn owner_of(&self, busid: &Busid) -> Option<ConnectionId> {
        self.table.lock().get(busid).map(Slot::owner)
    }

    pub fn claimed_count(&self) -> usize {
        self.table.lock().len()
    }
}
