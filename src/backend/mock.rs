//! Scripted backend for unit tests: records every call, parks every
//! submission until the test resolves it.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    BackendError, CancelOutcome, CompletionSink, DeviceHandle, UrbCompletion, UrbRequest,
    UsbBackend,
};
use crate::device::{Busid, UsbDevice};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Enumerate,
    Claim(Busid),
    Release(u64),
    Submit(u32),
    Cancel(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    Unavailable,
    AccessDenied,
}

#[derive(Default)]
struct Inner {
    devices: Vec<UsbDevice>,
    enumerate_failure: Option<ScriptedFailure>,
    claim_busy: HashSet<Busid>,
    next_handle: u64,
    handles: HashMap<u64, Busid>,
    pending: HashMap<(u64, u32), CompletionSink>,
    calls: Vec<Call>,
}

#[derive(Default)]
pub struct MockBackend {
    inner: Mutex<Inner>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: impl IntoIterator<Item = UsbDevice>) -> Self {
        let mock = Self::new();
        mock.inner.lock().devices = devices.into_iter().collect();
        mock
    }

    pub fn set_enumerate_failure(&self, failure: Option<ScriptedFailure>) {
        self.inner.lock().enumerate_failure = failure;
    }

    /// Make claim attempts on `busid` fail with `Busy`, as if the host
    /// held the device.
    pub fn set_claim_busy(&self, busid: Busid) {
        self.inner.lock().claim_busy.insert(busid);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().calls.clone()
    }

    pub fn pending_seqnums(&self) -> Vec<u32> {
        let mut seqs: Vec<u32> = self.inner.lock().pending.keys().map(|&(_, s)| s).collect();
        seqs.sort_unstable();
        seqs
    }

    /// Resolve a parked submission. Returns false if it is not in flight
    /// (never submitted, already completed, or already cancelled).
    pub async fn complete(&self, handle: DeviceHandle, completion: UrbCompletion) -> bool {
        let sink = self.inner.lock().pending.remove(&(handle.0, completion.seqnum));
        match sink {
            Some(sink) => sink.send(completion).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl UsbBackend for MockBackend {
    async fn enumerate(&self) -> Result<Vec<UsbDevice>, BackendError> {
        let mut inner = self.inner.lock();
        inner.calls.push(Call::Enumerate);
        match inner.enumerate_failure {
            Some(ScriptedFailure::Unavailable) => {
                Err(BackendError::Unavailable("scripted".to_string()))
            }
            Some(ScriptedFailure::AccessDenied) => {
                Err(BackendError::AccessDenied("scripted".to_string()))
            }
            None => {
                let mut devices = inner.devices.clone();
                devices.sort_by_key(|d| d.busid);
                Ok(devices)
            }
        }
    }

    async fn claim(&self, busid: &Busid) -> Result<DeviceHandle, BackendError> {
        let mut inner = self.inner.lock();
        inner.calls.push(Call::Claim(*busid));
        if !inner.devices.iter().any(|d| d.busid == *busid) {
            return Err(BackendError::NoSuchDevice);
        }
        if inner.claim_busy.contains(busid) || inner.handles.values().any(|b| b == busid) {
            return Err(BackendError::Busy);
        }
        inner.next_handle += 1;
        let handle = inner.next_handle;
        inner.handles.insert(handle, *busid);
        Ok(DeviceHandle(handle))
    }

    async fn release(&self, handle: DeviceHandle) -> Result<(), BackendError> {
        let mut inner = self.inner.lock();
        inner.calls.push(Call::Release(handle.0));
        inner.handles.remove(&handle.0);
        inner.pending.retain(|&(h, _), _| h != handle.0);
        Ok(())
    }

    async fn submit(
        &self,
        handle: DeviceHandle,
        urb: UrbRequest,
        sink: CompletionSink,
    ) -> Result<(), BackendError> {
        let mut inner = self.inner.lock();
        inner.calls.push(Call::Submit(urb.seqnum));
        if !inner.handles.contains_key(&handle.0) {
            return Err(BackendError::NoSuchDevice);
        }
        inner.pending.insert((handle.0, urb.seqnum), sink);
        Ok(())
    }

    async fn cancel(&self, handle: DeviceHandle, seqnum: u32) -> Result<CancelOutcome, BackendError> {
        let sink = {
            let mut inner = self.inner.lock();
            inner.calls.push(Call::Cancel(seqnum));
            inner.pending.remove(&(handle.0, seqnum))
        };
        match sink {
            Some(sink) => {
                let _ = sink.send(UrbCompletion::cancelled(seqnum)).await;
                Ok(CancelOutcome::Cancelled)
            }
            None => Ok(CancelOutcome::AlreadyDone),
        }
    }
}
