//! The host USB capability the server core relays through.
//!
//! The core only depends on the [`UsbBackend`] contract. Shipped
//! implementations: a simulated backend ([`sim`]) for tests and demos,
//! a scripted mock for unit tests, and the Linux usbfs backend
//! ([`usbfs`]) that drives real hardware.

pub mod sim;

#[cfg(test)]
pub mod mock;

#[cfg(target_os = "linux")]
pub mod usbfs;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::device::{Busid, UsbDevice};
use crate::proto::{self, IsoPacket};

/// Opaque handle to an exclusively claimed device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    pub fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            proto::DIR_OUT => Some(Direction::Out),
            proto::DIR_IN => Some(Direction::In),
            _ => None,
        }
    }

    pub fn as_wire(self) -> u32 {
        match self {
            Direction::Out => proto::DIR_OUT,
            Direction::In => proto::DIR_IN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

/// One URB as handed to the backend.
#[derive(Debug, Clone)]
pub struct UrbRequest {
    pub seqnum: u32,
    pub endpoint: u8,
    pub direction: Direction,
    pub kind: TransferKind,
    /// Setup packet; all zeroes unless `kind` is control.
    pub setup: [u8; 8],
    pub buffer_length: u32,
    /// OUT payload; empty for IN.
    pub out_data: Vec<u8>,
    /// (offset, length) per ISO packet.
    pub iso_packets: Vec<(u32, u32)>,
    pub interval: u32,
    pub start_frame: u32,
    pub flags: u32,
}

/// Backend resolution of one URB.
#[derive(Debug, Clone)]
pub struct UrbCompletion {
    pub seqnum: u32,
    /// 0 on success, negative errno otherwise.
    pub status: i32,
    pub actual_length: u32,
    /// IN payload; empty for OUT.
    pub data: Vec<u8>,
    pub start_frame: u32,
    pub error_count: u32,
    pub iso_packets: Vec<IsoPacket>,
}

impl UrbCompletion {
    pub fn success(seqnum: u32, data: Vec<u8>) -> Self {
        Self {
            seqnum,
            status: 0,
            actual_length: data.len() as u32,
            data,
            start_frame: 0,
            error_count: 0,
            iso_packets: Vec::new(),
        }
    }

    pub fn failure(seqnum: u32, status: i32) -> Self {
        Self {
            seqnum,
            status,
            actual_length: 0,
            data: Vec::new(),
            start_frame: 0,
            error_count: 1,
            iso_packets: Vec::new(),
        }
    }

    pub fn cancelled(seqnum: u32) -> Self {
        Self::failure(seqnum, proto::ECONNRESET)
    }
}

/// Bounded per-connection channel completions are pushed into. When the
/// connection cannot drain fast enough the backend blocks here, which
/// bounds memory per connection.
pub type CompletionSink = mpsc::Sender<UrbCompletion>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Cancellation was requested; a completion (usually `-ECONNRESET`)
    /// will still be delivered.
    Cancelled,
    /// The URB had already completed.
    AlreadyDone,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("device is busy")]
    Busy,
    #[error("no such device")]
    NoSuchDevice,
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("endpoint stalled")]
    Stall,
    #[error("backend failure: {0}")]
    Fatal(String),
    #[error("backend io: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn wire_status(&self) -> i32 {
        match self {
            BackendError::NoSuchDevice | BackendError::Busy => proto::ENODEV,
            BackendError::Stall => proto::EPIPE,
            _ => proto::EIO,
        }
    }

    /// Fatal means the USB subsystem is unusable for this process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BackendError::Fatal(_) | BackendError::AccessDenied(_))
    }
}

#[async_trait]
pub trait UsbBackend: Send + Sync {
    /// Fresh device scan, sorted by busid.
    async fn enumerate(&self) -> Result<Vec<UsbDevice>, BackendError>;

    /// Exclusively claim a device against the host. Non-blocking: if the
    /// host or another holder has it, fail fast with [`BackendError::Busy`].
    async fn claim(&self, busid: &Busid) -> Result<DeviceHandle, BackendError>;

    /// Release a claim. Idempotent; releasing an unknown handle is a no-op.
    async fn release(&self, handle: DeviceHandle) -> Result<(), BackendError>;

    /// Queue a URB. Submission failures are returned here; transfer
    /// failures travel in the completion's status.
    async fn submit(
        &self,
        handle: DeviceHandle,
        urb: UrbRequest,
        sink: CompletionSink,
    ) -> Result<(), BackendError>;

    /// Request cancellation of an in-flight URB.
    async fn cancel(&self, handle: DeviceHandle, seqnum: u32) -> Result<CancelOutcome, BackendError>;
}
