use thiserror::Error;

use crate::backend::BackendError;
use crate::codec::CodecError;
use crate::device::Busid;
use crate::proto;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Unified error for the server core.
///
/// Recoverable kinds are translated into wire statuses via
/// [`Error::wire_status`]; fatal kinds abort the server. Nothing inside a
/// per-connection task is allowed to abort the process.
#[derive(Debug, Error)]
pub enum Error {
    #[error("protocol violation: {0}")]
    Protocol(#[from] CodecError),

    #[error("{got} message is illegal in the {phase} phase")]
    IllegalMessage { phase: &'static str, got: &'static str },

    #[error("device {0} is not present")]
    NotPresent(Busid),

    #[error("device {0} is not bound")]
    NotBound(Busid),

    #[error("device {0} is claimed by someone else")]
    ClaimUnavailable(Busid),

    #[error("seqnum {0} is already in flight")]
    DuplicateSeqnum(u32),

    #[error("backend: {0}")]
    Backend(#[from] BackendError),

    #[error("config: {0}")]
    Config(String),

    #[error("peer disconnected")]
    Disconnect,

    #[error("deadline exceeded")]
    Timeout,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Negative errno-style status for RET_SUBMIT / RET_UNLINK.
    ///
    /// This is the only place host-side error kinds become wire-visible;
    /// the codec itself never sees them.
    pub fn wire_status(&self) -> i32 {
        match self {
            Error::NotPresent(_) | Error::NotBound(_) => proto::ENODEV,
            Error::ClaimUnavailable(_) => proto::ENODEV,
            Error::DuplicateSeqnum(_) => proto::EPIPE,
            Error::Timeout => proto::ETIME,
            Error::Disconnect => proto::ECONNRESET,
            Error::Backend(be) => be.wire_status(),
            _ => proto::EIO,
        }
    }

    /// Fatal errors terminate the server; everything else stays scoped to
    /// the request or connection that produced it.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Backend(be) => be.is_fatal(),
            Error::Config(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_status_mapping() {
        let busid: Busid = "1-2".parse().unwrap();
        assert_eq!(Error::NotPresent(busid).wire_status(), proto::ENODEV);
        assert_eq!(Error::Timeout.wire_status(), proto::ETIME);
        assert_eq!(Error::Disconnect.wire_status(), proto::ECONNRESET);
    }

    #[test]
    fn fatality() {
        assert!(Error::Config("bad".into()).is_fatal());
        assert!(!Error::Timeout.is_fatal());
        assert!(Error::Backend(BackendError::Fatal("usb subsystem gone".into())).is_fatal());
        assert!(!Error::Backend(BackendError::Busy).is_fatal());
    }
}
