//! ## Errors
//!
//! The error types used throughout the crate.
//!

use crate::transport::Phase;

/// Errors produced while encoding or decoding wire data.
///
/// Decoding is total: any malformed input maps onto one of these
/// variants, never a panic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("input truncated: needed {needed} more bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    #[error("unknown data type code 0x{0:04x}")]
    BadType(u16),
    #[error("malformed UTF-16 string")]
    BadString,
    #[error("malformed container: {0}")]
    BadContainer(&'static str),
}

/// Errors raised by a bulk transport implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("device detached")]
    NoDevice,
    #[error("transfer timed out")]
    Timeout,
    #[error("transfer timed out in {0:?} phase")]
    TimeoutInPhase(Phase),
    #[error("endpoint stalled")]
    Stall,
    #[error("device busy")]
    Busy,
    #[error("access to the device was denied")]
    AccessDenied,
    #[error("transfer cancelled")]
    Cancelled,
    #[error("usb i/o error: {0}")]
    Io(String),
}

impl From<rusb::Error> for TransportError {
    fn from(e: rusb::Error) -> TransportError {
        match e {
            rusb::Error::NoDevice | rusb::Error::NotFound => TransportError::NoDevice,
            rusb::Error::Timeout => TransportError::Timeout,
            rusb::Error::Pipe => TransportError::Stall,
            rusb::Error::Busy => TransportError::Busy,
            rusb::Error::Access => TransportError::AccessDenied,
            other => TransportError::Io(other.to_string()),
        }
    }
}

/// Errors surfaced by the protocol engine, sessions and transfers.
#[derive(Debug, thiserror::Error)]
pub enum MtpError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("device returned response 0x{code:04x}")]
    ProtocolError { code: u16, message: Option<String> },
    #[error("operation cancelled")]
    Cancelled,
    #[error("session is busy with another operation")]
    SessionBusy,
    #[error("transfer verification failed: {0}")]
    VerificationFailed(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("operation not supported by device: {0}")]
    NotSupported(&'static str),
    #[error("object not found")]
    ObjectNotFound,
    #[error("storage is full")]
    StorageFull,
    #[error("storage is read-only")]
    ReadOnly,
    #[error("object is write-protected")]
    ObjectWriteProtected,
    #[error("device disconnected")]
    DeviceDisconnected,
    #[error("permission denied")]
    PermissionDenied,
    #[error("overall deadline expired")]
    Timeout,
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("local i/o error: {0}")]
    LocalIo(#[from] std::io::Error),
}

impl MtpError {
    /// Map a non-OK response code onto the error taxonomy.
    pub fn from_response_code(code: u16) -> MtpError {
        use crate::constants::rc;
        match code {
            rc::INVALID_OBJECT_HANDLE | rc::INVALID_STORAGE_ID | rc::INVALID_PARENT_OBJECT => {
                MtpError::ObjectNotFound
            }
            rc::STORE_FULL => MtpError::StorageFull,
            rc::STORE_READ_ONLY => MtpError::ReadOnly,
            rc::OBJECT_WRITE_PROTECTED => MtpError::ObjectWriteProtected,
            rc::ACCESS_DENIED => MtpError::PermissionDenied,
            code => MtpError::ProtocolError {
                code,
                message: None,
            },
        }
    }

    /// True when the session must latch closed after this error.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            MtpError::DeviceDisconnected
                | MtpError::Transport(TransportError::NoDevice)
                | MtpError::Transport(TransportError::Stall)
        )
    }
}

/// Errors raised by the durable transfer journal.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("no transfer with id {0}")]
    UnknownTransfer(uuid::Uuid),
    #[error("journal i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal record corrupt: {0}")]
    Corrupt(String),
}
