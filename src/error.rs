//! Crate-wide error type.
//!
//! Grounded on `flux::shared::NetworkError` (two-variant retryable/fatal
//! split) and `flux::shared::ErrorType`, generalized into a `thiserror` enum
//! matching spec.md §7's error kinds one-for-one.

use thiserror::Error;

/// Errors surfaced to the higher-level messaging framework.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("address is invalid for this operation")]
    AddressInvalid,

    #[error("address is already in use")]
    AddressInUse,

    #[error("endpoint or pipe is closed")]
    Closed,

    #[error("operation timed out")]
    TimedOut,

    #[error("connection refused by peer")]
    ConnectionRefused,

    #[error("protocol error: {0}")]
    ProtocolError(&'static str),

    #[error("message too large to send")]
    MessageTooLarge,

    #[error("out of memory")]
    OutOfMemory,

    #[error("operation not supported")]
    Unsupported,

    #[error("invalid parameter")]
    Invalid,

    #[error("permission denied")]
    Permission,

    #[error("internal error: {0}")]
    Internal(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Maps the handful of overlay-library result codes enumerated in spec.md §7
/// onto [`TransportError`]. The overlay library itself is out of scope; this
/// exists so the mapping table has one obvious home.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OverlayResultCode {
    Ok,
    OutOfMemory,
    DataStoreFailed,
    InternalError,
    NetworkNotFound,
    Unsupported,
    BadParameter,
    Other,
}

impl From<OverlayResultCode> for TransportError {
    fn from(code: OverlayResultCode) -> Self {
        match code {
            OverlayResultCode::Ok => {
                TransportError::Internal("mapped a success code to an error")
            }
            OverlayResultCode::OutOfMemory => TransportError::OutOfMemory,
            OverlayResultCode::DataStoreFailed => TransportError::Permission,
            OverlayResultCode::InternalError => TransportError::Internal("overlay library fault"),
            OverlayResultCode::NetworkNotFound => TransportError::AddressInvalid,
            OverlayResultCode::Unsupported => TransportError::Unsupported,
            OverlayResultCode::BadParameter => TransportError::Invalid,
            OverlayResultCode::Other => TransportError::Internal("unmapped overlay error"),
        }
    }
}

/// Wire-level error codes carried in `error` frames (spec.md §4.3).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum WireErrorCode {
    Refused = 1,
    NotConnected = 2,
    ProtoMismatch = 3,
    ProtoOther = 4,
    MsgTooLarge = 5,
    Unknown = 6,
}

impl WireErrorCode {
    pub fn from_u8(v: u8) -> Option<WireErrorCode> {
        Some(match v {
            1 => WireErrorCode::Refused,
            2 => WireErrorCode::NotConnected,
            3 => WireErrorCode::ProtoMismatch,
            4 => WireErrorCode::ProtoOther,
            5 => WireErrorCode::MsgTooLarge,
            6 => WireErrorCode::Unknown,
            _ => return None,
        })
    }

    /// Short static message attached to outgoing `error` frames (spec.md's
    /// supplemented feature: original_source always attaches descriptive text).
    pub fn message(self) -> &'static str {
        match self {
            WireErrorCode::Refused => "connection refused: no listener",
            WireErrorCode::NotConnected => "no matching pipe for this address",
            WireErrorCode::ProtoMismatch => "peer protocol mismatch",
            WireErrorCode::ProtoOther => "peer rejected connection",
            WireErrorCode::MsgTooLarge => "message exceeds receive capacity",
            WireErrorCode::Unknown => "unknown error",
        }
    }

    /// Maps an incoming `error` frame's code to the dialer-facing error, per
    /// spec.md §4.4 "Error frame on dialer".
    pub fn to_transport_error(self) -> TransportError {
        match self {
            WireErrorCode::Refused => TransportError::ConnectionRefused,
            WireErrorCode::NotConnected => TransportError::Closed,
            WireErrorCode::ProtoMismatch | WireErrorCode::ProtoOther => {
                TransportError::ProtocolError("peer protocol rejection")
            }
            WireErrorCode::MsgTooLarge => TransportError::MessageTooLarge,
            WireErrorCode::Unknown => TransportError::Internal("unknown peer error"),
        }
    }
}
