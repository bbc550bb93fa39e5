use core::fmt::{Display, Formatter};

/// Errors surfaced by the card core.
///
/// Host-level transient conditions are classified by the host controller
/// itself; everything that crosses this crate's boundary is folded into one
/// of these variants.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SdError {
    /// R1 error bits, a bad R6/R7, or a host-reported transfer error.
    Io,
    /// Busy-wait exhaustion or a transfer event timeout.
    Timeout,
    /// Card absent, slot empty, or the card type is still unknown.
    NoDevice,
    /// R1 reported a card state the protocol does not allow here.
    InvalidState,
    /// Card is locked, or a write was attempted on write-protected media.
    PermissionDenied,
    /// Ioctl opcode (or feature) not handled.
    Unsupported,
    /// Bad minor, short buffer, or an oversized command batch.
    InvalidArgument,
    /// Bounce-buffer or slot allocation failure.
    OutOfMemory,
}

impl Display for SdError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            SdError::Io => write!(f, "io error"),
            SdError::Timeout => write!(f, "timeout"),
            SdError::NoDevice => write!(f, "no device"),
            SdError::InvalidState => write!(f, "invalid card state"),
            SdError::PermissionDenied => write!(f, "permission denied"),
            SdError::Unsupported => write!(f, "unsupported"),
            SdError::InvalidArgument => write!(f, "invalid argument"),
            SdError::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

pub type Result<T> = core::result::Result<T, SdError>;
