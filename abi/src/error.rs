//! Driver error taxonomy.
//!
//! Every fallible operation in the stack returns [`DriverError`] through
//! [`DriverResult`]. The variants are *kinds*, not sources: a caller decides
//! retry-vs-abort purely from the kind. The ioctl surface converts kinds to
//! negative errno values via [`DriverError::errno`].

use core::fmt;

/// Error kinds surfaced by the NFB driver stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum DriverError {
    /// Controller is not in the RUNNING state the operation requires.
    NotReady,
    /// Resource held by another owner, or a TX ring would overrun.
    Busy,
    /// No progress was possible; the caller should retry later.
    Again,
    /// Non-final success of a multi-step operation; keep polling.
    InProgress,
    /// Malformed descriptor, non-power-of-two size, out-of-range index.
    InvalidArgument,
    /// FDT node missing or controller not found.
    NoDevice,
    /// DMA or heap allocation failure.
    NoMemory,
    /// FDT property with wrong length/type, or a malformed packet header.
    BadFormat,
    /// Controller did not stop cleanly; further operation is unreliable.
    Dirty,
    /// Open-flag or exclusivity violation.
    Permission,
    /// Operation not implemented for this controller generation.
    NotSupported,
}

/// Result alias used throughout the stack.
pub type DriverResult<T> = Result<T, DriverError>;

impl DriverError {
    /// Negative errno value reported on the character-device surface.
    pub const fn errno(self) -> i32 {
        match self {
            DriverError::NotReady => -77,        // EBADFD
            DriverError::Busy => -16,            // EBUSY
            DriverError::Again => -11,           // EAGAIN
            DriverError::InProgress => -115,     // EINPROGRESS
            DriverError::InvalidArgument => -22, // EINVAL
            DriverError::NoDevice => -19,        // ENODEV
            DriverError::NoMemory => -12,        // ENOMEM
            DriverError::BadFormat => -74,       // EBADMSG
            DriverError::Dirty => -5,            // EIO
            DriverError::Permission => -1,       // EPERM
            DriverError::NotSupported => -95,    // EOPNOTSUPP
        }
    }

    /// Transient errors are recovered locally with bounded retries.
    #[inline]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            DriverError::Busy | DriverError::Again | DriverError::InProgress
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            DriverError::NotReady => "not ready",
            DriverError::Busy => "busy",
            DriverError::Again => "try again",
            DriverError::InProgress => "in progress",
            DriverError::InvalidArgument => "invalid argument",
            DriverError::NoDevice => "no such device",
            DriverError::NoMemory => "out of memory",
            DriverError::BadFormat => "bad format",
            DriverError::Dirty => "dirty controller state",
            DriverError::Permission => "permission denied",
            DriverError::NotSupported => "not supported",
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
