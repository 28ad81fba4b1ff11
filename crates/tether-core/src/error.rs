//! Error types for the interop kernel.
//!
//! Errors are split along the line the guest cares about: failures the guest
//! can recover from (a failed host operation, undecodable text, exhausted
//! resources) and defects (stale handles, out-of-bounds views, protocol
//! violations) that must never be tolerated. [`BridgeError::is_recoverable`]
//! draws that line; recoverable errors travel through the pending-error slot,
//! defects trap.

use thiserror::Error;

use crate::handles::Handle;
use crate::memory::ViewKind;
use crate::value::HostException;

/// Top-level error type for bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A host operation failed.
    #[error("Host error: {0}")]
    Host(HostException),

    /// Text crossing the boundary could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A bridge resource could not grow.
    #[error("Resource exhausted: {0}")]
    Exhausted(#[from] ResourceExhausted),

    /// A handle was used outside its lifetime.
    #[error("Handle error: {0}")]
    Handle(#[from] HandleError),

    /// A memory view was requested outside the guest buffer.
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    /// A closure reference count was misused.
    #[error("Closure error: {0}")]
    Closure(#[from] ClosureError),

    /// The pending-error slot protocol was violated.
    #[error("Error slot violation: {0}")]
    ErrorSlot(#[from] ErrorSlotViolation),

    /// A call into the guest failed.
    #[error("Guest call '{call}' failed: {message}")]
    Guest {
        /// The guest entry point that was called.
        call: &'static str,
        /// Description of the failure.
        message: String,
    },
}

impl BridgeError {
    /// Create a host error from anything convertible into an `anyhow::Error`.
    pub fn host(err: impl Into<anyhow::Error>) -> Self {
        Self::Host(HostException::new(err))
    }

    /// Create a guest call failure.
    pub fn guest(call: &'static str, message: impl std::fmt::Display) -> Self {
        Self::Guest {
            call,
            message: message.to_string(),
        }
    }

    /// Whether this error may be handed to the guest as a pending error.
    ///
    /// Host failures, decode failures and resource exhaustion are
    /// recoverable. Everything else is a defect.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Host(_) | Self::Decode(_) | Self::Exhausted(_))
    }

    /// Convert this error into the host value that is stored for the guest.
    pub fn into_exception(self) -> HostException {
        match self {
            Self::Host(exception) => exception,
            other => HostException::new(other),
        }
    }
}

/// Errors from handle table access.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandleError {
    /// The handle indexes past the end of the table.
    #[error("Handle {handle} out of range (table length {len})")]
    OutOfRange {
        /// The offending handle.
        handle: Handle,
        /// Current table length.
        len: usize,
    },

    /// The handle names a slot that has been freed.
    #[error("Handle {handle} refers to a freed slot")]
    Stale {
        /// The offending handle.
        handle: Handle,
    },

    /// The handle was freed twice under the strict free policy.
    #[error("Handle {handle} freed twice")]
    DoubleFree {
        /// The offending handle.
        handle: Handle,
    },

    /// The handle holds a value of the wrong kind for the operation.
    #[error("Handle {handle} holds {found}, expected {expected}")]
    UnexpectedKind {
        /// The offending handle.
        handle: Handle,
        /// The kind the operation needed.
        expected: &'static str,
        /// The kind that was found.
        found: &'static str,
    },
}

/// Errors from memory view access.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The requested range extends past the current buffer.
    #[error(
        "{kind} view out of bounds: offset={offset}, count={count}, available={available} elements"
    )]
    OutOfBounds {
        /// The view kind.
        kind: ViewKind,
        /// Element offset requested.
        offset: usize,
        /// Element count requested.
        count: usize,
        /// Elements available in the current buffer.
        available: usize,
    },

    /// A byte pointer is not aligned to the element width.
    #[error("Pointer {ptr:#x} is not aligned for a {kind} view")]
    Misaligned {
        /// The view kind.
        kind: ViewKind,
        /// The byte pointer.
        ptr: u32,
    },

    /// A length does not fit the guest's 32-bit address space.
    #[error("Length {0} does not fit in guest address space")]
    LengthOverflow(usize),
}

/// Errors from decoding guest text.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The byte range is not valid UTF-8.
    #[error("Invalid UTF-8 at byte {valid_up_to}")]
    InvalidUtf8 {
        /// Number of leading bytes that were valid.
        valid_up_to: usize,
        /// Length of the invalid sequence, if the input was not truncated.
        error_len: Option<usize>,
    },
}

impl From<std::str::Utf8Error> for DecodeError {
    fn from(err: std::str::Utf8Error) -> Self {
        Self::InvalidUtf8 {
            valid_up_to: err.valid_up_to(),
            error_len: err.error_len(),
        }
    }
}

/// A bridge resource could not grow any further.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResourceExhausted {
    /// The handle table reached its configured maximum.
    #[error("Handle table full: limit is {limit} handles")]
    HandleTable {
        /// Configured maximum number of slots.
        limit: u32,
    },

    /// Guest memory could not grow.
    #[error("Memory growth denied: requested {requested} bytes, limit {limit} bytes")]
    Memory {
        /// Requested size in bytes.
        requested: usize,
        /// Maximum size in bytes.
        limit: usize,
    },
}

/// Errors from closure lifetime management.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClosureError {
    /// A reference was released after the count reached zero.
    #[error("Closure {id} reference count underflow")]
    RefCountUnderflow {
        /// Closure identifier.
        id: u64,
    },
}

/// A second error was stored before the first was drained.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Pending error {pending} was not drained before error {incoming} was raised")]
pub struct ErrorSlotViolation {
    /// The handle already in the slot.
    pub pending: Handle,
    /// The handle that could not be stored.
    pub incoming: Handle,
}

/// Result type for bridge operations.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_taxonomy() {
        assert!(BridgeError::host(anyhow::anyhow!("boom")).is_recoverable());
        assert!(
            BridgeError::from(DecodeError::InvalidUtf8 {
                valid_up_to: 0,
                error_len: Some(1)
            })
            .is_recoverable()
        );
        assert!(BridgeError::from(ResourceExhausted::HandleTable { limit: 8 }).is_recoverable());

        assert!(!BridgeError::from(HandleError::Stale { handle: Handle::new(9) }).is_recoverable());
        assert!(!BridgeError::from(ClosureError::RefCountUnderflow { id: 1 }).is_recoverable());
        assert!(!BridgeError::guest("__tether_malloc", "trap").is_recoverable());
    }

    #[test]
    fn test_into_exception_keeps_host_error() {
        let err = BridgeError::host(anyhow::anyhow!("device lost"));
        assert_eq!(err.into_exception().message(), "device lost");

        let err = BridgeError::from(ResourceExhausted::HandleTable { limit: 8 });
        assert!(err.into_exception().message().contains("Handle table full"));
    }

    #[test]
    fn test_utf8_error_conversion() {
        let bytes = [b'a', 0xff];
        let err: DecodeError = std::str::from_utf8(&bytes).unwrap_err().into();
        assert_eq!(
            err,
            DecodeError::InvalidUtf8 {
                valid_up_to: 1,
                error_len: Some(1)
            }
        );
    }
}
