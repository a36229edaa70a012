//! Unified error handling for rocpool
//!
//! Three failure classes reach callers: precondition violations (programmer
//! errors, never recovered), out-of-memory after the one trim-and-retry
//! attempt, and raw driver failures. Lock poisoning is surfaced explicitly
//! rather than panicking inside the allocator.

use thiserror::Error;

use crate::driver::DriverError;
use crate::pool::AllocKind;

#[derive(Debug, Error)]
pub enum AllocError {
    /// Programmer error: missing/mismatched stream, unknown pointer,
    /// unsupported migration pair, invalid device index.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// The underlying allocator failed twice (once before and once after
    /// trimming the caches).
    #[error("out of memory: could not allocate {size} bytes of {kind} memory")]
    OutOfMemory { kind: AllocKind, size: usize },

    /// Any other nonzero driver return.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// Internal lock poisoned - this indicates a bug.
    #[error("internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for AllocError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        AllocError::LockPoisoned(err.to_string())
    }
}

impl AllocError {
    /// Whether retrying after freeing memory elsewhere could succeed.
    /// Precondition violations and poisoned locks never recover.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AllocError::OutOfMemory { .. } | AllocError::Driver(DriverError::OutOfMemory)
        )
    }
}

pub type AllocResult<T> = Result<T, AllocError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let err = AllocError::OutOfMemory {
            kind: AllocKind::Device,
            size: 1 << 20,
        };
        assert_eq!(
            err.to_string(),
            "out of memory: could not allocate 1048576 bytes of device memory"
        );

        let err = AllocError::Precondition("free: unknown address 0x10".to_string());
        assert_eq!(
            err.to_string(),
            "precondition violated: free: unknown address 0x10"
        );
    }

    #[test]
    fn recoverability() {
        assert!(AllocError::OutOfMemory {
            kind: AllocKind::Host,
            size: 64
        }
        .is_recoverable());
        assert!(AllocError::Driver(DriverError::OutOfMemory).is_recoverable());
        assert!(!AllocError::Precondition("bad".to_string()).is_recoverable());
        assert!(!AllocError::LockPoisoned("bad".to_string()).is_recoverable());
    }

    #[test]
    fn driver_error_converts() {
        let err: AllocError = DriverError::InvalidDevice(7).into();
        assert!(matches!(
            err,
            AllocError::Driver(DriverError::InvalidDevice(7))
        ));
    }

    #[test]
    fn poison_error_converts() {
        use std::sync::PoisonError;

        fn convert<T>(err: PoisonError<T>) -> AllocError {
            AllocError::from(err)
        }
        let _ = convert::<i32> as fn(PoisonError<i32>) -> AllocError;
    }
}
