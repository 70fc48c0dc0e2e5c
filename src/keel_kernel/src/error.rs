//! Result codes of blocking kernel operations
//!
//! Every operation that can block resolves to exactly one of three outcomes:
//! success, [`WaitError::Timeout`], or [`WaitError::Stopped`]. Precondition
//! violations (bad priority, blocking from an interrupt context, and the
//! like) are programming errors and are caught by assertions instead of
//! being reported through these types.
use core::fmt;

/// The error type of blocking kernel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The operation's deadline passed, or a polling operation found the
    /// object unavailable.
    Timeout,
    /// The object was reset by a `kill` operation while the caller was
    /// waiting on it.
    Stopped,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("the operation timed out"),
            Self::Stopped => f.write_str("the object was reset while waiting"),
        }
    }
}

/// The result type of blocking kernel operations.
pub type WaitResult<T> = Result<T, WaitError>;

/// The error type of [`Mutex::unlock`](crate::Mutex::unlock).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockError {
    /// The calling task does not own the mutex. This is also reported when
    /// the mutex was reset by a `kill` operation while the caller held it.
    NotOwner,
}

impl fmt::Display for UnlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotOwner => f.write_str("the mutex is not owned by the calling task"),
        }
    }
}
