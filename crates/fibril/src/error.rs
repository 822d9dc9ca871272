//! Runtime error type and benign outcome types
//!
//! Every fallible runtime call returns [`Result`]. Expected, non-failure
//! outcomes of lock and wait operations (lock already held, wait timed out)
//! are not errors: they are returned as [`LockStatus`] and [`WaitStatus`].

use std::io;

/// Result type used across the runtime
pub type Result<T> = std::result::Result<T, Error>;

/// Broad class of an [`Error`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid or stale handle, or an operation in the wrong state
    Usage,
    /// Allocation or OS resource failure
    Resource,
    /// Capability not provided by the runtime or by a given pool/scheduler
    Unsupported,
}

/// Errors returned by runtime operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The runtime has not been initialized
    #[error("runtime is not initialized")]
    Uninitialized,

    /// Memory (or a unit stack) could not be allocated
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// An argument is out of range
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// Invalid or freed execution stream, or no execution stream in this context
    #[error("invalid execution stream")]
    InvalidXstream,

    /// Execution stream rank is out of range or already taken
    #[error("invalid execution stream rank {0}")]
    InvalidXstreamRank(usize),

    /// Invalid or freed scheduler
    #[error("invalid scheduler")]
    InvalidSched,

    /// Scheduler configuration value missing or of the wrong type
    #[error("invalid scheduler configuration: {0}")]
    InvalidSchedConfig(String),

    /// Invalid or freed pool
    #[error("invalid pool")]
    InvalidPool,

    /// Pool access discipline does not allow the requested association
    #[error("pool access discipline violated: {0}")]
    InvalidPoolAccess(&'static str),

    /// Invalid or freed work unit, or no work unit in this context
    #[error("invalid work unit")]
    InvalidUnit,

    /// Invalid or freed work-unit-specific data key
    #[error("invalid key")]
    InvalidKey,

    /// Invalid or freed mutex
    #[error("invalid mutex")]
    InvalidMutex,

    /// Invalid or freed condition variable
    #[error("invalid condition variable")]
    InvalidCond,

    /// Invalid or freed readers-writer lock
    #[error("invalid readers-writer lock")]
    InvalidRwLock,

    /// Invalid or freed eventual
    #[error("invalid eventual")]
    InvalidEventual,

    /// Invalid or freed future
    #[error("invalid future")]
    InvalidFuture,

    /// Invalid or freed barrier
    #[error("invalid barrier")]
    InvalidBarrier,

    /// Query kind does not apply to the reported event
    #[error("invalid tool context query")]
    InvalidToolContext,

    /// Execution stream is in the wrong state for the operation
    #[error("execution stream state: {0}")]
    XstreamState(&'static str),

    /// Scheduler is already in use or in the wrong state
    #[error("scheduler: {0}")]
    Sched(&'static str),

    /// Pool is in use or in the wrong state
    #[error("pool: {0}")]
    Pool(&'static str),

    /// Work unit is in the wrong state for the operation
    #[error("work unit state: {0}")]
    UnitState(&'static str),

    /// Operation requires a stackful work unit
    #[error("operation requires a stackful work unit")]
    NotStackful,

    /// Mutex misuse (unlock by non-owner, relock of a non-recursive mutex)
    #[error("mutex: {0}")]
    Mutex(&'static str),

    /// Condition variable misuse (freed with waiters, bound to another mutex)
    #[error("condition variable: {0}")]
    Cond(&'static str),

    /// Readers-writer lock misuse (unlock while not held, freed while held)
    #[error("readers-writer lock: {0}")]
    RwLock(&'static str),

    /// Eventual misuse (size mismatch, set twice, reset with waiters)
    #[error("eventual: {0}")]
    Eventual(&'static str),

    /// Future misuse (set past its compartment count, reset with waiters)
    #[error("future: {0}")]
    Future(&'static str),

    /// Barrier misuse (reinit while a round is in progress)
    #[error("barrier: {0}")]
    Barrier(&'static str),

    /// Migration target is the unit's current location or cannot receive units
    #[error("invalid migration target")]
    MigrationTarget,

    /// Unit is not migratable or not READY
    #[error("migration not allowed: {0}")]
    MigrationNotAllowed(&'static str),

    /// Feature not supported by this build, platform, pool or scheduler
    #[error("feature not available: {0}")]
    FeatureUnavailable(&'static str),

    /// An OS call failed
    #[error("{op} failed: {source}")]
    Sys {
        /// Operation that failed
        op: &'static str,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// CPU binding failed
    #[error("cannot bind to cpu {cpu}: {source}")]
    CpuBind {
        /// Requested CPU id
        cpu: usize,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Wrap an OS error with the name of the failing operation
    pub(crate) fn sys(op: &'static str, source: io::Error) -> Self {
        Error::Sys { op, source }
    }

    /// Category of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::OutOfMemory(_) | Error::Sys { .. } | Error::CpuBind { .. } => {
                ErrorCategory::Resource
            }
            Error::FeatureUnavailable(_) => ErrorCategory::Unsupported,
            _ => ErrorCategory::Usage,
        }
    }
}

/// Outcome of a non-blocking lock attempt
#[must_use]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LockStatus {
    /// The caller now holds the lock
    Acquired,
    /// The lock is held elsewhere; nothing was changed
    Busy,
}

impl LockStatus {
    /// Whether the lock was acquired
    pub fn is_acquired(self) -> bool {
        self == LockStatus::Acquired
    }
}

/// Outcome of a timed wait
#[must_use]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitStatus {
    /// Woken by a signal before the deadline
    Signaled,
    /// The deadline passed first
    TimedOut,
}

impl WaitStatus {
    /// Whether the wait timed out
    pub fn timed_out(self) -> bool {
        self == WaitStatus::TimedOut
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(Error::Uninitialized.category(), ErrorCategory::Usage);
        assert_eq!(
            Error::OutOfMemory("stack".into()).category(),
            ErrorCategory::Resource
        );
        assert_eq!(
            Error::sys("spawn", io::Error::from(io::ErrorKind::Other)).category(),
            ErrorCategory::Resource
        );
        assert_eq!(
            Error::FeatureUnavailable("remove").category(),
            ErrorCategory::Unsupported
        );
        assert_eq!(
            Error::MigrationNotAllowed("running").category(),
            ErrorCategory::Usage
        );
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(Error::InvalidXstreamRank(3).to_string(), "invalid execution stream rank 3");
        let err = Error::sys("thread spawn", io::Error::new(io::ErrorKind::Other, "no threads"));
        assert_eq!(err.to_string(), "thread spawn failed: no threads");
    }

    #[test]
    fn test_benign_outcomes() {
        assert!(LockStatus::Acquired.is_acquired());
        assert!(!LockStatus::Busy.is_acquired());
        assert!(WaitStatus::TimedOut.timed_out());
        assert!(!WaitStatus::Signaled.timed_out());
    }
}
