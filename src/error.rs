//! Error types for vmsup.

use std::time::Duration;

use crate::ledger::Denied;
use crate::vm::VmId;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by supervisor operations.
///
/// Every variant that concerns a single VM names it, so callers can report
/// which instance an operation failed on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Host capacity cannot admit the requested reservation.
    #[error("insufficient resources for VM '{name}': {denied}")]
    InsufficientResources {
        /// Caller-supplied name of the rejected VM.
        name: String,
        /// Which budget refused the request.
        denied: Denied,
    },

    /// No VM with this id is known.
    #[error("VM not found: {0}")]
    NotFound(VmId),

    /// The VM is not in a state that permits the operation.
    #[error("VM {id} is {actual}, expected {expected}")]
    InvalidState {
        /// Target VM.
        id: VmId,
        /// Acceptable state(s) for the operation.
        expected: String,
        /// State observed when the operation was attempted.
        actual: String,
    },

    /// The hypervisor driver failed.
    #[error("driver error for VM {id}: {source}")]
    Driver {
        /// Target VM.
        id: VmId,
        /// Underlying driver failure.
        #[source]
        source: DriverError,
    },

    /// Host preparation by the driver failed.
    #[error("host initialization failed: {0}")]
    Host(#[source] DriverError),

    /// A driver call did not finish in time.
    #[error("{operation} of VM {id} timed out after {after:?}")]
    Timeout {
        /// Target VM.
        id: VmId,
        /// Operation that timed out ("provision", "terminate").
        operation: &'static str,
        /// The bound that was exceeded.
        after: Duration,
    },

    /// An internal invariant was violated.
    #[error("internal fault: {0}")]
    InternalFault(String),

    /// Request parameters were rejected before any state changed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Persistent state store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an `InvalidState` error.
    pub fn invalid_state(id: &VmId, expected: impl Into<String>, actual: impl ToString) -> Self {
        Self::InvalidState {
            id: id.clone(),
            expected: expected.into(),
            actual: actual.to_string(),
        }
    }

    /// Wrap a driver failure for a VM.
    pub fn driver(id: &VmId, source: DriverError) -> Self {
        Self::Driver {
            id: id.clone(),
            source,
        }
    }
}

impl From<redb::Error> for Error {
    fn from(err: redb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

macro_rules! storage_error_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Error {
                fn from(err: $ty) -> Self {
                    Error::Storage(err.to_string())
                }
            }
        )*
    };
}

storage_error_from!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

/// Failures reported by a hypervisor driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The driver could not start its helper command or VM process.
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        /// Program that failed to start.
        command: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A helper command exited unsuccessfully.
    #[error("'{command}' exited with status {code:?}: {stderr}")]
    CommandFailed {
        /// Command line that failed.
        command: String,
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Trimmed standard error output.
        stderr: String,
    },

    /// The driver returned output that could not be understood.
    #[error("unexpected driver output: {0}")]
    InvalidOutput(String),

    /// The handle does not belong to this driver.
    #[error("handle not supported by this driver: {0}")]
    UnsupportedHandle(String),

    /// The VM process would not stop.
    #[error("VM process {pid} did not exit after SIGKILL")]
    Unkillable {
        /// Process id that survived.
        pid: i32,
    },
}
