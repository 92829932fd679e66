//! Error types for the Gate runtime.

use gate_packet::ErrorKind;
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by [`Runtime`](crate::Runtime) and
/// [`Instance`](crate::Instance) operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// An error raised while serving the guest.
    #[error(transparent)]
    Gate(#[from] gate_packet::Error),

    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("module not found: {0}")]
    ModuleNotFound(String),

    /// The configured maximum number of instances is running.
    #[error("instance limit of {0} reached")]
    InstanceLimit(usize),

    /// The configured maximum number of modules is stored.
    #[error("module limit of {0} reached")]
    ModuleLimit(usize),

    /// The instance is not in a state that allows the operation.
    #[error("invalid instance state: {0}")]
    InvalidState(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::Gate(e) => e.kind(),
            RuntimeError::InstanceNotFound(_) | RuntimeError::ModuleNotFound(_) => {
                ErrorKind::NotFound
            }
            RuntimeError::InstanceLimit(_) | RuntimeError::ModuleLimit(_) => {
                ErrorKind::ResourceLimit
            }
            RuntimeError::InvalidState(_) => ErrorKind::Conflict,
            RuntimeError::Io(_) => ErrorKind::Internal,
        }
    }
}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
