//! Error type shared by the Gate crates.
//!
//! Errors are classified by [`ErrorKind`] so that the runtime can decide what
//! happens to an instance without matching on messages. Only the public
//! message of an error may be shown to the guest's owner; internal details go
//! to the log.

use thiserror::Error;

/// Error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadProgram,
    ResourceLimit,
    NotFound,
    Conflict,
    Cancelled,
    Internal,
}

/// Errors raised while serving a guest.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The guest violated the packet protocol. Fatal to the instance.
    #[error("bad program: {0}")]
    BadProgram(String),

    /// A configured limit was exceeded.
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),

    /// Something looked up by name or id does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation collides with existing state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The operation was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// A host-side failure. `public` is safe to show, `internal` is not.
    #[error("{public}: {internal}")]
    Internal { public: String, internal: String },
}

impl Error {
    pub fn bad_program(message: impl Into<String>) -> Self {
        Error::BadProgram(message.into())
    }

    pub fn internal(public: impl Into<String>, internal: impl Into<String>) -> Self {
        Error::Internal {
            public: public.into(),
            internal: internal.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadProgram(_) => ErrorKind::BadProgram,
            Error::ResourceLimit(_) => ErrorKind::ResourceLimit,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Message without internal details.
    pub fn public_message(&self) -> String {
        match self {
            Error::Internal { public, .. } => public.clone(),
            other => other.to_string(),
        }
    }

    pub fn is_bad_program(&self) -> bool {
        self.kind() == ErrorKind::BadProgram
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::internal("I/O error", e.to_string())
    }
}

/// Result type alias for Gate operations.
pub type Result<T> = std::result::Result<T, Error>;
