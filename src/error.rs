//! Error types shared by the lifecycle manager, installer, store and event bus.
//!
//! Every failure surfaced to a caller carries a human-readable reason. The
//! HTTP layer uses [`Error::kind`] to pick a status code; nothing else
//! inspects variants.

use thiserror::Error;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing arguments. No state was changed.
    Validation,
    /// The operation is not valid in the current state. No state was changed.
    Conflict,
    /// The referenced server does not exist.
    NotFound,
    /// Missing, revoked or invalid session.
    Unauthorized,
    /// Filesystem, process, database or network failure.
    Internal,
}

#[derive(Error, Debug)]
pub enum Error {
    /// Arguments failed validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The operation conflicts with the current server or install state.
    ///
    /// This error occurs when:
    /// - Starting a server that already has a live process
    /// - Installing a server that is already installing or running
    /// - Deleting a server that is still running
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Requested server was not found.
    #[error("Server not found: {0}")]
    NotFound(String),

    /// The per-server configuration is absent or unusable.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Spawning, signalling or writing to a server process failed.
    #[error("Server process error: {0}")]
    Process(String),

    /// A stage of an installation failed (acquire, verify, extract, locate).
    #[error("Installation failed: {0}")]
    Install(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::Config(_) => ErrorKind::Validation,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::Process(_)
            | Error::Install(_)
            | Error::Io(_)
            | Error::Database(_)
            | Error::Serialization(_) => ErrorKind::Internal,
        }
    }
}

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_and_validation_are_distinguishable() {
        assert_eq!(Error::Conflict("busy".into()).kind(), ErrorKind::Conflict);
        assert_eq!(Error::Config("missing".into()).kind(), ErrorKind::Validation);
        let io = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(io.kind(), ErrorKind::Internal);
    }
}
