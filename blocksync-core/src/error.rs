//! Error taxonomy for the replication engine.

use thiserror::Error;

/// Result type for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur across the replication stack.
///
/// Frame and payload errors are recoverable at the session level (the
/// offending frame is logged and dropped); state errors indicate a
/// programming error in the host application and propagate to the caller.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Malformed multipart frame: missing/extra parts, empty required field.
    #[error("malformed network frame: {0}")]
    NetworkFrame(String),

    /// Payload failed to deserialize.
    #[error("payload error: {0}")]
    Data(String),

    /// Operation attempted from an illegal node or session state.
    #[error("illegal state: {0}")]
    State(String),

    /// No binding registered for a payload's type name.
    #[error("no binding registered for type {0:?}")]
    UnsupportedType(String),

    /// Authentication handshake failure.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Underlying socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReplicationError {
    /// Whether this error may be swallowed by a session loop (logged and
    /// skipped) rather than propagated.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ReplicationError::NetworkFrame(_)
                | ReplicationError::Data(_)
                | ReplicationError::UnsupportedType(_)
        )
    }
}
