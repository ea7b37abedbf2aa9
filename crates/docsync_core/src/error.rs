use thiserror::Error;

/// Unified error type for docsync operations
#[derive(Debug, Error)]
pub enum DocSyncError {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    // Wire protocol errors
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unexpected message type: {0}")]
    UnexpectedMessageType(u64),

    // Document life-cycle errors
    #[error("Document '{0}' does not exist")]
    DocumentNotFound(String),

    #[error("Document container '{0}' has been disposed")]
    ContainerDisposed(String),

    #[error("Document '{0}' already has an active transaction")]
    TransactionConflict(String),

    #[error("CRDT error: {0}")]
    Crdt(String),

    // Clustering errors
    #[error("Cluster payload error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Pub/sub channel is not connected")]
    ChannelUnavailable,

    #[error("Invalid relay URL '{0}'")]
    InvalidRelayUrl(String),
}

impl DocSyncError {
    /// Whether this error means the container was torn down underneath the caller.
    pub fn is_disposed(&self) -> bool {
        matches!(self, DocSyncError::ContainerDisposed(_))
    }

    /// Whether this error is a wire-level protocol violation.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            DocSyncError::Malformed(_) | DocSyncError::UnexpectedMessageType(_)
        )
    }
}

/// Result type alias for docsync operations
pub type Result<T> = std::result::Result<T, DocSyncError>;
