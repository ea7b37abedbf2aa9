//! Originator of an operation.

use uuid::Uuid;

/// Client id used for server-originated events (loads, sweeps).
pub const SYSTEM_CLIENT_ID: u64 = 0;

/// Extra data carried alongside a [`DocumentContext`].
#[derive(Debug, Clone, PartialEq)]
pub enum ContextMetadata {
    /// The operation is a replay of a message published by another node.
    ClusterReplay { sender: Uuid },
}

/// Identifies who triggered an operation on which document.
///
/// Observers use the client id to suppress echoing a change back to the
/// connection that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentContext {
    pub document_name: String,
    pub client_id: u64,
    pub metadata: Option<ContextMetadata>,
}

impl DocumentContext {
    pub fn new(document_name: impl Into<String>, client_id: u64) -> Self {
        Self {
            document_name: document_name.into(),
            client_id,
            metadata: None,
        }
    }

    /// Context for an operation performed by the server itself.
    pub fn system(document_name: impl Into<String>) -> Self {
        Self::new(document_name, SYSTEM_CLIENT_ID)
    }

    pub fn with_metadata(mut self, metadata: ContextMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Whether this operation originated on another cluster node.
    pub fn is_cluster_replay(&self) -> bool {
        matches!(self.metadata, Some(ContextMetadata::ClusterReplay { .. }))
    }
}
