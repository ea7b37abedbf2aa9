//! Collaborative document engine for the docsync server.
//!
//! Documents are CRDTs (via `yrs`) kept in memory while in use, persisted
//! through a debounced write pipeline, and synchronized with clients over
//! the y-sync wire protocol. Multiple processes can share documents
//! through the [`cluster`] bridge.
//!
//! The [`manager::DocumentManager`] is the entry point for every surface.

/// Document cache (name to container, idle eviction)
pub mod cache;

/// Observer hooks and their dispatcher
pub mod callbacks;

/// Cross-process fan-out of document events
pub mod cluster;

/// Per-document container (lazy load, serialized mutation, debounced persist)
pub mod container;

/// Per-operation context (document, client, metadata)
pub mod context;

pub mod debounce;

/// CRDT engine adapter
pub mod engine;

/// Error (common error types)
pub mod error;

/// Service facade over cache, presence and callbacks
pub mod manager;

/// Coalesced, bounded-parallelism document writes
pub mod persistence;

/// Per-document client presence
pub mod presence;

/// Y-sync wire protocol codec
pub mod protocol;

/// Document storage backends
pub mod storage;

pub use callbacks::{CallbackResult, DocumentCallback};
pub use context::DocumentContext;
pub use error::{DocSyncError, Result};
pub use manager::{DocumentManager, DocumentManagerOptions};
