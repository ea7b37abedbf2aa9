//! Storage abstraction for document persistence.
//!
//! This module defines the [`DocStorage`] trait which abstracts over the
//! backends (SQLite, in-memory) that hold document snapshots. Every
//! backend is last-write-wins; no versioning happens at this layer.

mod memory;
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
mod sqlite;

pub use memory::MemoryStorage;
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
pub use sqlite::SqliteStorage;

use crate::error::DocSyncError;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, DocSyncError>;

/// Trait for document snapshot storage backends.
///
/// Methods are blocking; async callers run them on the blocking pool.
pub trait DocStorage: Send + Sync {
    /// Load the full document state as a binary blob.
    ///
    /// Returns `None` if the document doesn't exist.
    fn load_doc(&self, name: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Save the full document state.
    ///
    /// This overwrites any existing state for the document.
    fn save_doc(&self, name: &str, state: &[u8]) -> StorageResult<()>;

    /// Delete a document.
    fn delete_doc(&self, name: &str) -> StorageResult<()>;

    /// List all document names in storage.
    fn list_docs(&self) -> StorageResult<Vec<String>>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    /// Memory storage that counts calls, can be slowed down, and can fail.
    #[derive(Default)]
    pub struct CountingStorage {
        pub inner: MemoryStorage,
        pub loads: AtomicUsize,
        pub saves: AtomicUsize,
        pub active_saves: AtomicUsize,
        pub max_active_saves: AtomicUsize,
        pub save_delay: Option<Duration>,
        pub fail_saves: AtomicBool,
    }

    impl CountingStorage {
        pub fn slow(save_delay: Duration) -> Self {
            Self {
                save_delay: Some(save_delay),
                ..Self::default()
            }
        }
    }

    impl DocStorage for CountingStorage {
        fn load_doc(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.load_doc(name)
        }

        fn save_doc(&self, name: &str, state: &[u8]) -> StorageResult<()> {
            let active = self.active_saves.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active_saves.fetch_max(active, Ordering::SeqCst);
            if let Some(delay) = self.save_delay {
                std::thread::sleep(delay);
            }
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.active_saves.fetch_sub(1, Ordering::SeqCst);

            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(DocSyncError::Storage("backend unavailable".into()));
            }
            self.inner.save_doc(name, state)
        }

        fn delete_doc(&self, name: &str) -> StorageResult<()> {
            self.inner.delete_doc(name)
        }

        fn list_docs(&self) -> StorageResult<Vec<String>> {
            self.inner.list_docs()
        }
    }
}
