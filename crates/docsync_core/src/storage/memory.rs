//! In-memory storage implementation.
//!
//! Used by tests and by servers started without a database path.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::{DocStorage, StorageResult};

/// In-memory document storage.
///
/// Thread-safe via `RwLock`, but data is lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    /// Document snapshots (name -> binary state)
    docs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocStorage for MemoryStorage {
    fn load_doc(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(docs.get(name).cloned())
    }

    fn save_doc(&self, name: &str, state: &[u8]) -> StorageResult<()> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        docs.insert(name.to_string(), state.to_vec());
        Ok(())
    }

    fn delete_doc(&self, name: &str) -> StorageResult<()> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        docs.remove(name);
        Ok(())
    }

    fn list_docs(&self) -> StorageResult<Vec<String>> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = docs.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_doc() {
        let storage = MemoryStorage::new();
        let data = b"test document state";

        storage.save_doc("test", data).unwrap();
        let loaded = storage.load_doc("test").unwrap();

        assert_eq!(loaded, Some(data.to_vec()));
    }

    #[test]
    fn test_load_nonexistent_doc() {
        let storage = MemoryStorage::new();
        assert!(storage.load_doc("nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_save_overwrites() {
        let storage = MemoryStorage::new();
        storage.save_doc("test", b"first").unwrap();
        storage.save_doc("test", b"second").unwrap();
        assert_eq!(storage.load_doc("test").unwrap(), Some(b"second".to_vec()));
    }

    #[test]
    fn test_delete_and_list_docs() {
        let storage = MemoryStorage::new();
        storage.save_doc("doc2", b"data2").unwrap();
        storage.save_doc("doc1", b"data1").unwrap();
        assert_eq!(storage.list_docs().unwrap(), vec!["doc1", "doc2"]);

        storage.delete_doc("doc1").unwrap();
        assert_eq!(storage.list_docs().unwrap(), vec!["doc2"]);
    }
}
