//! SQLite-backed storage implementation.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use rusqlite::{Connection, OptionalExtension, params};

use super::{DocStorage, StorageResult};

/// SQLite-backed document storage.
///
/// # Thread Safety
///
/// The connection is wrapped in a `Mutex` for thread-safe access.
/// SQLite itself is used in serialized threading mode.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open or create a SQLite database at the given path.
    ///
    /// This will create the necessary tables if they don't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database for testing.
    pub fn in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                name TEXT PRIMARY KEY,
                state BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

impl DocStorage for SqliteStorage {
    fn load_doc(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let state = conn
            .query_row(
                "SELECT state FROM documents WHERE name = ?",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state)
    }

    fn save_doc(&self, name: &str, state: &[u8]) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT OR REPLACE INTO documents (name, state, updated_at) VALUES (?, ?, ?)",
            params![name, state, now],
        )?;
        Ok(())
    }

    fn delete_doc(&self, name: &str) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute("DELETE FROM documents WHERE name = ?", params![name])?;
        Ok(())
    }

    fn list_docs(&self) -> StorageResult<Vec<String>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare("SELECT name FROM documents ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_save_and_load_doc() {
        let storage = SqliteStorage::in_memory().unwrap();
        let data = b"test document state";

        storage.save_doc("test", data).unwrap();
        let loaded = storage.load_doc("test").unwrap();

        assert_eq!(loaded, Some(data.to_vec()));
    }

    #[test]
    fn test_sqlite_load_nonexistent_doc() {
        let storage = SqliteStorage::in_memory().unwrap();
        assert!(storage.load_doc("nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_sqlite_delete_doc() {
        let storage = SqliteStorage::in_memory().unwrap();
        storage.save_doc("test", b"data").unwrap();
        storage.delete_doc("test").unwrap();
        assert!(storage.load_doc("test").unwrap().is_none());
    }

    #[test]
    fn test_sqlite_list_docs() {
        let storage = SqliteStorage::in_memory().unwrap();
        storage.save_doc("doc2", b"data2").unwrap();
        storage.save_doc("doc1", b"data1").unwrap();

        assert_eq!(storage.list_docs().unwrap(), vec!["doc1", "doc2"]);
    }

    #[test]
    fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docs.db");

        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.save_doc("notes", &[1, 2, 3]).unwrap();
        }

        let reopened = SqliteStorage::open(&path).unwrap();
        assert_eq!(reopened.load_doc("notes").unwrap(), Some(vec![1, 2, 3]));
    }
}
