//! String-keyed durable storage, one instance per execution context.
//!
//! The page and the worker each own a private store; neither ever opens
//! the other's file. [`SqliteKv`] is the durable implementation;
//! [`MemoryKv`] backs tests and ephemeral sessions.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;
use rusqlite::{params, Connection};

/// Minimal key-value contract the stores are built on.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error>;
    fn put(&self, key: &str, value: &str) -> Result<(), anyhow::Error>;
    fn delete(&self, key: &str) -> Result<(), anyhow::Error>;
    /// All keys starting with `prefix`, in unspecified order.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, anyhow::Error>;
}

/// SQLite-backed store. Connections are opened per operation; SQLite
/// serializes writers on the file itself.
pub struct SqliteKv {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
}

impl SqliteKv {
    /// Open (and initialize if needed) the store at `db_path`.
    pub fn new(db_path: PathBuf) -> Result<Self, anyhow::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self { db_path };
        store.initialize_db()?;
        Ok(store)
    }

    fn initialize_db(&self) -> Result<(), anyhow::Error> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }
}

impl KvStore for SqliteKv {
    fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let conn = Connection::open(&self.db_path)?;
        let mut stmt = conn.prepare("SELECT value FROM kv_entries WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &str) -> Result<(), anyhow::Error> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute(
            "INSERT OR REPLACE INTO kv_entries (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), anyhow::Error> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute("DELETE FROM kv_entries WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, anyhow::Error> {
        let conn = Connection::open(&self.db_path)?;
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let mut stmt =
            conn.prepare("SELECT key FROM kv_entries WHERE key LIKE ?1 ESCAPE '\\'")?;
        let rows = stmt.query_map(params![pattern], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for key in rows {
            keys.push(key?);
        }
        Ok(keys)
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryKv {
    map: RwLock<HashMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), anyhow::Error> {
        self.map.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), anyhow::Error> {
        self.map.write().remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, anyhow::Error> {
        Ok(self
            .map
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_kv_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let kv = SqliteKv::new(dir.path().join("kv.db")).unwrap();

        assert!(kv.get("missing").unwrap().is_none());
        kv.put("conv_a", "{}").unwrap();
        assert_eq!(kv.get("conv_a").unwrap().as_deref(), Some("{}"));

        kv.delete("conv_a").unwrap();
        assert!(kv.get("conv_a").unwrap().is_none());
    }

    #[test]
    fn test_sqlite_kv_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");
        {
            let kv = SqliteKv::new(path.clone()).unwrap();
            kv.put("key", "value").unwrap();
        }
        let kv = SqliteKv::new(path).unwrap();
        assert_eq!(kv.get("key").unwrap().as_deref(), Some("value"));
    }

    #[test]
    fn test_prefix_scan_escapes_like_wildcards() {
        let dir = tempfile::tempdir().unwrap();
        let kv = SqliteKv::new(dir.path().join("kv.db")).unwrap();
        kv.put("conv_1", "a").unwrap();
        kv.put("conv_2", "b").unwrap();
        kv.put("convX3", "c").unwrap();
        kv.put("other", "d").unwrap();

        let mut keys = kv.keys_with_prefix("conv_").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["conv_1", "conv_2"]);
    }

    #[test]
    fn test_memory_kv_prefix_scan() {
        let kv = MemoryKv::new();
        kv.put("conv_1", "a").unwrap();
        kv.put("history", "b").unwrap();
        assert_eq!(kv.keys_with_prefix("conv_").unwrap(), vec!["conv_1"]);
    }
}
