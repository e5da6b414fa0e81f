//! Database module - durable key/value storage shared by every profile on the device

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;

/// Synchronous durable map. Several handles (tabs, processes) may point at
/// the same storage; each one learns about the others' writes through
/// [`DurableMap::take_external_change`].
pub trait DurableMap {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    /// Drop every key (full application reset)
    fn clear(&self) -> Result<()>;

    /// True once per batch of writes made through another handle since the last call
    fn take_external_change(&self) -> Result<bool>;
}

/// Read and decode a JSON value
pub fn read_json<T: DeserializeOwned>(map: &dyn DurableMap, key: &str) -> Result<Option<T>> {
    match map.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode and store a JSON value
pub fn write_json<T: Serialize + ?Sized>(map: &dyn DurableMap, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    map.set(key, &bytes)
}

/// SQLite-backed map
pub struct SqliteMap {
    conn: Connection,
    data_version: Cell<i64>,
}

impl SqliteMap {
    /// Open or create database
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        let map = Self {
            conn,
            data_version: Cell::new(0),
        };
        map.init_schema()?;
        map.data_version.set(map.read_data_version()?);
        Ok(map)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    // Only commits from other connections move this counter.
    fn read_data_version(&self) -> Result<i64> {
        let version = self
            .conn
            .query_row("PRAGMA data_version", [], |row| row.get(0))?;
        Ok(version)
    }
}

impl DurableMap for SqliteMap {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM kv", [])?;
        Ok(())
    }

    fn take_external_change(&self) -> Result<bool> {
        let current = self.read_data_version()?;
        if current != self.data_version.get() {
            self.data_version.set(current);
            return Ok(true);
        }
        Ok(false)
    }
}

#[derive(Default)]
struct SharedEntries {
    entries: HashMap<String, Vec<u8>>,
    total_writes: u64,
    writes_by_handle: HashMap<u64, u64>,
    next_handle: u64,
}

/// In-memory map. Clones made with [`MemoryMap::new_handle`] share storage
/// and see each other's writes as external changes.
pub struct MemoryMap {
    shared: Arc<Mutex<SharedEntries>>,
    handle: u64,
    seen_external: Cell<u64>,
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMap {
    pub fn new() -> Self {
        let shared = Arc::new(Mutex::new(SharedEntries::default()));
        Self::attach(shared)
    }

    /// Another handle on the same storage
    pub fn new_handle(&self) -> Self {
        Self::attach(self.shared.clone())
    }

    fn attach(shared: Arc<Mutex<SharedEntries>>) -> Self {
        let (handle, external) = {
            let mut guard = shared.lock().unwrap_or_else(|e| e.into_inner());
            let handle = guard.next_handle;
            guard.next_handle += 1;
            (handle, guard.total_writes)
        };
        Self {
            shared,
            handle,
            seen_external: Cell::new(external),
        }
    }

    fn with_shared<T>(&self, f: impl FnOnce(&mut SharedEntries) -> T) -> T {
        let mut guard = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    fn record_write(&self, shared: &mut SharedEntries) {
        shared.total_writes += 1;
        *shared.writes_by_handle.entry(self.handle).or_insert(0) += 1;
    }
}

impl DurableMap for MemoryMap {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.with_shared(|s| s.entries.get(key).cloned()))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.with_shared(|s| {
            s.entries.insert(key.to_string(), value.to_vec());
            self.record_write(s);
        });
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.with_shared(|s| {
            s.entries.remove(key);
            self.record_write(s);
        });
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.with_shared(|s| {
            s.entries.clear();
            self.record_write(s);
        });
        Ok(())
    }

    fn take_external_change(&self) -> Result<bool> {
        let external = self.with_shared(|s| {
            let own = s.writes_by_handle.get(&self.handle).copied().unwrap_or(0);
            s.total_writes - own
        });
        if external != self.seen_external.get() {
            self.seen_external.set(external);
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_map_roundtrip() {
        let map = MemoryMap::new();
        assert_eq!(map.get("k").unwrap(), None);
        map.set("k", b"v").unwrap();
        assert_eq!(map.get("k").unwrap(), Some(b"v".to_vec()));
        map.remove("k").unwrap();
        assert_eq!(map.get("k").unwrap(), None);
    }

    #[test]
    fn test_memory_map_own_writes_are_not_external() {
        let map = MemoryMap::new();
        map.set("k", b"v").unwrap();
        assert!(!map.take_external_change().unwrap());
    }

    #[test]
    fn test_memory_map_reports_other_handle_writes_once() {
        let tab_a = MemoryMap::new();
        let tab_b = tab_a.new_handle();

        tab_a.set("profiles", b"[]").unwrap();
        assert!(tab_b.take_external_change().unwrap());
        assert!(!tab_b.take_external_change().unwrap());
        assert_eq!(tab_b.get("profiles").unwrap(), Some(b"[]".to_vec()));
    }

    #[test]
    fn test_json_helpers() {
        let map = MemoryMap::new();
        write_json(&map, "numbers", &vec![1, 2, 3]).unwrap();
        let read: Option<Vec<i32>> = read_json(&map, "numbers").unwrap();
        assert_eq!(read, Some(vec![1, 2, 3]));
        let missing: Option<Vec<i32>> = read_json(&map, "missing").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_sqlite_map_persists_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fitsync.db");
        let path = path.to_str().unwrap();

        {
            let map = SqliteMap::open(path).unwrap();
            map.set("active_profile", b"abc").unwrap();
            map.set("active_profile", b"def").unwrap();
        }

        let map = SqliteMap::open(path).unwrap();
        assert_eq!(map.get("active_profile").unwrap(), Some(b"def".to_vec()));
        map.clear().unwrap();
        assert_eq!(map.get("active_profile").unwrap(), None);
    }

    #[test]
    fn test_sqlite_map_detects_other_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fitsync.db");
        let path = path.to_str().unwrap();

        let tab_a = SqliteMap::open(path).unwrap();
        let tab_b = SqliteMap::open(path).unwrap();

        tab_a.set("profiles", b"[]").unwrap();
        assert!(!tab_a.take_external_change().unwrap());
        assert!(tab_b.take_external_change().unwrap());
        assert!(!tab_b.take_external_change().unwrap());
    }
}
