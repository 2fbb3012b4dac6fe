//! Shared key-value stores with atomic set-if-absent-with-expiry.
//!
//! This is the only state the engine shares between processes. Any store
//! offering `SET key value NX EX ttl` semantics can sit behind [`KvStore`].

use crate::error::{PoolError, Result};

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;

pub trait KvStore: Send + Sync {
    /// Set `key` to `value` with a TTL, only if no unexpired value exists.
    /// Returns true when the value was written.
    fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// The unexpired value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Remove `key` unconditionally.
    fn delete(&self, key: &str) -> Result<()>;

    /// Remove `key` only while it still holds `value`.
    fn delete_if_eq(&self, key: &str, value: &str) -> Result<bool>;

    /// Reset the TTL of `key` only while it still holds `value`.
    fn expire_if_eq(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Unexpired keys starting with `prefix`.
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Process-local [`KvStore`]. Expiry follows tokio's clock, so paused-time
/// tests can advance past a TTL.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn live<'a>(entries: &'a HashMap<String, (String, Instant)>, key: &str) -> Option<&'a String> {
        entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(value, _)| value)
    }
}

impl KvStore for MemoryKv {
    fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock();
        if Self::live(&entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(Self::live(&self.entries.lock(), key).cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn delete_if_eq(&self, key: &str, value: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        if Self::live(&entries, key).map(String::as_str) == Some(value) {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    fn expire_if_eq(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock();
        if Self::live(&entries, key).map(String::as_str) != Some(value) {
            return Ok(false);
        }
        if let Some(entry) = entries.get_mut(key) {
            entry.1 = Instant::now() + ttl;
        }
        Ok(true)
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(key, (_, expires))| key.starts_with(prefix) && *expires > now)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// [`KvStore`] over a SQLite file, shared by independent processes on one host.
///
/// Expiry uses wall-clock unix milliseconds so every process agrees on it.
pub struct SqliteKv {
    conn: Mutex<Connection>,
}

fn kv_err(e: rusqlite::Error) -> PoolError {
    PoolError::Kv(e.to_string())
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_millis(ttl: Duration) -> i64 {
    now_millis().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

impl SqliteKv {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(kv_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(kv_err)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(kv_err)?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv_locks (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at_ms INTEGER NOT NULL
            )",
        )
        .map_err(kv_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KvStore for SqliteKv {
    fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(kv_err)?;
        let now = now_millis();
        tx.execute(
            "DELETE FROM kv_locks WHERE key = ?1 AND expires_at_ms <= ?2",
            params![key, now],
        )
        .map_err(kv_err)?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO kv_locks (key, value, expires_at_ms) VALUES (?1, ?2, ?3)",
                params![key, value, expiry_millis(ttl)],
            )
            .map_err(kv_err)?;
        tx.commit().map_err(kv_err)?;
        Ok(inserted == 1)
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .lock()
            .query_row(
                "SELECT value FROM kv_locks WHERE key = ?1 AND expires_at_ms > ?2",
                params![key, now_millis()],
                |row| row.get(0),
            )
            .optional()
            .map_err(kv_err)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM kv_locks WHERE key = ?1", params![key])
            .map_err(kv_err)?;
        Ok(())
    }

    fn delete_if_eq(&self, key: &str, value: &str) -> Result<bool> {
        let removed = self
            .conn
            .lock()
            .execute(
                "DELETE FROM kv_locks WHERE key = ?1 AND value = ?2 AND expires_at_ms > ?3",
                params![key, value, now_millis()],
            )
            .map_err(kv_err)?;
        Ok(removed > 0)
    }

    fn expire_if_eq(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let changed = self
            .conn
            .lock()
            .execute(
                "UPDATE kv_locks SET expires_at_ms = ?1
                 WHERE key = ?2 AND value = ?3 AND expires_at_ms > ?4",
                params![expiry_millis(ttl), key, value, now_millis()],
            )
            .map_err(kv_err)?;
        Ok(changed > 0)
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT key FROM kv_locks
                 WHERE substr(key, 1, ?1) = ?2 AND expires_at_ms > ?3 ORDER BY key",
            )
            .map_err(kv_err)?;
        let prefix_len = i64::try_from(prefix.chars().count()).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![prefix_len, prefix, now_millis()], |row| row.get(0))
            .map_err(kv_err)?;
        rows.collect::<rusqlite::Result<Vec<String>>>().map_err(kv_err)
    }
}
