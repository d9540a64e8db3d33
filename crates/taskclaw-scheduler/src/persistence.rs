//! Circuit state stores.
//!
//! `SqliteCircuitStore` shares circuit state between scheduler processes on one host
//! and keeps it across restarts; `MemoryCircuitStore` is the in-process equivalent.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::OptionalExtension;
use taskclaw_core::CircuitStateStore;
use taskclaw_core::error::{Result, TaskClawError};

/// SQLite-backed key/value store for circuit state.
pub struct SqliteCircuitStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteCircuitStore {
    /// Open or create the store database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| TaskClawError::Store(format!("DB open: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| TaskClawError::Store(format!("DB open: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
            -- Circuit breaker state per trigger (JSON value)
            CREATE TABLE IF NOT EXISTS circuit_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
            )
            .map_err(|e| TaskClawError::Store(format!("Migration: {e}")))
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&rusqlite::Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| TaskClawError::Store("circuit store lock poisoned".into()))?;
        f(&conn)
    }
}

#[async_trait]
impl CircuitStateStore for SqliteCircuitStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM circuit_state WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| TaskClawError::Store(format!("Get circuit: {e}")))
        })
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO circuit_state (key, value, updated_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![key, value, Utc::now().to_rfc3339()],
            )
            .map_err(|e| TaskClawError::Store(format!("Save circuit: {e}")))?;
            Ok(())
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM circuit_state WHERE key = ?1", [key])
                .map_err(|e| TaskClawError::Store(format!("Delete circuit: {e}")))?;
            Ok(())
        })
    }
}

/// Process-local key/value store.
#[derive(Default)]
pub struct MemoryCircuitStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryCircuitStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.values
            .lock()
            .map_err(|_| TaskClawError::Store("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl CircuitStateStore for MemoryCircuitStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values()?.remove(key);
        Ok(())
    }
}
