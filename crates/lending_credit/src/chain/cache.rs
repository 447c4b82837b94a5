//! SQLite cache for results of immutable contract calls.

use crate::types::Address;
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Content-addressed store of `eth_call` results. Key = SHA-256 of `to:calldata`.
pub struct CallCache {
    conn: Mutex<Connection>,
}

impl CallCache {
    /// Open or create the cache at `path`, creating parent dirs.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, CacheError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CacheError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS call_cache (
                key TEXT PRIMARY KEY,
                target TEXT NOT NULL,
                result BLOB NOT NULL,
                created_utc INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_call_cache_target ON call_cache(target);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn key_for(to: &Address, calldata: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(to.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(hex::encode(calldata).as_bytes());
        hex::encode(hasher.finalize())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, CacheError> {
        self.conn
            .lock()
            .map_err(|e| std::io::Error::other(e.to_string()).into())
    }

    pub fn get(&self, to: &Address, calldata: &[u8]) -> Result<Option<Vec<u8>>, CacheError> {
        let key = Self::key_for(to, calldata);
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT result FROM call_cache WHERE key = ?1")?;
        let row = stmt
            .query_row([key], |r| r.get::<_, Vec<u8>>(0))
            .optional()?;
        Ok(row)
    }

    pub fn put(&self, to: &Address, calldata: &[u8], result: &[u8]) -> Result<(), CacheError> {
        let key = Self::key_for(to, calldata);
        let created = time::OffsetDateTime::now_utc().unix_timestamp();
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO call_cache (key, target, result, created_utc) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![key, to.to_string(), result, created],
        )?;
        Ok(())
    }

    /// Number of cached results for `to`.
    pub fn count_for(&self, to: &Address) -> Result<u64, CacheError> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM call_cache WHERE target = ?1",
            [to.to_string()],
            |r| r.get(0),
        )?;
        Ok(n.max(0) as u64)
    }
}
