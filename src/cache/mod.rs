pub mod key;
pub mod models;
pub mod queries;

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

pub use key::cache_key;
pub use models::{CacheEntry, CacheStats};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Waveform encoding failed: {0}")]
    Codec(#[from] crate::waveform::CodecError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

const SCHEMA_VERSION: i32 = 1;

/// Persistent store of compressed waveform envelopes, keyed by content identity.
///
/// A single SQLite connection sits behind one mutex; every public operation
/// holds the lock for its whole duration, so the cache can be shared across
/// threads through an `Arc`. Caching is an optimization: an unopened cache, or
/// one whose database fails, behaves as "always miss, writes fail" and only
/// logs the error.
pub struct WaveformCache {
    conn: Mutex<Option<Connection>>,
}

impl Default for WaveformCache {
    fn default() -> Self {
        Self::new()
    }
}

impl WaveformCache {
    /// An unopened cache. Every lookup misses until [`WaveformCache::open`] succeeds.
    pub fn new() -> Self {
        Self {
            conn: Mutex::new(None),
        }
    }

    /// Convenience constructor for an in-memory cache (tests, `--no-cache` runs).
    pub fn in_memory() -> Result<Self> {
        let cache = Self::new();
        cache.open_in_memory()?;
        Ok(cache)
    }

    /// Open (or create) the database file. No-op if already open.
    pub fn open(&self, path: &Path) -> Result<()> {
        let mut guard = self.lock();
        if guard.is_some() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        init(&conn)?;
        log::info!("Waveform cache opened at {}", path.display());
        *guard = Some(conn);
        Ok(())
    }

    pub fn open_in_memory(&self) -> Result<()> {
        let mut guard = self.lock();
        if guard.is_some() {
            return Ok(());
        }
        let conn = Connection::open_in_memory()?;
        init(&conn)?;
        *guard = Some(conn);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Drop the connection. Later calls behave as an unopened cache.
    pub fn close(&self) {
        if self.lock().take().is_some() {
            log::debug!("Waveform cache closed");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        // A panic while holding the lock cannot leave the connection in a
        // state SQLite itself would not recover from.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` against the open connection with the lock held.
    ///
    /// Returns `None` when the cache is not open or `f` fails; failures are logged.
    fn with_conn<T>(&self, op: &str, f: impl FnOnce(&Connection) -> Result<T>) -> Option<T> {
        let guard = self.lock();
        let conn = match guard.as_ref() {
            Some(conn) => conn,
            None => {
                log::trace!("Waveform cache not open, skipping {}", op);
                return None;
            }
        };
        match f(conn) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("Waveform cache {} failed: {}", op, e);
                None
            }
        }
    }
}

fn init(conn: &Connection) -> Result<()> {
    // WAL keeps readers from blocking on the occasional write
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    // 2 MB page cache
    conn.pragma_update(None, "cache_size", -2000)?;
    migrate(conn)
}

fn migrate(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }

    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

/// V1: single waveform table, LRU index on access time, lookup index on location.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS waveforms (
            cache_key    TEXT PRIMARY KEY,
            path         TEXT NOT NULL,
            subsong      INTEGER NOT NULL,
            channels     INTEGER NOT NULL,
            sample_rate  INTEGER NOT NULL,
            duration     REAL NOT NULL,
            data         BLOB NOT NULL,
            size_bytes   INTEGER NOT NULL,
            created_at   INTEGER NOT NULL,
            accessed_at  INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_waveforms_accessed ON waveforms(accessed_at);
        CREATE INDEX IF NOT EXISTS idx_waveforms_path ON waveforms(path, subsong);
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_creates_schema() {
        let cache = WaveformCache::in_memory().unwrap();
        assert!(cache.is_open());
        let count = cache.with_conn("count", |conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM waveforms", [], |r| r.get::<_, i64>(0))?)
        });
        assert_eq!(count, Some(0));
    }

    #[test]
    fn test_open_file_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waveform_cache").join("waveforms.db");
        let cache = WaveformCache::new();
        cache.open(&path).unwrap();
        assert!(path.exists());

        // Second open is a no-op
        cache.open(&path).unwrap();
        cache.close();
        assert!(!cache.is_open());

        // Reopen runs the migration again without error
        cache.open(&path).unwrap();
        let version = cache.with_conn("version", |conn| {
            Ok(conn.pragma_query_value(None, "user_version", |row| row.get::<_, i32>(0))?)
        });
        assert_eq!(version, Some(SCHEMA_VERSION));
    }

    #[test]
    fn test_unopened_cache_skips_operations() {
        let cache = WaveformCache::new();
        assert!(!cache.is_open());
        assert!(cache.with_conn("noop", |_| Ok(())).is_none());
    }
}
