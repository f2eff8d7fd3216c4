//! SQLite-based cache backend.

use super::base::{BackendCore, DriverVersions, StoreKey};
use super::settings::{FieldKind, SettingField, SettingsForm};
use super::traits::{CacheBackend, CleanScope};
use crate::clock::{expiry_after, Clock, SystemClock};
use crate::config::{CacheConfig, SqliteOptions};
use crate::error::{CacheError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Size and count of the stored entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqliteStats {
    /// Total number of entries, expired ones included until swept.
    pub total_entries: usize,
    /// Total size of all stored payloads in bytes.
    pub total_size_bytes: u64,
    /// Size limit enforced by housekeeping (0 = unlimited).
    pub max_size_bytes: u64,
}

/// SQLite-backed cache.
///
/// Timestamps are unix milliseconds. Thread-safe via internal mutex on the
/// connection, which only exists between `connect` and `quit`.
pub struct SqliteBackend {
    core: BackendCore,
    db_path: Option<PathBuf>,
    max_size_bytes: u64,
    conn: Mutex<Option<Connection>>,
    clock: Arc<dyn Clock>,
}

impl SqliteBackend {
    pub const NAME: &'static str = "sqlite";
    pub const VERSIONS: DriverVersions = DriverVersions {
        minimum: "1.8.0",
        compatible: "9.99.99",
    };

    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let db_path = resolve_db_path(&config);
        let max_size_bytes = config.drivers.sqlite.max_size_bytes;
        Self {
            core: BackendCore::new(config, Self::VERSIONS),
            db_path,
            max_size_bytes,
            conn: Mutex::new(None),
            clock,
        }
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock().map_err(|e| CacheError::Database {
            message: format!("Failed to lock database: {}", e),
            source: None,
        })?;
        let conn = guard.as_ref().ok_or(CacheError::NotConnected)?;
        f(conn)
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    /// Initialize database schema.
    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                cached_at INTEGER NOT NULL,
                expires_at INTEGER,
                size_bytes INTEGER NOT NULL,
                last_accessed INTEGER NOT NULL
            );

            -- Index for expiration queries
            CREATE INDEX IF NOT EXISTS idx_cache_expires
                ON cache_entries(expires_at);

            -- Index for LRU eviction
            CREATE INDEX IF NOT EXISTS idx_cache_accessed
                ON cache_entries(last_accessed);
            "#,
        )
        .map_err(|e| CacheError::Database {
            message: format!("Failed to initialize cache schema: {}", e),
            source: Some(e),
        })
    }

    /// Entry count and total payload size.
    pub fn stats(&self) -> Result<SqliteStats> {
        self.with_conn(|conn| {
            let (total_entries, total_size): (i64, i64) = conn
                .query_row(
                    "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM cache_entries",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(|e| CacheError::Database {
                    message: format!("Failed to query cache stats: {}", e),
                    source: Some(e),
                })?;

            Ok(SqliteStats {
                total_entries: total_entries as usize,
                total_size_bytes: total_size as u64,
                max_size_bytes: self.max_size_bytes,
            })
        })
    }

    /// Remove expired entries. Returns the number of entries removed.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let now = self.now_ms();
        let deleted = self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )
            .map_err(|e| CacheError::Database {
                message: format!("Failed to cleanup expired entries: {}", e),
                source: Some(e),
            })
        })?;

        if deleted > 0 {
            debug!("Cleaned up {} expired cache entries", deleted);
        }
        Ok(deleted)
    }

    /// Evict least recently accessed entries until under `max_bytes`.
    ///
    /// Returns the number of entries evicted.
    pub fn evict_to_size(&self, max_bytes: u64) -> Result<usize> {
        self.with_conn(|conn| {
            let current_size: i64 = conn
                .query_row(
                    "SELECT COALESCE(SUM(size_bytes), 0) FROM cache_entries",
                    [],
                    |row| row.get(0),
                )
                .map_err(|e| CacheError::Database {
                    message: format!("Failed to query cache size: {}", e),
                    source: Some(e),
                })?;

            if (current_size as u64) <= max_bytes {
                return Ok(0);
            }

            let excess = current_size as u64 - max_bytes;
            debug!(
                "Cache size {}KB exceeds limit {}KB, evicting...",
                current_size / 1_000,
                max_bytes / 1_000
            );

            let mut stmt = conn
                .prepare("SELECT key, size_bytes FROM cache_entries ORDER BY last_accessed ASC")
                .map_err(|e| CacheError::Database {
                    message: format!("Failed to prepare eviction query: {}", e),
                    source: Some(e),
                })?;

            let entries: Vec<(String, i64)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(|e| CacheError::Database {
                    message: format!("Failed to query for eviction: {}", e),
                    source: Some(e),
                })?
                .filter_map(|r| r.ok())
                .collect();

            drop(stmt);

            let mut evicted_bytes = 0u64;
            let mut evicted_count = 0;
            for (key, size) in entries {
                if evicted_bytes >= excess {
                    break;
                }
                match conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key]) {
                    Ok(n) if n > 0 => {
                        evicted_bytes += size as u64;
                        evicted_count += 1;
                    }
                    Ok(_) => {}
                    Err(e) => debug!("Failed to evict cache entry '{}': {}", key, e),
                }
            }

            debug!(
                "Evicted {} entries ({}KB)",
                evicted_count,
                evicted_bytes / 1_000
            );
            Ok(evicted_count)
        })
    }
}

/// The configured path, else `cache.sqlite` next to the anchor.
fn resolve_db_path(config: &CacheConfig) -> Option<PathBuf> {
    if let Some(path) = &config.drivers.sqlite.path {
        return Some(path.clone());
    }
    let anchor = config.anchor_path.as_ref()?;
    let dir = if anchor.is_file() {
        anchor.parent()?.to_path_buf()
    } else {
        anchor.clone()
    };
    Some(dir.join(SqliteOptions::DEFAULT_FILE_NAME))
}

impl CacheBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn core(&self) -> &BackendCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BackendCore {
        &mut self.core
    }

    fn probe(&self) -> bool {
        self.db_path.is_some()
    }

    fn open(&mut self) -> Result<()> {
        let db_path = self.db_path.as_deref().ok_or_else(|| CacheError::Config {
            message: "sqlite cache needs drivers.sqlite.path or anchor_path".to_string(),
        })?;

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CacheError::Io {
                message: format!("Failed to create cache directory: {}", e),
                path: Some(parent.to_path_buf()),
                source: Some(e),
            })?;
        }

        let conn = Connection::open(db_path).map_err(|e| CacheError::Database {
            message: format!("Failed to open cache database: {}", e),
            source: Some(e),
        })?;

        // WAL lets several request processes share the file
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| CacheError::Database {
                message: format!("Failed to set pragmas: {}", e),
                source: Some(e),
            })?;

        Self::init_schema(&conn)?;

        let mut guard = self.conn.lock().map_err(|e| CacheError::Database {
            message: format!("Failed to lock database: {}", e),
            source: None,
        })?;
        *guard = Some(conn);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| CacheError::Database {
                message: format!("Failed to lock database: {}", e),
                source: None,
            })?
            .take();

        if let Some(conn) = conn {
            conn.close().map_err(|(_, e)| CacheError::Database {
                message: format!("Failed to close cache database: {}", e),
                source: Some(e),
            })?;
        }
        Ok(())
    }

    fn read_raw(&self, key: &StoreKey) -> Result<Option<Vec<u8>>> {
        let now = self.now_ms();
        self.with_conn(|conn| {
            let value: Option<Vec<u8>> = conn
                .query_row(
                    r#"
                    SELECT value FROM cache_entries
                    WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)
                    "#,
                    params![key.as_str(), now],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| CacheError::Database {
                    message: format!("Failed to query cache entry: {}", e),
                    source: Some(e),
                })?;

            if value.is_some() {
                if let Err(e) = conn.execute(
                    "UPDATE cache_entries SET last_accessed = ?1 WHERE key = ?2",
                    params![now, key.as_str()],
                ) {
                    debug!("Failed to record access to '{}': {}", key, e);
                }
            }
            Ok(value)
        })
    }

    fn write_raw(&self, key: &StoreKey, bytes: &[u8], ttl_secs: u64) -> Result<()> {
        let now = self.now_ms();
        let expires_at = expiry_after(self.clock.as_ref(), ttl_secs).map(|at| at.timestamp_millis());
        let size_bytes = bytes.len() as i64;

        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT OR REPLACE INTO cache_entries
                (key, value, cached_at, expires_at, size_bytes, last_accessed)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![key.as_str(), bytes, now, expires_at, size_bytes, now],
            )
            .map_err(|e| CacheError::Database {
                message: format!("Failed to set cache entry: {}", e),
                source: Some(e),
            })?;
            Ok(())
        })
    }

    fn delete_raw(&self, key: &StoreKey) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM cache_entries WHERE key = ?1",
                params![key.as_str()],
            )
            .map_err(|e| CacheError::Database {
                message: format!("Failed to delete cache entry: {}", e),
                source: Some(e),
            })?;
            Ok(())
        })
    }

    fn clear(&self, scope: CleanScope, prefix: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let result = match scope {
                CleanScope::All => conn.execute("DELETE FROM cache_entries", []),
                CleanScope::Current => conn.execute(
                    "DELETE FROM cache_entries WHERE substr(key, 1, length(?1)) = ?1",
                    params![prefix],
                ),
                CleanScope::Stale => conn.execute(
                    "DELETE FROM cache_entries WHERE substr(key, 1, length(?1)) <> ?1",
                    params![prefix],
                ),
            };
            result.map_err(|e| CacheError::Database {
                message: format!("Failed to clear cache entries: {}", e),
                source: Some(e),
            })
        })
    }

    fn flush_all(&self) -> Result<bool> {
        self.clear(CleanScope::All, "")?;
        debug!("Cleared all cache data");
        Ok(true)
    }

    fn sweep(&self) -> Result<()> {
        self.cleanup_expired()?;
        if self.max_size_bytes > 0 {
            self.evict_to_size(self.max_size_bytes)?;
        }
        Ok(())
    }

    fn cache_settings(&self, form: &mut SettingsForm) {
        let path = self
            .db_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        form.insert(SettingField::new(
            "sqlite.path",
            "Database file",
            FieldKind::Path,
            path,
        ));
        form.insert(
            SettingField::new(
                "sqlite.max_size_bytes",
                "Maximum size (bytes)",
                FieldKind::Number,
                self.max_size_bytes,
            )
            .with_help("Least recently used entries are trimmed past this size; 0 disables"),
        );
    }
}
