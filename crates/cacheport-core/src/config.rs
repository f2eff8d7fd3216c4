//! Configuration passed explicitly into every backend.
//!
//! The host owns loading; this module only defines the shape, the defaults,
//! and a few fixed constants shared by all drivers.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Fixed constants of the prefix and anchor scheme.
pub struct PrefixConfig;

impl PrefixConfig {
    /// Suffix appended to every computed default prefix.
    pub const SUFFIX: &'static str = "-APP-";
    /// Number of hex characters of the digest kept in the prefix.
    pub const HASH_LEN: usize = 8;
    /// Sentinel file touched inside an anchor directory.
    pub const SENTINEL_FILE: &'static str = ".cache-anchor";
}

/// Top-level cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CacheConfig {
    /// Administrative switch for the whole cache subsystem.
    pub enabled: bool,
    /// Stable installation identity (usually the host's base URL).
    pub identity: String,
    /// Filesystem anchor whose mtime feeds the default prefix.
    pub anchor_path: Option<PathBuf>,
    /// Fallback TTL in seconds.
    pub default_ttl_secs: u64,
    /// Version of the host application, used to filter drivers at discovery.
    pub host_version: Option<String>,
    /// Per-driver options.
    pub drivers: DriverOptions,
}

impl CacheConfig {
    /// Default TTL for entries written without one (2 minutes).
    pub const DEFAULT_TTL_SECS: u64 = 120;
    pub const DEFAULT_IDENTITY: &'static str = "http://localhost";

    /// Config rooted at a cache directory that doubles as the anchor.
    pub fn with_anchor(identity: impl Into<String>, anchor: impl AsRef<Path>) -> Self {
        Self {
            identity: identity.into(),
            anchor_path: Some(anchor.as_ref().to_path_buf()),
            ..Self::default()
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            identity: CacheConfig::DEFAULT_IDENTITY.to_string(),
            anchor_path: None,
            default_ttl_secs: CacheConfig::DEFAULT_TTL_SECS,
            host_version: None,
            drivers: DriverOptions::default(),
        }
    }
}

/// Options of the individual drivers. Each driver only reads its own section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverOptions {
    pub file: FileOptions,
    pub sqlite: SqliteOptions,
    pub memcached: MemcachedOptions,
}

/// Filesystem driver options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileOptions {
    /// Directory holding entry files. Falls back to the anchor path.
    pub directory: Option<PathBuf>,
}

/// SQLite driver options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteOptions {
    /// Database file. Falls back to `<anchor>/cache.sqlite`.
    pub path: Option<PathBuf>,
    /// Size limit enforced by housekeeping (0 = unlimited).
    pub max_size_bytes: u64,
}

impl SqliteOptions {
    pub const DEFAULT_FILE_NAME: &'static str = "cache.sqlite";
    /// Default maximum store size (256 MB).
    pub const DEFAULT_MAX_SIZE_BYTES: u64 = 268_435_456;
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            path: None,
            max_size_bytes: SqliteOptions::DEFAULT_MAX_SIZE_BYTES,
        }
    }
}

/// memcached driver options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemcachedOptions {
    pub host: String,
    pub port: u16,
    /// Connect and per-request I/O timeout in milliseconds.
    pub timeout_ms: u64,
}

impl MemcachedOptions {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 11211;
    pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for MemcachedOptions {
    fn default() -> Self {
        Self {
            host: MemcachedOptions::DEFAULT_HOST.to_string(),
            port: MemcachedOptions::DEFAULT_PORT,
            timeout_ms: MemcachedOptions::DEFAULT_TIMEOUT_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.default_ttl_secs, 120);
        assert!(config.anchor_path.is_none());
        assert_eq!(config.drivers.memcached.endpoint(), "127.0.0.1:11211");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: CacheConfig = serde_json::from_str(
            r#"{"identity": "http://example.test", "drivers": {"memcached": {"port": 22122}}}"#,
        )
        .unwrap();
        assert_eq!(config.identity, "http://example.test");
        assert_eq!(config.default_ttl_secs, CacheConfig::DEFAULT_TTL_SECS);
        assert_eq!(config.drivers.memcached.port, 22122);
        assert_eq!(config.drivers.memcached.host, "127.0.0.1");
        assert_eq!(
            config.drivers.sqlite.max_size_bytes,
            SqliteOptions::DEFAULT_MAX_SIZE_BYTES
        );
    }

    #[test]
    fn test_timeout_never_zero() {
        let options = MemcachedOptions {
            timeout_ms: 0,
            ..MemcachedOptions::default()
        };
        assert!(options.timeout() > Duration::ZERO);
    }
}
