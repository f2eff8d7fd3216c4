//! Shared state and default behavior embedded in every backend.
//!
//! `BackendCore` owns the prefix, the default TTL, the version range and the
//! lifecycle state. It is also the only place a `StoreKey` can be built, which
//! keeps unprefixed keys away from the storage primitives.

use crate::config::{CacheConfig, PrefixConfig};
use crate::error::{CacheError, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Host-application version range a driver declares support for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverVersions {
    /// Oldest supported host version.
    pub minimum: &'static str,
    /// Newest host version the driver was verified against.
    pub compatible: &'static str,
}

/// Lifecycle of a backend instance. There is no way back from `Quit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Constructed,
    Connected,
    Quit,
}

/// A key with the backend prefix already applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    full: String,
    prefix_len: usize,
}

impl StoreKey {
    fn new(prefix: &str, key: &str) -> Self {
        Self {
            full: format!("{}{}", prefix, key),
            prefix_len: prefix.len(),
        }
    }

    /// The full key as stored.
    pub fn as_str(&self) -> &str {
        &self.full
    }

    pub fn prefix(&self) -> &str {
        &self.full[..self.prefix_len]
    }

    /// The caller's key without prefix.
    pub fn key(&self) -> &str {
        &self.full[self.prefix_len..]
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl AsRef<str> for StoreKey {
    fn as_ref(&self) -> &str {
        &self.full
    }
}

/// State shared by all variants.
#[derive(Debug, Clone)]
pub struct BackendCore {
    config: CacheConfig,
    versions: DriverVersions,
    prefix: String,
    explicit_prefix: bool,
    default_ttl: u64,
    state: LifecycleState,
}

impl BackendCore {
    /// Build the core and compute the default prefix.
    pub fn new(config: CacheConfig, versions: DriverVersions) -> Self {
        let prefix = default_prefix(&config.identity, config.anchor_path.as_deref());
        let default_ttl = config.default_ttl_secs;
        Self {
            config,
            versions,
            prefix,
            explicit_prefix: false,
            default_ttl,
            state: LifecycleState::Constructed,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn versions(&self) -> DriverVersions {
        self.versions
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether the current prefix came from `set_prefix` with a non-empty key.
    pub fn has_explicit_prefix(&self) -> bool {
        self.explicit_prefix
    }

    /// Empty `key` recomputes the default prefix, anything else is used verbatim.
    pub fn set_prefix(&mut self, key: &str) {
        if key.is_empty() {
            self.prefix = default_prefix(&self.config.identity, self.config.anchor_path.as_deref());
            self.explicit_prefix = false;
        } else {
            self.prefix = key.to_string();
            self.explicit_prefix = true;
        }
        debug!("Cache prefix set to '{}'", self.prefix);
    }

    pub fn default_ttl(&self) -> u64 {
        self.default_ttl
    }

    pub fn set_default_ttl(&mut self, ttl: u64) {
        self.default_ttl = ttl;
    }

    /// TTL to apply to a write: the caller's value unless it is missing or 0.
    pub fn effective_ttl(&self, ttl: Option<u64>) -> u64 {
        match ttl {
            Some(ttl) if ttl > 0 => ttl,
            _ => self.default_ttl,
        }
    }

    pub fn store_key(&self, key: &str) -> StoreKey {
        StoreKey::new(&self.prefix, key)
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == LifecycleState::Connected
    }

    /// Mark connected, pinning a directory anchor first.
    pub(crate) fn mark_connected(&mut self) {
        self.pin_anchor();
        self.state = LifecycleState::Connected;
    }

    pub(crate) fn mark_quit(&mut self) {
        self.state = LifecycleState::Quit;
    }

    /// Plant the sentinel in a directory anchor that has none, then recompute
    /// the default prefix from the anchor as it is now.
    ///
    /// Drivers that write into the anchor directory would otherwise move its
    /// mtime, and with it the default prefix, on every write. The prefix
    /// computed at construction may predate the anchor or its sentinel.
    fn pin_anchor(&mut self) {
        if let Some(anchor) = self.config.anchor_path.as_deref() {
            let sentinel = anchor.join(PrefixConfig::SENTINEL_FILE);
            if anchor.is_dir() && !sentinel.exists() {
                if let Err(e) = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&sentinel)
                {
                    debug!("Could not create cache sentinel {}: {}", sentinel.display(), e);
                }
            }
        }

        if !self.explicit_prefix {
            self.set_prefix("");
        }
    }

    /// Invalidate by touching the anchor, then recompute the default prefix.
    ///
    /// Returns whether the anchor was touched. A missing or read-only anchor is
    /// logged and otherwise ignored. An explicit prefix is left untouched.
    pub fn touch_anchor(&mut self) -> bool {
        let Some(anchor) = self.config.anchor_path.clone() else {
            debug!("No cache anchor configured, invalidation by touch skipped");
            return false;
        };

        match touch(&anchor) {
            Ok(target) => {
                debug!("Touched cache anchor {}", target.display());
                if !self.explicit_prefix {
                    self.set_prefix("");
                }
                true
            }
            Err(e) => {
                warn!("Cache anchor {} not writable: {}", anchor.display(), e);
                false
            }
        }
    }
}

/// Compute the default prefix for an identity and optional anchor.
///
/// The digest input is the identity followed by the anchor's mtime, or by the
/// identity again when no anchor mtime is available.
pub fn default_prefix(identity: &str, anchor: Option<&Path>) -> String {
    let marker = anchor
        .and_then(anchor_mtime)
        .map(format_mtime)
        .unwrap_or_else(|| identity.to_string());

    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    hasher.update(marker.as_bytes());
    let digest = hex::encode(hasher.finalize());

    format!("{}{}", &digest[..PrefixConfig::HASH_LEN], PrefixConfig::SUFFIX)
}

/// Modification time feeding the prefix: the sentinel inside an anchor
/// directory if present, else the anchor itself.
pub fn anchor_mtime(anchor: &Path) -> Option<SystemTime> {
    if anchor.is_dir() {
        let sentinel = anchor.join(PrefixConfig::SENTINEL_FILE);
        if let Some(mtime) = modified(&sentinel) {
            return Some(mtime);
        }
    }
    modified(anchor)
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn format_mtime(mtime: SystemTime) -> String {
    let since = mtime.duration_since(UNIX_EPOCH).unwrap_or_default();
    format!("{}.{:09}", since.as_secs(), since.subsec_nanos())
}

/// Bump the anchor's mtime strictly past the value currently feeding the prefix.
fn touch(anchor: &Path) -> Result<PathBuf> {
    let target = if anchor.is_dir() {
        anchor.join(PrefixConfig::SENTINEL_FILE)
    } else if anchor.is_file() {
        anchor.to_path_buf()
    } else {
        return Err(CacheError::Config {
            message: format!("cache anchor {} does not exist", anchor.display()),
        });
    };

    let previous = anchor_mtime(anchor);

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&target)
        .map_err(|e| CacheError::io_with_path(e, &target))?;

    let mut stamp = SystemTime::now();
    if let Some(previous) = previous {
        if stamp <= previous {
            // Coarse filesystem timestamps can repeat within a second.
            stamp = previous + Duration::from_secs(1);
        }
    }

    file.set_modified(stamp)
        .map_err(|e| CacheError::io_with_path(e, &target))?;

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const VERSIONS: DriverVersions = DriverVersions {
        minimum: "1.8.0",
        compatible: "1.8.99",
    };

    fn core_in(dir: &Path) -> BackendCore {
        BackendCore::new(CacheConfig::with_anchor("http://example.test", dir), VERSIONS)
    }

    #[test]
    fn test_default_prefix_shape() {
        let prefix = default_prefix("http://example.test", None);
        assert_eq!(prefix.len(), PrefixConfig::HASH_LEN + PrefixConfig::SUFFIX.len());
        assert!(prefix.ends_with("-APP-"));
        assert!(prefix[..PrefixConfig::HASH_LEN]
            .chars()
            .all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_identity_only_prefix_when_anchor_missing() {
        let missing = Path::new("/nonexistent/cacheport/anchor");
        assert_eq!(
            default_prefix("http://example.test", Some(missing)),
            default_prefix("http://example.test", None)
        );
        assert_ne!(
            default_prefix("http://example.test", None),
            default_prefix("http://other.test", None)
        );
    }

    #[test]
    fn test_prefix_is_deterministic() {
        let temp = TempDir::new().unwrap();
        let mut core = core_in(temp.path());

        core.set_prefix("");
        let first = core.prefix().to_string();
        core.set_prefix("");
        assert_eq!(core.prefix(), first);
    }

    #[test]
    fn test_touch_changes_prefix() {
        let temp = TempDir::new().unwrap();
        let mut core = core_in(temp.path());
        let before = core.prefix().to_string();

        assert!(core.touch_anchor());
        assert!(temp.path().join(PrefixConfig::SENTINEL_FILE).exists());
        assert_ne!(core.prefix(), before);

        let after_first = core.prefix().to_string();
        assert!(core.touch_anchor());
        assert_ne!(core.prefix(), after_first);
    }

    #[test]
    fn test_file_anchor() {
        let temp = TempDir::new().unwrap();
        let anchor = temp.path().join("anchor.txt");
        std::fs::write(&anchor, b"").unwrap();

        let mut core = BackendCore::new(CacheConfig::with_anchor("http://example.test", &anchor), VERSIONS);
        let before = core.prefix().to_string();
        assert!(core.touch_anchor());
        assert_ne!(core.prefix(), before);
        assert!(!temp.path().join(PrefixConfig::SENTINEL_FILE).exists());
    }

    #[test]
    fn test_explicit_prefix_survives_touch() {
        let temp = TempDir::new().unwrap();
        let mut core = core_in(temp.path());

        core.set_prefix("forum1_");
        assert!(core.has_explicit_prefix());
        assert!(core.touch_anchor());
        assert_eq!(core.prefix(), "forum1_");

        core.set_prefix("");
        assert!(!core.has_explicit_prefix());
        assert!(core.prefix().ends_with("-APP-"));
    }

    #[test]
    fn test_touch_without_anchor_is_noop() {
        let mut core = BackendCore::new(CacheConfig::default(), VERSIONS);
        let before = core.prefix().to_string();
        assert!(!core.touch_anchor());
        assert_eq!(core.prefix(), before);
    }

    #[test]
    fn test_connect_pins_directory_anchor() {
        let temp_dir = TempDir::new().unwrap();
        let mut core = core_in(temp_dir.path());
        core.mark_connected();
        assert!(temp_dir.path().join(PrefixConfig::SENTINEL_FILE).exists());

        let pinned = core.prefix().to_string();
        fs::write(temp_dir.path().join("entry.cache"), b"{}").unwrap();
        core.set_prefix("");
        assert_eq!(core.prefix(), pinned);
    }

    #[test]
    fn test_instances_built_before_anchor_agree_after_connect() {
        let temp_dir = TempDir::new().unwrap();
        let anchor = temp_dir.path().join("cache");
        let mut first = core_in(&anchor);
        let mut second = core_in(&anchor);

        fs::create_dir_all(&anchor).unwrap();
        first.mark_connected();
        second.mark_connected();

        assert_eq!(first.prefix(), second.prefix());
        let connected = second.prefix().to_string();
        second.set_prefix("");
        assert_eq!(second.prefix(), connected);
    }

    #[test]
    fn test_connect_keeps_explicit_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let mut core = core_in(temp_dir.path());
        core.set_prefix("forum_");
        core.mark_connected();
        assert_eq!(core.prefix(), "forum_");
    }

    #[test]
    fn test_effective_ttl() {
        let mut core = BackendCore::new(CacheConfig::default(), VERSIONS);
        assert_eq!(core.effective_ttl(None), 120);
        assert_eq!(core.effective_ttl(Some(0)), 120);
        assert_eq!(core.effective_ttl(Some(30)), 30);

        core.set_default_ttl(600);
        assert_eq!(core.default_ttl(), 600);
        assert_eq!(core.effective_ttl(None), 600);
    }

    #[test]
    fn test_store_key_parts() {
        let mut core = BackendCore::new(CacheConfig::default(), VERSIONS);
        core.set_prefix("p_");
        let key = core.store_key("widgets");
        assert_eq!(key.as_str(), "p_widgets");
        assert_eq!(key.prefix(), "p_");
        assert_eq!(key.key(), "widgets");
    }

    #[test]
    fn test_lifecycle_marks() {
        let mut core = BackendCore::new(CacheConfig::default(), VERSIONS);
        assert_eq!(core.state(), LifecycleState::Constructed);
        core.mark_connected();
        assert!(core.is_connected());
        core.mark_quit();
        assert_eq!(core.state(), LifecycleState::Quit);
    }
}
