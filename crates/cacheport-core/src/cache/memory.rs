//! In-process map backend.

use super::base::{BackendCore, DriverVersions, StoreKey};
use super::traits::{CacheBackend, CleanScope};
use crate::clock::{expiry_after, Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Map-backed cache local to this process.
///
/// Thread-safe via an internal mutex on the map.
#[derive(Debug)]
pub struct MemoryBackend {
    core: BackendCore,
    entries: Mutex<HashMap<String, MemoryEntry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryBackend {
    pub const NAME: &'static str = "memory";
    pub const VERSIONS: DriverVersions = DriverVersions {
        minimum: "1.4.0",
        compatible: "9.99.99",
    };

    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a backend that reads time from `clock`.
    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            core: BackendCore::new(config, Self::VERSIONS),
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of entries held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, MemoryEntry>>> {
        self.entries
            .lock()
            .map_err(|e| CacheError::Other(format!("Failed to lock memory cache: {}", e)))
    }
}

impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn core(&self) -> &BackendCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BackendCore {
        &mut self.core
    }

    fn close(&mut self) -> Result<()> {
        self.lock()?.clear();
        Ok(())
    }

    fn read_raw(&self, key: &StoreKey) -> Result<Option<Vec<u8>>> {
        let mut entries = self.lock()?;
        let now = self.clock.now();

        match entries.get(key.as_str()) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key.as_str());
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    fn write_raw(&self, key: &StoreKey, bytes: &[u8], ttl_secs: u64) -> Result<()> {
        let entry = MemoryEntry {
            value: bytes.to_vec(),
            expires_at: expiry_after(self.clock.as_ref(), ttl_secs),
        };
        self.lock()?.insert(key.as_str().to_string(), entry);
        Ok(())
    }

    fn delete_raw(&self, key: &StoreKey) -> Result<()> {
        self.lock()?.remove(key.as_str());
        Ok(())
    }

    fn clear(&self, scope: CleanScope, prefix: &str) -> Result<usize> {
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|key, _| !scope.matches(key, prefix));
        Ok(before - entries.len())
    }

    fn flush_all(&self) -> Result<bool> {
        self.lock()?.clear();
        Ok(true)
    }

    fn sweep(&self) -> Result<()> {
        let mut entries = self.lock()?;
        let now = self.clock.now();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));

        let removed = before - entries.len();
        if removed > 0 {
            debug!("Swept {} expired memory cache entries", removed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn connected(clock: &ManualClock) -> MemoryBackend {
        let mut backend = MemoryBackend::with_clock(CacheConfig::default(), Arc::new(clock.clone()));
        assert!(backend.connect());
        backend
    }

    #[test]
    fn test_set_and_get() {
        let backend = connected(&ManualClock::new());
        assert!(backend.put_data("key1", Some(&json!("hello world")), None));
        assert_eq!(backend.get_data("key1", None), Some(json!("hello world")));
    }

    #[test]
    fn test_keys_are_prefixed() {
        let backend = connected(&ManualClock::new());
        backend.put_data("key1", Some(&json!(1)), None);

        let entries = backend.entries.lock().unwrap();
        let stored: Vec<&String> = entries.keys().collect();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].starts_with(backend.get_prefix()));
        assert!(stored[0].ends_with("key1"));
    }

    #[test]
    fn test_expiration() {
        let clock = ManualClock::new();
        let backend = connected(&clock);

        backend.put_data("x", Some(&json!("v")), Some(1));
        assert_eq!(backend.get_data("x", None), Some(json!("v")));

        clock.advance_secs(2);
        assert_eq!(backend.get_data("x", None), None);
        assert!(backend.is_empty());
    }

    #[test]
    fn test_default_ttl_applies() {
        let clock = ManualClock::new();
        let mut backend = connected(&clock);
        backend.set_default_ttl(10);

        backend.put_data("x", Some(&json!("v")), Some(0));
        clock.advance_secs(9);
        assert!(backend.get_data("x", None).is_some());
        clock.advance_secs(2);
        assert!(backend.get_data("x", None).is_none());
    }

    #[test]
    fn test_sweep_removes_expired() {
        let clock = ManualClock::new();
        let backend = connected(&clock);

        backend.put_data("short", Some(&json!(1)), Some(5));
        backend.put_data("long", Some(&json!(2)), Some(500));
        clock.advance_secs(10);

        backend.housekeeping();
        assert_eq!(backend.len(), 1);
        assert_eq!(backend.get_data("long", None), Some(json!(2)));
    }

    #[test]
    fn test_clean_stale_keeps_current() {
        let mut backend = connected(&ManualClock::new());
        backend.set_prefix("old_");
        backend.put_data("a", Some(&json!(1)), None);
        backend.set_prefix("new_");
        backend.put_data("b", Some(&json!(2)), None);

        assert!(backend.clean_cache("stale"));
        assert_eq!(backend.len(), 1);
        assert_eq!(backend.get_data("b", None), Some(json!(2)));

        assert!(backend.clean_cache(""));
        assert!(backend.is_empty());
    }

    #[test]
    fn test_quit_releases_entries() {
        let mut backend = connected(&ManualClock::new());
        backend.put_data("a", Some(&json!(1)), None);
        assert!(backend.quit());
        assert!(backend.is_empty());
        assert!(!backend.connect());
    }
}
