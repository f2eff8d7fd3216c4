//! Cache backend trait and types.

use super::base::{BackendCore, LifecycleState, StoreKey};
use super::settings::SettingsForm;
use crate::error::Result;
use serde_json::Value;
use tracing::{debug, warn};

/// Category filter for `clean_cache`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanScope {
    /// Entries under the current prefix.
    Current,
    /// Entries left behind under older prefixes.
    Stale,
    /// Everything in the store.
    All,
}

impl CleanScope {
    /// Parse a host-supplied category. Unknown categories mean `Current`.
    pub fn parse(category: &str) -> Self {
        match category.trim().to_ascii_lowercase().as_str() {
            "all" => CleanScope::All,
            "stale" => CleanScope::Stale,
            "" | "data" => CleanScope::Current,
            other => {
                debug!("Unknown cache category '{}', cleaning current prefix", other);
                CleanScope::Current
            }
        }
    }

    /// Whether an entry stored under `key` falls in this scope.
    pub fn matches(&self, key: &str, prefix: &str) -> bool {
        match self {
            CleanScope::Current => key.starts_with(prefix),
            CleanScope::Stale => !key.starts_with(prefix),
            CleanScope::All => true,
        }
    }
}

/// Whether a value is the "absent" marker that turns a write into a delete.
pub fn is_absent(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

/// Generic cache backend trait.
///
/// Implementors embed a [`BackendCore`] and provide the storage primitives;
/// the host-facing operations are default methods built on top of them and
/// never return errors, only `false` or `None`.
/// All operations are synchronous.
pub trait CacheBackend: Send + Sync {
    /// Short driver identifier, e.g. `"memory"`.
    fn name(&self) -> &'static str;

    fn core(&self) -> &BackendCore;

    fn core_mut(&mut self) -> &mut BackendCore;

    // ------------------------------------------------------------------
    // Storage primitives
    // ------------------------------------------------------------------

    /// Static capability check, independent of the enable flag.
    fn probe(&self) -> bool {
        true
    }

    /// Open handles or connections. Called once by `connect`.
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release handles or connections. Called once by `quit`.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Read the raw payload stored under `key`, honoring expiry.
    fn read_raw(&self, key: &StoreKey) -> Result<Option<Vec<u8>>>;

    /// Store `bytes` under `key`. `ttl_secs == 0` means no expiry.
    fn write_raw(&self, key: &StoreKey, bytes: &[u8], ttl_secs: u64) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    fn delete_raw(&self, key: &StoreKey) -> Result<()>;

    /// Remove entries in `scope` relative to `prefix`, returning how many went.
    fn clear(&self, scope: CleanScope, prefix: &str) -> Result<usize>;

    /// Drop every entry at once. `Ok(false)` means the store has no such
    /// operation and invalidation falls back to touching the anchor.
    fn flush_all(&self) -> Result<bool> {
        Ok(false)
    }

    /// One bounded maintenance pass.
    fn sweep(&self) -> Result<()> {
        Ok(())
    }

    // ------------------------------------------------------------------
    // Host-facing contract
    // ------------------------------------------------------------------

    /// Whether this backend can run here. `test` skips the enable flag.
    fn is_supported(&self, test: bool) -> bool {
        self.probe() && (test || self.core().config().enabled)
    }

    /// Open the backend. Safe to call again once connected.
    fn connect(&mut self) -> bool {
        match self.core().state() {
            LifecycleState::Connected => return true,
            LifecycleState::Quit => {
                warn!("Cache backend '{}' was shut down and cannot reconnect", self.name());
                return false;
            }
            LifecycleState::Constructed => {}
        }

        match self.open() {
            Ok(()) => {
                self.core_mut().mark_connected();
                debug!(
                    "Connected cache backend '{}' with prefix '{}'",
                    self.name(),
                    self.core().prefix()
                );
                true
            }
            Err(e) => {
                warn!("Failed to connect cache backend '{}': {}", self.name(), e);
                false
            }
        }
    }

    /// Set the key prefix; an empty key recomputes the default one.
    fn set_prefix(&mut self, key: &str) -> bool {
        self.core_mut().set_prefix(key);
        true
    }

    fn get_prefix(&self) -> &str {
        self.core().prefix()
    }

    fn set_default_ttl(&mut self, ttl: u64) -> bool {
        self.core_mut().set_default_ttl(ttl);
        true
    }

    fn get_default_ttl(&self) -> u64 {
        self.core().default_ttl()
    }

    /// Look up `key`. The `ttl` argument is accepted and ignored.
    fn get_data(&self, key: &str, _ttl: Option<u64>) -> Option<Value> {
        let store_key = ready_key(self, key)?;

        let bytes = match self.read_raw(&store_key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!("Cache read of '{}' failed: {}", store_key, e);
                return None;
            }
        };

        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Null) => None,
            Ok(value) => Some(value),
            Err(e) => {
                debug!("Discarding undecodable cache entry '{}': {}", store_key, e);
                None
            }
        }
    }

    /// Store `value` under `key`, or delete the key when `value` is absent.
    fn put_data(&self, key: &str, value: Option<&Value>, ttl: Option<u64>) -> bool {
        let Some(store_key) = ready_key(self, key) else {
            return false;
        };

        // Legacy shape: an absent value is a delete.
        let value = match value {
            Some(value) if !is_absent(Some(value)) => value,
            _ => return remove(self, &store_key),
        };

        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to serialize cache entry '{}': {}", store_key, e);
                return false;
            }
        };

        let ttl = self.core().effective_ttl(ttl);
        match self.write_raw(&store_key, &bytes, ttl) {
            Ok(()) => true,
            Err(e) => {
                warn!("Cache write of '{}' failed: {}", store_key, e);
                false
            }
        }
    }

    /// Delete `key` explicitly.
    fn delete_data(&self, key: &str) -> bool {
        match ready_key(self, key) {
            Some(store_key) => remove(self, &store_key),
            None => false,
        }
    }

    /// Clear entries of a category (see [`CleanScope::parse`]).
    fn clean_cache(&self, category: &str) -> bool {
        if !self.core().is_connected() {
            debug!("clean_cache on unconnected backend '{}'", self.name());
            return false;
        }

        let scope = CleanScope::parse(category);
        match self.clear(scope, self.core().prefix()) {
            Ok(removed) => {
                debug!(
                    "Cleaned {} entries from '{}' ({:?})",
                    removed,
                    self.name(),
                    scope
                );
                true
            }
            Err(e) => {
                warn!("Cache clean on '{}' failed: {}", self.name(), e);
                false
            }
        }
    }

    /// Make every existing entry unreachable. Best effort; always true.
    fn invalidate_cache(&mut self) -> bool {
        match self.flush_all() {
            Ok(true) => {
                debug!("Flushed cache backend '{}'", self.name());
                return true;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    "Flush of '{}' failed, falling back to anchor touch: {}",
                    self.name(),
                    e
                );
            }
        }

        self.core_mut().touch_anchor();
        true
    }

    /// Release resources. Always true.
    fn quit(&mut self) -> bool {
        if self.core().is_connected() {
            if let Err(e) = self.close() {
                warn!("Error while closing cache backend '{}': {}", self.name(), e);
            }
        }
        self.core_mut().mark_quit();
        true
    }

    /// Contribute backend-specific fields to the host's settings form.
    fn cache_settings(&self, _form: &mut SettingsForm) {}

    /// Newest host version this driver supports.
    fn get_compatible_version(&self) -> &str {
        self.core().versions().compatible
    }

    /// Oldest host version this driver supports.
    fn get_minimum_version(&self) -> &str {
        self.core().versions().minimum
    }

    /// Reports the minimum supported host version, not a driver version.
    /// Existing hosts compare against this value, so it is kept as is.
    fn get_version(&self) -> &str {
        self.get_minimum_version()
    }

    /// Periodic maintenance. Failures are logged and swallowed.
    fn housekeeping(&self) {
        if !self.core().is_connected() {
            return;
        }
        if let Err(e) = self.sweep() {
            warn!("Housekeeping on '{}' failed: {}", self.name(), e);
        }
    }
}

/// Prefixed key for a data operation, or `None` when the backend is not usable.
fn ready_key<B: CacheBackend + ?Sized>(backend: &B, key: &str) -> Option<StoreKey> {
    if !backend.core().is_connected() {
        debug!(
            "Data operation on unconnected backend '{}' ignored",
            backend.name()
        );
        return None;
    }
    Some(backend.core().store_key(key))
}

fn remove<B: CacheBackend + ?Sized>(backend: &B, key: &StoreKey) -> bool {
    match backend.delete_raw(key) {
        Ok(()) => true,
        Err(e) => {
            warn!("Cache delete of '{}' failed: {}", key, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_scope_parse() {
        assert_eq!(CleanScope::parse(""), CleanScope::Current);
        assert_eq!(CleanScope::parse("data"), CleanScope::Current);
        assert_eq!(CleanScope::parse("ALL"), CleanScope::All);
        assert_eq!(CleanScope::parse("stale"), CleanScope::Stale);
        assert_eq!(CleanScope::parse("sessions"), CleanScope::Current);
    }

    #[test]
    fn test_clean_scope_matches() {
        assert!(CleanScope::Current.matches("p_key", "p_"));
        assert!(!CleanScope::Current.matches("q_key", "p_"));
        assert!(CleanScope::Stale.matches("q_key", "p_"));
        assert!(!CleanScope::Stale.matches("p_key", "p_"));
        assert!(CleanScope::All.matches("anything", "p_"));
    }

    #[test]
    fn test_is_absent() {
        assert!(is_absent(None));
        assert!(is_absent(Some(&Value::Null)));
        assert!(!is_absent(Some(&Value::Bool(false))));
        assert!(!is_absent(Some(&serde_json::json!([]))));
    }
}
