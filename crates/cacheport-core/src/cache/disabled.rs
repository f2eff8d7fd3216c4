//! No-op backend used when caching is switched off or unavailable.

use super::base::{BackendCore, DriverVersions, StoreKey};
use super::traits::{CacheBackend, CleanScope};
use crate::config::CacheConfig;
use crate::error::Result;

/// Backend that never stores anything. Writes are accepted and dropped.
#[derive(Debug, Clone)]
pub struct DisabledBackend {
    core: BackendCore,
}

impl DisabledBackend {
    pub const NAME: &'static str = "disabled";
    pub const VERSIONS: DriverVersions = DriverVersions {
        minimum: "1.0.0",
        compatible: "9.99.99",
    };

    pub fn new(config: CacheConfig) -> Self {
        Self {
            core: BackendCore::new(config, Self::VERSIONS),
        }
    }
}

impl CacheBackend for DisabledBackend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn core(&self) -> &BackendCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BackendCore {
        &mut self.core
    }

    fn read_raw(&self, _key: &StoreKey) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn write_raw(&self, _key: &StoreKey, _bytes: &[u8], _ttl_secs: u64) -> Result<()> {
        Ok(())
    }

    fn delete_raw(&self, _key: &StoreKey) -> Result<()> {
        Ok(())
    }

    fn clear(&self, _scope: CleanScope, _prefix: &str) -> Result<usize> {
        Ok(0)
    }

    fn flush_all(&self) -> Result<bool> {
        Ok(true)
    }

    /// The fallback backend runs regardless of the enable flag.
    fn is_supported(&self, _test: bool) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_disabled_accepts_and_forgets() {
        let mut backend = DisabledBackend::new(CacheConfig::default());
        assert!(backend.connect());

        assert!(backend.put_data("widgets", Some(&json!([1, 2, 3])), None));
        assert_eq!(backend.get_data("widgets", None), None);
        assert!(backend.clean_cache(""));
        assert!(backend.invalidate_cache());
        assert!(backend.quit());
    }

    #[test]
    fn test_disabled_supported_even_when_switched_off() {
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        let backend = DisabledBackend::new(config);
        assert!(backend.is_supported(true));
        assert!(backend.is_supported(false));
    }
}
