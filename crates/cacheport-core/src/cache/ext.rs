//! Typed convenience layer over the JSON payload contract.

use super::traits::CacheBackend;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

/// Typed helpers available on every backend, including `dyn CacheBackend`.
pub trait CacheBackendExt: CacheBackend {
    /// Read `key` and decode it as `T`. Decode failures count as a miss.
    fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get_data(key, None)?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                debug!("Cached value for '{}' has unexpected shape: {}", key, e);
                None
            }
        }
    }

    /// Encode `value` and store it under `key`.
    fn put_as<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<u64>) -> bool {
        match serde_json::to_value(value) {
            Ok(json) => self.put_data(key, Some(&json), ttl),
            Err(e) => {
                warn!("Failed to encode cache value for '{}': {}", key, e);
                false
            }
        }
    }

    /// Return the cached value, or compute, store and return it on a miss.
    fn remember<T, F>(&self, key: &str, ttl: Option<u64>, compute: F) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        if let Some(hit) = self.get_as::<T>(key) {
            return hit;
        }
        let fresh = compute();
        if !self.put_as(key, &fresh, ttl) {
            debug!("Computed value for '{}' was not cached", key);
        }
        fresh
    }
}

impl<B: CacheBackend + ?Sized> CacheBackendExt for B {}
