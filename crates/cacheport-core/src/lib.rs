//! cacheport - a pluggable cache backend layer.
//!
//! A host holds one backend per process and talks to it only through the
//! [`CacheBackend`] contract, so the store behind it (memory, files, SQLite,
//! memcached, or nothing at all) can be swapped by configuration.
//!
//! # Example
//!
//! ```rust
//! use cacheport_core::{open_backend, BackendKind, CacheConfig, CacheBackendExt};
//!
//! let config = CacheConfig::default();
//! let mut cache = open_backend(BackendKind::Memory, &config);
//!
//! assert!(cache.put_as("widgets", &vec![1, 2, 3], None));
//! assert_eq!(cache.get_as::<Vec<i32>>("widgets"), Some(vec![1, 2, 3]));
//!
//! // Writing the absent marker deletes.
//! assert!(cache.put_data("widgets", None, None));
//! assert_eq!(cache.get_data("widgets", None), None);
//!
//! cache.quit();
//! ```

pub mod atomic;
pub mod cache;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod error;

// Re-export commonly used types
pub use cache::{
    is_absent, BackendCore, CacheBackend, CacheBackendExt, CleanScope, DisabledBackend,
    DriverVersions, FieldKind, FileBackend, LifecycleState, MemoryBackend, SettingField,
    SettingsForm, StoreKey,
};
#[cfg(feature = "memcached")]
pub use cache::MemcachedBackend;
#[cfg(feature = "sqlite")]
pub use cache::{SqliteBackend, SqliteStats};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, DriverOptions, FileOptions, MemcachedOptions, SqliteOptions};
pub use discovery::{create_backend, discover, open_backend, BackendDescriptor, BackendKind};
pub use error::{CacheError, Result};
