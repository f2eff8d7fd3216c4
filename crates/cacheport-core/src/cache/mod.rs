//! Pluggable cache backends.
//!
//! Every driver implements [`CacheBackend`] on top of a shared
//! [`BackendCore`], which supplies prefixing, TTL defaults, touch-based
//! invalidation, version strings and the connect/quit lifecycle:
//! - `disabled`: accepts everything, stores nothing
//! - `memory`: per-process map with per-entry expiry
//! - `file`: one JSON envelope per key in a cache directory
//! - `sqlite`: single-table SQLite store with LRU trimming
//! - `memcached`: external daemon over the text protocol

mod base;
mod disabled;
mod ext;
mod file;
#[cfg(feature = "memcached")]
mod memcached;
mod memory;
mod settings;
#[cfg(feature = "sqlite")]
mod sqlite;
mod traits;

pub use base::{
    anchor_mtime, default_prefix, BackendCore, DriverVersions, LifecycleState, StoreKey,
};
pub use disabled::DisabledBackend;
pub use ext::CacheBackendExt;
pub use file::FileBackend;
#[cfg(feature = "memcached")]
pub use memcached::MemcachedBackend;
pub use memory::MemoryBackend;
pub use settings::{FieldKind, SettingField, SettingsForm};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteBackend, SqliteStats};
pub use traits::{is_absent, CacheBackend, CleanScope};
