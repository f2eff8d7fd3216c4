//! Backend discovery and selection for hosts.
//!
//! The host enumerates every known variant, keeps the ones that pass the
//! static capability probe and whose declared version range covers the host
//! version, and then constructs and connects exactly one of them.

use crate::cache::{
    CacheBackend, DisabledBackend, DriverVersions, FileBackend, MemoryBackend,
};
#[cfg(feature = "memcached")]
use crate::cache::MemcachedBackend;
#[cfg(feature = "sqlite")]
use crate::cache::SqliteBackend;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Known backend variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Disabled,
    Memory,
    File,
    Sqlite,
    Memcached,
}

impl BackendKind {
    pub const ALL: [BackendKind; 5] = [
        BackendKind::Disabled,
        BackendKind::Memory,
        BackendKind::File,
        BackendKind::Sqlite,
        BackendKind::Memcached,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Disabled => DisabledBackend::NAME,
            BackendKind::Memory => MemoryBackend::NAME,
            BackendKind::File => FileBackend::NAME,
            BackendKind::Sqlite => "sqlite",
            BackendKind::Memcached => "memcached",
        }
    }

    /// Whether the variant was compiled into this build.
    pub fn is_compiled(&self) -> bool {
        match self {
            BackendKind::Sqlite => cfg!(feature = "sqlite"),
            BackendKind::Memcached => cfg!(feature = "memcached"),
            _ => true,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| CacheError::Config {
                message: format!("unknown cache backend '{}'", s),
            })
    }
}

/// What discovery reports about one variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub kind: BackendKind,
    /// Static capability probe result (`is_supported(true)`).
    pub supported: bool,
    pub minimum_version: String,
    pub compatible_version: String,
    /// Whether the host version falls within the declared range.
    pub compatible: bool,
}

impl BackendDescriptor {
    /// Supported and compatible.
    pub fn is_eligible(&self) -> bool {
        self.supported && self.compatible
    }
}

/// Construct a backend of the given kind. The instance is not connected.
pub fn create_backend(kind: BackendKind, config: &CacheConfig) -> Result<Box<dyn CacheBackend>> {
    let config = config.clone();
    match kind {
        BackendKind::Disabled => Ok(Box::new(DisabledBackend::new(config))),
        BackendKind::Memory => Ok(Box::new(MemoryBackend::new(config))),
        BackendKind::File => Ok(Box::new(FileBackend::new(config))),
        #[cfg(feature = "sqlite")]
        BackendKind::Sqlite => Ok(Box::new(SqliteBackend::new(config))),
        #[cfg(feature = "memcached")]
        BackendKind::Memcached => Ok(Box::new(MemcachedBackend::new(config))),
        #[allow(unreachable_patterns)]
        other => Err(CacheError::Unsupported {
            backend: other.as_str().to_string(),
        }),
    }
}

/// Whether `host` lies within `[minimum, compatible]`.
///
/// A missing host version accepts every driver; unparseable versions reject.
pub fn is_version_compatible(versions: DriverVersions, host: Option<&str>) -> bool {
    let Some(host) = host else {
        return true;
    };

    let parsed = (
        Version::parse(host.trim()),
        Version::parse(versions.minimum),
        Version::parse(versions.compatible),
    );
    match parsed {
        (Ok(host), Ok(minimum), Ok(compatible)) => minimum <= host && host <= compatible,
        _ => {
            debug!(
                "Unparseable version in range check: host={} range={}..={}",
                host, versions.minimum, versions.compatible
            );
            false
        }
    }
}

/// Describe every known variant against `config`.
pub fn discover(config: &CacheConfig) -> Vec<BackendDescriptor> {
    BackendKind::ALL
        .into_iter()
        .map(|kind| match create_backend(kind, config) {
            Ok(backend) => {
                let versions = backend.core().versions();
                BackendDescriptor {
                    kind,
                    supported: backend.is_supported(true),
                    minimum_version: backend.get_minimum_version().to_string(),
                    compatible_version: backend.get_compatible_version().to_string(),
                    compatible: is_version_compatible(versions, config.host_version.as_deref()),
                }
            }
            Err(_) => BackendDescriptor {
                kind,
                supported: false,
                minimum_version: String::new(),
                compatible_version: String::new(),
                compatible: false,
            },
        })
        .collect()
}

/// Construct and connect `kind`, falling back to a connected disabled backend.
pub fn open_backend(kind: BackendKind, config: &CacheConfig) -> Box<dyn CacheBackend> {
    match try_open(kind, config) {
        Ok(backend) => {
            info!("Using cache backend '{}'", kind);
            backend
        }
        Err(e) => {
            if e.is_unavailable() {
                warn!("Cache backend '{}' unavailable, caching disabled: {}", kind, e);
            } else {
                info!("Cache backend '{}' not selected, caching disabled: {}", kind, e);
            }
            let mut fallback = DisabledBackend::new(config.clone());
            fallback.connect();
            Box::new(fallback)
        }
    }
}

fn try_open(kind: BackendKind, config: &CacheConfig) -> Result<Box<dyn CacheBackend>> {
    let mut backend = create_backend(kind, config)?;

    if !backend.is_supported(false) {
        return Err(CacheError::Unsupported {
            backend: kind.as_str().to_string(),
        });
    }
    let versions = backend.core().versions();
    if !is_version_compatible(versions, config.host_version.as_deref()) {
        return Err(CacheError::Config {
            message: format!(
                "backend supports {}..={}, host is {}",
                versions.minimum,
                versions.compatible,
                config.host_version.as_deref().unwrap_or("unknown")
            ),
        });
    }
    if !backend.connect() {
        return Err(CacheError::NotConnected);
    }
    Ok(backend)
}
