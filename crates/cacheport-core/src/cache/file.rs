//! Filesystem backend: one JSON envelope per key.
//!
//! Entry files live directly in the cache directory and are named after a
//! digest of the prefixed key, so arbitrary keys never become path segments.
//! The envelope keeps the full key, which lets scoped cleaning tell current
//! entries from ones left behind by an older prefix.

use super::base::{BackendCore, DriverVersions, StoreKey};
use super::settings::{FieldKind, SettingField, SettingsForm};
use super::traits::{CacheBackend, CleanScope};
use crate::atomic::{atomic_read_json, atomic_write_json, remove_if_exists};
use crate::clock::{expiry_after, Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const ENTRY_EXTENSION: &str = "cache";

/// On-disk entry format.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    key: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    payload: String,
}

impl Envelope {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Cache backend storing entries as files in a directory.
#[derive(Debug)]
pub struct FileBackend {
    core: BackendCore,
    directory: Option<PathBuf>,
    clock: Arc<dyn Clock>,
}

impl FileBackend {
    pub const NAME: &'static str = "file";
    pub const VERSIONS: DriverVersions = DriverVersions {
        minimum: "1.6.0",
        compatible: "9.99.99",
    };

    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let directory = resolve_directory(&config);
        Self {
            core: BackendCore::new(config, Self::VERSIONS),
            directory,
            clock,
        }
    }

    /// Directory holding entry files, if one is configured.
    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    fn dir(&self) -> Result<&Path> {
        self.directory
            .as_deref()
            .ok_or_else(|| CacheError::Config {
                message: "file cache needs drivers.file.directory or anchor_path".to_string(),
            })
    }

    fn entry_path(&self, key: &StoreKey) -> Result<PathBuf> {
        let digest = hex::encode(Sha256::digest(key.as_str().as_bytes()));
        Ok(self
            .dir()?
            .join(format!("{}.{}", &digest[..32], ENTRY_EXTENSION)))
    }

    /// Entry files currently in the directory.
    fn entry_files(&self) -> Result<Vec<PathBuf>> {
        let dir = self.dir()?;
        let entries = fs::read_dir(dir).map_err(|e| CacheError::Io {
            message: format!("Failed to read cache directory: {}", e),
            path: Some(dir.to_path_buf()),
            source: Some(e),
        })?;

        Ok(entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == ENTRY_EXTENSION))
            .collect())
    }
}

/// The explicit directory, else the anchor (or its parent when it is a file).
fn resolve_directory(config: &CacheConfig) -> Option<PathBuf> {
    if let Some(dir) = &config.drivers.file.directory {
        return Some(dir.clone());
    }
    let anchor = config.anchor_path.as_ref()?;
    if anchor.is_file() {
        anchor.parent().map(Path::to_path_buf)
    } else {
        Some(anchor.clone())
    }
}

impl CacheBackend for FileBackend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn core(&self) -> &BackendCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BackendCore {
        &mut self.core
    }

    /// The directory, or the nearest ancestor it would be created in, must be
    /// a writable directory.
    fn probe(&self) -> bool {
        let Some(dir) = &self.directory else {
            return false;
        };
        match dir.ancestors().find(|p| p.exists()) {
            Some(existing) => {
                existing.is_dir()
                    && fs::metadata(existing)
                        .map(|m| !m.permissions().readonly())
                        .unwrap_or(false)
            }
            None => false,
        }
    }

    fn open(&mut self) -> Result<()> {
        let dir = self.dir()?;
        fs::create_dir_all(dir).map_err(|e| CacheError::Io {
            message: format!("Failed to create cache directory: {}", e),
            path: Some(dir.to_path_buf()),
            source: Some(e),
        })?;

        let readonly = fs::metadata(dir)
            .map_err(|e| CacheError::io_with_path(e, dir))?
            .permissions()
            .readonly();
        if readonly {
            return Err(CacheError::Config {
                message: format!("cache directory {} is read-only", dir.display()),
            });
        }
        Ok(())
    }

    fn read_raw(&self, key: &StoreKey) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(key)?;

        let envelope = match atomic_read_json::<Envelope>(&path) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return Ok(None),
            Err(CacheError::Json { message, .. }) => {
                debug!("Removing corrupt cache file: {}", message);
                remove_if_exists(&path)?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if envelope.key != key.as_str() {
            return Ok(None);
        }
        if envelope.is_expired(self.clock.now()) {
            remove_if_exists(&path)?;
            return Ok(None);
        }

        Ok(Some(envelope.payload.into_bytes()))
    }

    fn write_raw(&self, key: &StoreKey, bytes: &[u8], ttl_secs: u64) -> Result<()> {
        let payload = String::from_utf8(bytes.to_vec())
            .map_err(|e| CacheError::Other(format!("Cache payload is not UTF-8: {}", e)))?;

        let envelope = Envelope {
            key: key.as_str().to_string(),
            expires_at: expiry_after(self.clock.as_ref(), ttl_secs),
            payload,
        };
        atomic_write_json(&self.entry_path(key)?, &envelope)
    }

    fn delete_raw(&self, key: &StoreKey) -> Result<()> {
        remove_if_exists(&self.entry_path(key)?)?;
        Ok(())
    }

    fn clear(&self, scope: CleanScope, prefix: &str) -> Result<usize> {
        let mut removed = 0;
        for path in self.entry_files()? {
            let doomed = match atomic_read_json::<Envelope>(&path) {
                Ok(Some(envelope)) => scope.matches(&envelope.key, prefix),
                Ok(None) => false,
                // Unreadable files belong to no prefix.
                Err(_) => scope != CleanScope::Current,
            };
            if doomed && remove_if_exists(&path)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn sweep(&self) -> Result<()> {
        let now = self.clock.now();
        let mut removed = 0;
        for path in self.entry_files()? {
            let expired = match atomic_read_json::<Envelope>(&path) {
                Ok(Some(envelope)) => envelope.is_expired(now),
                Ok(None) => false,
                Err(_) => true,
            };
            if expired && remove_if_exists(&path)? {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Swept {} expired cache files", removed);
        }
        Ok(())
    }

    fn cache_settings(&self, form: &mut SettingsForm) {
        let current = self
            .directory
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_default();
        form.insert(
            SettingField::new("file.directory", "Cache directory", FieldKind::Path, current)
                .with_help("Directory that holds one file per cached entry"),
        );
    }
}
