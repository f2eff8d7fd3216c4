//! memcached backend speaking the text protocol over TCP.
//!
//! Only the handful of commands the contract needs are used: `version`,
//! `get`, `set`, `delete`, `flush_all` and `quit`. Expiry is enforced by the
//! daemon.

use super::base::{BackendCore, DriverVersions, StoreKey};
use super::settings::{FieldKind, SettingField, SettingsForm};
use super::traits::{CacheBackend, CleanScope};
use crate::config::{CacheConfig, MemcachedOptions};
use crate::error::{CacheError, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Longest key memcached accepts.
const MAX_KEY_LEN: usize = 250;
/// Relative expiry limit; larger values are sent as absolute unix time.
const MAX_RELATIVE_EXPIRY: u64 = 60 * 60 * 24 * 30;
/// Longest sanitized prefix kept in front of a hashed key.
const HASHED_PREFIX_LEN: usize = 64;

struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Connection {
    fn open(options: &MemcachedOptions) -> Result<Self> {
        let endpoint = options.endpoint();
        let timeout = options.timeout();

        let addrs = endpoint
            .to_socket_addrs()
            .map_err(|e| CacheError::Connection {
                endpoint: endpoint.clone(),
                message: format!("address lookup failed: {}", e),
            })?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(timeout))?;
                    stream.set_write_timeout(Some(timeout))?;
                    stream.set_nodelay(true)?;
                    let writer = stream.try_clone()?;
                    return Ok(Self {
                        reader: BufReader::new(stream),
                        writer,
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(CacheError::Connection {
            endpoint,
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no addresses resolved".to_string()),
        })
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Read one response line without its trailing CRLF.
    fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line)?;
        if read == 0 {
            return Err(CacheError::Protocol {
                message: "connection closed by server".to_string(),
            });
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();

        if line == "ERROR" || line.starts_with("CLIENT_ERROR") || line.starts_with("SERVER_ERROR") {
            return Err(CacheError::Protocol { message: line });
        }
        Ok(line)
    }

    fn version(&mut self) -> Result<String> {
        self.send(b"version\r\n")?;
        let line = self.read_line()?;
        line.strip_prefix("VERSION ")
            .map(str::to_string)
            .ok_or_else(|| unexpected("version", &line))
    }

    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        self.send(format!("get {}\r\n", key).as_bytes())?;

        let header = self.read_line()?;
        if header == "END" {
            return Ok(None);
        }

        // VALUE <key> <flags> <bytes>
        let len: usize = header
            .strip_prefix("VALUE ")
            .and_then(|rest| rest.split_whitespace().nth(2))
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| unexpected("get", &header))?;

        let mut data = vec![0u8; len + 2];
        self.reader.read_exact(&mut data)?;
        if !data.ends_with(b"\r\n") {
            return Err(unexpected("get", "data block without CRLF"));
        }
        data.truncate(len);

        let end = self.read_line()?;
        if end != "END" {
            return Err(unexpected("get", &end));
        }
        Ok(Some(data))
    }

    fn set(&mut self, key: &str, bytes: &[u8], exptime: u64) -> Result<()> {
        let mut command = format!("set {} 0 {} {}\r\n", key, exptime, bytes.len()).into_bytes();
        command.extend_from_slice(bytes);
        command.extend_from_slice(b"\r\n");
        self.send(&command)?;

        let line = self.read_line()?;
        if line == "STORED" {
            Ok(())
        } else {
            Err(unexpected("set", &line))
        }
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.send(format!("delete {}\r\n", key).as_bytes())?;
        let line = self.read_line()?;
        match line.as_str() {
            "DELETED" | "NOT_FOUND" => Ok(()),
            _ => Err(unexpected("delete", &line)),
        }
    }

    fn flush_all(&mut self) -> Result<()> {
        self.send(b"flush_all\r\n")?;
        let line = self.read_line()?;
        if line == "OK" {
            Ok(())
        } else {
            Err(unexpected("flush_all", &line))
        }
    }

    fn quit(&mut self) -> Result<()> {
        self.send(b"quit\r\n")
    }
}

fn unexpected(command: &str, line: &str) -> CacheError {
    CacheError::Protocol {
        message: format!("unexpected reply to {}: {}", command, line),
    }
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_graphic()
}

/// Key sent on the wire. Keys memcached would reject keep a sanitized prefix
/// and replace the rest with a digest of the full key.
pub(crate) fn wire_key(key: &StoreKey) -> String {
    let full = key.as_str();
    if !full.is_empty() && full.len() <= MAX_KEY_LEN && full.chars().all(is_key_char) {
        return full.to_string();
    }

    let prefix: String = key
        .prefix()
        .chars()
        .map(|c| if is_key_char(c) { c } else { '_' })
        .take(HASHED_PREFIX_LEN)
        .collect();
    format!("{}{}", prefix, hex::encode(Sha256::digest(full.as_bytes())))
}

/// memcached `exptime` for a TTL in seconds.
fn exptime(ttl_secs: u64) -> u64 {
    if ttl_secs > MAX_RELATIVE_EXPIRY {
        (Utc::now().timestamp().max(0) as u64).saturating_add(ttl_secs)
    } else {
        ttl_secs
    }
}

/// Backend for an external memcached daemon.
pub struct MemcachedBackend {
    core: BackendCore,
    options: MemcachedOptions,
    conn: Mutex<Option<Connection>>,
}

impl MemcachedBackend {
    pub const NAME: &'static str = "memcached";
    pub const VERSIONS: DriverVersions = DriverVersions {
        minimum: "1.6.0",
        compatible: "9.99.99",
    };

    pub fn new(config: CacheConfig) -> Self {
        let options = config.drivers.memcached.clone();
        Self {
            core: BackendCore::new(config, Self::VERSIONS),
            options,
            conn: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &MemcachedOptions {
        &self.options
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
        self.conn
            .lock()
            .map_err(|e| CacheError::Other(format!("Failed to lock memcached connection: {}", e)))
    }

    /// Run `f` on the connection, reconnecting once if it was dropped.
    ///
    /// Any error drops the connection so the next call starts clean.
    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        if !self.core.is_connected() {
            return Err(CacheError::NotConnected);
        }

        let mut guard = self.lock()?;
        if guard.is_none() {
            debug!("Reconnecting to memcached at {}", self.options.endpoint());
            *guard = Some(Connection::open(&self.options)?);
        }

        let conn = guard.as_mut().ok_or(CacheError::NotConnected)?;
        let result = f(conn);
        if result.is_err() {
            *guard = None;
        }
        result
    }
}

impl CacheBackend for MemcachedBackend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn core(&self) -> &BackendCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BackendCore {
        &mut self.core
    }

    fn probe(&self) -> bool {
        !self.options.host.trim().is_empty() && self.options.port != 0
    }

    fn open(&mut self) -> Result<()> {
        let mut conn = Connection::open(&self.options)?;
        let version = conn.version()?;
        debug!(
            "Connected to memcached {} at {}",
            version,
            self.options.endpoint()
        );
        *self.lock()? = Some(conn);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut conn) = self.lock()?.take() {
            if let Err(e) = conn.quit() {
                warn!("Failed to send quit to memcached: {}", e);
            }
        }
        Ok(())
    }

    fn read_raw(&self, key: &StoreKey) -> Result<Option<Vec<u8>>> {
        let wire = wire_key(key);
        self.with_conn(|conn| conn.get(&wire))
    }

    fn write_raw(&self, key: &StoreKey, bytes: &[u8], ttl_secs: u64) -> Result<()> {
        let wire = wire_key(key);
        self.with_conn(|conn| conn.set(&wire, bytes, exptime(ttl_secs)))
    }

    fn delete_raw(&self, key: &StoreKey) -> Result<()> {
        let wire = wire_key(key);
        self.with_conn(|conn| conn.delete(&wire))
    }

    /// memcached cannot enumerate keys, so every scope flushes.
    fn clear(&self, _scope: CleanScope, _prefix: &str) -> Result<usize> {
        self.with_conn(|conn| conn.flush_all())?;
        Ok(0)
    }

    fn flush_all(&self) -> Result<bool> {
        self.with_conn(|conn| conn.flush_all())?;
        Ok(true)
    }

    fn cache_settings(&self, form: &mut SettingsForm) {
        form.insert(SettingField::new(
            "memcached.host",
            "memcached host",
            FieldKind::Text,
            self.options.host.clone(),
        ));
        form.insert(SettingField::new(
            "memcached.port",
            "memcached port",
            FieldKind::Number,
            self.options.port,
        ));
        form.insert(
            SettingField::new(
                "memcached.timeout_ms",
                "Timeout (ms)",
                FieldKind::Number,
                self.options.timeout_ms,
            )
            .with_help("Applies to connecting and to each request"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn key_with_prefix(prefix: &str, key: &str) -> StoreKey {
        let mut core = BackendCore::new(CacheConfig::default(), MemcachedBackend::VERSIONS);
        core.set_prefix(prefix);
        core.store_key(key)
    }

    #[test]
    fn test_wire_key_passthrough() {
        let key = key_with_prefix("abcd1234-APP-", "widgets");
        assert_eq!(wire_key(&key), "abcd1234-APP-widgets");
    }

    #[test]
    fn test_wire_key_hashes_invalid_keys() {
        let key = key_with_prefix("abcd1234-APP-", "user list");
        let wire = wire_key(&key);
        assert!(wire.starts_with("abcd1234-APP-"));
        assert!(!wire.contains(' '));
        assert_eq!(wire.len(), "abcd1234-APP-".len() + 64);

        let long = key_with_prefix("p ", &"k".repeat(400));
        let wire = wire_key(&long);
        assert!(wire.starts_with("p_"));
        assert!(wire.len() <= MAX_KEY_LEN);
    }

    #[test]
    fn test_exptime() {
        assert_eq!(exptime(0), 0);
        assert_eq!(exptime(120), 120);
        assert!(exptime(MAX_RELATIVE_EXPIRY + 1) > MAX_RELATIVE_EXPIRY * 10);
    }

    #[test]
    fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let mut config = CacheConfig::default();
        config.drivers.memcached.port = port;
        config.drivers.memcached.timeout_ms = 200;

        let mut backend = MemcachedBackend::new(config);
        assert!(backend.is_supported(true));
        assert!(!backend.connect());
        assert_eq!(backend.get_data("x", None), None);
        assert!(!backend.put_data("x", Some(&serde_json::json!(1)), None));
    }

    #[test]
    fn test_settings_fields() {
        let backend = MemcachedBackend::new(CacheConfig::default());
        let mut form = SettingsForm::new();
        backend.cache_settings(&mut form);

        let names: Vec<&str> = form.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["memcached.host", "memcached.port", "memcached.timeout_ms"]);
    }
}
