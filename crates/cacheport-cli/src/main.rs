//! cacheport - command-line host for the cache backends.
//!
//! Each invocation loads the configuration, opens one backend, runs a single
//! command and quits the backend again. Results are printed as JSON on stdout.

use anyhow::{Context, Result};
use cacheport_core::{discover, open_backend, BackendKind, CacheBackend, CacheConfig, SettingsForm};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "cacheport")]
#[command(about = "Inspect and drive cacheport cache backends")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend to open
    #[arg(short, long, default_value = "file")]
    backend: BackendKind,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every backend with its support and version range
    Backends,
    /// Print the value stored under KEY, or null
    Get { key: String },
    /// Store a JSON value under KEY (null deletes)
    Put {
        key: String,
        value: String,
        /// Seconds to live (0 = backend default)
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Delete KEY
    Delete { key: String },
    /// Clear a category of entries (data, stale or all)
    Clean {
        #[arg(long, default_value = "")]
        scope: String,
    },
    /// Make every cached entry unreachable
    Invalidate,
    /// Print the backend's settings form
    Settings,
    /// Run one maintenance pass
    Housekeeping,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging; stdout carries command output
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = load_config(args.config.as_deref())?;
    let output = run(args.backend, &config, args.command)?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

/// Read the configuration file, or fall back to defaults.
///
/// A configuration without an anchor gets the platform cache directory.
fn load_config(path: Option<&Path>) -> Result<CacheConfig> {
    let mut config = match path {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        }
        None => CacheConfig::default(),
    };

    if config.anchor_path.is_none() {
        if let Some(cache_dir) = dirs::cache_dir() {
            config.anchor_path = Some(cache_dir.join("cacheport"));
        }
    }

    if let Some(anchor) = &config.anchor_path {
        if !anchor.exists() {
            fs::create_dir_all(anchor)
                .with_context(|| format!("Failed to create cache anchor {}", anchor.display()))?;
        }
        debug!("Cache anchor: {}", anchor.display());
    }

    Ok(config)
}

fn run(kind: BackendKind, config: &CacheConfig, command: Command) -> Result<Value> {
    if let Command::Backends = command {
        return Ok(serde_json::to_value(discover(config))?);
    }

    let mut backend = open_backend(kind, config);
    info!("Opened '{}' with prefix '{}'", backend.name(), backend.get_prefix());

    let output = execute(backend.as_mut(), command);
    backend.quit();
    output
}

fn execute(backend: &mut dyn CacheBackend, command: Command) -> Result<Value> {
    let output = match command {
        Command::Backends => Value::Null,
        Command::Get { key } => backend.get_data(&key, None).unwrap_or(Value::Null),
        Command::Put { key, value, ttl } => {
            let value: Value = serde_json::from_str(&value)
                .with_context(|| format!("Value for '{}' is not valid JSON", key))?;
            json!({ "stored": backend.put_data(&key, Some(&value), ttl) })
        }
        Command::Delete { key } => json!({ "deleted": backend.delete_data(&key) }),
        Command::Clean { scope } => json!({ "cleaned": backend.clean_cache(&scope) }),
        Command::Invalidate => json!({ "invalidated": backend.invalidate_cache() }),
        Command::Settings => {
            let mut form = SettingsForm::new();
            backend.cache_settings(&mut form);
            json!({
                "backend": backend.name(),
                "prefix": backend.get_prefix(),
                "default_ttl": backend.get_default_ttl(),
                "fields": form,
            })
        }
        Command::Housekeeping => {
            backend.housekeeping();
            json!({ "ok": true })
        }
    };
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &Path) -> CacheConfig {
        CacheConfig::with_anchor("http://example.test", dir)
    }

    #[test]
    fn test_load_config_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let anchor = temp_dir.path().join("anchor");
        let path = temp_dir.path().join("cacheport.json");
        fs::write(
            &path,
            json!({ "identity": "http://forum.test", "anchor_path": anchor }).to_string(),
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.identity, "http://forum.test");
        assert_eq!(config.default_ttl_secs, 120);
        assert!(anchor.is_dir());
    }

    #[test]
    fn test_load_config_rejects_bad_json() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cacheport.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn test_put_get_across_invocations() {
        let temp_dir = TempDir::new().unwrap();
        let config = config_in(temp_dir.path());

        let put = Command::Put {
            key: "widgets".to_string(),
            value: "[1,2,3]".to_string(),
            ttl: None,
        };
        assert_eq!(run(BackendKind::File, &config, put).unwrap(), json!({ "stored": true }));

        let get = Command::Get {
            key: "widgets".to_string(),
        };
        assert_eq!(run(BackendKind::File, &config, get).unwrap(), json!([1, 2, 3]));
    }

    #[test]
    fn test_put_rejects_invalid_json() {
        let temp_dir = TempDir::new().unwrap();
        let put = Command::Put {
            key: "k".to_string(),
            value: "not json".to_string(),
            ttl: None,
        };
        assert!(run(BackendKind::Memory, &config_in(temp_dir.path()), put).is_err());
    }

    #[test]
    fn test_backends_lists_all() {
        let temp_dir = TempDir::new().unwrap();
        let listed = run(BackendKind::Memory, &config_in(temp_dir.path()), Command::Backends).unwrap();
        assert_eq!(listed.as_array().map(Vec::len), Some(BackendKind::ALL.len()));
    }

    #[test]
    fn test_settings_names_backend() {
        let temp_dir = TempDir::new().unwrap();
        let settings = run(BackendKind::File, &config_in(temp_dir.path()), Command::Settings).unwrap();
        assert_eq!(settings["backend"], "file");
        assert_eq!(settings["fields"][0]["name"], "file.directory");
    }
}
