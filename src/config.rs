//! Configuration loading.
//!
//! A small JSON config file plus command-line overrides. Everything has a
//! working default so a bare `wharfd` starts against `./state`.

use std::path::PathBuf;
use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::INSPECT_PORT;

/// Broker configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    /// Directory holding the durable store, layer cache, certificate
    /// bundles and the secret key.
    pub state_dir: PathBuf,
    /// Path of the generated front-end proxy config.
    pub haproxy_path: PathBuf,
    /// Loopback port for the JSON inspection endpoint.
    pub inspect_port: u16,
    /// Unix socket the message transport listens on.
    pub bus_socket: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("state"),
            haproxy_path: PathBuf::from("haproxy.cfg"),
            inspect_port: INSPECT_PORT,
            bus_socket: PathBuf::from("wharfd.sock"),
        }
    }
}

impl Config {
    /// Load from a JSON file; a missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let Some(path) = path else { return Ok(Config::default()) };
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file: {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config file: {}", path.display()))
    }

    /// Platform config file used when no `--config` is given, if present.
    pub fn default_path() -> Option<PathBuf> {
        let path = dirs::config_dir()?.join("wharfd").join("config.json");
        path.is_file().then_some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_no_file() {
        let cfg = Config::load(None).unwrap();
        assert_eq!(cfg.state_dir, PathBuf::from("state"));
        assert_eq!(cfg.inspect_port, INSPECT_PORT);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wharfd.json");
        fs::write(&path, r#"{"inspect_port": 2048}"#).unwrap();
        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.inspect_port, 2048);
        assert_eq!(cfg.haproxy_path, PathBuf::from("haproxy.cfg"));
    }
}
