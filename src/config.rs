//! Server and client settings
//!
//! The daemon reads an optional TOML file first and lets command-line flags
//! override individual fields. Missing keys fall back to the defaults below.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::protocol::timeouts::Timeouts;

pub const DEFAULT_BIND: &str = "127.0.0.1:2121";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (host:port)
    pub bind: String,
    /// Confinement root served to clients
    pub root: PathBuf,
    /// Run each connection in its own task instead of one at a time
    pub concurrent_sessions: bool,
    pub timeouts: Timeouts,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            root: PathBuf::from("."),
            concurrent_sessions: false,
            timeouts: Timeouts::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml(data: &str) -> Result<Self> {
        toml::from_str(data).context("Failed to parse server config")
    }

    /// Load from `path`, or return the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let data = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config file: {}", p.display()))?;
                Self::from_toml(&data)
            }
            None => Ok(Self::default()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address (host:port)
    pub server: String,
    /// Where downloaded files are written
    pub download_dir: PathBuf,
    pub timeouts: Timeouts,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_BIND.to_string(),
            download_dir: PathBuf::from("."),
            timeouts: Timeouts::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg = ServerConfig::from_toml(
            r#"
            root = "/srv/ftp"
            [timeouts]
            io_ms = 1500
            "#,
        )
        .unwrap();
        assert_eq!(cfg.root, PathBuf::from("/srv/ftp"));
        assert_eq!(cfg.bind, DEFAULT_BIND);
        assert!(!cfg.concurrent_sessions);
        assert_eq!(cfg.timeouts.io_ms, 1500);
        assert_eq!(cfg.timeouts.idle_ms, Timeouts::default().idle_ms);
    }

    #[test]
    fn test_bad_toml_rejected() {
        assert!(ServerConfig::from_toml("concurrent_sessions = \"maybe\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let tmp = TempDir::new().unwrap();
        let p = tmp.path().join("rftpd.toml");
        std::fs::write(&p, "bind = \"0.0.0.0:9000\"\nconcurrent_sessions = true\n").unwrap();
        let cfg = ServerConfig::load(Some(&p)).unwrap();
        assert_eq!(cfg.bind, "0.0.0.0:9000");
        assert!(cfg.concurrent_sessions);

        assert_eq!(ServerConfig::load(None).unwrap(), ServerConfig::default());
        assert!(ServerConfig::load(Some(&tmp.path().join("missing.toml"))).is_err());
    }
}
