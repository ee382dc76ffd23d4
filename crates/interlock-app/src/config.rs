//! File configuration and command-line overlay.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use interlock_proxy::DEFAULT_PROXY_PORT;
use serde::{Deserialize, Serialize};

/// Settings read from a JSON config file. Missing fields take defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Listen address.
    pub addr: Option<SocketAddr>,
    /// Accept upstream certificates without verification.
    pub ssl_insecure: bool,
    /// Directory holding the root CA.
    pub ca_dir: Option<PathBuf>,
    /// Where to append upstream TLS secrets (NSS key log format).
    pub key_log_path: Option<PathBuf>,
    /// Log level (error, warn, info, debug, trace).
    pub log_level: Option<String>,
}

impl FileConfig {
    /// Loads a config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub addr: Option<SocketAddr>,
    pub port: Option<u16>,
    pub ssl_insecure: bool,
    pub ca_dir: Option<PathBuf>,
    pub key_log_path: Option<PathBuf>,
    pub log_level: Option<String>,
    pub debug: bool,
}

/// Effective settings after overlaying the command line on the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub addr: SocketAddr,
    pub ssl_insecure: bool,
    pub ca_dir: Option<PathBuf>,
    pub key_log_path: Option<PathBuf>,
    pub log_level: String,
}

impl Settings {
    pub fn resolve(file: FileConfig, cli: Overrides) -> Self {
        let mut addr = cli
            .addr
            .or(file.addr)
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)));
        if let Some(port) = cli.port {
            addr.set_port(port);
        }

        let log_level = if cli.debug {
            "debug".to_string()
        } else {
            cli.log_level
                .or(file.log_level)
                .unwrap_or_else(|| "info".to_string())
        };

        Self {
            addr,
            ssl_insecure: cli.ssl_insecure || file.ssl_insecure,
            ca_dir: cli.ca_dir.or(file.ca_dir),
            key_log_path: cli.key_log_path.or(file.key_log_path),
            log_level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_without_file_or_flags() {
        let settings = Settings::resolve(FileConfig::default(), Overrides::default());
        assert_eq!(settings.addr, SocketAddr::from(([127, 0, 0, 1], 8766)));
        assert!(!settings.ssl_insecure);
        assert_eq!(settings.ca_dir, None);
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn partial_file_is_accepted() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("interlock.json");
        std::fs::write(&path, r#"{ "addr": "0.0.0.0:9000", "ssl_insecure": true }"#).unwrap();

        let file = FileConfig::load(&path).unwrap();
        assert_eq!(file.addr, Some("0.0.0.0:9000".parse().unwrap()));
        assert!(file.ssl_insecure);
        assert_eq!(file.ca_dir, None);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.json");
        std::fs::write(&path, "{ addr: ").unwrap();

        let err = FileConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid config file"));
        assert!(FileConfig::load(&temp_dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn flags_win_over_file() {
        let file = FileConfig {
            addr: Some("0.0.0.0:9000".parse().unwrap()),
            ca_dir: Some(PathBuf::from("/etc/interlock/ca")),
            log_level: Some("warn".to_string()),
            ..FileConfig::default()
        };
        let cli = Overrides {
            port: Some(9100),
            ca_dir: Some(PathBuf::from("/tmp/ca")),
            log_level: Some("trace".to_string()),
            ..Overrides::default()
        };

        let settings = Settings::resolve(file, cli);
        assert_eq!(settings.addr, SocketAddr::from(([0, 0, 0, 0], 9100)));
        assert_eq!(settings.ca_dir, Some(PathBuf::from("/tmp/ca")));
        assert_eq!(settings.log_level, "trace");
    }

    #[test]
    fn debug_flag_forces_debug_level() {
        let file = FileConfig {
            log_level: Some("warn".to_string()),
            ..FileConfig::default()
        };
        let cli = Overrides {
            debug: true,
            ..Overrides::default()
        };
        assert_eq!(Settings::resolve(file, cli).log_level, "debug");
    }

    #[test]
    fn insecure_from_either_source() {
        let file = FileConfig {
            ssl_insecure: true,
            ..FileConfig::default()
        };
        assert!(Settings::resolve(file, Overrides::default()).ssl_insecure);

        let cli = Overrides {
            ssl_insecure: true,
            ..Overrides::default()
        };
        assert!(Settings::resolve(FileConfig::default(), cli).ssl_insecure);
    }
}
