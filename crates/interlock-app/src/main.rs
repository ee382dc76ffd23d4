//! Interlock - intercepting HTTP/HTTPS proxy.
//!
//! Runs the proxy in the foreground until interrupted. The root CA is created
//! on first run; install it as a trusted root to let clients accept the
//! intercepted sessions.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use directories::ProjectDirs;
use interlock_proxy::{env_key_log, CaManager, FileKeyLog, LogAddon, ProxyConfig, ProxyServer};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{FileConfig, Overrides, Settings};

/// Interlock - intercepting HTTP/HTTPS proxy
#[derive(Parser, Debug)]
#[command(name = "interlock", version, about)]
struct Args {
    /// JSON config file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Listen address (host:port)
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Listen port, keeping the configured host
    #[arg(long, short)]
    port: Option<u16>,

    /// Accept upstream certificates without verification
    #[arg(long)]
    ssl_insecure: bool,

    /// Directory holding the root CA
    #[arg(long)]
    ca_dir: Option<PathBuf>,

    /// Append upstream TLS secrets to this file (NSS key log format)
    #[arg(long)]
    key_log: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Also write logs to the data directory
    #[arg(long)]
    log_file: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            addr: self.addr,
            port: self.port,
            ssl_insecure: self.ssl_insecure,
            ca_dir: self.ca_dir.clone(),
            key_log_path: self.key_log.clone(),
            log_level: self.log_level.clone(),
            debug: self.debug,
        }
    }
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "interlock", "Interlock").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging, with daily-rotated files when requested.
fn init_logging(log_level: &str, log_file: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("interlock={},warn", log_level)));

    if log_file {
        if let Some(log_dir) = logs_dir() {
            if std::fs::create_dir_all(&log_dir).is_ok() {
                let file_appender = RollingFileAppender::builder()
                    .rotation(Rotation::DAILY)
                    .max_log_files(5)
                    .filename_prefix("interlock")
                    .filename_suffix("log")
                    .build(&log_dir)
                    .ok();

                if let Some(appender) = file_appender {
                    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(fmt::layer().with_writer(std::io::stdout))
                        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                        .init();

                    tracing::info!("Logging to {:?}", log_dir);
                    return Some(guard);
                }
            }
        }
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        tracing::warn!("File logging unavailable, using console only");
        return None;
    }

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    None
}

fn build_config(settings: &Settings) -> anyhow::Result<ProxyConfig> {
    let config = match &settings.ca_dir {
        Some(dir) => ProxyConfig::with_ca_dir(CaManager::new(dir.clone())),
        None => ProxyConfig::new()?,
    };
    let config = config
        .with_addr(settings.addr)
        .with_ssl_insecure(settings.ssl_insecure)
        .with_addon(Arc::new(LogAddon));

    match &settings.key_log_path {
        Some(path) => {
            let key_log = FileKeyLog::open(path)
                .with_context(|| format!("Failed to open key log {}", path.display()))?;
            Ok(config.with_key_log(Arc::new(key_log)))
        }
        None => Ok(match env_key_log() {
            Some(key_log) => config.with_key_log(key_log),
            None => config,
        }),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let settings = Settings::resolve(file, args.overrides());
    let _guard = init_logging(&settings.log_level, args.log_file);

    if settings.ssl_insecure {
        tracing::warn!("Upstream certificate verification is disabled");
    }

    let server = ProxyServer::new(build_config(&settings)?)?;
    tracing::info!(
        "Install {:?} as a trusted root to intercept TLS",
        server.ca_cert_path()
    );

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn args_parse_flags() {
        let args = Args::parse_from([
            "interlock",
            "--port",
            "9000",
            "--ssl-insecure",
            "--ca-dir",
            "/tmp/ca",
        ]);
        let overrides = args.overrides();
        assert_eq!(overrides.port, Some(9000));
        assert!(overrides.ssl_insecure);
        assert_eq!(overrides.ca_dir, Some(PathBuf::from("/tmp/ca")));
        assert_eq!(overrides.log_level, None);
    }

    #[test]
    fn build_config_uses_settings() {
        let temp_dir = TempDir::new().unwrap();
        let settings = Settings {
            addr: "127.0.0.1:9001".parse().unwrap(),
            ssl_insecure: true,
            ca_dir: Some(temp_dir.path().join("ca")),
            key_log_path: Some(temp_dir.path().join("keys.log")),
            log_level: "info".to_string(),
        };

        let config = build_config(&settings).unwrap();
        assert_eq!(config.addr, settings.addr);
        assert!(config.ssl_insecure);
        assert_eq!(config.addons.len(), 1);
        assert!(config.key_log.is_some());
        assert_eq!(config.ca_manager.ca_dir(), temp_dir.path().join("ca").as_path());
    }
}
