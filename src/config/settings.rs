//! Configuration settings.
//!
//! Defines the main `Config` struct and environment variable loading logic.

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_env_u16_or(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn get_env_u32_or(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn get_env_u64_or(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// True unless the variable is explicitly set to `false` or `0`.
fn get_env_enabled(key: &str) -> bool {
    env::var(key)
        .map(|v| {
            let v = v.to_lowercase();
            v != "false" && v != "0"
        })
        .unwrap_or(true)
}

/// Application configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the proxy listens on, all interfaces.
    pub proxy_port: u16,
    /// Port the upstream application listens on, loopback only.
    pub app_port: u16,
    /// Master switch; when false the process exits without binding.
    pub enabled: bool,
    /// Window for the upstream to produce response headers.
    pub request_timeout: Duration,
    /// Name of the edge-injected header carrying the real host, lowercase.
    pub orig_host_header: String,
    /// Bound on concurrently handled client connections.
    pub max_connections: u32,
    /// Drain window between closing the listener and process exit.
    pub shutdown_grace: Duration,
    /// Logging format: "json" or "pretty".
    pub log_format: String,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Missing or unparsable values fall back to their defaults; the app
    /// port falls back from `QUANT_APP_PORT` to `PORT` to 3001, matching
    /// the contract the base images are built against.
    #[must_use]
    pub fn from_env() -> Arc<Self> {
        let proxy_port = get_env_u16_or("QUANT_PROXY_PORT", 3000);
        let app_port = env::var("QUANT_APP_PORT")
            .or_else(|_| env::var("PORT"))
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3001);
        let enabled = get_env_enabled("QUANT_PROXY_ENABLED");
        let request_timeout =
            Duration::from_millis(get_env_u64_or("QUANT_PROXY_TIMEOUT", 30_000));
        let orig_host_header =
            get_env_or("QUANT_ORIG_HOST_HEADER", "quant-orig-host").to_lowercase();
        let max_connections = get_env_u32_or("QUANT_PROXY_MAX_CONNECTIONS", 1024).max(1);
        let shutdown_grace =
            Duration::from_millis(get_env_u64_or("QUANT_PROXY_SHUTDOWN_GRACE_MS", 5_000));
        let log_format = get_env_or("LOG_FORMAT", "json");

        Arc::new(Self {
            proxy_port,
            app_port,
            enabled,
            request_timeout,
            orig_host_header,
            max_connections,
            shutdown_grace,
            log_format,
        })
    }

    /// Address the proxy binds to.
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.proxy_port)
    }

    /// Address of the single upstream target.
    #[must_use]
    pub fn upstream_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.app_port)
    }
}
