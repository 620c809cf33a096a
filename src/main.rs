//! Quant Cloud reverse proxy.
//!
//! Transparent proxy that handles header translation for apps running
//! behind Quant's edge network. Rewrites the edge-supplied origin host
//! header to `Host` so apps see the correct hostname without
//! framework-specific configuration, forwards everything else untouched,
//! and tunnels protocol upgrades byte-for-byte.
//!
//! Environment variables:
//!   QUANT_PROXY_PORT       - Port the proxy listens on (default: 3000)
//!   QUANT_APP_PORT         - Port the app listens on (falls back to PORT, then 3001)
//!   QUANT_PROXY_ENABLED    - Set to 'false' to disable (default: true)
//!   QUANT_PROXY_TIMEOUT    - Request timeout in ms (default: 30000)
//!   QUANT_ORIG_HOST_HEADER - Header containing the real host (default: quant-orig-host)

use quant_proxy::{Config, run_proxy};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    dotenvy::dotenv().ok();

    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stdout());
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(non_blocking);

    if log_format.eq_ignore_ascii_case("pretty") {
        subscriber.init();
    } else {
        subscriber.json().init();
    }

    let config = Config::from_env();

    if !config.enabled {
        info!("proxying disabled via QUANT_PROXY_ENABLED, exiting");
        return;
    }

    info!(
        proxy_port = config.proxy_port,
        app_port = config.app_port,
        orig_host_header = %config.orig_host_header,
        timeout_ms = config.request_timeout.as_millis() as u64,
        log_format = %config.log_format,
        "proxy starting"
    );

    let rt = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
    if let Err(e) = rt.block_on(run_proxy(config)) {
        error!(error = %e, "failed to bind listener");
        std::process::exit(1);
    }
}
