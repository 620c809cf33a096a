//! Library definitions.
//!
//! Exports the configuration layer and the proxy engine.

pub mod config;
pub mod proxy;

pub use config::{Config, ProxyError, Result};
pub use proxy::headers::translate_headers;
pub use proxy::health::HEALTH_PATH;
pub use proxy::{run_proxy, serve};
