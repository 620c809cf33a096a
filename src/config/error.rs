//! Error types and result aliases.
//!
//! Defines the core `ProxyError` enumeration and common `Result` type.

use thiserror::Error;

/// Failures while serving a single request or tunnel.
///
/// Every variant is local to one exchange; none of them is fatal to the
/// process. The only process-fatal condition is a failed bind of the
/// listening socket, which surfaces as a plain `std::io::Error` from the
/// listener and a nonzero exit.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The upstream refused the connection; the app is not listening yet.
    #[error("upstream refused connection")]
    UpstreamUnavailable,

    /// No response head arrived within the configured window.
    #[error("upstream timed out")]
    UpstreamTimeout,

    /// Any other transport failure before the response head was written.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The client went away before the upstream replied.
    #[error("client closed before upstream replied")]
    ClientAborted,
}

/// Result type alias for `ProxyError`.
pub type Result<T> = std::result::Result<T, ProxyError>;
