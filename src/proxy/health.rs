//! Liveness endpoint served by the proxy itself.
//!
//! Answered before any translation or forwarding happens, so orchestrators
//! can probe the proxy even while the upstream application is still booting.

use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Path reserved for the proxy's own liveness probe. Distinct from any
/// health endpoint the upstream application exposes; never forwarded.
pub const HEALTH_PATH: &str = "/__quant_proxy_health";

const HEALTH_BODY: &str = r#"{"status":"ok","proxy":true}"#;

/// Writes the fixed liveness response.
///
/// # Errors
///
/// Propagates write failures on the client socket.
pub async fn write_health_response<W>(writer: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        HEALTH_BODY.len()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(HEALTH_BODY.as_bytes()).await?;
    writer.flush().await
}
