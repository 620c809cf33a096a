//! Upgrade tunneling.
//!
//! Once the handshake head is translated and replayed to the upstream, the
//! proxy stops interpreting the stream entirely and shuttles raw bytes in
//! both directions. No frame parsing happens here, so any upgrade-based
//! protocol works, not only WebSocket.

use crate::config::Config;
use crate::proxy::headers::{self, RequestHead};
use std::io;
use std::net::IpAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// Establishes the tunnel and runs it until either side closes.
///
/// `handshake_rest` holds bytes already read past the upgrade head; they are
/// replayed to the upstream before piping starts. Takes ownership of the
/// client socket: after an upgrade the connection can never return to
/// request/response handling.
///
/// # Errors
///
/// Dial or handshake-replay failures; the caller destroys the client socket
/// without an HTTP-level response, the handshake being already mid-flight.
pub async fn run_tunnel(
    mut client: TcpStream,
    head: &RequestHead,
    handshake_rest: Vec<u8>,
    peer_ip: Option<IpAddr>,
    config: &Config,
) -> io::Result<()> {
    let mut upstream = TcpStream::connect(config.upstream_addr()).await?;
    super::listener::configure_tcp_stream(&upstream);

    let translated = headers::translate_headers(&head.headers, peer_ip, config);
    let head_bytes =
        headers::serialize_request_head(&head.method, &head.path, head.version, &translated);

    upstream.write_all(head_bytes.as_bytes()).await?;
    if !handshake_rest.is_empty() {
        upstream.write_all(&handshake_rest).await?;
    }
    upstream.flush().await?;

    let result = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    let _ = client.shutdown().await;
    let _ = upstream.shutdown().await;

    match result {
        Ok((client_to_upstream, upstream_to_client)) => {
            debug!(client_to_upstream, upstream_to_client, "tunnel closed");
        }
        Err(e) => debug!(error = %e, "tunnel closed with error"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn test_config(app_port: u16) -> Arc<Config> {
        Arc::new(Config {
            proxy_port: 0,
            app_port,
            enabled: true,
            request_timeout: Duration::from_secs(2),
            orig_host_header: "quant-orig-host".to_string(),
            max_connections: 16,
            shutdown_grace: Duration::from_millis(100),
            log_format: "pretty".to_string(),
        })
    }

    fn upgrade_head() -> RequestHead {
        RequestHead {
            method: "GET".to_string(),
            path: "/socket".to_string(),
            version: 1,
            headers: vec![
                ("Host".to_string(), "localhost".to_string()),
                ("Connection".to_string(), "Upgrade".to_string()),
                ("Upgrade".to_string(), "websocket".to_string()),
                ("quant-orig-host".to_string(), "app.example.com".to_string()),
            ],
        }
    }

    #[tokio::test]
    async fn test_tunnel_round_trip_echo() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let app_port = upstream.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let n = socket.read(&mut buf).await.unwrap();
            let handshake = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(handshake.contains("Host: app.example.com"));
            assert!(handshake.contains("Upgrade: websocket"));

            socket
                .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
                .await
                .unwrap();

            // Echo everything after the handshake.
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if socket.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client_task = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut buf = [0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"HTTP/1.1 101"));

            let payload: &[u8] = &[0x82, 0x04, 0xde, 0xad, 0xbe, 0xef];
            stream.write_all(payload).await.unwrap();
            let mut echoed = vec![0u8; payload.len()];
            stream.read_exact(&mut echoed).await.unwrap();
            assert_eq!(echoed, payload);
        });

        let (proxy_side, _) = listener.accept().await.unwrap();
        let config = test_config(app_port);
        let tunnel_task =
            tokio::spawn(
                async move { run_tunnel(proxy_side, &upgrade_head(), Vec::new(), None, &config).await },
            );

        tokio::time::timeout(Duration::from_secs(2), client_task)
            .await
            .unwrap()
            .unwrap();
        // Client side dropped; the tunnel must wind down on its own.
        tokio::time::timeout(Duration::from_secs(2), tunnel_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_tunnel_dial_failure_surfaces() {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = probe.local_addr().unwrap().port();
        drop(probe);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _stream = TcpStream::connect(addr).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        let (proxy_side, _) = listener.accept().await.unwrap();

        let config = test_config(dead_port);
        let err = run_tunnel(proxy_side, &upgrade_head(), Vec::new(), None, &config)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
