//! TCP accept loop and connection lifecycle.
//!
//! One task per accepted connection; a semaphore bounds how many run at
//! once. Termination signals stop the accept loop, close the listener, and
//! drain in-flight connections for a bounded grace window.

use crate::config::Config;
use crate::proxy::{forward, headers, health, tunnel};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Binds the configured listen address and serves until a termination
/// signal arrives.
///
/// # Errors
///
/// Returns the bind error; the caller treats it as fatal and exits nonzero.
pub async fn run_proxy(config: Arc<Config>) -> io::Result<()> {
    let listener = TcpListener::bind(config.listen_addr()).await?;
    serve(listener, config).await
}

/// Serves connections from an already-bound listener.
///
/// Split from [`run_proxy`] so tests can bind an ephemeral port themselves.
///
/// # Errors
///
/// Only listener-level failures; per-connection errors are logged and
/// contained.
pub async fn serve(listener: TcpListener, config: Arc<Config>) -> io::Result<()> {
    let local_addr = listener.local_addr()?;
    info!(
        listen_addr = %local_addr,
        upstream_addr = %config.upstream_addr(),
        orig_host_header = %config.orig_host_header,
        "proxy listening"
    );

    let connections = Arc::new(Semaphore::new(config.max_connections as usize));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let Ok(permit) = connections.clone().acquire_owned().await else {
                            break;
                        };
                        let config = config.clone();
                        tokio::spawn(async move {
                            let _permit = permit;
                            if let Err(e) = handle_connection(stream, peer_addr, &config).await {
                                debug!(peer_addr = %peer_addr, error = %e, "connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    info!("shutdown signal received, draining connections");
    drop(listener);

    let drained = tokio::time::timeout(
        config.shutdown_grace,
        connections.acquire_many(config.max_connections),
    )
    .await;
    match drained {
        Ok(_) => info!("all connections drained"),
        Err(_) => warn!(
            grace_ms = config.shutdown_grace.as_millis() as u64,
            "shutdown grace expired with connections still open"
        ),
    }
    Ok(())
}

/// Resolves when SIGTERM or SIGINT arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

pub(crate) fn configure_tcp_stream(stream: &TcpStream) {
    let sock = socket2::SockRef::from(&stream);

    let _ = stream.set_nodelay(true);

    let ka = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(10));
    let _ = sock.set_tcp_keepalive(&ka);
}

/// Serves one client connection until it closes, upgrades, or errors.
///
/// Persistent connections loop here: each request dials its own upstream
/// connection, so per-request state never leaks across exchanges.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    config: &Config,
) -> io::Result<()> {
    configure_tcp_stream(&stream);
    let peer_ip = Some(peer_addr.ip());
    let mut carry = Vec::new();

    loop {
        let (head, rest) = match headers::read_request_head(&mut stream, carry).await {
            Ok(Some(parts)) => parts,
            Ok(None) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!(peer_addr = %peer_addr, error = %e, "malformed request head");
                let _ =
                    forward::write_plain_response(&mut stream, 400, "Bad Request", "Bad Request")
                        .await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        debug!(
            peer_addr = %peer_addr,
            method = %head.method,
            path = %head.path,
            "request received"
        );

        if headers::is_upgrade_request(&head.headers) {
            if let Err(e) = tunnel::run_tunnel(stream, &head, rest, peer_ip, config).await {
                warn!(peer_addr = %peer_addr, error = %e, "upgrade tunnel failed");
            }
            return Ok(());
        }

        if head.path == health::HEALTH_PATH {
            health::write_health_response(&mut stream).await?;
            if forward::wants_close(head.version, &head.headers) {
                return Ok(());
            }
            carry = rest;
            continue;
        }

        match forward::forward(&mut stream, &head, rest, peer_ip, config).await {
            forward::Persistence::KeepAlive(rest) => carry = rest,
            forward::Persistence::Close => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

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

    async fn spawn_serve(config: Arc<Config>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = serve(listener, config).await;
        });
        addr
    }

    #[tokio::test]
    async fn test_socket_configuration() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            configure_tcp_stream(&socket);
            assert!(socket.nodelay().unwrap());
        });

        let client = TcpStream::connect(addr).await.unwrap();
        configure_tcp_stream(&client);
        assert!(client.nodelay().unwrap());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_request_gets_400() {
        let addr = spawn_serve(test_config(1)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"garbage garbage\r\n\r\n").await.unwrap();

        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();
        assert!(raw.starts_with("HTTP/1.1 400 "));
    }

    #[tokio::test]
    async fn test_health_served_without_upstream() {
        // app_port 1: nothing listens there, and it must not matter.
        let addr = spawn_serve(test_config(1)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /__quant_proxy_health HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();
        assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(raw.contains(r#""proxy":true"#));
    }

    #[tokio::test]
    async fn test_health_keeps_connection_for_second_request() {
        let addr = spawn_serve(test_config(1)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /__quant_proxy_health HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(buf[..n].starts_with(b"HTTP/1.1 200 OK"));

        // Same connection, second probe.
        stream
            .write_all(b"GET /__quant_proxy_health HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let n = stream.read(&mut buf).await.unwrap();
        assert!(buf[..n].starts_with(b"HTTP/1.1 200 OK"));
    }
}
