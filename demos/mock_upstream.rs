//! Stand-in upstream app for exercising the proxy by hand.
//!
//! Listens on QUANT_APP_PORT (default 3001) and reports the headers it
//! receives, which makes the proxy's Host rewrite directly observable:
//!
//! ```text
//! QUANT_APP_PORT=3001 cargo run --example mock_upstream
//! cargo run
//! curl -H 'Quant-Orig-Host: app.example.com' http://127.0.0.1:3000/_headers
//! ```

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write as _;
use std::net::SocketAddr;
use tokio::net::TcpListener;

async fn handle(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/health" => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(r#"{"status":"ok"}"#)))
            .unwrap(),
        "/_headers" => {
            let mut body = String::new();
            for (name, value) in req.headers() {
                let _ = writeln!(body, "{name}: {}", value.to_str().unwrap_or("<binary>"));
            }
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain")
                .body(Full::new(Bytes::from(body)))
                .unwrap()
        }
        _ => {
            let host = req
                .headers()
                .get("host")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("not set");
            let proto = req
                .headers()
                .get("x-forwarded-proto")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("not set");
            let body = format!("mock upstream\nHost: {host}\nX-Forwarded-Proto: {proto}\n");
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain")
                .body(Full::new(Bytes::from(body)))
                .unwrap()
        }
    };
    Ok(response)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let port: u16 = std::env::var("QUANT_APP_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(3001);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    let listener = TcpListener::bind(addr).await?;
    println!("mock upstream listening on http://{addr}");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::task::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .serve_connection(io, service_fn(handle))
                .await
            {
                eprintln!("error serving connection: {err:?}");
            }
        });
    }
}
