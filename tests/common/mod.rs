//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use axum::response::IntoResponse;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use route_cache::config::parse_config;
use route_cache::http::handler::handler_fn;
use route_cache::{HandlerCatalog, HttpServer, Pipeline, Shutdown};

/// Start a mock upstream on an ephemeral port.
///
/// Every response body is `"<response> <request line target>"`, so tests can
/// see which path the upstream was asked for.
pub async fn start_mock_backend(response: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 4096];
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        let head = String::from_utf8_lossy(&buf[..n]);
                        let target = head
                            .lines()
                            .next()
                            .and_then(|line| line.split_whitespace().nth(1))
                            .unwrap_or("")
                            .to_string();
                        let body = format!("{} {}", response, target);
                        let response_str = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response_str.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// Built-in catalog plus a `counter` handler answering `"call <n>"`.
pub fn catalog_with_counter() -> (HandlerCatalog, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut catalog = HandlerCatalog::with_builtins();
    let counter = calls.clone();
    catalog.register_handler("counter", move || {
        let counter = counter.clone();
        handler_fn(move |_req| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(format!("call {}", n).into_response()) }
        })
    });
    (catalog, calls)
}

/// Server for `toml`, not yet bound to a listener.
pub fn build_server(toml: &str, catalog: &HandlerCatalog) -> HttpServer {
    let config = parse_config(toml, catalog).unwrap();
    let pipeline = Pipeline::from_config(&config, catalog).unwrap();
    HttpServer::new(&config, Arc::new(pipeline))
}

/// Serve `server` on an ephemeral port until the returned handle is triggered.
pub async fn spawn_server(server: HttpServer) -> (SocketAddr, Shutdown, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    let task = tokio::spawn(async move {
        server.run(listener, signal).await.unwrap();
    });
    (addr, shutdown, task)
}

pub fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

pub async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
