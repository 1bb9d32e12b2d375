//! HTTP-level tests for the reverse proxy.
//!
//! Spins real backends on loopback and drives requests through the proxy
//! handler: distribution, forwarded headers, 503 behavior, and health
//! gating.

use axum::extract::Request;
use axum::routing::get;
use axum::Router;
use budgie::proxy::{BalancerKind, ContainerProxy};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Starts a backend that answers every path with `name` and echoes the
/// X-Forwarded-* headers it saw.
async fn start_backend(name: &'static str) -> u16 {
    let app = Router::new()
        .route("/_health", get(|| async { "ok" }))
        .fallback(move |req: Request| async move {
            let fwd_for = req
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let fwd_host = req
                .headers()
                .get("x-forwarded-host")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            format!("{name}|{fwd_for}|{fwd_host}")
        });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

/// Serves the proxy handler for one workload on loopback.
async fn start_proxy(proxy: &Arc<ContainerProxy>, container_id: &str) -> u16 {
    let app = proxy.handler(container_id);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    port
}

#[tokio::test]
async fn test_round_robin_distributes_evenly() {
    let a = start_backend("a").await;
    let b = start_backend("b").await;

    let proxy = ContainerProxy::new(BalancerKind::RoundRobin);
    proxy.add_backend("c1", "127.0.0.1", a).await.unwrap();
    proxy.add_backend("c1", "127.0.0.1", b).await.unwrap();

    let port = start_proxy(&proxy, "c1").await;
    let client = reqwest::Client::new();

    let mut hits_a = 0;
    let mut hits_b = 0;
    for _ in 0..6 {
        let body = client
            .get(format!("http://127.0.0.1:{port}/page"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        match body.split('|').next() {
            Some("a") => hits_a += 1,
            Some("b") => hits_b += 1,
            other => panic!("unexpected backend: {other:?}"),
        }
    }
    assert_eq!(hits_a, 3);
    assert_eq!(hits_b, 3);
}

#[tokio::test]
async fn test_forwarded_headers_set() {
    let a = start_backend("a").await;

    let proxy = ContainerProxy::new(BalancerKind::RoundRobin);
    proxy.add_backend("c1", "127.0.0.1", a).await.unwrap();
    let port = start_proxy(&proxy, "c1").await;

    let body = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{port}/whoami"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let parts: Vec<&str> = body.split('|').collect();
    assert_eq!(parts[0], "a");
    assert!(parts[1].starts_with("127.0.0.1:"), "X-Forwarded-For carries the remote address");
    assert!(parts[2].starts_with("127.0.0.1:"), "X-Forwarded-Host carries the original host");
}

#[tokio::test]
async fn test_no_active_backend_returns_503() {
    let proxy = ContainerProxy::new(BalancerKind::RoundRobin);
    proxy.add_backend("c1", "127.0.0.1", 1).await.unwrap();
    proxy.backends("c1").await[0].set_active(false);

    let port = start_proxy(&proxy, "c1").await;
    let status = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{port}/"))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status.as_u16(), 503);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_health_gating_excludes_dead_backend() {
    let alive = start_backend("alive").await;

    let proxy = ContainerProxy::new(BalancerKind::RoundRobin);
    proxy.add_backend("c1", "127.0.0.1", alive).await.unwrap();
    // A port with nothing listening: probes fail with a network error.
    proxy.add_backend("c1", "127.0.0.1", 1).await.unwrap();

    let _health_task = proxy.start_health_check(Duration::from_millis(200));
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Every dispatch lands on the live backend.
    for _ in 0..4 {
        let selected = proxy.select("c1").await.unwrap();
        assert_eq!(selected.url, format!("http://127.0.0.1:{alive}"));
    }
    proxy.shutdown();
}
