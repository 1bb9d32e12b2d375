//! Per-workload reverse proxy.
//!
//! Maintains a backend pool per container id. Requests are dispatched to
//! an active backend by round-robin or least-connections selection and
//! forwarded with `X-Forwarded-For` / `X-Forwarded-Host` set; 503 is
//! returned when no backend is active. A periodic health task probes
//! `GET <backend>/_health` with a 2 s deadline and gates failing backends
//! out of selection.

use crate::constants::{PROXY_HEALTH_PATH, PROXY_PROBE_TIMEOUT};
use crate::container::short_id;
use crate::error::{Error, Result};
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderValue, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

// =============================================================================
// Backends
// =============================================================================

/// Load-balancing algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancerKind {
    RoundRobin,
    LeastConnections,
}

/// One registered `host:port` endpoint.
pub struct Backend {
    /// Base URL, e.g. `http://192.168.1.10:8080`.
    pub url: String,
    active: AtomicBool,
    live_connections: AtomicI64,
}

impl Backend {
    fn new(url: String) -> Self {
        Self {
            url,
            active: AtomicBool::new(true),
            live_connections: AtomicI64::new(0),
        }
    }

    /// Whether the backend is currently eligible for selection.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Current live-connection count.
    pub fn live_connections(&self) -> i64 {
        self.live_connections.load(Ordering::Relaxed)
    }

    /// Sets the active flag (used by the health checker and tests).
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }
}

/// Decrements the live-connection counter on every exit path.
struct ConnectionGuard {
    backend: Arc<Backend>,
}

impl ConnectionGuard {
    fn new(backend: Arc<Backend>) -> Self {
        backend.live_connections.fetch_add(1, Ordering::Relaxed);
        Self { backend }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.backend.live_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

struct BackendPool {
    backends: RwLock<Vec<Arc<Backend>>>,
    counter: AtomicU64,
}

impl BackendPool {
    fn new() -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
            counter: AtomicU64::new(0),
        }
    }
}

// =============================================================================
// Proxy
// =============================================================================

/// Reverse proxy with a backend pool per workload.
pub struct ContainerProxy {
    pools: RwLock<HashMap<String, Arc<BackendPool>>>,
    kind: BalancerKind,
    client: reqwest::Client,
    stop_tx: watch::Sender<bool>,
    /// Back-reference handed to HTTP handlers and the health task.
    self_ref: Weak<ContainerProxy>,
}

impl ContainerProxy {
    /// Creates a proxy with the given selection algorithm.
    pub fn new(kind: BalancerKind) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new_cyclic(|self_ref| Self {
            pools: RwLock::new(HashMap::new()),
            kind,
            client: reqwest::Client::new(),
            stop_tx,
            self_ref: self_ref.clone(),
        })
    }

    /// Registers a backend for a workload.
    pub async fn add_backend(&self, container_id: &str, ip: &str, port: u16) -> Result<()> {
        let mut pools = self.pools.write().await;
        let pool = pools
            .entry(container_id.to_string())
            .or_insert_with(|| Arc::new(BackendPool::new()));

        let url = format!("http://{ip}:{port}");
        pool.backends.write().await.push(Arc::new(Backend::new(url)));
        info!(
            "added backend {ip}:{port} for container {}",
            short_id(container_id)
        );
        Ok(())
    }

    /// Removes a backend from a workload's pool.
    pub async fn remove_backend(&self, container_id: &str, ip: &str, port: u16) -> Result<()> {
        let pools = self.pools.read().await;
        let pool = pools
            .get(container_id)
            .ok_or_else(|| Error::ContainerNotFound(container_id.to_string()))?;

        let url = format!("http://{ip}:{port}");
        let mut backends = pool.backends.write().await;
        let before = backends.len();
        backends.retain(|b| b.url != url);
        if backends.len() == before {
            return Err(Error::BackendNotFound);
        }
        info!(
            "removed backend {ip}:{port} for container {}",
            short_id(container_id)
        );
        Ok(())
    }

    /// Snapshot of a workload's backends (used by inspect and tests).
    pub async fn backends(&self, container_id: &str) -> Vec<Arc<Backend>> {
        let pools = self.pools.read().await;
        match pools.get(container_id) {
            Some(pool) => pool.backends.read().await.clone(),
            None => Vec::new(),
        }
    }

    /// Selects a backend from a workload's pool per the configured
    /// algorithm; `None` when no backend is active.
    pub async fn select(&self, container_id: &str) -> Option<Arc<Backend>> {
        let pool = {
            let pools = self.pools.read().await;
            pools.get(container_id)?.clone()
        };

        let backends = pool.backends.read().await;
        let active: Vec<&Arc<Backend>> = backends.iter().filter(|b| b.is_active()).collect();
        if active.is_empty() {
            return None;
        }

        match self.kind {
            BalancerKind::RoundRobin => {
                let n = pool.counter.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(active[(n % active.len() as u64) as usize]))
            }
            BalancerKind::LeastConnections => {
                // Linear scan; ties break to the first in registration order.
                let mut selected = active[0];
                let mut min = selected.live_connections();
                for backend in &active[1..] {
                    let live = backend.live_connections();
                    if live < min {
                        min = live;
                        selected = backend;
                    }
                }
                Some(Arc::clone(selected))
            }
        }
    }

    /// Returns an HTTP handler that proxies every request to the
    /// workload's pool.
    ///
    /// Callers hold the proxy in an `Arc` (see [`ContainerProxy::new`]);
    /// the handler keeps its own reference.
    pub fn handler(&self, container_id: &str) -> Router {
        // The weak reference only fails to upgrade mid-drop, when no
        // caller can be borrowing self.
        let Some(proxy) = self.self_ref.upgrade() else {
            return Router::new();
        };
        let state = ProxyHandlerState {
            proxy,
            container_id: container_id.to_string(),
        };
        Router::new()
            .fallback(proxy_request)
            .with_state(state)
    }

    /// Spawns the periodic backend health task.
    pub fn start_health_check(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let Some(proxy) = self.self_ref.upgrade() else {
            return tokio::spawn(async {});
        };
        let mut stop_rx = self.stop_tx.subscribe();

        info!("proxy health checker started ({interval:?} interval)");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        proxy.probe_all().await;
                    }
                    _ = stop_rx.changed() => {
                        info!("proxy health checker stopped");
                        return;
                    }
                }
            }
        })
    }

    /// Stops the health task.
    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
    }

    async fn probe_all(&self) {
        let pools: Vec<(String, Arc<BackendPool>)> = {
            let pools = self.pools.read().await;
            pools.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        for (container_id, pool) in pools {
            let backends = pool.backends.read().await.clone();
            for backend in backends {
                let client = self.client.clone();
                let container_id = container_id.clone();
                tokio::spawn(async move {
                    probe_backend(&client, &container_id, &backend).await;
                });
            }
        }
    }
}

/// Probes one backend, flipping its active flag on transitions only.
async fn probe_backend(client: &reqwest::Client, container_id: &str, backend: &Backend) {
    let url = format!("{}{PROXY_HEALTH_PATH}", backend.url);
    let healthy = match client
        .get(&url)
        .timeout(PROXY_PROBE_TIMEOUT)
        .send()
        .await
    {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    };

    let was_active = backend.is_active();
    if healthy && !was_active {
        info!(
            "backend {} for container {} is back online",
            backend.url,
            short_id(container_id)
        );
    } else if !healthy && was_active {
        warn!(
            "backend {} for container {} is unhealthy",
            backend.url,
            short_id(container_id)
        );
    }
    backend.set_active(healthy);
}

// =============================================================================
// Request Forwarding
// =============================================================================

#[derive(Clone)]
struct ProxyHandlerState {
    proxy: Arc<ContainerProxy>,
    container_id: String,
}

async fn proxy_request(
    State(state): State<ProxyHandlerState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response<Body> {
    let Some(backend) = state.proxy.select(&state.container_id).await else {
        return Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body(Body::from("No backends available"))
            .unwrap_or_default();
    };

    // Live-connection accounting covers the whole dispatch; the guard
    // decrements on every exit path, including errors.
    let _guard = ConnectionGuard::new(Arc::clone(&backend));

    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let upstream_url = format!("{}{path_and_query}", backend.url);

    let original_host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();

    let method = match reqwest::Method::from_bytes(request.method().as_str().as_bytes()) {
        Ok(m) => m,
        Err(_) => {
            return Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(Body::empty())
                .unwrap_or_default()
        }
    };

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in request.headers() {
        if name == axum::http::header::HOST {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.insert(n, v);
        }
    }
    if let Ok(v) = reqwest::header::HeaderValue::from_str(&remote.to_string()) {
        headers.insert("x-forwarded-for", v);
    }
    if let Ok(v) = reqwest::header::HeaderValue::from_str(&original_host) {
        headers.insert("x-forwarded-host", v);
    }

    let body = match axum::body::to_bytes(request.into_body(), usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(Body::empty())
                .unwrap_or_default()
        }
    };

    let upstream = state
        .proxy
        .client
        .request(method, &upstream_url)
        .headers(headers)
        .body(body.to_vec())
        .send()
        .await;

    let upstream = match upstream {
        Ok(resp) => resp,
        Err(e) => {
            debug!("upstream request to {upstream_url} failed: {e}");
            return Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .body(Body::from("Upstream request failed"))
                .unwrap_or_default();
        }
    };

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::builder().status(status);
    if let Some(headers_mut) = response.headers_mut() {
        for (name, value) in upstream.headers() {
            if let (Ok(n), Ok(v)) = (
                axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers_mut.insert(n, v);
            }
        }
    }

    let body = upstream.bytes().await.unwrap_or_default();
    response.body(Body::from(body)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_robin_cycles_active_backends() {
        let proxy = ContainerProxy::new(BalancerKind::RoundRobin);
        proxy.add_backend("c1", "10.0.0.1", 80).await.unwrap();
        proxy.add_backend("c1", "10.0.0.2", 80).await.unwrap();
        proxy.add_backend("c1", "10.0.0.3", 80).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(proxy.select("c1").await.unwrap().url.clone());
        }
        // Each backend exactly once per N consecutive requests.
        assert_eq!(&seen[0..3], &seen[3..6]);
        let mut first_cycle = seen[0..3].to_vec();
        first_cycle.sort();
        first_cycle.dedup();
        assert_eq!(first_cycle.len(), 3);
    }

    #[tokio::test]
    async fn test_round_robin_skips_inactive() {
        let proxy = ContainerProxy::new(BalancerKind::RoundRobin);
        proxy.add_backend("c1", "10.0.0.1", 80).await.unwrap();
        proxy.add_backend("c1", "10.0.0.2", 80).await.unwrap();

        let backends = proxy.backends("c1").await;
        backends[0].set_active(false);

        for _ in 0..4 {
            let selected = proxy.select("c1").await.unwrap();
            assert_eq!(selected.url, "http://10.0.0.2:80");
        }
    }

    #[tokio::test]
    async fn test_least_connections_picks_minimum_with_order_ties() {
        let proxy = ContainerProxy::new(BalancerKind::LeastConnections);
        proxy.add_backend("c1", "10.0.0.1", 80).await.unwrap();
        proxy.add_backend("c1", "10.0.0.2", 80).await.unwrap();
        proxy.add_backend("c1", "10.0.0.3", 80).await.unwrap();

        let backends = proxy.backends("c1").await;
        backends[0].live_connections.store(3, Ordering::Relaxed);
        backends[1].live_connections.store(1, Ordering::Relaxed);
        backends[2].live_connections.store(2, Ordering::Relaxed);

        assert_eq!(
            proxy.select("c1").await.unwrap().url,
            "http://10.0.0.2:80"
        );

        // B goes unhealthy: next dispatch goes to C.
        backends[1].set_active(false);
        assert_eq!(
            proxy.select("c1").await.unwrap().url,
            "http://10.0.0.3:80"
        );

        // Ties break to the first in registration order.
        backends[1].set_active(true);
        for b in backends.iter() {
            b.live_connections.store(0, Ordering::Relaxed);
        }
        assert_eq!(
            proxy.select("c1").await.unwrap().url,
            "http://10.0.0.1:80"
        );
    }

    #[tokio::test]
    async fn test_no_active_backends_yields_none() {
        let proxy = ContainerProxy::new(BalancerKind::RoundRobin);
        assert!(proxy.select("missing").await.is_none());

        proxy.add_backend("c1", "10.0.0.1", 80).await.unwrap();
        proxy.backends("c1").await[0].set_active(false);
        assert!(proxy.select("c1").await.is_none());
    }

    #[tokio::test]
    async fn test_remove_backend() {
        let proxy = ContainerProxy::new(BalancerKind::RoundRobin);
        proxy.add_backend("c1", "10.0.0.1", 80).await.unwrap();
        proxy.remove_backend("c1", "10.0.0.1", 80).await.unwrap();
        assert!(proxy.backends("c1").await.is_empty());

        assert!(matches!(
            proxy.remove_backend("c1", "10.0.0.1", 80).await,
            Err(Error::BackendNotFound)
        ));
    }

    #[tokio::test]
    async fn test_connection_guard_balances() {
        let backend = Arc::new(Backend::new("http://10.0.0.1:80".to_string()));
        {
            let _g1 = ConnectionGuard::new(Arc::clone(&backend));
            let _g2 = ConnectionGuard::new(Arc::clone(&backend));
            assert_eq!(backend.live_connections(), 2);
        }
        assert_eq!(backend.live_connections(), 0);
    }
}
