//! Health check monitor.
//!
//! Wakes every second and probes running containers that carry a health
//! check configuration, each on its own interval. A 2xx response clears
//! the failing streak; when the streak reaches the retry budget the
//! container is marked unhealthy and transitioned to `failed`, where the
//! restart monitor takes over.

use crate::constants::{HEALTH_LOG_DEPTH, HEALTH_TICK_INTERVAL};
use crate::container::Container;
use crate::manager::Manager;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

// =============================================================================
// Health State
// =============================================================================

/// Health status of a monitored container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No probe has completed yet.
    Starting,
    /// Last probe succeeded.
    Healthy,
    /// Failing streak reached the retry budget.
    Unhealthy,
}

/// One recorded probe result.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeRecord {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// 0 on success, 1 on failure.
    pub exit_code: i32,
    /// HTTP status line or error text.
    pub output: String,
}

#[derive(Debug, Clone)]
struct ContainerHealth {
    status: HealthStatus,
    failing_streak: u32,
    log: Vec<ProbeRecord>,
}

impl ContainerHealth {
    fn new() -> Self {
        Self {
            status: HealthStatus::Starting,
            failing_streak: 0,
            log: Vec::new(),
        }
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// Periodic HTTP health prober.
pub struct HealthMonitor {
    manager: Arc<Manager>,
    health: Arc<RwLock<HashMap<String, ContainerHealth>>>,
    client: reqwest::Client,
    stop_tx: watch::Sender<bool>,
}

impl HealthMonitor {
    /// Creates a health monitor over `manager`.
    pub fn new(manager: Arc<Manager>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            manager,
            health: Arc::new(RwLock::new(HashMap::new())),
            client: reqwest::Client::new(),
            stop_tx,
        }
    }

    /// Returns the current status for a container, if it is tracked.
    pub async fn status(&self, id: &str) -> Option<HealthStatus> {
        self.health.read().await.get(id).map(|h| h.status)
    }

    /// Returns the retained probe log for a container.
    pub async fn probe_log(&self, id: &str) -> Vec<ProbeRecord> {
        self.health
            .read()
            .await
            .get(id)
            .map(|h| h.log.clone())
            .unwrap_or_default()
    }

    /// Resets tracking for a container (called on start).
    pub async fn reset(&self, id: &str) {
        self.health
            .write()
            .await
            .insert(id.to_string(), ContainerHealth::new());
    }

    /// Drops tracking for a container (called on remove).
    pub async fn forget(&self, id: &str) {
        self.health.write().await.remove(id);
    }

    /// Spawns the monitor loop.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(&self.manager);
        let health = Arc::clone(&self.health);
        let client = self.client.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        info!("health check monitor started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_TICK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::tick(&manager, &health, &client).await;
                    }
                    _ = stop_rx.changed() => {
                        info!("health check monitor stopped");
                        return;
                    }
                }
            }
        })
    }

    /// Signals the monitor loop to exit.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    async fn tick(
        manager: &Arc<Manager>,
        health: &Arc<RwLock<HashMap<String, ContainerHealth>>>,
        client: &reqwest::Client,
    ) {
        let containers = manager.list().await;

        for ctr in containers {
            let Some(check) = &ctr.health_check else {
                continue;
            };
            if check.path.is_empty() || !ctr.is_running() {
                continue;
            }

            if !Self::probe_due(&ctr, health).await {
                continue;
            }

            let manager = Arc::clone(manager);
            let health = Arc::clone(health);
            let client = client.clone();
            tokio::spawn(async move {
                Self::run_probe(&manager, &health, &client, &ctr).await;
            });
        }
    }

    /// Checks whether the per-container interval has elapsed since the
    /// last recorded probe.
    async fn probe_due(
        ctr: &Container,
        health: &Arc<RwLock<HashMap<String, ContainerHealth>>>,
    ) -> bool {
        let map = health.read().await;
        match map.get(&ctr.id).and_then(|h| h.log.last()) {
            Some(last) => {
                let elapsed = Utc::now().signed_duration_since(last.end);
                elapsed
                    .to_std()
                    .map(|e| e >= ctr.health_interval())
                    .unwrap_or(true)
            }
            None => true,
        }
    }

    async fn run_probe(
        manager: &Arc<Manager>,
        health: &Arc<RwLock<HashMap<String, ContainerHealth>>>,
        client: &reqwest::Client,
        ctr: &Container,
    ) {
        let Some(port) = ctr.primary_port() else {
            return;
        };
        let Some(check) = &ctr.health_check else {
            return;
        };
        let path = if check.path.starts_with('/') {
            check.path.clone()
        } else {
            format!("/{}", check.path)
        };
        let url = format!("http://localhost:{}{}", port.host_port, path);

        let start = Utc::now();
        let outcome = client
            .get(&url)
            .timeout(ctr.health_timeout())
            .send()
            .await;

        let (exit_code, output) = match outcome {
            Ok(resp) if resp.status().is_success() => (0, format!("HTTP {}", resp.status().as_u16())),
            Ok(resp) => (1, format!("HTTP {}", resp.status().as_u16())),
            Err(e) => (1, e.to_string()),
        };

        Self::record(manager, health, ctr, start, exit_code, output).await;
    }

    async fn record(
        manager: &Arc<Manager>,
        health: &Arc<RwLock<HashMap<String, ContainerHealth>>>,
        ctr: &Container,
        start: DateTime<Utc>,
        exit_code: i32,
        output: String,
    ) {
        let mut map = health.write().await;
        let entry = map
            .entry(ctr.id.clone())
            .or_insert_with(ContainerHealth::new);

        entry.log.push(ProbeRecord {
            start,
            end: Utc::now(),
            exit_code,
            output: output.clone(),
        });
        if entry.log.len() > HEALTH_LOG_DEPTH {
            entry.log.remove(0);
        }

        let retries = ctr.health_retries();
        if exit_code == 0 {
            entry.failing_streak = 0;
            entry.status = HealthStatus::Healthy;
            debug!("container {} health check passed", ctr.short_id());
            return;
        }

        entry.failing_streak += 1;
        warn!(
            "container {} health check failed ({}/{}): {output}",
            ctr.short_id(),
            entry.failing_streak,
            retries
        );

        if entry.failing_streak >= retries {
            entry.status = HealthStatus::Unhealthy;
            drop(map);
            warn!(
                "container {} is unhealthy, handing over to restart policy",
                ctr.short_id()
            );
            if let Err(e) = manager.mark_failed(&ctr.id).await {
                error!("failed to mark container {} failed: {e}", ctr.short_id());
            }
        }
    }
}
