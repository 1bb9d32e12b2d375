//! Restart monitor.
//!
//! Scans the container list every 5 seconds and reschedules stopped or
//! failed containers according to their restart policy, with exponential
//! backoff bounded at 5 minutes.

use crate::constants::{MAX_RESTART_BACKOFF, RESTART_SCAN_INTERVAL};
use crate::container::{Container, ContainerState, RestartPolicyKind};
use crate::manager::Manager;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Computes the backoff floor for a restart attempt:
/// `min(1s * 2^restart_count, 5min)`.
pub fn restart_backoff(restart_count: u32) -> Duration {
    let exp = restart_count.min(16);
    let backoff = Duration::from_secs(1u64 << exp);
    backoff.min(MAX_RESTART_BACKOFF)
}

/// Decides whether a container is due for a policy-driven restart.
///
/// The answer honours both the policy table and the backoff floor since
/// `exited_at`. `unless-stopped` restarts on any exit, including exit 0,
/// unless the stop was user-invoked.
pub fn should_restart(ctr: &Container) -> bool {
    if ctr.state != ContainerState::Stopped && ctr.state != ContainerState::Failed {
        return false;
    }

    let Some(policy) = &ctr.restart_policy else {
        return false;
    };

    let policy_allows = match policy.name {
        RestartPolicyKind::No => false,
        RestartPolicyKind::Always => true,
        RestartPolicyKind::OnFailure => {
            if policy.maximum_retry_count > 0 && ctr.restart_count >= policy.maximum_retry_count {
                false
            } else {
                ctr.state == ContainerState::Failed
            }
        }
        RestartPolicyKind::UnlessStopped => !ctr.user_stopped,
    };
    if !policy_allows {
        return false;
    }

    // Enforce exponential backoff relative to the recorded exit time.
    match ctr.exited_at {
        Some(exited_at) => {
            let elapsed = Utc::now().signed_duration_since(exited_at);
            let backoff = restart_backoff(ctr.restart_count);
            elapsed.to_std().map(|e| e >= backoff).unwrap_or(false)
        }
        // No exit timestamp recorded; restart immediately.
        None => true,
    }
}

/// Monitor rescheduling containers per their restart policy.
pub struct RestartMonitor {
    manager: Arc<Manager>,
    interval: Duration,
    stop_tx: watch::Sender<bool>,
}

impl RestartMonitor {
    /// Creates a restart monitor over `manager`.
    pub fn new(manager: Arc<Manager>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            manager,
            interval: RESTART_SCAN_INTERVAL,
            stop_tx,
        }
    }

    /// Overrides the scan interval (used by tests).
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Spawns the monitor loop.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(&self.manager);
        let interval = self.interval;
        let mut stop_rx = self.stop_tx.subscribe();

        info!("restart monitor started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::scan(&manager).await;
                    }
                    _ = stop_rx.changed() => {
                        info!("restart monitor stopped");
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

    /// One scan pass over the container list.
    async fn scan(manager: &Arc<Manager>) {
        let containers = manager.list().await;

        for ctr in containers {
            if !should_restart(&ctr) {
                continue;
            }

            info!(
                "restarting container {} (attempt {})",
                ctr.short_id(),
                ctr.restart_count + 1
            );

            // The manager re-validates state under its lock, so a container
            // removed or started between snapshot and here is skipped.
            match manager.start_for_restart(&ctr.id).await {
                Ok(()) => debug!("container {} restarted", ctr.short_id()),
                Err(e) => error!("failed to restart container {}: {e}", ctr.short_id()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{generate_id, ImageConfig, RestartPolicy};

    fn exited_container(state: ContainerState, policy: RestartPolicyKind) -> Container {
        Container {
            id: generate_id().unwrap(),
            name: "t".to_string(),
            state,
            image: ImageConfig::default(),
            ports: Vec::new(),
            volumes: Vec::new(),
            env: Vec::new(),
            health_check: None,
            replicas: None,
            resources: None,
            restart_policy: Some(RestartPolicy {
                name: policy,
                maximum_retry_count: 0,
            }),
            depends_on: Vec::new(),
            network_config: None,
            node_id: "n".to_string(),
            peers: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            exited_at: Some(Utc::now() - chrono::Duration::hours(1)),
            exit_code: Some(1),
            restart_count: 0,
            user_stopped: false,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(restart_backoff(0), Duration::from_secs(1));
        assert_eq!(restart_backoff(1), Duration::from_secs(2));
        assert_eq!(restart_backoff(3), Duration::from_secs(8));
        assert_eq!(restart_backoff(8), Duration::from_secs(256));
        assert_eq!(restart_backoff(9), MAX_RESTART_BACKOFF);
        assert_eq!(restart_backoff(40), MAX_RESTART_BACKOFF);
    }

    #[test]
    fn test_no_policy_never_restarts() {
        let ctr = exited_container(ContainerState::Failed, RestartPolicyKind::No);
        assert!(!should_restart(&ctr));
    }

    #[test]
    fn test_always_restarts_stopped_and_failed() {
        assert!(should_restart(&exited_container(
            ContainerState::Stopped,
            RestartPolicyKind::Always
        )));
        assert!(should_restart(&exited_container(
            ContainerState::Failed,
            RestartPolicyKind::Always
        )));
    }

    #[test]
    fn test_on_failure_ignores_clean_exit() {
        assert!(!should_restart(&exited_container(
            ContainerState::Stopped,
            RestartPolicyKind::OnFailure
        )));
        assert!(should_restart(&exited_container(
            ContainerState::Failed,
            RestartPolicyKind::OnFailure
        )));
    }

    #[test]
    fn test_on_failure_respects_retry_budget() {
        let mut ctr = exited_container(ContainerState::Failed, RestartPolicyKind::OnFailure);
        ctr.restart_policy = Some(RestartPolicy {
            name: RestartPolicyKind::OnFailure,
            maximum_retry_count: 2,
        });
        ctr.restart_count = 2;
        assert!(!should_restart(&ctr));

        ctr.restart_count = 1;
        assert!(should_restart(&ctr));
    }

    #[test]
    fn test_unless_stopped_honours_user_intent() {
        // Crash (or even a clean self-exit) restarts...
        let mut ctr = exited_container(ContainerState::Stopped, RestartPolicyKind::UnlessStopped);
        assert!(should_restart(&ctr));

        // ...but an explicit user stop does not.
        ctr.user_stopped = true;
        assert!(!should_restart(&ctr));
    }

    #[test]
    fn test_backoff_window_blocks_early_restart() {
        let mut ctr = exited_container(ContainerState::Failed, RestartPolicyKind::Always);
        ctr.restart_count = 4; // 16s backoff
        ctr.exited_at = Some(Utc::now() - chrono::Duration::seconds(3));
        assert!(!should_restart(&ctr));

        ctr.exited_at = Some(Utc::now() - chrono::Duration::seconds(20));
        assert!(should_restart(&ctr));
    }

    #[test]
    fn test_running_container_never_restarts() {
        let ctr = exited_container(ContainerState::Running, RestartPolicyKind::Always);
        assert!(!should_restart(&ctr));
    }
}
