//! Tests for the restart monitor against the in-memory runtime.
//!
//! Exercises the end-to-end policy loop: a failing task is restarted with
//! exponential backoff until its retry budget is spent.

use budgie::container::{
    generate_id, Container, ContainerState, ImageConfig, PortMapping, RestartPolicy,
    RestartPolicyKind,
};
use budgie::manager::Manager;
use budgie::monitor::RestartMonitor;
use budgie::runtime::MemoryRuntime;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn failing_container(max_retries: u32) -> Container {
    Container {
        id: generate_id().unwrap(),
        name: "flaky".to_string(),
        state: ContainerState::Creating,
        image: ImageConfig {
            docker_image: "flaky:latest".to_string(),
            ..Default::default()
        },
        ports: vec![PortMapping {
            container_port: 80,
            host_port: 8080,
            protocol: "tcp".to_string(),
        }],
        volumes: Vec::new(),
        env: Vec::new(),
        health_check: None,
        replicas: None,
        resources: None,
        restart_policy: Some(RestartPolicy {
            name: RestartPolicyKind::OnFailure,
            maximum_retry_count: max_retries,
        }),
        depends_on: Vec::new(),
        network_config: None,
        node_id: "test-node".to_string(),
        peers: Vec::new(),
        created_at: Utc::now(),
        started_at: None,
        exited_at: None,
        exit_code: None,
        restart_count: 0,
        user_stopped: false,
    }
}

async fn wait_for_state(
    manager: &Arc<Manager>,
    id: &str,
    state: ContainerState,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if manager.get(id).await.unwrap().state == state {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread")]
async fn test_on_failure_restarts_until_budget_spent() {
    let dir = TempDir::new().unwrap();
    let runtime = Arc::new(MemoryRuntime::new());
    let manager = Manager::new(runtime.clone(), dir.path().to_path_buf()).unwrap();

    let ctr = failing_container(2);
    let id = manager.create(ctr).await.unwrap();
    manager.start(&id).await.unwrap();

    let monitor =
        RestartMonitor::new(Arc::clone(&manager)).with_interval(Duration::from_millis(100));
    let handle = monitor.start();

    // Crash at t=0: the monitor restarts after the ~1s backoff.
    runtime.finish(&id, 1);
    assert!(wait_for_state(&manager, &id, ContainerState::Failed, Duration::from_secs(1)).await);
    assert!(wait_for_state(&manager, &id, ContainerState::Running, Duration::from_secs(3)).await);
    assert_eq!(manager.get(&id).await.unwrap().restart_count, 1);

    // Crash again: second restart after the ~2s backoff.
    runtime.finish(&id, 1);
    assert!(wait_for_state(&manager, &id, ContainerState::Running, Duration::from_secs(5)).await);
    assert_eq!(manager.get(&id).await.unwrap().restart_count, 2);

    // Third crash exceeds maximum_retry_count=2: stays failed.
    runtime.finish(&id, 1);
    assert!(wait_for_state(&manager, &id, ContainerState::Failed, Duration::from_secs(1)).await);
    tokio::time::sleep(Duration::from_secs(2)).await;
    let ctr = manager.get(&id).await.unwrap();
    assert_eq!(ctr.state, ContainerState::Failed);
    assert_eq!(ctr.restart_count, 2);

    monitor.stop();
    let _ = handle.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_user_stop_blocks_unless_stopped_restart() {
    let dir = TempDir::new().unwrap();
    let runtime = Arc::new(MemoryRuntime::new());
    let manager = Manager::new(runtime.clone(), dir.path().to_path_buf()).unwrap();

    let mut ctr = failing_container(0);
    ctr.restart_policy = Some(RestartPolicy {
        name: RestartPolicyKind::UnlessStopped,
        maximum_retry_count: 0,
    });
    let id = manager.create(ctr).await.unwrap();
    manager.start(&id).await.unwrap();

    let monitor =
        RestartMonitor::new(Arc::clone(&manager)).with_interval(Duration::from_millis(100));
    let handle = monitor.start();

    manager.stop(&id, Duration::from_secs(1)).await.unwrap();

    // An explicitly stopped container is never rescheduled.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        manager.get(&id).await.unwrap().state,
        ContainerState::Stopped
    );

    monitor.stop();
    let _ = handle.await;
}
