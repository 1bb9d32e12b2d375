//! Tests for the container lifecycle manager.
//!
//! Validates the state machine, snapshot persistence, exit watching, and
//! prefix resolution against the in-memory runtime double.

use budgie::container::{
    generate_id, Container, ContainerState, ImageConfig, PortMapping, RestartPolicy,
    RestartPolicyKind,
};
use budgie::error::Error;
use budgie::manager::Manager;
use budgie::runtime::MemoryRuntime;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn web_container() -> Container {
    Container {
        id: generate_id().unwrap(),
        name: "web".to_string(),
        state: ContainerState::Creating,
        image: ImageConfig {
            docker_image: "nginx:alpine".to_string(),
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
            name: RestartPolicyKind::No,
            maximum_retry_count: 0,
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

fn fixture() -> (TempDir, Arc<MemoryRuntime>, Arc<Manager>) {
    let dir = TempDir::new().unwrap();
    let runtime = Arc::new(MemoryRuntime::new());
    let manager = Manager::new(runtime.clone(), dir.path().to_path_buf()).unwrap();
    (dir, runtime, manager)
}

/// Reads the persisted snapshot back as containers.
fn snapshot(dir: &TempDir) -> Vec<Container> {
    let data = std::fs::read(dir.path().join("state.json")).unwrap();
    serde_json::from_slice(&data).unwrap()
}

/// Asserts that the on-disk snapshot matches the in-memory view.
async fn assert_snapshot_matches(dir: &TempDir, manager: &Arc<Manager>) {
    let mut on_disk: Vec<(String, ContainerState)> = snapshot(dir)
        .into_iter()
        .map(|c| (c.id, c.state))
        .collect();
    let mut in_memory: Vec<(String, ContainerState)> = manager
        .list()
        .await
        .into_iter()
        .map(|c| (c.id, c.state))
        .collect();
    on_disk.sort_by(|a, b| a.0.cmp(&b.0));
    in_memory.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(on_disk, in_memory);
}

// =============================================================================
// Create / Start / Stop
// =============================================================================

#[tokio::test]
async fn test_run_lifecycle() {
    let (dir, _runtime, manager) = fixture();
    let ctr = web_container();
    let id = ctr.id.clone();
    assert_eq!(id.len(), 64);

    manager.create(ctr).await.unwrap();
    assert_eq!(manager.get(&id).await.unwrap().state, ContainerState::Created);
    assert_snapshot_matches(&dir, &manager).await;

    manager.start(&id).await.unwrap();
    let running = manager.get(&id).await.unwrap();
    assert_eq!(running.state, ContainerState::Running);
    assert!(running.started_at.is_some());
    assert_eq!(
        running
            .ports
            .iter()
            .map(|p| format!("{}->{}/{}", p.host_port, p.container_port, p.protocol))
            .collect::<Vec<_>>(),
        vec!["8080->80/tcp"]
    );
    assert_snapshot_matches(&dir, &manager).await;
}

#[tokio::test]
async fn test_duplicate_create_conflicts() {
    let (_dir, _runtime, manager) = fixture();
    let ctr = web_container();
    let dup = ctr.clone();

    manager.create(ctr).await.unwrap();
    assert!(matches!(
        manager.create(dup).await,
        Err(Error::ContainerExists(_))
    ));
}

#[tokio::test]
async fn test_failed_create_leaves_nothing() {
    let (_dir, runtime, manager) = fixture();
    runtime.fail_next_create("registry unreachable");

    let ctr = web_container();
    let id = ctr.id.clone();
    assert!(manager.create(ctr).await.is_err());
    assert!(matches!(
        manager.get(&id).await,
        Err(Error::ContainerNotFound(_))
    ));
    assert!(!runtime.exists(&id));
}

#[tokio::test]
async fn test_failed_start_leaves_created() {
    let (_dir, runtime, manager) = fixture();
    let ctr = web_container();
    let id = manager.create(ctr).await.unwrap();

    runtime.fail_next_start("task spawn failed");
    assert!(manager.start(&id).await.is_err());
    assert_eq!(manager.get(&id).await.unwrap().state, ContainerState::Created);
}

#[tokio::test]
async fn test_graceful_stop_then_state_error() {
    let (dir, _runtime, manager) = fixture();
    let id = manager.create(web_container()).await.unwrap();
    manager.start(&id).await.unwrap();

    manager.stop(&id, Duration::from_secs(5)).await.unwrap();
    let stopped = manager.get(&id).await.unwrap();
    assert_eq!(stopped.state, ContainerState::Stopped);
    assert!(stopped.user_stopped);
    assert!(stopped.exited_at.is_some());
    assert_snapshot_matches(&dir, &manager).await;

    // A second stop is a state error.
    assert!(matches!(
        manager.stop(&id, Duration::from_secs(5)).await,
        Err(Error::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_start_requires_startable_state() {
    let (_dir, _runtime, manager) = fixture();
    let id = manager.create(web_container()).await.unwrap();
    manager.start(&id).await.unwrap();

    assert!(matches!(
        manager.start(&id).await,
        Err(Error::InvalidState { .. })
    ));
}

// =============================================================================
// Exit Watcher
// =============================================================================

#[tokio::test]
async fn test_clean_exit_transitions_to_stopped() {
    let (_dir, runtime, manager) = fixture();
    let id = manager.create(web_container()).await.unwrap();
    manager.start(&id).await.unwrap();

    runtime.finish(&id, 0);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let ctr = manager.get(&id).await.unwrap();
    assert_eq!(ctr.state, ContainerState::Stopped);
    assert_eq!(ctr.exit_code, Some(0));
    assert!(ctr.exited_at.is_some());
}

#[tokio::test]
async fn test_nonzero_exit_transitions_to_failed() {
    let (_dir, runtime, manager) = fixture();
    let id = manager.create(web_container()).await.unwrap();
    manager.start(&id).await.unwrap();

    runtime.finish(&id, 137);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let ctr = manager.get(&id).await.unwrap();
    assert_eq!(ctr.state, ContainerState::Failed);
    assert_eq!(ctr.exit_code, Some(137));
}

#[tokio::test]
async fn test_manual_restart_resets_restart_count() {
    let (_dir, runtime, manager) = fixture();
    let id = manager.create(web_container()).await.unwrap();
    manager.start(&id).await.unwrap();
    runtime.finish(&id, 1);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Monitor-driven restart bumps the counter.
    manager.start_for_restart(&id).await.unwrap();
    assert_eq!(manager.get(&id).await.unwrap().restart_count, 1);

    runtime.finish(&id, 0);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // User-invoked start resets it.
    manager.start(&id).await.unwrap();
    assert_eq!(manager.get(&id).await.unwrap().restart_count, 0);
}

// =============================================================================
// Remove
// =============================================================================

#[tokio::test]
async fn test_remove_refuses_running() {
    let (dir, runtime, manager) = fixture();
    let id = manager.create(web_container()).await.unwrap();
    manager.start(&id).await.unwrap();

    assert!(matches!(
        manager.remove(&id, false).await,
        Err(Error::InvalidState { .. })
    ));

    runtime.finish(&id, 0);
    tokio::time::sleep(Duration::from_millis(100)).await;

    manager.remove(&id, false).await.unwrap();
    assert!(manager.get(&id).await.is_err());
    assert_snapshot_matches(&dir, &manager).await;
}

// =============================================================================
// Persistence
// =============================================================================

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let id = {
        let runtime = Arc::new(MemoryRuntime::new());
        let manager = Manager::new(runtime, dir.path().to_path_buf()).unwrap();
        manager.create(web_container()).await.unwrap()
    };

    let runtime = Arc::new(MemoryRuntime::new());
    let manager = Manager::new(runtime, dir.path().to_path_buf()).unwrap();
    let ctr = manager.get(&id).await.unwrap();
    assert_eq!(ctr.name, "web");
    assert_eq!(ctr.state, ContainerState::Created);
}

// =============================================================================
// Resolution
// =============================================================================

#[tokio::test]
async fn test_resolve_by_prefix_and_name() {
    let (_dir, _runtime, manager) = fixture();
    let ctr = web_container();
    let id = ctr.id.clone();
    manager.create(ctr).await.unwrap();

    assert_eq!(manager.resolve(&id[..12]).await.unwrap(), id);
    assert_eq!(manager.resolve("web").await.unwrap(), id);
    assert!(matches!(
        manager.resolve("nope").await,
        Err(Error::ContainerNotFound(_))
    ));
}

#[tokio::test]
async fn test_resolve_ambiguous_prefix() {
    let (_dir, _runtime, manager) = fixture();
    let mut a = web_container();
    a.id = format!("aa{}", &a.id[2..]);
    let mut b = web_container();
    b.name = "api".to_string();
    b.id = format!("aa{}", &b.id[2..]);

    manager.create(a).await.unwrap();
    manager.create(b).await.unwrap();

    match manager.resolve("aa").await {
        Err(Error::AmbiguousPrefix { matches, .. }) => assert_eq!(matches.len(), 2),
        other => panic!("expected ambiguous prefix, got {other:?}"),
    }
}
