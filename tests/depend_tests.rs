//! Integration tests for dependency readiness waits.

use budgie::container::{generate_id, Container, ContainerState, ImageConfig};
use budgie::depend::wait_for_dependencies;
use budgie::error::Error;
use budgie::manager::Manager;
use budgie::runtime::MemoryRuntime;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn named(name: &str, deps: &[&str]) -> Container {
    Container {
        id: generate_id().unwrap(),
        name: name.to_string(),
        state: ContainerState::Creating,
        image: ImageConfig {
            docker_image: format!("{name}:latest"),
            ..Default::default()
        },
        ports: Vec::new(),
        volumes: Vec::new(),
        env: Vec::new(),
        health_check: None,
        replicas: None,
        resources: None,
        restart_policy: None,
        depends_on: deps.iter().map(|s| s.to_string()).collect(),
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

#[tokio::test(flavor = "multi_thread")]
async fn test_wait_returns_once_dependency_runs() {
    let dir = TempDir::new().unwrap();
    let runtime = Arc::new(MemoryRuntime::new());
    let manager = Manager::new(runtime, dir.path().to_path_buf()).unwrap();

    let db = named("db", &[]);
    let db_id = manager.create(db).await.unwrap();

    let waiter = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            wait_for_dependencies(
                &manager,
                "web",
                &["db".to_string()],
                Duration::from_secs(5),
            )
            .await
        })
    };

    // The waiter polls while db is only created...
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(!waiter.is_finished());

    // ...and resolves once it runs.
    manager.start(&db_id).await.unwrap();
    waiter.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_wait_times_out() {
    let dir = TempDir::new().unwrap();
    let runtime = Arc::new(MemoryRuntime::new());
    let manager = Manager::new(runtime, dir.path().to_path_buf()).unwrap();

    manager.create(named("db", &[])).await.unwrap();

    let result = wait_for_dependencies(
        &manager,
        "web",
        &["db".to_string()],
        Duration::from_millis(1200),
    )
    .await;
    assert!(matches!(result, Err(Error::DependencyTimeout(_))));
}

#[tokio::test]
async fn test_wait_fails_on_unknown_dependency() {
    let dir = TempDir::new().unwrap();
    let runtime = Arc::new(MemoryRuntime::new());
    let manager = Manager::new(runtime, dir.path().to_path_buf()).unwrap();

    let result = wait_for_dependencies(
        &manager,
        "web",
        &["ghost".to_string()],
        Duration::from_secs(2),
    )
    .await;
    assert!(matches!(result, Err(Error::UnknownDependency { .. })));
}
