//! Discovery tests.
//!
//! The packet codec is covered by unit tests; these exercise the
//! announce/query loop over real multicast, which needs a
//! multicast-capable loopback and is therefore opt-in.

use budgie::container::{generate_id, Container, ContainerState, ImageConfig, PortMapping};
use budgie::discovery::DiscoveryService;
use chrono::Utc;
use std::time::Duration;

fn web_container() -> Container {
    Container {
        id: generate_id().unwrap(),
        name: "web".to_string(),
        state: ContainerState::Running,
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
        restart_policy: None,
        depends_on: Vec::new(),
        network_config: None,
        node_id: "node-a".to_string(),
        peers: Vec::new(),
        created_at: Utc::now(),
        started_at: Some(Utc::now()),
        exited_at: None,
        exit_code: None,
        restart_count: 0,
        user_stopped: false,
    }
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a multicast-capable network"]
async fn test_announce_then_discover_roundtrip() {
    let announcer = DiscoveryService::new().unwrap();
    let _responder = announcer.start_responder();

    let ctr = web_container();
    announcer.announce_container(&ctr).await.unwrap();

    let querier = DiscoveryService::new().unwrap();
    let found = querier.discover(Duration::from_secs(3)).await.unwrap();

    let entry = found
        .iter()
        .find(|c| c.id == ctr.id)
        .expect("announced container should be discovered");
    assert_eq!(entry.name, "web");
    assert_eq!(entry.node_id, "node-a");
    assert_eq!(entry.image, "nginx:alpine");
    assert_eq!(entry.port, 8080);
    assert!(!entry.ips.is_empty());

    announcer.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a multicast-capable network"]
async fn test_retracted_container_disappears() {
    let announcer = DiscoveryService::new().unwrap();
    let _responder = announcer.start_responder();

    let ctr = web_container();
    announcer.announce_container(&ctr).await.unwrap();
    announcer.retract_container(&ctr.id).await.unwrap();

    let querier = DiscoveryService::new().unwrap();
    let found = querier.discover(Duration::from_secs(2)).await.unwrap();
    assert!(found.iter().all(|c| c.id != ctr.id));

    announcer.shutdown().await.unwrap();
}
