//! Tests for the volume synchroniser.
//!
//! Runs real passes against a sync server bound on loopback: after one
//! pass the target matches the source byte for byte, and a second pass
//! writes nothing.

use budgie::sync::{collect_signatures, sync_from, SyncServer};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const CONTAINER_ID: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

async fn start_server(root: &Path) -> (Arc<SyncServer>, String) {
    let server = Arc::new(SyncServer::bind(0).await.unwrap());
    server
        .register_volume(CONTAINER_ID, root.to_path_buf())
        .await;
    let addr = format!("127.0.0.1:{}", server.local_port().unwrap());

    let serve = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = serve.serve().await;
    });

    (server, addr)
}

fn tree_contents(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut out = Vec::new();
    for sig in collect_signatures(root, "").unwrap() {
        let data = std::fs::read(root.join(&sig.path)).unwrap();
        out.push((sig.path, data));
    }
    out
}

// =============================================================================
// Round-Trip
// =============================================================================

#[tokio::test]
async fn test_round_trip_into_empty_target() {
    let source = TempDir::new().unwrap();
    std::fs::write(source.path().join("index.html"), b"hello\n").unwrap();
    std::fs::create_dir_all(source.path().join("assets/css")).unwrap();
    std::fs::write(source.path().join("assets/css/site.css"), b"body{}\n").unwrap();

    let target = TempDir::new().unwrap();
    let (server, addr) = start_server(source.path()).await;

    let written = sync_from(&addr, CONTAINER_ID, target.path(), None)
        .await
        .unwrap();
    assert_eq!(written, 2);

    assert_eq!(tree_contents(target.path()), tree_contents(source.path()));
    assert_eq!(
        std::fs::read(target.path().join("index.html")).unwrap(),
        b"hello\n"
    );
    server.stop();
}

#[tokio::test]
async fn test_subset_target_catches_up() {
    let source = TempDir::new().unwrap();
    std::fs::write(source.path().join("a.txt"), b"alpha").unwrap();
    std::fs::write(source.path().join("b.txt"), b"beta").unwrap();

    let target = TempDir::new().unwrap();
    // Target already holds an identical copy of a.txt.
    std::fs::write(target.path().join("a.txt"), b"alpha").unwrap();

    let (server, addr) = start_server(source.path()).await;
    let written = sync_from(&addr, CONTAINER_ID, target.path(), None)
        .await
        .unwrap();

    assert_eq!(written, 1);
    assert_eq!(tree_contents(target.path()), tree_contents(source.path()));
    server.stop();
}

#[tokio::test]
async fn test_changed_content_is_overwritten() {
    let source = TempDir::new().unwrap();
    std::fs::write(source.path().join("f"), b"new contents").unwrap();

    let target = TempDir::new().unwrap();
    std::fs::write(target.path().join("f"), b"old stale!!!").unwrap();

    let (server, addr) = start_server(source.path()).await;
    sync_from(&addr, CONTAINER_ID, target.path(), None)
        .await
        .unwrap();

    assert_eq!(
        std::fs::read(target.path().join("f")).unwrap(),
        b"new contents"
    );
    server.stop();
}

// =============================================================================
// Idempotence
// =============================================================================

#[tokio::test]
async fn test_second_pass_writes_nothing() {
    let source = TempDir::new().unwrap();
    std::fs::write(source.path().join("index.html"), b"hello\n").unwrap();
    std::fs::create_dir_all(source.path().join("sub")).unwrap();
    std::fs::write(source.path().join("sub/data.bin"), vec![7u8; 4096]).unwrap();

    let target = TempDir::new().unwrap();
    let (server, addr) = start_server(source.path()).await;

    let first = sync_from(&addr, CONTAINER_ID, target.path(), None)
        .await
        .unwrap();
    assert_eq!(first, 2);

    let second = sync_from(&addr, CONTAINER_ID, target.path(), None)
        .await
        .unwrap();
    assert_eq!(second, 0, "second pass must produce no file writes");
    server.stop();
}

// =============================================================================
// Errors
// =============================================================================

#[tokio::test]
async fn test_unregistered_container_is_refused() {
    let source = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let (server, addr) = start_server(source.path()).await;

    let result = sync_from(&addr, "ffffffffffff", target.path(), None).await;
    assert!(result.is_err());
    server.stop();
}

#[tokio::test]
async fn test_unregister_removes_volume() {
    let source = TempDir::new().unwrap();
    std::fs::write(source.path().join("f"), b"x").unwrap();
    let target = TempDir::new().unwrap();

    let (server, addr) = start_server(source.path()).await;
    server.unregister_volume(CONTAINER_ID).await;

    assert!(sync_from(&addr, CONTAINER_ID, target.path(), None)
        .await
        .is_err());
    server.stop();
}
