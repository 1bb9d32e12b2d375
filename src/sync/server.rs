//! Sync server: serves volume reconciliation passes.
//!
//! A long-running TCP listener holds a registry of container id → volume
//! root. Containers register as they start and deregister as they stop.
//! Each accepted connection runs one pass: answer the signature request,
//! read the stale list, stream the requested files, acknowledge, close.

use crate::constants::DEFAULT_SYNC_PORT;
use crate::container::short_id;
use crate::error::{Error, Result};
use crate::sync::protocol::{Ack, SignatureResponse, SyncChannel, SyncMessage};
use crate::sync::tls::TlsContext;
use crate::sync::volume::{collect_signatures, validate_relpath};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// Long-running volume sync server.
pub struct SyncServer {
    listener: TcpListener,
    volumes: Arc<RwLock<HashMap<String, PathBuf>>>,
    tls: Option<Arc<TlsContext>>,
    stop_tx: watch::Sender<bool>,
}

impl SyncServer {
    /// Binds the server on `port` (0 picks an ephemeral port).
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            listener,
            volumes: Arc::new(RwLock::new(HashMap::new())),
            tls: None,
            stop_tx,
        })
    }

    /// Binds on the default sync port.
    pub async fn bind_default() -> Result<Self> {
        Self::bind(DEFAULT_SYNC_PORT).await
    }

    /// Enables TLS on accepted connections.
    pub fn with_tls(mut self, tls: Arc<TlsContext>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Returns the bound local port.
    pub fn local_port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Registers a container's volume root for serving.
    pub async fn register_volume(&self, container_id: &str, volume_path: PathBuf) {
        info!(
            "registered volume for container {} at {}",
            short_id(container_id),
            volume_path.display()
        );
        self.volumes
            .write()
            .await
            .insert(container_id.to_string(), volume_path);
    }

    /// Removes a container's volume from the registry.
    pub async fn unregister_volume(&self, container_id: &str) {
        self.volumes.write().await.remove(container_id);
    }

    /// Runs the accept loop until [`SyncServer::stop`] is called.
    pub async fn serve(&self) -> Result<()> {
        let addr = self.listener.local_addr()?;
        info!("sync server listening on {addr}");
        let mut stop_rx = self.stop_tx.subscribe();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("sync connection from {peer}");
                            let volumes = Arc::clone(&self.volumes);
                            let tls = self.tls.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, volumes, tls).await {
                                    warn!("sync pass from {peer} failed: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            error!("failed to accept sync connection: {e}");
                        }
                    }
                }
                _ = stop_rx.changed() => {
                    info!("sync server stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Signals the accept loop to exit.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

async fn handle_connection(
    stream: TcpStream,
    volumes: Arc<RwLock<HashMap<String, PathBuf>>>,
    tls: Option<Arc<TlsContext>>,
) -> Result<()> {
    match tls {
        Some(tls) => {
            let stream = tls.accept(stream).await?;
            serve_pass(SyncChannel::new(stream), volumes).await
        }
        None => serve_pass(SyncChannel::new(stream), volumes).await,
    }
}

/// Executes the server side of a single sync pass.
async fn serve_pass<S: AsyncRead + AsyncWrite + Unpin + Send>(
    mut channel: SyncChannel<S>,
    volumes: Arc<RwLock<HashMap<String, PathBuf>>>,
) -> Result<()> {
    // 1. Signature request selects the volume (and optionally a subtree).
    let request = match channel.recv().await? {
        SyncMessage::SignatureRequest(req) => req,
        other => {
            channel.send_error(400, "expected signature request").await?;
            return Err(Error::SyncProtocol(format!(
                "unexpected opening message: {other:?}"
            )));
        }
    };

    let root = {
        let volumes = volumes.read().await;
        volumes.get(&request.container_id).cloned()
    };
    let Some(root) = root else {
        channel.send_error(404, "container not registered").await?;
        return Err(Error::ContainerNotFound(request.container_id));
    };

    // 2. Walk the root and send the signatures.
    let signatures = collect_signatures(&root, &request.subpath)?;
    debug!(
        "serving {} signatures for {}",
        signatures.len(),
        short_id(&request.container_id)
    );
    channel
        .send(&SyncMessage::SignatureResponse(SignatureResponse {
            count: signatures.len(),
            signatures,
        }))
        .await?;

    // 3-4. The receiver answers with the stale paths it wants.
    let delta = match channel.recv().await? {
        SyncMessage::DeltaRequest(delta) => delta,
        SyncMessage::Ack(_) => return Ok(()), // nothing stale
        other => {
            return Err(Error::SyncProtocol(format!(
                "expected delta request, got {other:?}"
            )))
        }
    };

    // 5. Stream each requested file: metadata then exactly `size` bytes.
    for relpath in &delta.files {
        validate_relpath(relpath)?;
        let full_path = root.join(relpath);
        let content = match tokio::fs::read(&full_path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("failed to read {relpath} during sync: {e}");
                continue;
            }
        };
        let meta = crate::sync::volume::FileSignature {
            path: relpath.clone(),
            size: content.len() as u64,
            mtime_ns: 0,
            quick_checksum: String::new(),
            content_hash: None,
        };
        channel.send_file(&meta, &content).await?;
        debug!("sent {relpath} ({} bytes)", content.len());
    }

    channel
        .send(&SyncMessage::Ack(Ack {
            success: true,
            message: "transfer complete".to_string(),
        }))
        .await?;

    Ok(())
}
