//! Sync client: the receive side of a reconciliation pass.
//!
//! Dials the primary's sync server, compares the advertised signatures
//! against the local volume root, requests everything stale, and writes
//! the transferred files in place (parents 0755, files 0644).

use crate::constants::SYNC_DIAL_TIMEOUT;
use crate::error::{Error, Result};
use crate::sync::protocol::{Ack, DeltaRequest, SignatureRequest, SyncChannel, SyncMessage};
use crate::sync::tls::TlsContext;
use crate::sync::volume::{needs_update, validate_relpath};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Dials `addr` and reconciles `local_root` against the primary's volume
/// for `container_id`. Returns the number of files written.
pub async fn sync_from(
    addr: &str,
    container_id: &str,
    local_root: &Path,
    tls: Option<Arc<TlsContext>>,
) -> Result<usize> {
    let stream = tokio::time::timeout(SYNC_DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("dial sync server {addr}"),
            duration: SYNC_DIAL_TIMEOUT,
        })??;

    info!("syncing volume {} from {addr}", local_root.display());

    let written = match tls {
        Some(tls) => {
            let host = addr.split(':').next().unwrap_or(addr);
            let stream = tls.connect(host, stream).await?;
            receive_volume(SyncChannel::new(stream), container_id, local_root).await?
        }
        None => receive_volume(SyncChannel::new(stream), container_id, local_root).await?,
    };

    info!("volume sync completed, {written} file(s) written");
    Ok(written)
}

/// Runs the receive side of one pass over an established channel.
pub async fn receive_volume<S: AsyncRead + AsyncWrite + Unpin + Send>(
    mut channel: SyncChannel<S>,
    container_id: &str,
    local_root: &Path,
) -> Result<usize> {
    std::fs::create_dir_all(local_root)?;

    // 1. Ask for the primary's signatures.
    channel
        .send(&SyncMessage::SignatureRequest(SignatureRequest {
            container_id: container_id.to_string(),
            subpath: String::new(),
        }))
        .await?;

    let response = match channel.recv().await? {
        SyncMessage::SignatureResponse(resp) => resp,
        SyncMessage::Error(e) => {
            return Err(Error::SyncProtocol(format!(
                "server refused pass: {} ({})",
                e.message, e.code
            )))
        }
        other => {
            return Err(Error::SyncProtocol(format!(
                "expected signatures, got {other:?}"
            )))
        }
    };

    // 2. Decide which files are stale locally.
    let stale: Vec<String> = response
        .signatures
        .iter()
        .filter(|sig| validate_relpath(&sig.path).is_ok() && needs_update(local_root, sig))
        .map(|sig| sig.path.clone())
        .collect();

    debug!(
        "{} of {} remote files are stale locally",
        stale.len(),
        response.count
    );

    if stale.is_empty() {
        channel
            .send(&SyncMessage::Ack(Ack {
                success: true,
                message: "up to date".to_string(),
            }))
            .await?;
        return Ok(0);
    }

    channel
        .send(&SyncMessage::DeltaRequest(DeltaRequest {
            files: stale,
        }))
        .await?;

    // 3. Receive file transfers until the server acknowledges completion.
    let mut written = 0usize;
    loop {
        match channel.recv().await? {
            SyncMessage::FileTransfer(meta) => {
                validate_relpath(&meta.path)?;
                let content = channel.recv_file_content(meta.size).await?;

                let full_path = local_root.join(&meta.path);
                if let Some(parent) = full_path.parent() {
                    std::fs::create_dir_all(parent)?;
                    #[cfg(unix)]
                    let _ = std::fs::set_permissions(
                        parent,
                        std::fs::Permissions::from_mode(0o755),
                    );
                }
                tokio::fs::write(&full_path, &content).await?;
                #[cfg(unix)]
                std::fs::set_permissions(&full_path, std::fs::Permissions::from_mode(0o644))?;

                debug!("received {} ({} bytes)", meta.path, meta.size);
                written += 1;
            }
            SyncMessage::Ack(_) => return Ok(written),
            SyncMessage::Error(e) => {
                return Err(Error::SyncProtocol(format!(
                    "server aborted pass: {} ({})",
                    e.message, e.code
                )))
            }
            other => {
                return Err(Error::SyncProtocol(format!(
                    "unexpected message during transfer: {other:?}"
                )))
            }
        }
    }
}
