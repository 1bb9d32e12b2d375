//! Sync wire protocol.
//!
//! Messages are self-describing tagged envelopes:
//!
//! ```text
//! ┌────────┬──────────────────┬───────────────┬───────────────────┐
//! │ type   │ header len (u32) │ header (JSON) │ body (FileTransfer │
//! │ (u8)   │ big-endian       │               │ only: `size` bytes)│
//! └────────┴──────────────────┴───────────────┴───────────────────┘
//! ```
//!
//! Only `FileTransfer` carries a body; its length is the `size` field of
//! the header signature. Oversized headers are rejected before
//! allocation.

use crate::constants::MAX_SYNC_HEADER_LEN;
use crate::error::{Error, Result};
use crate::sync::volume::FileSignature;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// =============================================================================
// Message Types
// =============================================================================

const TYPE_SIGNATURE_REQUEST: u8 = 1;
const TYPE_SIGNATURE_RESPONSE: u8 = 2;
const TYPE_DELTA_REQUEST: u8 = 3;
const TYPE_FILE_TRANSFER: u8 = 4;
const TYPE_ACK: u8 = 5;
const TYPE_ERROR: u8 = 6;

/// Asks the server for signatures of a registered volume (or a subtree).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureRequest {
    pub container_id: String,
    /// Optional subtree below the volume root; empty means the whole root.
    #[serde(default)]
    pub subpath: String,
}

/// Signature listing for one volume pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureResponse {
    pub count: usize,
    pub signatures: Vec<FileSignature>,
}

/// Stale paths the receiver wants transferred.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaRequest {
    pub files: Vec<String>,
}

/// Terminal acknowledgement of a pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
    pub message: String,
}

/// Error reported over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub code: u16,
    pub message: String,
}

/// One envelope on the sync channel.
#[derive(Debug, Clone)]
pub enum SyncMessage {
    SignatureRequest(SignatureRequest),
    SignatureResponse(SignatureResponse),
    DeltaRequest(DeltaRequest),
    /// Header of a file transfer; exactly `meta.size` raw bytes follow.
    FileTransfer(FileSignature),
    Ack(Ack),
    Error(WireError),
}

impl SyncMessage {
    fn type_byte(&self) -> u8 {
        match self {
            Self::SignatureRequest(_) => TYPE_SIGNATURE_REQUEST,
            Self::SignatureResponse(_) => TYPE_SIGNATURE_RESPONSE,
            Self::DeltaRequest(_) => TYPE_DELTA_REQUEST,
            Self::FileTransfer(_) => TYPE_FILE_TRANSFER,
            Self::Ack(_) => TYPE_ACK,
            Self::Error(_) => TYPE_ERROR,
        }
    }

    fn header_json(&self) -> Result<Vec<u8>> {
        let json = match self {
            Self::SignatureRequest(m) => serde_json::to_vec(m)?,
            Self::SignatureResponse(m) => serde_json::to_vec(m)?,
            Self::DeltaRequest(m) => serde_json::to_vec(m)?,
            Self::FileTransfer(m) => serde_json::to_vec(m)?,
            Self::Ack(m) => serde_json::to_vec(m)?,
            Self::Error(m) => serde_json::to_vec(m)?,
        };
        Ok(json)
    }
}

// =============================================================================
// Channel
// =============================================================================

/// Framed sync channel over any byte stream (plain TCP or TLS).
pub struct SyncChannel<S> {
    stream: S,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> SyncChannel<S> {
    /// Wraps a connected stream.
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Consumes the channel, returning the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Sends one envelope.
    pub async fn send(&mut self, msg: &SyncMessage) -> Result<()> {
        let header = msg.header_json()?;
        if header.len() as u32 > MAX_SYNC_HEADER_LEN {
            return Err(Error::SyncProtocol(format!(
                "header too large: {} bytes",
                header.len()
            )));
        }
        self.stream.write_u8(msg.type_byte()).await?;
        self.stream.write_u32(header.len() as u32).await?;
        self.stream.write_all(&header).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receives one envelope.
    pub async fn recv(&mut self) -> Result<SyncMessage> {
        let type_byte = self.stream.read_u8().await?;
        let header_len = self.stream.read_u32().await?;
        if header_len > MAX_SYNC_HEADER_LEN {
            return Err(Error::SyncProtocol(format!(
                "header too large: {header_len} bytes"
            )));
        }

        let mut header = vec![0u8; header_len as usize];
        self.stream.read_exact(&mut header).await?;

        let msg = match type_byte {
            TYPE_SIGNATURE_REQUEST => {
                SyncMessage::SignatureRequest(serde_json::from_slice(&header)?)
            }
            TYPE_SIGNATURE_RESPONSE => {
                SyncMessage::SignatureResponse(serde_json::from_slice(&header)?)
            }
            TYPE_DELTA_REQUEST => SyncMessage::DeltaRequest(serde_json::from_slice(&header)?),
            TYPE_FILE_TRANSFER => SyncMessage::FileTransfer(serde_json::from_slice(&header)?),
            TYPE_ACK => SyncMessage::Ack(serde_json::from_slice(&header)?),
            TYPE_ERROR => SyncMessage::Error(serde_json::from_slice(&header)?),
            other => {
                return Err(Error::SyncProtocol(format!(
                    "unknown message type {other}"
                )))
            }
        };
        Ok(msg)
    }

    /// Sends a file: the `FileTransfer` envelope then exactly `meta.size`
    /// content bytes.
    pub async fn send_file(&mut self, meta: &FileSignature, content: &[u8]) -> Result<()> {
        if content.len() as u64 != meta.size {
            return Err(Error::SyncProtocol(format!(
                "file {} changed size during transfer ({} != {})",
                meta.path,
                content.len(),
                meta.size
            )));
        }
        self.send(&SyncMessage::FileTransfer(meta.clone())).await?;
        self.stream.write_all(content).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads exactly `size` content bytes following a `FileTransfer`
    /// envelope.
    pub async fn recv_file_content(&mut self, size: u64) -> Result<Vec<u8>> {
        let mut content = vec![0u8; size as usize];
        self.stream.read_exact(&mut content).await?;
        Ok(content)
    }

    /// Sends a wire error.
    pub async fn send_error(&mut self, code: u16, message: &str) -> Result<()> {
        self.send(&SyncMessage::Error(WireError {
            code,
            message: message.to_string(),
        }))
        .await
    }
}
