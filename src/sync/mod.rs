//! Volume synchronisation between nodes.
//!
//! A signature-exchange delta protocol reconciles a replica's mutable
//! volumes with a primary's over TCP (optionally TLS-wrapped):
//!
//! ```text
//! Replica                              Primary (sync server)
//!   |  SignatureRequest(id, subpath)     |
//!   |-----------------------------------►|
//!   |  SignatureResponse(signatures)     |
//!   |◄-----------------------------------|
//!   |  DeltaRequest(stale paths)         |
//!   |-----------------------------------►|
//!   |  FileTransfer(meta) + bytes  (×N)  |
//!   |◄-----------------------------------|
//!   |  Ack                               |
//!   |◄-----------------------------------|
//! ```
//!
//! One pass per connection; the channel is closed afterwards.

mod client;
mod protocol;
mod server;
mod tls;
mod volume;
mod watcher;

pub use client::{receive_volume, sync_from};
pub use protocol::{Ack, DeltaRequest, SignatureRequest, SignatureResponse, SyncChannel, SyncMessage, WireError};
pub use server::SyncServer;
pub use tls::{TlsContext, generate_node_cert};
pub use volume::{collect_signatures, needs_update, FileSignature};
pub use watcher::VolumeWatcher;
