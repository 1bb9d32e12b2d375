//! # budgie
//!
//! **LAN-scale container orchestrator.**
//!
//! Operators declare a containerised workload in a small YAML bundle and a
//! node runs it via a local container engine. Peers on the same broadcast
//! domain discover one another over multicast DNS-SD, replicate the
//! workload, and reconcile its read-write volumes, so that any node can
//! serve traffic behind a port-based reverse proxy.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              budgie                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                     Lifecycle Manager                       │    │
//! │  │   create(ctr) → start(id) → stop(id) → remove(id)           │    │
//! │  │   single exclusion lock · exit watchers · JSON snapshot     │    │
//! │  └────────────┬───────────────────────────────┬────────────────┘    │
//! │               │                               │                     │
//! │  ┌────────────▼────────────┐     ┌────────────▼────────────┐        │
//! │  │     Runtime trait       │     │        Monitors         │        │
//! │  │ pull / create / start / │     │  restart (policy+backoff)│       │
//! │  │ stop / delete / status /│     │  health  (HTTP probes)  │        │
//! │  │ logs / exec / images    │     └─────────────────────────┘        │
//! │  └─────────────────────────┘                                        │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │   Discovery (mDNS/DNS-SD)  ·  Sync (signature delta over TCP)       │
//! │   Reverse proxy (RR / least-conn)  ·  Secrets (AES-GCM)  ·  Nets    │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Container Lifecycle
//!
//! ```text
//!   ┌──────────┐  create  ┌─────────┐  start  ┌─────────┐
//!   │ creating │ ───────► │ created │ ──────► │ running │
//!   └──────────┘          └─────────┘         └────┬────┘
//!                              │                   │
//!                              │ remove       exit │ / stop
//!                              ▼                   ▼
//!                         ┌─────────┐         ┌─────────┐   restart
//!                         │ deleted │ ◄────── │ stopped │ ◄─────────┐
//!                         └─────────┘ remove  └─────────┘  policy   │
//!                                             ┌─────────┐ ──────────┘
//!                                             │ failed  │
//!                                             └─────────┘
//! ```
//!
//! # Replica Bring-Up (chirp)
//!
//! ```text
//! node B: chirp --sync <id>
//!   1. multicast query _budgie._tcp.local
//!   2. replica spec (fresh id, mirrored image/port, rw volume → /data)
//!   3. manager.create (pulls image)
//!   4. sync pass against <primary>:18733 (failure is non-fatal)
//!   5. manager.start + announce
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use budgie::bundle::Bundle;
//! use budgie::manager::Manager;
//! use budgie::runtime::ProcessRuntime;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> budgie::Result<()> {
//!     let data_dir = std::path::PathBuf::from("/var/lib/budgie");
//!     let runtime = Arc::new(ProcessRuntime::new(data_dir.clone())?);
//!     let manager = Manager::new(runtime, data_dir)?;
//!
//!     let ctr = Bundle::parse(Path::new("web.bun"))?
//!         .into_container(Path::new("web.bun"))?;
//!     let id = manager.create(ctr).await?;
//!     manager.start(&id).await?;
//!     Ok(())
//! }
//! ```

pub mod bundle;
pub mod chirp;
pub mod config;
pub mod constants;
pub mod container;
pub mod depend;
pub mod discovery;
pub mod error;
pub mod manager;
pub mod monitor;
pub mod network;
pub mod proxy;
pub mod runtime;
pub mod secrets;
pub mod store;
pub mod sync;

pub use error::{Error, Result};
