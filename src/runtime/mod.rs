//! Runtime adapter - narrow contract over the host container engine.
//!
//! The core never talks to a container engine directly; it consumes this
//! trait. Implementations are tagged variants behind the contract:
//!
//! - [`ProcessRuntime`]: executes workloads as supervised host processes,
//!   materialising mounts and log files under the data directory.
//! - [`MemoryRuntime`]: an in-memory double used by the test-suite and by
//!   dry runs; tasks are finished explicitly by the caller.
//!
//! # Lifecycle
//!
//! ```text
//! pull(image) → create(ctr) → start(id) → [wait(id)] → stop(id) → delete(id)
//! ```
//!
//! `wait` resolves when the task exits and yields its exit code; the
//! lifecycle manager installs it as an asynchronous exit watcher.

mod memory;
mod process;

pub use memory::MemoryRuntime;
pub use process::ProcessRuntime;

use crate::container::Container;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Task Status
// =============================================================================

/// Status of a runtime task as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Container object exists but no task was spawned.
    Created,
    /// Task is executing.
    Running,
    /// Task has exited or was never started.
    Stopped,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

// =============================================================================
// Exec
// =============================================================================

/// Options for executing a command inside a running container.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Attach stdin.
    pub interactive: bool,
    /// Allocate a TTY.
    pub tty: bool,
    /// Run detached, without collecting output.
    pub detach: bool,
    /// Run as this user.
    pub user: Option<String>,
    /// Working directory override.
    pub workdir: Option<String>,
    /// Extra environment entries in `KEY=VALUE` form.
    pub env: Vec<String>,
}

/// Result of an exec invocation.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecResult {
    /// Returns true if the command exited zero.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

// =============================================================================
// Images
// =============================================================================

/// Summary of a locally known image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSummary {
    pub reference: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub size: u64,
    pub pulled_at: chrono::DateTime<chrono::Utc>,
}

// =============================================================================
// Runtime Trait
// =============================================================================

/// Narrow container-engine contract consumed by the core.
///
/// All operations take deadlines from the caller's context; cancellation
/// surfaces as the propagated error and never leaves the adapter holding a
/// half-created task.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Returns the runtime variant name.
    fn name(&self) -> &str;

    /// Pulls an image from its registry.
    async fn pull(&self, reference: &str) -> Result<()>;

    /// Creates the engine-side container: pulls the image if needed and
    /// materialises mounts, environment, and resource limits. No task is
    /// spawned.
    async fn create(&self, ctr: &Container) -> Result<()>;

    /// Spawns the container task.
    async fn start(&self, id: &str) -> Result<()>;

    /// Resolves when the container's task exits, yielding its exit code.
    async fn wait(&self, id: &str) -> Result<i32>;

    /// Stops the task: graceful signal, wait up to `timeout`, force-kill on
    /// expiry, then delete the task.
    async fn stop(&self, id: &str, timeout: Duration) -> Result<()>;

    /// Deletes the engine-side container and its snapshot.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Reports the engine's view of the task.
    async fn status(&self, id: &str) -> Result<TaskStatus>;

    /// Returns a readable log file for the container.
    async fn logs(&self, id: &str) -> Result<PathBuf>;

    /// Executes a command inside a running container.
    async fn exec(&self, id: &str, command: &[String], opts: ExecOptions) -> Result<ExecResult>;

    /// Lists locally known images.
    async fn list_images(&self) -> Result<Vec<ImageSummary>>;
}
