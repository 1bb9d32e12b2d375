//! In-memory runtime double.
//!
//! Tracks the full create/start/stop/delete lifecycle without touching a
//! container engine. Tasks never exit on their own; the test-suite (or a
//! dry run) finishes them explicitly with [`MemoryRuntime::finish`].

use super::{ExecOptions, ExecResult, ImageSummary, Runtime, TaskStatus};
use crate::container::Container;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

struct MemoryTask {
    status: TaskStatus,
    exit_tx: watch::Sender<Option<i32>>,
}

/// In-memory [`Runtime`] used by tests and dry runs.
#[derive(Default)]
pub struct MemoryRuntime {
    tasks: Mutex<HashMap<String, MemoryTask>>,
    images: Mutex<Vec<ImageSummary>>,
    log_dir: Mutex<Option<PathBuf>>,
    /// When set, the next create call fails with this reason.
    fail_next_create: Mutex<Option<String>>,
    /// When set, the next start call fails with this reason.
    fail_next_start: Mutex<Option<String>>,
}

impl MemoryRuntime {
    /// Creates an empty in-memory runtime.
    pub fn new() -> Self {
        Self::default()
    }

    // The double carries no real resources; a poisoned lock is recovered
    // rather than surfaced.
    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryTask>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Directs log handles at `dir`; the runtime creates empty log files
    /// there on start.
    pub fn with_log_dir(self, dir: PathBuf) -> Self {
        *self.log_dir.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(dir);
        self
    }

    /// Arms a one-shot create failure.
    pub fn fail_next_create(&self, reason: &str) {
        *self.fail_next_create.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(reason.to_string());
    }

    /// Arms a one-shot start failure.
    pub fn fail_next_start(&self, reason: &str) {
        *self.fail_next_start.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(reason.to_string());
    }

    /// Finishes a running task with `exit_code`, waking its exit watcher.
    pub fn finish(&self, id: &str, exit_code: i32) {
        let mut tasks = self.tasks();
        if let Some(task) = tasks.get_mut(id) {
            task.status = TaskStatus::Stopped;
            let _ = task.exit_tx.send(Some(exit_code));
        }
    }

    /// Returns true if the engine knows this container id.
    pub fn exists(&self, id: &str) -> bool {
        self.tasks().contains_key(id)
    }
}

#[async_trait]
impl Runtime for MemoryRuntime {
    fn name(&self) -> &str {
        "memory"
    }

    async fn pull(&self, reference: &str) -> Result<()> {
        let mut images = self.images.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !images.iter().any(|i| i.reference == reference) {
            images.push(ImageSummary {
                reference: reference.to_string(),
                digest: String::new(),
                size: 0,
                pulled_at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn create(&self, ctr: &Container) -> Result<()> {
        if let Some(reason) = self.fail_next_create.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take() {
            return Err(Error::CreateFailed {
                id: ctr.id.clone(),
                reason,
            });
        }

        self.pull(&ctr.image.docker_image).await?;

        let mut tasks = self.tasks();
        if tasks.contains_key(&ctr.id) {
            return Err(Error::ContainerExists(ctr.id.clone()));
        }
        let (exit_tx, _) = watch::channel(None);
        tasks.insert(
            ctr.id.clone(),
            MemoryTask {
                status: TaskStatus::Created,
                exit_tx,
            },
        );
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        if let Some(reason) = self.fail_next_start.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take() {
            return Err(Error::StartFailed {
                id: id.to_string(),
                reason,
            });
        }

        let mut tasks = self.tasks();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
        // Restarted tasks get a fresh exit channel.
        let (exit_tx, _) = watch::channel(None);
        task.exit_tx = exit_tx;
        task.status = TaskStatus::Running;
        drop(tasks);

        if let Some(dir) = self.log_dir.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone() {
            let _ = std::fs::create_dir_all(&dir);
            let _ = std::fs::File::create(dir.join(format!("{}.log", crate::container::short_id(id))));
        }
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i32> {
        let mut rx = {
            let tasks = self.tasks();
            let task = tasks
                .get(id)
                .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
            task.exit_tx.subscribe()
        };

        loop {
            if let Some(code) = *rx.borrow() {
                return Ok(code);
            }
            if rx.changed().await.is_err() {
                return Err(Error::Internal(format!("exit channel closed for {id}")));
            }
        }
    }

    async fn stop(&self, id: &str, _timeout: Duration) -> Result<()> {
        let mut tasks = self.tasks();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
        task.status = TaskStatus::Stopped;
        let _ = task.exit_tx.send(Some(0));
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.tasks().remove(id);
        Ok(())
    }

    async fn status(&self, id: &str) -> Result<TaskStatus> {
        let tasks = self.tasks();
        let task = tasks
            .get(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
        Ok(task.status)
    }

    async fn logs(&self, id: &str) -> Result<PathBuf> {
        let dir = self
            .log_dir
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| Error::NotSupported("memory runtime has no log dir".to_string()))?;
        Ok(dir.join(format!("{}.log", crate::container::short_id(id))))
    }

    async fn exec(&self, id: &str, _command: &[String], _opts: ExecOptions) -> Result<ExecResult> {
        let tasks = self.tasks();
        match tasks.get(id).map(|t| t.status) {
            Some(TaskStatus::Running) => Ok(ExecResult {
                exit_code: 0,
                stdout: Vec::new(),
                stderr: Vec::new(),
            }),
            Some(_) => Err(Error::InvalidState {
                id: id.to_string(),
                state: "stopped".to_string(),
                expected: "running".to_string(),
            }),
            None => Err(Error::ContainerNotFound(id.to_string())),
        }
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        Ok(self.images.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone())
    }
}
