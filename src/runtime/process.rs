//! Process-backed runtime variant.
//!
//! Runs each workload as a supervised host process. The image reference is
//! recorded in a local image list; the container command (or a default
//! shell) becomes the spawned process, with environment entries applied
//! and stdout/stderr redirected to `<data_dir>/logs/<short_id>.log`.
//!
//! This variant exists for nodes without a container engine socket and for
//! exercising the full orchestration path end-to-end; resource limits are
//! accepted but only validated, not enforced.

use super::{ExecOptions, ExecResult, ImageSummary, Runtime, TaskStatus};
use crate::constants::{CONTAINERS_DIR, LOGS_DIR};
use crate::container::{short_id, Container};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

struct ProcessTask {
    spec: Container,
    status: TaskStatus,
    pid: Option<u32>,
    exit_tx: watch::Sender<Option<i32>>,
    log_path: PathBuf,
}

/// [`Runtime`] variant executing workloads as host processes.
pub struct ProcessRuntime {
    data_dir: PathBuf,
    tasks: Mutex<HashMap<String, ProcessTask>>,
    images: Mutex<Vec<ImageSummary>>,
}

impl ProcessRuntime {
    /// Creates a process runtime rooted at `data_dir`.
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(data_dir.join(LOGS_DIR))?;
        std::fs::create_dir_all(data_dir.join(CONTAINERS_DIR))?;
        Ok(Self {
            data_dir,
            tasks: Mutex::new(HashMap::new()),
            images: Mutex::new(Vec::new()),
        })
    }

    fn log_path(&self, id: &str) -> PathBuf {
        self.data_dir.join(LOGS_DIR).join(format!("{}.log", short_id(id)))
    }

    fn tasks(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, ProcessTask>>> {
        self.tasks
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))
    }

    fn images(&self) -> Result<std::sync::MutexGuard<'_, Vec<ImageSummary>>> {
        self.images
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))
    }

    fn spec_path(&self, id: &str) -> PathBuf {
        self.data_dir.join(CONTAINERS_DIR).join(format!("{id}.json"))
    }

    /// Rehydrates a task entry from the persisted spec, for containers
    /// created by an earlier process.
    fn hydrate(&self, id: &str) -> Result<()> {
        {
            let tasks = self.tasks()?;
            if tasks.contains_key(id) {
                return Ok(());
            }
        }

        let data = std::fs::read(self.spec_path(id))
            .map_err(|_| Error::ContainerNotFound(id.to_string()))?;
        let spec: Container = serde_json::from_slice(&data)?;

        let (exit_tx, _) = watch::channel(None);
        let log_path = self.log_path(id);
        self.tasks()?.insert(
            id.to_string(),
            ProcessTask {
                spec,
                status: TaskStatus::Stopped,
                pid: None,
                exit_tx,
                log_path,
            },
        );
        Ok(())
    }

    /// Builds the command for a container spec.
    fn build_command(spec: &Container) -> Vec<String> {
        if !spec.image.command.is_empty() {
            spec.image.command.clone()
        } else {
            // No engine to resolve an entrypoint; idle so the workload
            // stays observable until stopped.
            vec!["sleep".to_string(), "infinity".to_string()]
        }
    }
}

#[async_trait]
impl Runtime for ProcessRuntime {
    fn name(&self) -> &str {
        "process"
    }

    async fn pull(&self, reference: &str) -> Result<()> {
        let mut images = self.images()?;
        if !images.iter().any(|i| i.reference == reference) {
            images.push(ImageSummary {
                reference: reference.to_string(),
                digest: String::new(),
                size: 0,
                pulled_at: Utc::now(),
            });
            info!("recorded image {reference}");
        }
        Ok(())
    }

    async fn create(&self, ctr: &Container) -> Result<()> {
        self.pull(&ctr.image.docker_image).await?;

        if let Some(res) = &ctr.resources {
            res.validate()?;
        }

        // Materialise volume sources so mounts exist before start.
        for vol in &ctr.volumes {
            std::fs::create_dir_all(&vol.source).map_err(|e| Error::CreateFailed {
                id: ctr.id.clone(),
                reason: format!("failed to create volume source {}: {e}", vol.source),
            })?;
        }

        let mut tasks = self.tasks()?;
        if tasks.contains_key(&ctr.id) {
            return Err(Error::ContainerExists(ctr.id.clone()));
        }

        std::fs::write(self.spec_path(&ctr.id), serde_json::to_vec_pretty(ctr)?)?;

        let (exit_tx, _) = watch::channel(None);
        let log_path = self.log_path(&ctr.id);
        tasks.insert(
            ctr.id.clone(),
            ProcessTask {
                spec: ctr.clone(),
                status: TaskStatus::Created,
                pid: None,
                exit_tx,
                log_path,
            },
        );
        debug!("created process container {}", short_id(&ctr.id));
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.hydrate(id)?;
        let (command, env, workdir, log_path) = {
            let tasks = self.tasks()?;
            let task = tasks
                .get(id)
                .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
            (
                Self::build_command(&task.spec),
                task.spec.env.clone(),
                task.spec.image.workdir.clone(),
                task.log_path.clone(),
            )
        };

        let log_file = std::fs::File::create(&log_path).map_err(|e| Error::StartFailed {
            id: id.to_string(),
            reason: format!("failed to open log file: {e}"),
        })?;
        let log_err = log_file.try_clone().map_err(|e| Error::StartFailed {
            id: id.to_string(),
            reason: e.to_string(),
        })?;

        let mut cmd = Command::new(&command[0]);
        cmd.args(&command[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_err));
        if !workdir.is_empty() {
            cmd.current_dir(&workdir);
        }
        for entry in &env {
            if let Some((k, v)) = entry.split_once('=') {
                cmd.env(k, v);
            }
        }

        let mut child = cmd.spawn().map_err(|e| Error::StartFailed {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id();

        let (exit_tx, _) = watch::channel(None);
        {
            let mut tasks = self.tasks()?;
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
            task.status = TaskStatus::Running;
            task.pid = pid;
            task.exit_tx = exit_tx.clone();
        }

        // Reaper task: resolves exit watchers and flips the engine status.
        let reaper_id = id.to_string();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!("wait failed for {}: {e}", short_id(&reaper_id));
                    -1
                }
            };
            let _ = exit_tx.send(Some(code));
        });

        info!("started process container {} (pid {:?})", short_id(id), pid);
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i32> {
        let mut rx = {
            let tasks = self.tasks()?;
            let task = tasks
                .get(id)
                .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
            task.exit_tx.subscribe()
        };

        loop {
            if let Some(code) = *rx.borrow() {
                // Reflect the exit in the engine status.
                if let Some(task) = self.tasks()?.get_mut(id) {
                    task.status = TaskStatus::Stopped;
                    task.pid = None;
                }
                return Ok(code);
            }
            if rx.changed().await.is_err() {
                return Err(Error::Internal(format!("exit channel closed for {id}")));
            }
        }
    }

    async fn stop(&self, id: &str, timeout: Duration) -> Result<()> {
        let entry = {
            let tasks = self.tasks()?;
            tasks.get(id).map(|t| (t.pid, t.exit_tx.subscribe()))
        };

        // An absent or task-less container is already stopped.
        let Some((Some(pid), mut rx)) = entry else {
            debug!("container {} has no running task", short_id(id));
            return Ok(());
        };

        // SAFETY: signalling a pid we spawned and still track.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        let graceful = tokio::time::timeout(timeout, async {
            loop {
                if rx.borrow().is_some() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;

        if graceful.is_err() {
            warn!(
                "container {} did not stop within {:?}, sending SIGKILL",
                short_id(id),
                timeout
            );
            // SAFETY: as above.
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
            loop {
                if rx.borrow().is_some() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }

        let mut tasks = self.tasks()?;
        if let Some(task) = tasks.get_mut(id) {
            task.status = TaskStatus::Stopped;
            task.pid = None;
        }
        info!("stopped container {}", short_id(id));
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut tasks = self.tasks()?;
        if let Some(task) = tasks.get(id) {
            if task.status == TaskStatus::Running {
                return Err(Error::InvalidState {
                    id: id.to_string(),
                    state: "running".to_string(),
                    expected: "created or stopped".to_string(),
                });
            }
        }
        tasks.remove(id);
        let _ = std::fs::remove_file(self.spec_path(id));
        debug!("deleted container {}", short_id(id));
        Ok(())
    }

    async fn status(&self, id: &str) -> Result<TaskStatus> {
        let tasks = self.tasks()?;
        match tasks.get(id) {
            Some(task) => Ok(task.status),
            // Created by an earlier process; no live task here.
            None if self.spec_path(id).exists() => Ok(TaskStatus::Stopped),
            None => Err(Error::ContainerNotFound(id.to_string())),
        }
    }

    async fn logs(&self, id: &str) -> Result<PathBuf> {
        Ok(self.log_path(id))
    }

    async fn exec(&self, id: &str, command: &[String], opts: ExecOptions) -> Result<ExecResult> {
        {
            let tasks = self.tasks()?;
            let task = tasks
                .get(id)
                .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
            if task.status != TaskStatus::Running {
                return Err(Error::InvalidState {
                    id: id.to_string(),
                    state: task.status.to_string(),
                    expected: "running".to_string(),
                });
            }
        }

        if command.is_empty() {
            return Err(Error::ExecFailed {
                id: id.to_string(),
                reason: "empty command".to_string(),
            });
        }

        let mut cmd = Command::new(&command[0]);
        cmd.args(&command[1..]);
        if let Some(dir) = &opts.workdir {
            cmd.current_dir(dir);
        }
        for entry in &opts.env {
            if let Some((k, v)) = entry.split_once('=') {
                cmd.env(k, v);
            }
        }

        if opts.detach {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
            cmd.spawn().map_err(|e| Error::ExecFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
            return Ok(ExecResult {
                exit_code: 0,
                stdout: Vec::new(),
                stderr: Vec::new(),
            });
        }

        let output = cmd.output().await.map_err(|e| Error::ExecFailed {
            id: id.to_string(),
            reason: e.to_string(),
        })?;

        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        Ok(self.images()?.clone())
    }
}
