//! Container lifecycle manager.
//!
//! The manager owns the in-memory container map and the on-disk snapshot,
//! and is the sole writer of state transitions. Every mutating operation
//! takes the exclusion lock across the runtime call and the subsequent
//! state/store update, so readers observe either the pre-state or the
//! post-state, never a torn intermediate.
//!
//! Persistence failures after a runtime action has succeeded are logged at
//! ERROR but do not fail the operation: the runtime state is authoritative
//! and the snapshot reconciles at the next successful write.

use crate::constants::{LOG_TAIL_BYTES_PER_LINE, STATE_FILE};
use crate::container::{short_id, Container, ContainerState};
use crate::error::{Error, Result};
use crate::runtime::{ExecOptions, ExecResult, Runtime, TaskStatus};
use crate::store::{init_data_dir, SnapshotFile};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Options for log retrieval.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Return only the last N lines (approximate byte-seek).
    pub tail: Option<u64>,
    /// Prefix each line with its raw text timestamp if present.
    pub timestamps: bool,
    /// Best-effort: drop lines whose leading timestamp parses older than
    /// this.
    pub since: Option<DateTime<Utc>>,
}

/// Container lifecycle manager.
pub struct Manager {
    runtime: Arc<dyn Runtime>,
    containers: Mutex<HashMap<String, Container>>,
    snapshot: SnapshotFile,
    data_dir: PathBuf,
    /// Back-reference handed to spawned exit watchers.
    self_ref: Weak<Manager>,
}

impl Manager {
    /// Creates a manager rooted at `data_dir`, loading any persisted
    /// snapshot. Failure to create the data directory is fatal.
    pub fn new(runtime: Arc<dyn Runtime>, data_dir: PathBuf) -> Result<Arc<Self>> {
        init_data_dir(&data_dir)?;
        let snapshot = SnapshotFile::new(data_dir.join(STATE_FILE));

        let mut containers = HashMap::new();
        match snapshot.load::<Container>() {
            Ok(list) => {
                for ctr in list {
                    containers.insert(ctr.id.clone(), ctr);
                }
            }
            Err(e) => warn!("failed to load container state, starting fresh: {e}"),
        }

        Ok(Arc::new_cyclic(|self_ref| Self {
            runtime,
            containers: Mutex::new(containers),
            snapshot,
            data_dir,
            self_ref: self_ref.clone(),
        }))
    }

    /// Returns the data directory this manager persists under.
    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    /// Returns the runtime adapter.
    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    /// Persists the current map; errors are logged, never returned.
    fn persist(&self, containers: &HashMap<String, Container>) {
        let list: Vec<&Container> = containers.values().collect();
        if let Err(e) = self.snapshot.save(&list) {
            error!("failed to save container state: {e}");
        }
    }

    // =========================================================================
    // Lifecycle Operations
    // =========================================================================

    /// Creates a container: pulls the image, materialises mounts and
    /// limits through the runtime, transitions to `created`, persists.
    ///
    /// A create failure leaves no in-memory record behind.
    pub async fn create(&self, mut ctr: Container) -> Result<String> {
        let mut containers = self.containers.lock().await;

        if containers.contains_key(&ctr.id) {
            return Err(Error::ContainerExists(ctr.id));
        }

        self.runtime.create(&ctr).await?;

        ctr.state = ContainerState::Created;
        let id = ctr.id.clone();
        info!("created container {} ({})", short_id(&id), ctr.name);
        containers.insert(id.clone(), ctr);
        self.persist(&containers);

        Ok(id)
    }

    /// Starts a container from `created` or `stopped`.
    ///
    /// This is the user-invoked path: the restart counter is reset and the
    /// explicit-stop marker cleared. An asynchronous exit watcher records
    /// the task's exit code and drives the stopped/failed transition.
    pub async fn start(&self, id: &str) -> Result<()> {
        self.start_inner(id, false).await
    }

    /// Starts a container on behalf of the restart monitor: accepts the
    /// `failed` state and increments the restart counter instead of
    /// resetting it.
    pub async fn start_for_restart(&self, id: &str) -> Result<()> {
        self.start_inner(id, true).await
    }

    async fn start_inner(&self, id: &str, restart: bool) -> Result<()> {
        let mut containers = self.containers.lock().await;

        let ctr = containers
            .get_mut(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;

        let startable = match ctr.state {
            ContainerState::Created | ContainerState::Stopped => true,
            ContainerState::Failed => restart,
            _ => false,
        };
        if !startable {
            return Err(Error::InvalidState {
                id: id.to_string(),
                state: ctr.state.to_string(),
                expected: if restart {
                    "stopped or failed".to_string()
                } else {
                    "created or stopped".to_string()
                },
            });
        }

        self.runtime.start(id).await?;

        ctr.state = ContainerState::Running;
        ctr.started_at = Some(Utc::now());
        ctr.exit_code = None;
        if restart {
            ctr.restart_count += 1;
        } else {
            ctr.restart_count = 0;
            ctr.user_stopped = false;
        }

        let generation = ctr.started_at;
        info!("started container {}", short_id(id));
        self.persist(&containers);
        drop(containers);

        self.spawn_exit_watcher(id.to_string(), generation);
        Ok(())
    }

    /// Installs the exit watcher for a started task. The watcher ignores
    /// stale generations (a stop-and-restart supersedes it).
    fn spawn_exit_watcher(&self, id: String, generation: Option<DateTime<Utc>>) {
        let Some(manager) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let code = match manager.runtime.wait(&id).await {
                Ok(code) => code,
                Err(e) => {
                    warn!("exit watcher for {} lost the task: {e}", short_id(&id));
                    return;
                }
            };

            let mut containers = manager.containers.lock().await;
            let Some(ctr) = containers.get_mut(&id) else {
                return;
            };
            if ctr.state != ContainerState::Running || ctr.started_at != generation {
                // A stop or restart already transitioned this container.
                return;
            }

            ctr.exit_code = Some(code);
            ctr.exited_at = Some(Utc::now());
            ctr.state = if code == 0 {
                ContainerState::Stopped
            } else {
                ContainerState::Failed
            };
            info!(
                "container {} exited with status {code}",
                short_id(&id)
            );
            manager.persist(&containers);
        });
    }

    /// Stops a running container: graceful signal, wait up to `timeout`,
    /// force-kill on expiry. Marks the stop as user intent.
    pub async fn stop(&self, id: &str, timeout: Duration) -> Result<()> {
        let mut containers = self.containers.lock().await;

        let ctr = containers
            .get_mut(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;

        if ctr.state != ContainerState::Running {
            return Err(Error::InvalidState {
                id: id.to_string(),
                state: ctr.state.to_string(),
                expected: "running".to_string(),
            });
        }

        self.runtime.stop(id, timeout).await?;

        ctr.state = ContainerState::Stopped;
        ctr.exited_at = Some(Utc::now());
        ctr.user_stopped = true;
        info!("stopped container {}", short_id(id));
        self.persist(&containers);

        Ok(())
    }

    /// Removes a non-running container, deleting the runtime object and
    /// optionally its volume sources.
    pub async fn remove(&self, id: &str, remove_volumes: bool) -> Result<()> {
        let mut containers = self.containers.lock().await;

        let ctr = containers
            .get(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;

        if ctr.state == ContainerState::Running {
            return Err(Error::InvalidState {
                id: id.to_string(),
                state: "running".to_string(),
                expected: "any non-running state".to_string(),
            });
        }

        self.runtime.delete(id).await?;

        let removed = containers.remove(id);
        if remove_volumes {
            if let Some(ctr) = &removed {
                for vol in &ctr.volumes {
                    if let Err(e) = std::fs::remove_dir_all(&vol.source) {
                        warn!("failed to remove volume {}: {e}", vol.source);
                    }
                }
            }
        }

        info!("removed container {}", short_id(id));
        self.persist(&containers);
        Ok(())
    }

    /// Marks a running container failed (used by the health monitor); the
    /// restart monitor picks it up from there.
    pub async fn mark_failed(&self, id: &str) -> Result<()> {
        let mut containers = self.containers.lock().await;

        let ctr = containers
            .get_mut(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;

        if ctr.state != ContainerState::Running {
            return Ok(());
        }

        ctr.state = ContainerState::Failed;
        ctr.exited_at = Some(Utc::now());
        warn!("container {} marked failed", short_id(id));
        self.persist(&containers);
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Returns a snapshot of one container.
    pub async fn get(&self, id: &str) -> Result<Container> {
        let containers = self.containers.lock().await;
        containers
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))
    }

    /// Returns a snapshot of all containers.
    pub async fn list(&self) -> Vec<Container> {
        let containers = self.containers.lock().await;
        containers.values().cloned().collect()
    }

    /// Resolves a full id, id prefix, or exact name to a container id.
    ///
    /// A prefix matching several containers is an error carrying the
    /// colliding short ids.
    pub async fn resolve(&self, id_or_prefix: &str) -> Result<String> {
        let containers = self.containers.lock().await;

        if containers.contains_key(id_or_prefix) {
            return Ok(id_or_prefix.to_string());
        }

        let matches: Vec<&Container> = containers
            .values()
            .filter(|c| c.id.starts_with(id_or_prefix) || c.name == id_or_prefix)
            .collect();

        match matches.len() {
            0 => Err(Error::ContainerNotFound(id_or_prefix.to_string())),
            1 => Ok(matches[0].id.clone()),
            _ => Err(Error::AmbiguousPrefix {
                prefix: id_or_prefix.to_string(),
                matches: matches.iter().map(|c| c.short_id().to_string()).collect(),
            }),
        }
    }

    /// Reports the runtime's view of a container task.
    pub async fn task_status(&self, id: &str) -> Result<TaskStatus> {
        self.runtime.status(id).await
    }

    // =========================================================================
    // Logs and Exec
    // =========================================================================

    /// Reads a container's log, honouring tail/since options.
    ///
    /// `tail` is an approximate byte-seek (~100 bytes/line heuristic)
    /// followed by a discard to the next newline; `since` is best-effort
    /// and requires lines to start with an RFC 3339 timestamp.
    pub async fn logs(&self, id: &str, opts: &LogOptions) -> Result<String> {
        let path = self.runtime.logs(id).await?;
        let mut file = std::fs::File::open(&path)?;

        if let Some(lines) = opts.tail {
            let len = file.metadata()?.len();
            let seek_back = lines.saturating_mul(LOG_TAIL_BYTES_PER_LINE);
            if seek_back < len {
                file.seek(SeekFrom::Start(len - seek_back))?;
                let mut rest = String::new();
                file.read_to_string(&mut rest)?;
                // Discard the partial first line the seek landed inside.
                let content = match rest.find('\n') {
                    Some(idx) => rest[idx + 1..].to_string(),
                    None => rest,
                };
                return Ok(self.filter_since(content, opts));
            }
            file.seek(SeekFrom::Start(0))?;
        }

        let mut content = String::new();
        file.read_to_string(&mut content)?;
        Ok(self.filter_since(content, opts))
    }

    fn filter_since(&self, content: String, opts: &LogOptions) -> String {
        let Some(since) = opts.since else {
            return content;
        };
        content
            .lines()
            .filter(|line| {
                let ts = line.split_whitespace().next().unwrap_or("");
                match ts.parse::<DateTime<Utc>>() {
                    Ok(t) => t >= since,
                    // Lines without a parseable timestamp are kept.
                    Err(_) => true,
                }
            })
            .map(|l| format!("{l}\n"))
            .collect()
    }

    /// Executes a command inside a running container.
    pub async fn exec(
        &self,
        id: &str,
        command: &[String],
        opts: ExecOptions,
    ) -> Result<ExecResult> {
        {
            let containers = self.containers.lock().await;
            let ctr = containers
                .get(id)
                .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
            if ctr.state != ContainerState::Running {
                return Err(Error::InvalidState {
                    id: id.to_string(),
                    state: ctr.state.to_string(),
                    expected: "running".to_string(),
                });
            }
        }
        debug!("exec in {}: {:?}", short_id(id), command);
        self.runtime.exec(id, command, opts).await
    }
}
