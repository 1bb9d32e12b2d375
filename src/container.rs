//! Container model and identity.
//!
//! This module defines the authoritative container entity, its state
//! machine vocabulary, and ID generation. Containers are created from
//! bundles, owned by the lifecycle manager, and persisted as JSON.

use crate::constants::{CONTAINER_ID_LEN, SHORT_ID_LEN};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Container State
// =============================================================================

/// Lifecycle state of a container.
///
/// Transitions form a DAG:
///
/// ```text
///   creating ──► created ──► running ──► stopped
///                   ▲           ▲  │        │
///                   │           │  └──► failed
///                   │           └───────┘ (restart policy)
/// ```
///
/// `created` and `stopped` may transition to deletion; `running` may not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Container is being created.
    Creating,
    /// Runtime object exists but no task has been spawned.
    Created,
    /// A runtime task is executing.
    Running,
    /// The task exited with code 0 or was stopped.
    Stopped,
    /// The task is paused.
    Paused,
    /// The task exited non-zero or was marked unhealthy.
    Failed,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Paused => write!(f, "paused"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// =============================================================================
// Spec Fragments
// =============================================================================

/// Port mapping between container and host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
    /// "tcp" or "udp".
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// Volume mount mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMapping {
    pub source: String,
    pub target: String,
    /// "rw" or "ro".
    #[serde(default = "default_volume_mode")]
    pub mode: String,
}

fn default_volume_mode() -> String {
    "rw".to_string()
}

impl VolumeMapping {
    /// Returns true if the mount is read-write (and therefore synced).
    pub fn is_rw(&self) -> bool {
        self.mode == "rw"
    }
}

/// HTTP health check configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Path probed on the container's first mapped host port.
    pub path: String,
    /// Seconds between probes (0 = default).
    #[serde(default)]
    pub interval: u64,
    /// Seconds before a probe is abandoned (0 = default).
    #[serde(default)]
    pub timeout: u64,
    /// Failing streak length before the container is marked unhealthy
    /// (0 = default).
    #[serde(default)]
    pub retries: u32,
}

/// Replica bounds carried on the bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicasConfig {
    pub min: u32,
    pub max: u32,
}

/// Resource limits applied at runtime create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU shares (relative weight).
    #[serde(default)]
    pub cpu_shares: u64,
    /// CPU CFS quota in microseconds.
    #[serde(default)]
    pub cpu_quota: i64,
    /// Memory limit in bytes.
    #[serde(default)]
    pub memory_limit: u64,
    /// Memory + swap limit in bytes; must be >= memory_limit when set.
    #[serde(default)]
    pub memory_swap: u64,
    /// Block I/O weight, 10-1000.
    #[serde(default)]
    pub blkio_weight: u16,
    /// Maximum number of PIDs.
    #[serde(default)]
    pub pids_limit: i64,
}

impl ResourceLimits {
    /// Validates cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.memory_swap > 0 && self.memory_limit > 0 && self.memory_swap < self.memory_limit {
            return Err(Error::Validation {
                field: "resources.memory_swap".to_string(),
                reason: "memory+swap limit must be >= memory limit".to_string(),
            });
        }
        if self.blkio_weight > 0 && !(10..=1000).contains(&self.blkio_weight) {
            return Err(Error::Validation {
                field: "resources.blkio_weight".to_string(),
                reason: "block I/O weight must be between 10 and 1000".to_string(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Restart Policy
// =============================================================================

/// Restart behavior applied by the restart monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicyKind {
    /// Never restart.
    No,
    /// Restart on every exit.
    Always,
    /// Restart only on non-zero exit, bounded by the retry count.
    OnFailure,
    /// Restart on any exit that was not a user-invoked stop.
    UnlessStopped,
}

impl std::str::FromStr for RestartPolicyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "no" => Ok(Self::No),
            "always" => Ok(Self::Always),
            "on-failure" => Ok(Self::OnFailure),
            "unless-stopped" => Ok(Self::UnlessStopped),
            other => Err(Error::UnknownRestartPolicy(other.to_string())),
        }
    }
}

/// Restart policy with its retry bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub name: RestartPolicyKind,
    /// Maximum retries for `on-failure`; 0 means unbounded.
    #[serde(default)]
    pub maximum_retry_count: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            name: RestartPolicyKind::No,
            maximum_retry_count: 0,
        }
    }
}

// =============================================================================
// Image and Network Config
// =============================================================================

/// Image reference and process overrides.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Registry image reference, e.g. `nginx:alpine`.
    pub docker_image: String,
    /// Optional command override.
    #[serde(default)]
    pub command: Vec<String>,
    /// Optional working directory.
    #[serde(default)]
    pub workdir: String,
}

/// Per-container network settings (metadata only; the kernel is not
/// programmed by this layer).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gateway: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_hosts: Vec<String>,
}

// =============================================================================
// Container
// =============================================================================

/// The authoritative container entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    /// 64-hex-character random ID; the first 12 characters are never all
    /// digits (the short id doubles as a default hostname).
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub image: ImageConfig,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub volumes: Vec<VolumeMapping>,
    /// Environment strings in `KEY=VALUE` form.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<ReplicasConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceLimits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_config: Option<NetworkConfig>,

    /// Hostname of the node that first ran this workload.
    pub node_id: String,
    /// Node ids of known replicas.
    #[serde(default)]
    pub peers: Vec<String>,

    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Restart attempts performed by the restart monitor. Reset on manual
    /// start.
    #[serde(default)]
    pub restart_count: u32,
    /// Set when a user-invoked stop transitioned this container; the only
    /// place the store remembers intent (drives `unless-stopped`).
    #[serde(default)]
    pub user_stopped: bool,
}

impl Container {
    /// Returns the first 12 characters of the id (or the whole id when
    /// shorter).
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    /// Returns true if the container is in the running state.
    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }

    /// Returns the first port mapping with a host port, if any.
    pub fn primary_port(&self) -> Option<&PortMapping> {
        self.ports.iter().find(|p| p.host_port > 0)
    }

    /// Effective health probe interval.
    pub fn health_interval(&self) -> Duration {
        match &self.health_check {
            Some(h) if h.interval > 0 => Duration::from_secs(h.interval),
            _ => crate::constants::DEFAULT_HEALTH_INTERVAL,
        }
    }

    /// Effective health probe timeout.
    pub fn health_timeout(&self) -> Duration {
        match &self.health_check {
            Some(h) if h.timeout > 0 => Duration::from_secs(h.timeout),
            _ => crate::constants::DEFAULT_HEALTH_TIMEOUT,
        }
    }

    /// Effective failing streak threshold.
    pub fn health_retries(&self) -> u32 {
        match &self.health_check {
            Some(h) if h.retries > 0 => h.retries,
            _ => crate::constants::DEFAULT_HEALTH_RETRIES,
        }
    }
}

/// Returns the short form of a container id.
pub fn short_id(id: &str) -> &str {
    if id.len() >= SHORT_ID_LEN {
        &id[..SHORT_ID_LEN]
    } else {
        id
    }
}

/// Generates a unique 64-hex-character container ID.
///
/// Retries until the 12-character prefix contains a non-digit so the short
/// id never collides with purely numeric hostnames. RNG failures are
/// propagated, never panicked over.
pub fn generate_id() -> Result<String> {
    let mut buf = [0u8; CONTAINER_ID_LEN / 2];
    loop {
        rand::rngs::OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| Error::Rng(e.to_string()))?;
        let id = hex::encode(buf);
        if !id[..SHORT_ID_LEN].bytes().all(|b| b.is_ascii_digit()) {
            return Ok(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_shape() {
        let id = generate_id().unwrap();
        assert_eq!(id.len(), CONTAINER_ID_LEN);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
        assert!(!id[..SHORT_ID_LEN].bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn test_short_id_is_prefix() {
        let id = generate_id().unwrap();
        assert_eq!(short_id(&id), &id[..12]);
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_restart_policy_parsing() {
        assert_eq!(
            "on-failure".parse::<RestartPolicyKind>().unwrap(),
            RestartPolicyKind::OnFailure
        );
        assert!("sometimes".parse::<RestartPolicyKind>().is_err());
    }

    #[test]
    fn test_resource_limit_validation() {
        let ok = ResourceLimits {
            memory_limit: 256,
            memory_swap: 512,
            ..Default::default()
        };
        assert!(ok.validate().is_ok());

        let bad = ResourceLimits {
            memory_limit: 512,
            memory_swap: 256,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad_weight = ResourceLimits {
            blkio_weight: 5,
            ..Default::default()
        };
        assert!(bad_weight.validate().is_err());
    }
}
