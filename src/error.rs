//! Error types for the budgie core.

use std::path::PathBuf;

/// Result type alias for budgie operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the budgie core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Bundle or request failed validation; nothing was changed.
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    /// Bundle file could not be parsed.
    #[error("failed to parse bundle {path}: {reason}")]
    BundleParse { path: PathBuf, reason: String },

    /// Subnet string is not a valid CIDR.
    #[error("invalid subnet '{0}'")]
    InvalidCidr(String),

    /// Gateway address does not belong to the network's subnet.
    #[error("gateway {gateway} is not within subnet {subnet}")]
    GatewayOutsideSubnet { gateway: String, subnet: String },

    /// Unknown restart policy name.
    #[error("unknown restart policy: {0}")]
    UnknownRestartPolicy(String),

    // =========================================================================
    // Conflict Errors
    // =========================================================================
    /// Container with this id already exists.
    #[error("container already exists: {0}")]
    ContainerExists(String),

    /// Secret with this name already exists.
    #[error("secret already exists: {0}")]
    SecretExists(String),

    /// Network with this name already exists.
    #[error("network already exists: {0}")]
    NetworkExists(String),

    /// Network still has attached containers.
    #[error("network {name} is in use by {count} container(s)")]
    NetworkInUse { name: String, count: usize },

    /// The default network cannot be removed.
    #[error("cannot remove default network")]
    DefaultNetworkRemoval,

    // =========================================================================
    // Not-Found Errors
    // =========================================================================
    /// Container id or prefix matched nothing.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Secret name matched nothing.
    #[error("secret not found: {0}")]
    SecretNotFound(String),

    /// Network name matched nothing.
    #[error("network not found: {0}")]
    NetworkNotFound(String),

    /// No discovery record matched the requested id.
    #[error("container {0} not found on network")]
    NotDiscovered(String),

    // =========================================================================
    // State Errors
    // =========================================================================
    /// Operation is not legal in the container's current state.
    #[error("container '{id}' is in state '{state}', expected {expected}")]
    InvalidState {
        id: String,
        state: String,
        expected: String,
    },

    // =========================================================================
    // Ambiguity
    // =========================================================================
    /// An id prefix matched more than one container.
    #[error("ambiguous id prefix '{prefix}' matches: {}", matches.join(", "))]
    AmbiguousPrefix {
        prefix: String,
        matches: Vec<String>,
    },

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// Image pull failed.
    #[error("failed to pull image '{reference}': {reason}")]
    ImagePullFailed { reference: String, reason: String },

    /// Runtime-level create failed.
    #[error("failed to create container '{id}': {reason}")]
    CreateFailed { id: String, reason: String },

    /// Task spawn failed.
    #[error("failed to start container '{id}': {reason}")]
    StartFailed { id: String, reason: String },

    /// Runtime-level delete failed.
    #[error("failed to delete container '{id}': {reason}")]
    DeleteFailed { id: String, reason: String },

    /// Exec in a running container failed.
    #[error("exec failed in container '{id}': {reason}")]
    ExecFailed { id: String, reason: String },

    /// Operation not supported by the active runtime variant.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    // =========================================================================
    // Dependency Errors
    // =========================================================================
    /// depends_on edges form a cycle.
    #[error("circular dependency detected involving {0}")]
    DependencyCycle(String),

    /// depends_on references a container that does not exist.
    #[error("container {container} depends on unknown container {dependency}")]
    UnknownDependency {
        container: String,
        dependency: String,
    },

    /// Dependencies did not become ready in time.
    #[error("timeout waiting for dependencies of {0}")]
    DependencyTimeout(String),

    // =========================================================================
    // Crypto Errors
    // =========================================================================
    /// Secret ciphertext failed to authenticate or was malformed.
    #[error("failed to decrypt secret: {0}")]
    Decrypt(String),

    /// OS randomness was unavailable.
    #[error("failed to read from system RNG: {0}")]
    Rng(String),

    // =========================================================================
    // Sync / Discovery / Proxy I/O
    // =========================================================================
    /// Sync wire protocol violation.
    #[error("sync protocol error: {0}")]
    SyncProtocol(String),

    /// A relative path in a sync message escaped the volume root.
    #[error("path escapes volume root: {0}")]
    PathTraversal(String),

    /// Discovery socket or packet failure.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// TLS configuration or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// No active backend is registered for the workload.
    #[error("no backends available for container {0}")]
    NoBackends(String),

    /// Backend endpoint not registered in the pool.
    #[error("backend not found")]
    BackendNotFound,

    // =========================================================================
    // Fatal Errors
    // =========================================================================
    /// Data directory could not be created; the process cannot run.
    #[error("failed to initialize data directory {path}: {reason}")]
    DataDirInit { path: PathBuf, reason: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Timeout on a bounded operation.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the CLI exit code for this error: 3 for unknown
    /// containers, 1 otherwise. The argument parser owns code 2.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::ContainerNotFound(_) | Error::NotDiscovered(_) => 3,
            _ => 1,
        }
    }
}
