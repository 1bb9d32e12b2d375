//! Constants for the budgie core.
//!
//! All ports, timeouts, limits, and file names are defined here to ensure
//! consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Identity
// =============================================================================

/// Length of a full container ID in hex characters (32 random bytes).
pub const CONTAINER_ID_LEN: usize = 64;

/// Length of a short container ID (prefix of the full ID).
pub const SHORT_ID_LEN: usize = 12;

// =============================================================================
// Network Ports
// =============================================================================

/// Default TCP port for the volume sync server.
pub const DEFAULT_SYNC_PORT: u16 = 18733;

/// mDNS multicast port (5353, RFC 6762).
pub const MDNS_PORT: u16 = 5353;

// =============================================================================
// Timeouts and Intervals
// =============================================================================

/// Default graceful stop timeout before SIGKILL.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default discovery query window.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP dial timeout used by the chirp workflow when reaching a sync server.
pub const SYNC_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Restart monitor scan interval.
pub const RESTART_SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound on restart backoff.
pub const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(300);

/// Health monitor wake interval (per-container intervals gate actual probes).
pub const HEALTH_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Default health probe interval when the bundle omits one.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Default health probe timeout when the bundle omits one.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Default failing-probe streak before a container is marked unhealthy.
pub const DEFAULT_HEALTH_RETRIES: u32 = 3;

/// Poll granularity for dependency readiness waits.
pub const DEPENDENCY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default reverse-proxy backend probe interval.
pub const PROXY_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Deadline for a single reverse-proxy backend probe.
pub const PROXY_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Health Tracking
// =============================================================================

/// Number of recent probe results retained per container.
pub const HEALTH_LOG_DEPTH: usize = 5;

/// Path probed on proxy backends.
pub const PROXY_HEALTH_PATH: &str = "/_health";

// =============================================================================
// Sync Protocol
// =============================================================================

/// Bytes of file head and tail folded into the quick checksum.
pub const QUICK_CHECKSUM_WINDOW: usize = 1024;

/// Files at or below this size also carry a full SHA-256 in their signature,
/// catching edits that preserve both size and mtime.
pub const FULL_HASH_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Maximum accepted envelope header size on the sync wire.
pub const MAX_SYNC_HEADER_LEN: u32 = 16 * 1024 * 1024;

// =============================================================================
// Discovery
// =============================================================================

/// DNS-SD service type advertised for budgie workloads.
pub const DISCOVERY_SERVICE: &str = "_budgie._tcp.local";

/// TTL for discovery records (seconds).
pub const DISCOVERY_TTL: u32 = 120;

// =============================================================================
// Secret Store
// =============================================================================

/// Salt length for the master key file.
pub const SECRET_SALT_LEN: usize = 32;

/// Master and derived key length.
pub const SECRET_KEY_LEN: usize = 32;

/// PBKDF2-HMAC-SHA256 iteration count.
pub const SECRET_KDF_ITERATIONS: u32 = 100_000;

/// AES-GCM nonce length.
pub const SECRET_NONCE_LEN: usize = 12;

// =============================================================================
// Networks
// =============================================================================

/// Name of the default network, materialised on first boot.
pub const DEFAULT_NETWORK_NAME: &str = "budgie0";

/// CIDR of the default network.
pub const DEFAULT_NETWORK_CIDR: &str = "172.20.0.0/16";

/// Gateway of the default network.
pub const DEFAULT_NETWORK_GATEWAY: &str = "172.20.0.1";

// =============================================================================
// Data Directory Layout
// =============================================================================

/// Container snapshot file under the data directory.
pub const STATE_FILE: &str = "state.json";

/// Secrets snapshot file under the data directory.
pub const SECRETS_FILE: &str = "secrets.json";

/// Master key material for the secret store.
pub const SECRETS_KEY_FILE: &str = ".secrets.key";

/// Networks snapshot file under the data directory.
pub const NETWORKS_FILE: &str = "networks.json";

/// Subdirectory for replica volume roots.
pub const VOLUMES_DIR: &str = "volumes";

/// Subdirectory for per-container log files.
pub const LOGS_DIR: &str = "logs";

/// Subdirectory for per-container auxiliary state.
pub const CONTAINERS_DIR: &str = "containers";

/// Heuristic bytes-per-line used by the approximate log tail seek.
pub const LOG_TAIL_BYTES_PER_LINE: u64 = 100;
