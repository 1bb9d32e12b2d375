//! Daemon and CLI configuration.
//!
//! Configuration is read from `budgie.yaml`, searched in order:
//! `$BUDGIE_CONFIG`, the current directory, `~/.budgie/`,
//! `~/.config/budgie/`, `/etc/budgie/`. Environment variables override
//! individual keys after the file is applied.

use crate::constants::DEFAULT_SYNC_PORT;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Candidate config file names, tried in order inside each search location.
const CONFIG_NAMES: [&str; 4] = ["budgie.yaml", "budgie.yml", ".budgie.yaml", ".budgie.yml"];

/// Top-level budgie configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory for all persisted state.
    pub data_dir: PathBuf,
    /// Address of the containerd socket consumed by the runtime adapter.
    pub containerd_address: String,
    /// Port the volume sync server binds to.
    pub sync_port: u16,
    pub tls: TlsSettings,
    pub discovery: DiscoverySettings,
    pub defaults: ContainerDefaults,
    pub logging: LoggingSettings,
}

/// TLS settings for the sync channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub enabled: bool,
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: String,
}

/// LAN discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub enabled: bool,
    pub domain: String,
    /// Query window in seconds.
    pub timeout: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            domain: "local".to_string(),
            timeout: 10,
        }
    }
}

/// Defaults applied to new containers when the bundle is silent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerDefaults {
    pub restart_policy: String,
    pub max_retries: u32,
    /// Seconds to wait for a graceful stop before SIGKILL.
    pub stop_timeout: u64,
}

impl Default for ContainerDefaults {
    fn default() -> Self {
        Self {
            restart_policy: "no".to_string(),
            max_retries: 3,
            stop_timeout: 10,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// debug, info, warn, error.
    pub level: String,
    /// text or json.
    pub format: String,
    /// Log file path; empty means stdout.
    pub file: String,
    /// Max size in MB before rotation.
    pub max_size: u64,
    /// Old log files to keep.
    pub max_backups: u32,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: String::new(),
            max_size: 100,
            max_backups: 3,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/budgie"),
            containerd_address: "/run/containerd/containerd.sock".to_string(),
            sync_port: DEFAULT_SYNC_PORT,
            tls: TlsSettings::default(),
            discovery: DiscoverySettings::default(),
            defaults: ContainerDefaults::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Config {
    /// Loads configuration from the first config file found, then applies
    /// environment overrides. Missing files fall back to defaults.
    pub fn load() -> Result<Self> {
        let mut cfg = Config::default();

        if let Some(path) = find_config_file() {
            let data = std::fs::read_to_string(&path)?;
            cfg = serde_yaml::from_str(&data)?;
        }

        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Applies `BUDGIE_*` / `CONTAINERD_ADDRESS` environment overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BUDGIE_DATA_DIR") {
            if !v.is_empty() {
                self.data_dir = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("CONTAINERD_ADDRESS") {
            if !v.is_empty() {
                self.containerd_address = v;
            }
        }
        if let Ok(v) = std::env::var("BUDGIE_SYNC_PORT") {
            if let Ok(port) = v.parse() {
                self.sync_port = port;
            }
        }
        if let Ok(v) = std::env::var("BUDGIE_LOG_LEVEL") {
            if !v.is_empty() {
                self.logging.level = v;
            }
        }
    }

    /// Writes the configuration to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_yaml::to_string(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Returns the user-level config path (`~/.budgie/budgie.yaml`).
    pub fn user_config_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".budgie").join("budgie.yaml"))
            .unwrap_or_else(|| PathBuf::from("budgie.yaml"))
    }

    /// Creates the user config file with defaults if it does not exist.
    pub fn init() -> Result<PathBuf> {
        let path = Self::user_config_path();
        if !path.exists() {
            Config::default().save(&path)?;
        }
        Ok(path)
    }

    /// Looks up a dotted key for `budgie config get`.
    pub fn get_key(&self, key: &str) -> Option<String> {
        match key {
            "data_dir" => Some(self.data_dir.display().to_string()),
            "containerd_address" => Some(self.containerd_address.clone()),
            "sync_port" => Some(self.sync_port.to_string()),
            "tls.enabled" => Some(self.tls.enabled.to_string()),
            "tls.cert_file" => Some(self.tls.cert_file.clone()),
            "tls.key_file" => Some(self.tls.key_file.clone()),
            "tls.ca_file" => Some(self.tls.ca_file.clone()),
            "discovery.enabled" => Some(self.discovery.enabled.to_string()),
            "discovery.domain" => Some(self.discovery.domain.clone()),
            "discovery.timeout" => Some(self.discovery.timeout.to_string()),
            "defaults.restart_policy" => Some(self.defaults.restart_policy.clone()),
            "defaults.max_retries" => Some(self.defaults.max_retries.to_string()),
            "defaults.stop_timeout" => Some(self.defaults.stop_timeout.to_string()),
            "logging.level" => Some(self.logging.level.clone()),
            "logging.format" => Some(self.logging.format.clone()),
            "logging.file" => Some(self.logging.file.clone()),
            _ => None,
        }
    }
}

/// Searches the standard locations for a config file.
fn find_config_file() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("BUDGIE_CONFIG") {
        let p = PathBuf::from(env_path);
        if p.exists() {
            return Some(p);
        }
    }

    for name in CONFIG_NAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    if let Some(home) = dirs::home_dir() {
        for dir in [home.join(".budgie"), home.join(".config").join("budgie")] {
            for name in CONFIG_NAMES {
                let p = dir.join(name);
                if p.exists() {
                    return Some(p);
                }
            }
        }
    }

    for name in CONFIG_NAMES {
        let p = Path::new("/etc/budgie").join(name);
        if p.exists() {
            return Some(p);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.sync_port, DEFAULT_SYNC_PORT);
        assert_eq!(cfg.defaults.stop_timeout, 10);
        assert!(cfg.discovery.enabled);
        assert!(!cfg.tls.enabled);
    }

    #[test]
    fn test_get_key() {
        let cfg = Config::default();
        assert_eq!(cfg.get_key("sync_port").unwrap(), "18733");
        assert_eq!(cfg.get_key("defaults.restart_policy").unwrap(), "no");
        assert!(cfg.get_key("nope").is_none());
    }

    #[test]
    fn test_roundtrip_yaml() {
        let cfg = Config::default();
        let s = serde_yaml::to_string(&cfg).unwrap();
        let back: Config = serde_yaml::from_str(&s).unwrap();
        assert_eq!(back.sync_port, cfg.sync_port);
        assert_eq!(back.logging.level, cfg.logging.level);
    }
}
