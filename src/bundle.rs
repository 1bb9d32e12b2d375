//! Bundle file parsing.
//!
//! A bundle (`*.bun`) is a small YAML spec describing one containerised
//! workload. Parsing validates the version tag and the presence of at
//! least one port mapping, then lowers the bundle into a [`Container`]
//! ready for the lifecycle manager.

use crate::container::{
    generate_id, Container, ContainerState, HealthCheck, ImageConfig, PortMapping,
    ReplicasConfig, ResourceLimits, RestartPolicy, VolumeMapping,
};
use crate::error::{Error, Result};
use chrono::Utc;
use serde::Deserialize;
use std::path::Path;

/// Supported bundle schema version.
pub const BUNDLE_VERSION: &str = "1.0";

/// In-memory form of a parsed bundle file.
#[derive(Debug, Clone, Deserialize)]
pub struct Bundle {
    pub version: String,
    #[serde(default)]
    pub name: String,
    pub image: ImageConfig,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub volumes: Vec<VolumeMapping>,
    #[serde(default, rename = "environment")]
    pub env: Vec<String>,
    #[serde(default)]
    pub env_file: String,
    #[serde(default, rename = "healthcheck")]
    pub health: Option<HealthCheck>,
    #[serde(default)]
    pub replicas: Option<ReplicasConfig>,
    #[serde(default)]
    pub resources: Option<ResourceLimits>,
    #[serde(default)]
    pub restart_policy: Option<RestartPolicy>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub stop_timeout: u64,
}

impl Bundle {
    /// Parses and validates a bundle file.
    pub fn parse(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| Error::BundleParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut bundle: Bundle =
            serde_yaml::from_str(&data).map_err(|e| Error::BundleParse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        if bundle.version.is_empty() {
            return Err(Error::Validation {
                field: "version".to_string(),
                reason: "bundle version is required".to_string(),
            });
        }

        if bundle.ports.is_empty() {
            return Err(Error::Validation {
                field: "ports".to_string(),
                reason: "at least one port mapping is required".to_string(),
            });
        }

        if bundle.image.docker_image.is_empty() {
            return Err(Error::Validation {
                field: "image.docker_image".to_string(),
                reason: "image reference is required".to_string(),
            });
        }

        if bundle.name.is_empty() {
            bundle.name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("bundle")
                .to_string();
        }

        if let Some(res) = &bundle.resources {
            res.validate()?;
        }

        Ok(bundle)
    }

    /// Lowers the bundle into a container with a fresh identity.
    ///
    /// Environment precedence: entries from `env_file` are loaded first and
    /// bundle-level `environment` entries override them on key conflicts.
    pub fn into_container(self, bundle_path: &Path) -> Result<Container> {
        let mut env = Vec::new();
        if !self.env_file.is_empty() {
            env = load_env_file(&self.env_file, bundle_path)?;
        }
        for entry in &self.env {
            if let Some(key) = entry.split('=').next() {
                env.retain(|e: &String| e.split('=').next() != Some(key));
            }
            env.push(entry.clone());
        }

        Ok(Container {
            id: generate_id()?,
            name: self.name,
            state: ContainerState::Creating,
            image: self.image,
            ports: self.ports,
            volumes: self.volumes,
            env,
            health_check: self.health,
            replicas: self.replicas,
            resources: self.resources,
            restart_policy: Some(self.restart_policy.unwrap_or_default()),
            depends_on: self.depends_on,
            network_config: None,
            node_id: node_id(),
            peers: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            exited_at: None,
            exit_code: None,
            restart_count: 0,
            user_stopped: false,
        })
    }
}

/// Loads `KEY=VALUE` lines from an env file resolved relative to the bundle.
///
/// Blank lines and lines starting with `#` are skipped; lines without `=`
/// are ignored.
fn load_env_file(env_file: &str, bundle_path: &Path) -> Result<Vec<String>> {
    let path = if Path::new(env_file).is_absolute() {
        Path::new(env_file).to_path_buf()
    } else {
        bundle_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(env_file)
    };

    let data = std::fs::read_to_string(&path).map_err(|e| Error::BundleParse {
        path: path.clone(),
        reason: format!("failed to read env file: {e}"),
    })?;

    let mut env = Vec::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.contains('=') {
            env.push(line.to_string());
        }
    }
    Ok(env)
}

/// Returns the hostname used as this node's identity.
pub fn node_id() -> String {
    let name = gethostname::gethostname().to_string_lossy().to_string();
    if name.is_empty() {
        "unknown".to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_bundle(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_parse_minimal_bundle() {
        let dir = TempDir::new().unwrap();
        let path = write_bundle(
            &dir,
            "web.bun",
            r#"
version: "1.0"
image:
  docker_image: nginx:alpine
ports:
  - container_port: 80
    host_port: 8080
"#,
        );

        let bundle = Bundle::parse(&path).unwrap();
        assert_eq!(bundle.name, "web");
        assert_eq!(bundle.ports[0].host_port, 8080);
        assert_eq!(bundle.ports[0].protocol, "tcp");
    }

    #[test]
    fn test_missing_version_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_bundle(
            &dir,
            "bad.bun",
            r#"
version: ""
image:
  docker_image: nginx:alpine
ports:
  - container_port: 80
    host_port: 8080
"#,
        );
        assert!(Bundle::parse(&path).is_err());
    }

    #[test]
    fn test_missing_ports_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_bundle(
            &dir,
            "noports.bun",
            r#"
version: "1.0"
image:
  docker_image: nginx:alpine
"#,
        );
        assert!(Bundle::parse(&path).is_err());
    }

    #[test]
    fn test_env_file_overridden_by_bundle_env() {
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join("app.env");
        std::fs::write(&env_path, "# comment\nFOO=from_file\nBAR=1\n\nnot a pair\n").unwrap();

        let path = write_bundle(
            &dir,
            "app.bun",
            r#"
version: "1.0"
image:
  docker_image: nginx:alpine
environment:
  - FOO=from_bundle
env_file: app.env
ports:
  - container_port: 80
    host_port: 8080
"#,
        );

        let ctr = Bundle::parse(&path).unwrap().into_container(&path).unwrap();
        assert!(ctr.env.contains(&"FOO=from_bundle".to_string()));
        assert!(ctr.env.contains(&"BAR=1".to_string()));
        assert!(!ctr.env.contains(&"FOO=from_file".to_string()));
    }
}
