//! Chirp: LAN listing and replica bring-up.
//!
//! Without a target, chirp lists workloads advertised on the broadcast
//! domain. With a target id (or prefix), it joins the workload as a
//! replica:
//!
//! 1. discovery query, first record whose id matches the prefix
//! 2. materialise a replica spec mirroring the primary's image and port
//! 3. create (pulls the image)
//! 4. optionally reconcile the volume from the primary's sync server;
//!    sync failure is logged but not fatal
//! 5. start and announce

use crate::constants::{DEFAULT_DISCOVERY_TIMEOUT, VOLUMES_DIR};
use crate::container::{
    generate_id, short_id, Container, ContainerState, ImageConfig, PortMapping, VolumeMapping,
};
use crate::discovery::{DiscoveredContainer, DiscoveryService};
use crate::error::{Error, Result};
use crate::manager::Manager;
use crate::sync::TlsContext;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Options for a join run. `--dry-run` never reaches this layer: the CLI
/// renders the output of [`plan_join`] instead.
#[derive(Debug, Clone, Default)]
pub struct ChirpOptions {
    /// Reconcile volume contents from the primary before starting.
    pub sync: bool,
}

/// The resolved plan for a replica bring-up.
#[derive(Debug, Clone)]
pub struct ReplicaPlan {
    pub target: DiscoveredContainer,
    pub primary_ip: String,
    pub sync_addr: String,
    pub volume_path: PathBuf,
}

/// Queries the LAN for advertised workloads.
pub async fn list_workloads(discovery: &DiscoveryService) -> Result<Vec<DiscoveredContainer>> {
    discovery.discover(DEFAULT_DISCOVERY_TIMEOUT).await
}

/// Resolves the target and builds the bring-up plan without side effects.
pub async fn plan_join(
    discovery: &DiscoveryService,
    data_dir: &PathBuf,
    sync_port: u16,
    id_prefix: &str,
) -> Result<ReplicaPlan> {
    let candidates = discovery.discover(DEFAULT_DISCOVERY_TIMEOUT).await?;

    let target = candidates
        .into_iter()
        .find(|c| c.id.starts_with(id_prefix))
        .ok_or_else(|| Error::NotDiscovered(id_prefix.to_string()))?;

    let primary_ip = target
        .ips
        .first()
        .ok_or_else(|| Error::Discovery(format!(
            "no IP addresses advertised for {}",
            short_id(&target.id)
        )))?
        .to_string();

    let volume_path = data_dir.join(VOLUMES_DIR).join(short_id(&target.id));
    let sync_addr = format!("{primary_ip}:{sync_port}");

    Ok(ReplicaPlan {
        target,
        primary_ip,
        sync_addr,
        volume_path,
    })
}

/// Materialises the replica container spec for a plan: fresh identity,
/// `<primary-name>-replica`, mirrored port, one rw volume mapped to
/// `/data`, peers pointing back at the primary.
pub fn replica_spec(plan: &ReplicaPlan) -> Result<Container> {
    Ok(Container {
        id: generate_id()?,
        name: format!("{}-replica", plan.target.name),
        state: ContainerState::Creating,
        image: ImageConfig {
            docker_image: plan.target.image.clone(),
            ..Default::default()
        },
        ports: vec![PortMapping {
            container_port: plan.target.port,
            host_port: plan.target.port,
            protocol: "tcp".to_string(),
        }],
        volumes: vec![VolumeMapping {
            source: plan.volume_path.display().to_string(),
            target: "/data".to_string(),
            mode: "rw".to_string(),
        }],
        env: Vec::new(),
        health_check: None,
        replicas: None,
        resources: None,
        restart_policy: None,
        depends_on: Vec::new(),
        network_config: None,
        node_id: crate::bundle::node_id(),
        peers: vec![plan.target.node_id.clone()],
        created_at: Utc::now(),
        started_at: None,
        exited_at: None,
        exit_code: None,
        restart_count: 0,
        user_stopped: false,
    })
}

/// Joins a discovered workload as a replica. Returns the replica.
pub async fn join_workload(
    manager: &Arc<Manager>,
    discovery: &DiscoveryService,
    sync_port: u16,
    id_prefix: &str,
    opts: &ChirpOptions,
    tls: Option<Arc<TlsContext>>,
) -> Result<Container> {
    let plan = plan_join(discovery, manager.data_dir(), sync_port, id_prefix).await?;

    info!(
        "joining {} ({}) from node {}",
        plan.target.name,
        plan.target.image,
        plan.target.node_id
    );

    std::fs::create_dir_all(&plan.volume_path)?;
    let replica = replica_spec(&plan)?;
    let replica_id = manager.create(replica).await?;

    if opts.sync {
        match crate::sync::sync_from(
            &plan.sync_addr,
            &plan.target.id,
            &plan.volume_path,
            tls,
        )
        .await
        {
            Ok(written) => info!("volume sync complete ({written} file(s))"),
            // The replica still starts with whatever state it has.
            Err(e) => warn!("volume sync from {} failed: {e}", plan.sync_addr),
        }
    }

    manager.start(&replica_id).await?;

    let replica = manager.get(&replica_id).await?;
    if let Err(e) = discovery.announce_container(&replica).await {
        warn!("failed to announce replica: {e}");
    }

    info!("replica {} is running", replica.short_id());
    Ok(replica)
}
