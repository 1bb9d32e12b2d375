//! Network manager (metadata only).
//!
//! Tracks networks, their CIDRs, and container membership. This layer does
//! not program the kernel; allocations exist so the CNI layer and the
//! inspect surface agree on addressing.
//!
//! IP allocation maintains a per-network allocation map and hands out the
//! lowest free host address starting at `.2` (the gateway conventionally
//! holds `.1`); disconnecting a container returns its address to the pool.

use crate::constants::{
    DEFAULT_NETWORK_CIDR, DEFAULT_NETWORK_GATEWAY, DEFAULT_NETWORK_NAME, NETWORKS_FILE,
};
use crate::error::{Error, Result};
use crate::store::{init_data_dir, SnapshotFile};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Mutex;
use tracing::{error, info, warn};

// =============================================================================
// CIDR
// =============================================================================

/// A parsed IPv4 CIDR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: u32,
    prefix_len: u8,
}

impl Cidr {
    /// Parses `a.b.c.d/len`.
    pub fn parse(s: &str) -> Result<Self> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidCidr(s.to_string()))?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| Error::InvalidCidr(s.to_string()))?;
        let prefix_len: u8 = len.parse().map_err(|_| Error::InvalidCidr(s.to_string()))?;
        if prefix_len > 32 {
            return Err(Error::InvalidCidr(s.to_string()));
        }
        let mask = Self::mask_of(prefix_len);
        Ok(Self {
            network: u32::from(addr) & mask,
            prefix_len,
        })
    }

    fn mask_of(prefix_len: u8) -> u32 {
        if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - prefix_len)
        }
    }

    /// Returns true if `ip` belongs to this block.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        (u32::from(ip) & Self::mask_of(self.prefix_len)) == self.network
    }

    /// First assignable host address (network + 1).
    pub fn first_host(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network + 1)
    }

    /// Last assignable host address (broadcast - 1); for /31 and /32 the
    /// block has no conventional host range.
    pub fn last_host(&self) -> Ipv4Addr {
        let size = if self.prefix_len >= 31 {
            0
        } else {
            (1u32 << (32 - self.prefix_len)) - 2
        };
        Ipv4Addr::from(self.network + size)
    }
}

// =============================================================================
// Model
// =============================================================================

/// A container network (metadata only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    /// Opaque 12-hex id.
    pub id: String,
    /// Unique name; the lookup key.
    pub name: String,
    /// Driver tag, e.g. "bridge".
    pub driver: String,
    pub subnet: String,
    pub gateway: String,
    /// Attached container ids.
    #[serde(default)]
    pub containers: Vec<String>,
    /// Container id → allocated IP.
    #[serde(default)]
    pub allocations: HashMap<String, String>,
}

/// Addressing handed to a container on connect.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerNetworkInfo {
    pub network_id: String,
    pub network_name: String,
    pub ip_address: String,
    pub gateway: String,
}

// =============================================================================
// Manager
// =============================================================================

/// Manager for network metadata and address allocation.
pub struct NetworkManager {
    networks: Mutex<HashMap<String, Network>>,
    snapshot: SnapshotFile,
}

impl NetworkManager {
    /// Opens the manager under `data_dir`, materialising the default
    /// network if it is missing.
    pub fn new(data_dir: &Path) -> Result<Self> {
        init_data_dir(data_dir)?;
        let snapshot = SnapshotFile::new(data_dir.join(NETWORKS_FILE));

        let mut networks = HashMap::new();
        match snapshot.load::<Network>() {
            Ok(list) => {
                for net in list {
                    networks.insert(net.name.clone(), net);
                }
            }
            Err(e) => warn!("failed to load network state, starting fresh: {e}"),
        }

        let manager = Self {
            networks: Mutex::new(networks),
            snapshot,
        };

        if manager.get(DEFAULT_NETWORK_NAME).is_err() {
            if let Err(e) = manager.create(
                DEFAULT_NETWORK_NAME,
                "bridge",
                DEFAULT_NETWORK_CIDR,
                DEFAULT_NETWORK_GATEWAY,
            ) {
                warn!("failed to create default network: {e}");
            }
        }

        Ok(manager)
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Network>>> {
        self.networks
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))
    }

    /// Creates a network after validating its CIDR and gateway.
    pub fn create(&self, name: &str, driver: &str, subnet: &str, gateway: &str) -> Result<Network> {
        let mut networks = self.guard()?;

        if networks.contains_key(name) {
            return Err(Error::NetworkExists(name.to_string()));
        }

        let cidr = Cidr::parse(subnet)?;
        let gw: Ipv4Addr = gateway
            .parse()
            .map_err(|_| Error::Validation {
                field: "gateway".to_string(),
                reason: format!("invalid gateway IP: {gateway}"),
            })?;
        if !cidr.contains(gw) {
            return Err(Error::GatewayOutsideSubnet {
                gateway: gateway.to_string(),
                subnet: subnet.to_string(),
            });
        }

        let net = Network {
            id: generate_network_id()?,
            name: name.to_string(),
            driver: driver.to_string(),
            subnet: subnet.to_string(),
            gateway: gateway.to_string(),
            containers: Vec::new(),
            allocations: HashMap::new(),
        };

        networks.insert(name.to_string(), net.clone());
        self.save(&networks);
        info!("created network {name} ({subnet})");
        Ok(net)
    }

    /// Removes a network. The default network and networks with attached
    /// containers are non-removable.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut networks = self.guard()?;

        let net = networks
            .get(name)
            .ok_or_else(|| Error::NetworkNotFound(name.to_string()))?;

        if name == DEFAULT_NETWORK_NAME {
            return Err(Error::DefaultNetworkRemoval);
        }
        if !net.containers.is_empty() {
            return Err(Error::NetworkInUse {
                name: name.to_string(),
                count: net.containers.len(),
            });
        }

        networks.remove(name);
        self.save(&networks);
        info!("removed network {name}");
        Ok(())
    }

    /// Returns a network by name.
    pub fn get(&self, name: &str) -> Result<Network> {
        let networks = self.guard()?;
        networks
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NetworkNotFound(name.to_string()))
    }

    /// Returns all networks, sorted by name.
    pub fn list(&self) -> Vec<Network> {
        // Listing is infallible; recover the map from a poisoned lock.
        let networks = self
            .networks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut list: Vec<Network> = networks.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Attaches a container and allocates it the lowest free host address.
    pub fn connect(&self, network_name: &str, container_id: &str) -> Result<ContainerNetworkInfo> {
        let mut networks = self.guard()?;

        let net = networks
            .get_mut(network_name)
            .ok_or_else(|| Error::NetworkNotFound(network_name.to_string()))?;

        if net.containers.iter().any(|id| id == container_id) {
            return Err(Error::Validation {
                field: "container".to_string(),
                reason: format!("container already connected to network {network_name}"),
            });
        }

        let ip = allocate_ip(net)?;
        net.containers.push(container_id.to_string());
        net.allocations.insert(container_id.to_string(), ip.clone());

        let info = ContainerNetworkInfo {
            network_id: net.id.clone(),
            network_name: net.name.clone(),
            ip_address: ip,
            gateway: net.gateway.clone(),
        };

        self.save(&networks);
        Ok(info)
    }

    /// Detaches a container, returning its address to the pool.
    pub fn disconnect(&self, network_name: &str, container_id: &str) -> Result<()> {
        let mut networks = self.guard()?;

        let net = networks
            .get_mut(network_name)
            .ok_or_else(|| Error::NetworkNotFound(network_name.to_string()))?;

        let before = net.containers.len();
        net.containers.retain(|id| id != container_id);
        if net.containers.len() == before {
            return Err(Error::Validation {
                field: "container".to_string(),
                reason: format!("container not connected to network {network_name}"),
            });
        }
        net.allocations.remove(container_id);

        self.save(&networks);
        Ok(())
    }

    fn save(&self, networks: &HashMap<String, Network>) {
        let list: Vec<&Network> = networks.values().collect();
        if let Err(e) = self.snapshot.save(&list) {
            error!("failed to save network state: {e}");
        }
    }
}

/// Finds the lowest free host address in the network, starting at `.2`.
fn allocate_ip(net: &Network) -> Result<String> {
    let cidr = Cidr::parse(&net.subnet)?;
    let gateway: Option<Ipv4Addr> = net.gateway.parse().ok();

    let in_use: Vec<Ipv4Addr> = net
        .allocations
        .values()
        .filter_map(|ip| ip.parse().ok())
        .collect();

    let first = u32::from(cidr.first_host()) + 1; // skip .1, conventionally the gateway
    let last = u32::from(cidr.last_host());

    for candidate in first..=last {
        let ip = Ipv4Addr::from(candidate);
        if Some(ip) == gateway || in_use.contains(&ip) {
            continue;
        }
        return Ok(ip.to_string());
    }

    Err(Error::Validation {
        field: "network".to_string(),
        reason: format!("no available IPs in network {}", net.name),
    })
}

fn generate_network_id() -> Result<String> {
    let mut buf = [0u8; 6];
    rand::rngs::OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| Error::Rng(e.to_string()))?;
    Ok(hex::encode(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cidr_parse_and_contains() {
        let cidr = Cidr::parse("172.20.0.0/16").unwrap();
        assert!(cidr.contains("172.20.0.1".parse().unwrap()));
        assert!(cidr.contains("172.20.255.254".parse().unwrap()));
        assert!(!cidr.contains("172.21.0.1".parse().unwrap()));

        assert!(Cidr::parse("not-a-cidr").is_err());
        assert!(Cidr::parse("10.0.0.0/40").is_err());
    }

    #[test]
    fn test_default_network_materialised() {
        let dir = TempDir::new().unwrap();
        let nm = NetworkManager::new(dir.path()).unwrap();
        let net = nm.get(DEFAULT_NETWORK_NAME).unwrap();
        assert_eq!(net.subnet, DEFAULT_NETWORK_CIDR);
        assert_eq!(net.gateway, DEFAULT_NETWORK_GATEWAY);
    }

    #[test]
    fn test_gateway_outside_subnet_rejected() {
        let dir = TempDir::new().unwrap();
        let nm = NetworkManager::new(dir.path()).unwrap();
        assert!(matches!(
            nm.create("bad", "bridge", "10.1.0.0/24", "10.2.0.1"),
            Err(Error::GatewayOutsideSubnet { .. })
        ));
    }

    #[test]
    fn test_default_network_not_removable() {
        let dir = TempDir::new().unwrap();
        let nm = NetworkManager::new(dir.path()).unwrap();
        assert!(matches!(
            nm.remove(DEFAULT_NETWORK_NAME),
            Err(Error::DefaultNetworkRemoval)
        ));
    }

    #[test]
    fn test_in_use_network_not_removable() {
        let dir = TempDir::new().unwrap();
        let nm = NetworkManager::new(dir.path()).unwrap();
        nm.create("apps", "bridge", "10.5.0.0/24", "10.5.0.1").unwrap();
        nm.connect("apps", "c1").unwrap();

        assert!(matches!(
            nm.remove("apps"),
            Err(Error::NetworkInUse { count: 1, .. })
        ));

        nm.disconnect("apps", "c1").unwrap();
        nm.remove("apps").unwrap();
    }

    #[test]
    fn test_allocation_starts_at_dot_two_and_reclaims() {
        let dir = TempDir::new().unwrap();
        let nm = NetworkManager::new(dir.path()).unwrap();
        nm.create("apps", "bridge", "10.5.0.0/24", "10.5.0.1").unwrap();

        let a = nm.connect("apps", "c1").unwrap();
        let b = nm.connect("apps", "c2").unwrap();
        let c = nm.connect("apps", "c3").unwrap();
        assert_eq!(a.ip_address, "10.5.0.2");
        assert_eq!(b.ip_address, "10.5.0.3");
        assert_eq!(c.ip_address, "10.5.0.4");

        // Freed addresses are reused, lowest first.
        nm.disconnect("apps", "c2").unwrap();
        let d = nm.connect("apps", "c4").unwrap();
        assert_eq!(d.ip_address, "10.5.0.3");
    }

    #[test]
    fn test_pool_exhaustion() {
        let dir = TempDir::new().unwrap();
        let nm = NetworkManager::new(dir.path()).unwrap();
        // /30 leaves .1 (gateway) and .2 as the only host addresses.
        nm.create("tiny", "bridge", "10.9.0.0/30", "10.9.0.1").unwrap();

        nm.connect("tiny", "c1").unwrap();
        assert!(nm.connect("tiny", "c2").is_err());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let nm = NetworkManager::new(dir.path()).unwrap();
            nm.create("apps", "bridge", "10.5.0.0/24", "10.5.0.1").unwrap();
            nm.connect("apps", "c1").unwrap();
        }
        let nm = NetworkManager::new(dir.path()).unwrap();
        let net = nm.get("apps").unwrap();
        assert_eq!(net.containers, vec!["c1"]);
        assert_eq!(net.allocations.get("c1").unwrap(), "10.5.0.2");
    }
}
