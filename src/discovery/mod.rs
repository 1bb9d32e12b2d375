//! LAN discovery via multicast DNS-SD.
//!
//! Every running workload is advertised as an instance of
//! `_budgie._tcp.local`: one service record per port mapping, named
//! `budgie-<short_id>`, carrying TXT fields `container_id`, `node_id`,
//! `container_name`, and `image`, plus A records for every non-loopback
//! IPv4 on the node.
//!
//! A responder task answers PTR queries for the service type so that other
//! nodes' `chirp` queries see this node's workloads; records are retracted
//! with TTL-0 goodbyes on shutdown.

pub mod packet;

use crate::constants::{DISCOVERY_SERVICE, DISCOVERY_TTL, MDNS_PORT};
use crate::container::{short_id, Container};
use crate::error::{Error, Result};
use packet::{
    build_goodbye, build_ptr_question, build_service_announcement, parse_question,
    parse_service_response, Question, ServiceRecord, DNS_TYPE_ANY, DNS_TYPE_PTR,
    MDNS_MULTICAST_ADDR,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

// =============================================================================
// Discovered Containers
// =============================================================================

/// A workload advertised by some node on the LAN. Transient; never
/// persisted.
#[derive(Debug, Clone)]
pub struct DiscoveredContainer {
    pub id: String,
    pub name: String,
    pub node_id: String,
    pub image: String,
    pub port: u16,
    pub ips: Vec<Ipv4Addr>,
}

impl DiscoveredContainer {
    fn from_record(record: &ServiceRecord) -> Option<Self> {
        let txt = record.txt_map();
        // Entries without a container id are not budgie workloads.
        let id = txt.get("container_id")?.clone();
        Some(Self {
            id,
            name: txt.get("container_name").cloned().unwrap_or_default(),
            node_id: txt.get("node_id").cloned().unwrap_or_default(),
            image: txt.get("image").cloned().unwrap_or_default(),
            port: record.port,
            ips: record.ips.clone(),
        })
    }
}

// =============================================================================
// Service
// =============================================================================

/// Multicast announce/query service.
pub struct DiscoveryService {
    socket: Arc<UdpSocket>,
    /// Records currently advertised by this node, keyed by container id.
    announced: Arc<Mutex<HashMap<String, Vec<ServiceRecord>>>>,
    stop_tx: watch::Sender<bool>,
}

impl DiscoveryService {
    /// Creates the service and binds the multicast socket.
    pub fn new() -> Result<Self> {
        let socket = create_mdns_socket(Ipv4Addr::UNSPECIFIED)?;
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            socket: Arc::new(socket),
            announced: Arc::new(Mutex::new(HashMap::new())),
            stop_tx,
        })
    }

    /// Announces a container: one service record per port mapping.
    pub async fn announce_container(&self, ctr: &Container) -> Result<()> {
        let ips = local_ipv4_addrs();
        let hostname = format!("{}.local", ctr.node_id);
        let mut records = Vec::with_capacity(ctr.ports.len());

        for port in &ctr.ports {
            let record = ServiceRecord {
                instance: format!("budgie-{}", ctr.short_id()),
                service: DISCOVERY_SERVICE.to_string(),
                hostname: hostname.clone(),
                port: port.host_port,
                txt: vec![
                    format!("container_id={}", ctr.id),
                    format!("node_id={}", ctr.node_id),
                    format!("container_name={}", ctr.name),
                    format!("image={}", ctr.image.docker_image),
                ],
                ips: ips.clone(),
            };

            let dest = SocketAddr::new(IpAddr::V4(MDNS_MULTICAST_ADDR), MDNS_PORT);
            self.socket
                .send_to(&build_service_announcement(&record, DISCOVERY_TTL), dest)
                .await
                .map_err(|e| Error::Discovery(e.to_string()))?;

            info!(
                "announcing container {} on port {}",
                ctr.short_id(),
                port.host_port
            );
            records.push(record);
        }

        self.announced.lock().await.insert(ctr.id.clone(), records);
        Ok(())
    }

    /// Retracts a container's records with goodbye packets.
    pub async fn retract_container(&self, id: &str) -> Result<()> {
        let records = self.announced.lock().await.remove(id);
        let Some(records) = records else {
            return Ok(());
        };

        let dest = SocketAddr::new(IpAddr::V4(MDNS_MULTICAST_ADDR), MDNS_PORT);
        for record in records {
            self.socket
                .send_to(&build_goodbye(&record), dest)
                .await
                .map_err(|e| Error::Discovery(e.to_string()))?;
        }
        debug!("retracted discovery records for {}", short_id(id));
        Ok(())
    }

    /// Spawns the responder loop answering PTR queries for our records.
    pub fn start_responder(&self) -> tokio::task::JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let announced = Arc::clone(&self.announced);
        let mut stop_rx = self.stop_tx.subscribe();

        info!("discovery responder started");
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            loop {
                tokio::select! {
                    recv = socket.recv_from(&mut buf) => {
                        match recv {
                            Ok((len, src)) => {
                                Self::handle_packet(&socket, &announced, &buf[..len], src).await;
                            }
                            Err(e) => {
                                warn!("discovery recv error: {e}");
                            }
                        }
                    }
                    _ = stop_rx.changed() => {
                        info!("discovery responder stopped");
                        return;
                    }
                }
            }
        })
    }

    async fn handle_packet(
        socket: &UdpSocket,
        announced: &Mutex<HashMap<String, Vec<ServiceRecord>>>,
        data: &[u8],
        src: SocketAddr,
    ) {
        let question: Option<Question> = match parse_question(data) {
            Ok(q) => q,
            Err(_) => return, // malformed packets are ignored
        };
        let Some(question) = question else {
            return;
        };

        if question.name != DISCOVERY_SERVICE
            || (question.qtype != DNS_TYPE_PTR && question.qtype != DNS_TYPE_ANY)
        {
            return;
        }

        let dest = if question.unicast_response {
            src
        } else {
            SocketAddr::new(IpAddr::V4(MDNS_MULTICAST_ADDR), MDNS_PORT)
        };

        let records = announced.lock().await;
        for record_set in records.values() {
            for record in record_set {
                let response = build_service_announcement(record, DISCOVERY_TTL);
                if let Err(e) = socket.send_to(&response, dest).await {
                    warn!("failed to answer discovery query: {e}");
                }
            }
        }
    }

    /// Queries the LAN for budgie workloads, collecting responses for the
    /// given window. Entries are de-duplicated by container id; records
    /// missing a `container_id` TXT field are dropped.
    pub async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredContainer>> {
        let query = build_ptr_question(DISCOVERY_SERVICE);
        let dest = SocketAddr::new(IpAddr::V4(MDNS_MULTICAST_ADDR), MDNS_PORT);
        self.socket
            .send_to(&query, dest)
            .await
            .map_err(|e| Error::Discovery(e.to_string()))?;

        let mut found: HashMap<String, DiscoveredContainer> = HashMap::new();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = [0u8; 1500];

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, self.socket.recv_from(&mut buf)).await {
                Err(_) => break, // window elapsed
                Ok(Err(e)) => {
                    warn!("discovery recv error: {e}");
                    continue;
                }
                Ok(Ok((len, _src))) => {
                    let records = match parse_service_response(&buf[..len], DISCOVERY_SERVICE) {
                        Ok(records) => records,
                        Err(_) => continue,
                    };
                    for record in &records {
                        if let Some(ctr) = DiscoveredContainer::from_record(record) {
                            found.entry(ctr.id.clone()).or_insert(ctr);
                        }
                    }
                }
            }
        }

        let mut list: Vec<DiscoveredContainer> = found.into_values().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    /// Retracts everything and stops the responder.
    pub async fn shutdown(&self) -> Result<()> {
        let ids: Vec<String> = self.announced.lock().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.retract_container(&id).await {
                warn!("failed to retract {}: {e}", short_id(&id));
            }
        }
        let _ = self.stop_tx.send(true);
        Ok(())
    }
}

// =============================================================================
// Sockets and Addresses
// =============================================================================

/// Creates the mDNS multicast socket: SO_REUSEADDR (and SO_REUSEPORT on
/// BSD-likes), joined to 224.0.0.251, TTL 255 per RFC 6762, loopback on.
fn create_mdns_socket(interface_addr: Ipv4Addr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::Discovery(format!("failed to create socket: {e}")))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| Error::Discovery(format!("failed to set SO_REUSEADDR: {e}")))?;

    #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd"))]
    socket
        .set_reuse_port(true)
        .map_err(|e| Error::Discovery(format!("failed to set SO_REUSEPORT: {e}")))?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MDNS_PORT);
    socket
        .bind(&bind_addr.into())
        .map_err(|e| Error::Discovery(format!("failed to bind to {bind_addr}: {e}")))?;

    socket
        .join_multicast_v4(&MDNS_MULTICAST_ADDR, &interface_addr)
        .map_err(|e| Error::Discovery(format!("failed to join multicast group: {e}")))?;

    socket
        .set_multicast_ttl_v4(255)
        .map_err(|e| Error::Discovery(format!("failed to set multicast TTL: {e}")))?;

    socket
        .set_multicast_loop_v4(true)
        .map_err(|e| Error::Discovery(format!("failed to set multicast loopback: {e}")))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| Error::Discovery(format!("failed to set non-blocking: {e}")))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
        .map_err(|e| Error::Discovery(format!("failed to create tokio socket: {e}")))
}

/// Collects every non-loopback IPv4 on up interfaces, falling back to
/// 127.0.0.1 when nothing qualifies.
pub fn local_ipv4_addrs() -> Vec<Ipv4Addr> {
    let mut ips = Vec::new();

    // getifaddrs without another dependency: ask the kernel which source
    // address it would route multicast from, plus any addresses UDP
    // connect can discover.
    if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") {
        if socket.connect((MDNS_MULTICAST_ADDR, MDNS_PORT)).is_ok() {
            if let Ok(addr) = socket.local_addr() {
                if let IpAddr::V4(v4) = addr.ip() {
                    if !v4.is_loopback() && !v4.is_unspecified() {
                        ips.push(v4);
                    }
                }
            }
        }
    }

    if ips.is_empty() {
        ips.push(Ipv4Addr::LOCALHOST);
    }
    ips
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovered_container_requires_id() {
        let record = ServiceRecord {
            instance: "budgie-abc".to_string(),
            service: DISCOVERY_SERVICE.to_string(),
            hostname: "n.local".to_string(),
            port: 80,
            txt: vec!["node_id=n".to_string()],
            ips: vec![],
        };
        assert!(DiscoveredContainer::from_record(&record).is_none());

        let record = ServiceRecord {
            txt: vec![
                "container_id=abcdef".to_string(),
                "container_name=web".to_string(),
            ],
            ..record
        };
        let ctr = DiscoveredContainer::from_record(&record).unwrap();
        assert_eq!(ctr.id, "abcdef");
        assert_eq!(ctr.name, "web");
    }

    #[test]
    fn test_local_ipv4_never_empty() {
        assert!(!local_ipv4_addrs().is_empty());
    }
}
