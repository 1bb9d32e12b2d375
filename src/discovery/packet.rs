//! DNS-SD wire format for LAN discovery.
//!
//! mDNS (RFC 6762) is DNS over multicast UDP; DNS-SD (RFC 6763) layers
//! service discovery on top of it with PTR/SRV/TXT records. Only the
//! subset budgie needs is implemented:
//!
//! - PTR questions for the `_budgie._tcp.local` service type
//! - Service announcements: PTR + SRV + TXT + A records in one response
//! - Goodbye packets (TTL=0)
//! - Response parsing back into service entries

use std::collections::HashMap;
use std::net::Ipv4Addr;

/// mDNS multicast address (224.0.0.251).
pub const MDNS_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// DNS record type: A (IPv4 address).
pub const DNS_TYPE_A: u16 = 1;

/// DNS record type: PTR (domain pointer).
pub const DNS_TYPE_PTR: u16 = 12;

/// DNS record type: TXT (key=value strings).
pub const DNS_TYPE_TXT: u16 = 16;

/// DNS record type: SRV (service locator).
pub const DNS_TYPE_SRV: u16 = 33;

/// DNS record type: ANY (wildcard).
pub const DNS_TYPE_ANY: u16 = 255;

/// DNS class: IN (Internet).
pub const DNS_CLASS_IN: u16 = 1;

/// Cache-flush bit for mDNS class field.
pub const CACHE_FLUSH_BIT: u16 = 0x8000;

/// DNS-SD packet error.
#[derive(Debug, Clone)]
pub enum PacketError {
    /// Packet is shorter than its structure requires.
    Truncated { expected: usize, actual: usize },
    /// Invalid domain name at the given offset.
    InvalidName(usize),
    /// Invalid UTF-8 inside a name or TXT string.
    InvalidUtf8,
}

impl std::fmt::Display for PacketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated { expected, actual } => {
                write!(f, "packet too short: expected at least {expected} bytes, got {actual}")
            }
            Self::InvalidName(offset) => write!(f, "invalid domain name at offset {offset}"),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 in packet"),
        }
    }
}

impl std::error::Error for PacketError {}

// =============================================================================
// Service Model
// =============================================================================

/// One advertised service instance, the unit of announce and parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Instance label, e.g. `budgie-0123456789ab`.
    pub instance: String,
    /// Service type domain, e.g. `_budgie._tcp.local`.
    pub service: String,
    /// Target host domain from the SRV record.
    pub hostname: String,
    /// Advertised port.
    pub port: u16,
    /// Raw TXT strings (`key=value`).
    pub txt: Vec<String>,
    /// Advertised IPv4 addresses.
    pub ips: Vec<Ipv4Addr>,
}

impl ServiceRecord {
    /// Parses the TXT strings into a key/value map; strings without `=`
    /// are dropped.
    pub fn txt_map(&self) -> HashMap<String, String> {
        self.txt
            .iter()
            .filter_map(|s| {
                s.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect()
    }

    fn fqdn(&self) -> String {
        format!("{}.{}", self.instance, self.service)
    }
}

/// A parsed question from a query packet.
#[derive(Debug, Clone)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    /// QU bit: unicast response requested.
    pub unicast_response: bool,
}

// =============================================================================
// Building
// =============================================================================

/// Builds a PTR question for a service type.
pub fn build_ptr_question(service: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(64);

    packet.extend_from_slice(&[0x00, 0x00]); // ID = 0 for mDNS
    packet.extend_from_slice(&[0x00, 0x00]); // Flags: standard query
    packet.extend_from_slice(&[0x00, 0x01]); // QDCOUNT = 1
    packet.extend_from_slice(&[0x00, 0x00]); // ANCOUNT
    packet.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
    packet.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

    packet.extend(encode_name(service));
    packet.extend_from_slice(&DNS_TYPE_PTR.to_be_bytes());
    packet.extend_from_slice(&DNS_CLASS_IN.to_be_bytes());

    packet
}

/// Builds an unsolicited service announcement carrying PTR, SRV, TXT, and
/// one A record per address. `ttl = 0` produces a goodbye.
pub fn build_service_announcement(record: &ServiceRecord, ttl: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(256);
    let answer_count = 3 + record.ips.len() as u16;

    packet.extend_from_slice(&[0x00, 0x00]); // ID = 0 for unsolicited
    packet.extend_from_slice(&[0x84, 0x00]); // Flags: QR=1, AA=1
    packet.extend_from_slice(&[0x00, 0x00]); // QDCOUNT = 0
    packet.extend_from_slice(&answer_count.to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
    packet.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

    let fqdn = record.fqdn();

    // PTR: service type -> instance. PTR records are shared, so the
    // cache-flush bit stays clear.
    let ptr_rdata = encode_name(&fqdn);
    push_record(&mut packet, &record.service, DNS_TYPE_PTR, DNS_CLASS_IN, ttl, &ptr_rdata);

    // SRV: instance -> hostname + port.
    let mut srv_rdata = Vec::with_capacity(32);
    srv_rdata.extend_from_slice(&0u16.to_be_bytes()); // priority
    srv_rdata.extend_from_slice(&0u16.to_be_bytes()); // weight
    srv_rdata.extend_from_slice(&record.port.to_be_bytes());
    srv_rdata.extend(encode_name(&record.hostname));
    push_record(
        &mut packet,
        &fqdn,
        DNS_TYPE_SRV,
        DNS_CLASS_IN | CACHE_FLUSH_BIT,
        ttl,
        &srv_rdata,
    );

    // TXT: instance -> key=value strings.
    let mut txt_rdata = Vec::with_capacity(64);
    for s in &record.txt {
        let bytes = s.as_bytes();
        let len = bytes.len().min(255);
        txt_rdata.push(len as u8);
        txt_rdata.extend_from_slice(&bytes[..len]);
    }
    if txt_rdata.is_empty() {
        txt_rdata.push(0);
    }
    push_record(
        &mut packet,
        &fqdn,
        DNS_TYPE_TXT,
        DNS_CLASS_IN | CACHE_FLUSH_BIT,
        ttl,
        &txt_rdata,
    );

    // A: hostname -> each advertised address.
    for ip in &record.ips {
        push_record(
            &mut packet,
            &record.hostname,
            DNS_TYPE_A,
            DNS_CLASS_IN | CACHE_FLUSH_BIT,
            ttl,
            &ip.octets(),
        );
    }

    packet
}

/// Builds a goodbye packet (TTL=0) for a previously announced service.
pub fn build_goodbye(record: &ServiceRecord) -> Vec<u8> {
    build_service_announcement(record, 0)
}

fn push_record(packet: &mut Vec<u8>, name: &str, rtype: u16, class: u16, ttl: u32, rdata: &[u8]) {
    packet.extend(encode_name(name));
    packet.extend_from_slice(&rtype.to_be_bytes());
    packet.extend_from_slice(&class.to_be_bytes());
    packet.extend_from_slice(&ttl.to_be_bytes());
    packet.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    packet.extend_from_slice(rdata);
}

// =============================================================================
// Parsing
// =============================================================================

/// Parses a query packet into its first question.
///
/// Returns `Ok(None)` for responses and question-less packets; malformed
/// packets are errors.
pub fn parse_question(packet: &[u8]) -> Result<Option<Question>, PacketError> {
    if packet.len() < 12 {
        return Err(PacketError::Truncated {
            expected: 12,
            actual: packet.len(),
        });
    }

    let flags = u16::from_be_bytes([packet[2], packet[3]]);
    if (flags & 0x8000) != 0 {
        return Ok(None); // response, not a query
    }

    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    if qdcount == 0 {
        return Ok(None);
    }

    let (name, offset) = decode_name(packet, 12)?;
    if packet.len() < offset + 4 {
        return Err(PacketError::Truncated {
            expected: offset + 4,
            actual: packet.len(),
        });
    }

    let qtype = u16::from_be_bytes([packet[offset], packet[offset + 1]]);
    let qclass = u16::from_be_bytes([packet[offset + 2], packet[offset + 3]]);

    Ok(Some(Question {
        name: name.to_lowercase(),
        qtype,
        unicast_response: (qclass & 0x8000) != 0,
    }))
}

/// Parses a response packet, reassembling its PTR/SRV/TXT/A records into
/// service entries for `service_type`.
pub fn parse_service_response(
    packet: &[u8],
    service_type: &str,
) -> Result<Vec<ServiceRecord>, PacketError> {
    if packet.len() < 12 {
        return Err(PacketError::Truncated {
            expected: 12,
            actual: packet.len(),
        });
    }

    let flags = u16::from_be_bytes([packet[2], packet[3]]);
    if (flags & 0x8000) == 0 {
        return Ok(Vec::new()); // query, not a response
    }

    let qdcount = u16::from_be_bytes([packet[4], packet[5]]) as usize;
    let record_count = (u16::from_be_bytes([packet[6], packet[7]]) as usize)
        + (u16::from_be_bytes([packet[8], packet[9]]) as usize)
        + (u16::from_be_bytes([packet[10], packet[11]]) as usize);

    let mut offset = 12;

    // Skip echoed questions.
    for _ in 0..qdcount {
        let (_, next) = decode_name(packet, offset)?;
        offset = next + 4;
    }

    let mut instances: Vec<String> = Vec::new();
    let mut srv: HashMap<String, (String, u16)> = HashMap::new();
    let mut txt: HashMap<String, Vec<String>> = HashMap::new();
    let mut addrs: HashMap<String, Vec<Ipv4Addr>> = HashMap::new();

    for _ in 0..record_count {
        let (name, next) = decode_name(packet, offset)?;
        offset = next;
        if packet.len() < offset + 10 {
            return Err(PacketError::Truncated {
                expected: offset + 10,
                actual: packet.len(),
            });
        }

        let rtype = u16::from_be_bytes([packet[offset], packet[offset + 1]]);
        let rdlength =
            u16::from_be_bytes([packet[offset + 8], packet[offset + 9]]) as usize;
        offset += 10;

        if packet.len() < offset + rdlength {
            return Err(PacketError::Truncated {
                expected: offset + rdlength,
                actual: packet.len(),
            });
        }
        let rdata_start = offset;
        let name_lower = name.to_lowercase();

        match rtype {
            DNS_TYPE_PTR if name_lower == service_type => {
                let (target, _) = decode_name(packet, rdata_start)?;
                instances.push(target.to_lowercase());
            }
            DNS_TYPE_SRV => {
                if rdlength < 7 {
                    return Err(PacketError::Truncated {
                        expected: rdata_start + 7,
                        actual: rdata_start + rdlength,
                    });
                }
                let port =
                    u16::from_be_bytes([packet[rdata_start + 4], packet[rdata_start + 5]]);
                let (target, _) = decode_name(packet, rdata_start + 6)?;
                srv.insert(name_lower, (target.to_lowercase(), port));
            }
            DNS_TYPE_TXT => {
                let mut strings = Vec::new();
                let mut pos = rdata_start;
                let end = rdata_start + rdlength;
                while pos < end {
                    let len = packet[pos] as usize;
                    pos += 1;
                    if len == 0 || pos + len > end {
                        break;
                    }
                    let s = std::str::from_utf8(&packet[pos..pos + len])
                        .map_err(|_| PacketError::InvalidUtf8)?;
                    strings.push(s.to_string());
                    pos += len;
                }
                txt.insert(name_lower, strings);
            }
            DNS_TYPE_A => {
                if rdlength == 4 {
                    let ip = Ipv4Addr::new(
                        packet[rdata_start],
                        packet[rdata_start + 1],
                        packet[rdata_start + 2],
                        packet[rdata_start + 3],
                    );
                    addrs.entry(name_lower).or_default().push(ip);
                }
            }
            _ => {}
        }

        offset += rdlength;
    }

    // SRV records without a matching PTR still identify instances (some
    // responders omit the PTR when answering a direct query).
    for fqdn in srv.keys() {
        if fqdn.ends_with(service_type) && !instances.contains(fqdn) {
            instances.push(fqdn.clone());
        }
    }

    let mut out = Vec::new();
    for fqdn in instances {
        let Some(instance) = fqdn.strip_suffix(&format!(".{service_type}")) else {
            continue;
        };
        let (hostname, port) = srv.get(&fqdn).cloned().unwrap_or_default();
        let ips = addrs.get(&hostname).cloned().unwrap_or_default();
        out.push(ServiceRecord {
            instance: instance.to_string(),
            service: service_type.to_string(),
            hostname,
            port,
            txt: txt.get(&fqdn).cloned().unwrap_or_default(),
            ips,
        });
    }

    Ok(out)
}

// =============================================================================
// Names
// =============================================================================

/// Encodes a domain name in DNS wire format.
pub fn encode_name(domain: &str) -> Vec<u8> {
    let mut result = Vec::with_capacity(domain.len() + 2);
    for label in domain.split('.') {
        if label.is_empty() {
            continue;
        }
        result.push(label.len() as u8);
        result.extend(label.as_bytes());
    }
    result.push(0);
    result
}

/// Decodes a domain name, following compression pointers (0xC0 prefix).
/// Returns the name and the offset just past it.
pub fn decode_name(packet: &[u8], start: usize) -> Result<(String, usize), PacketError> {
    let mut labels = Vec::new();
    let mut offset = start;
    let mut jumped = false;
    let mut next_offset = start;
    let mut jumps = 0;
    const MAX_JUMPS: usize = 10;

    loop {
        if offset >= packet.len() {
            return Err(PacketError::InvalidName(offset));
        }

        let len = packet[offset] as usize;

        if len == 0 {
            if !jumped {
                next_offset = offset + 1;
            }
            break;
        }

        if (len & 0xC0) == 0xC0 {
            if offset + 1 >= packet.len() {
                return Err(PacketError::InvalidName(offset));
            }
            jumps += 1;
            if jumps > MAX_JUMPS {
                return Err(PacketError::InvalidName(offset));
            }
            let pointer = ((len & 0x3F) << 8) | (packet[offset + 1] as usize);
            if !jumped {
                next_offset = offset + 2;
            }
            jumped = true;
            offset = pointer;
            continue;
        }

        offset += 1;
        if offset + len > packet.len() {
            return Err(PacketError::InvalidName(offset));
        }
        let label =
            std::str::from_utf8(&packet[offset..offset + len]).map_err(|_| PacketError::InvalidUtf8)?;
        labels.push(label.to_string());
        offset += len;
    }

    Ok((labels.join("."), next_offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DISCOVERY_SERVICE;

    fn sample_record() -> ServiceRecord {
        ServiceRecord {
            instance: "budgie-0123456789ab".to_string(),
            service: DISCOVERY_SERVICE.to_string(),
            hostname: "node-a.local".to_string(),
            port: 8080,
            txt: vec![
                "container_id=0123456789abcdef".to_string(),
                "node_id=node-a".to_string(),
                "container_name=web".to_string(),
                "image=nginx:alpine".to_string(),
            ],
            ips: vec![Ipv4Addr::new(192, 168, 1, 10)],
        }
    }

    #[test]
    fn test_name_roundtrip() {
        let encoded = encode_name("_budgie._tcp.local");
        let (decoded, len) = decode_name(&encoded, 0).unwrap();
        assert_eq!(decoded, "_budgie._tcp.local");
        assert_eq!(len, encoded.len());
    }

    #[test]
    fn test_decode_with_compression_pointer() {
        let mut packet = encode_name("_budgie._tcp.local");
        let first_end = packet.len();
        packet.push(6);
        packet.extend(b"budgie");
        packet.push(0xC0);
        packet.push(0x00);

        let (name, _) = decode_name(&packet, first_end).unwrap();
        assert_eq!(name, "budgie._budgie._tcp.local");
    }

    #[test]
    fn test_question_roundtrip() {
        let packet = build_ptr_question(DISCOVERY_SERVICE);
        let q = parse_question(&packet).unwrap().unwrap();
        assert_eq!(q.name, DISCOVERY_SERVICE);
        assert_eq!(q.qtype, DNS_TYPE_PTR);
        assert!(!q.unicast_response);
    }

    #[test]
    fn test_announcement_roundtrip() {
        let record = sample_record();
        let packet = build_service_announcement(&record, 120);

        let parsed = parse_service_response(&packet, DISCOVERY_SERVICE).unwrap();
        assert_eq!(parsed.len(), 1);
        let got = &parsed[0];
        assert_eq!(got.instance, record.instance);
        assert_eq!(got.port, 8080);
        assert_eq!(got.hostname, "node-a.local");
        assert_eq!(got.ips, record.ips);
        assert_eq!(
            got.txt_map().get("container_name").map(String::as_str),
            Some("web")
        );
    }

    #[test]
    fn test_goodbye_has_zero_ttl() {
        let record = sample_record();
        let packet = build_goodbye(&record);
        // PTR record TTL sits right after the encoded service name + type
        // + class in the first answer.
        let name_len = encode_name(&record.service).len();
        let ttl_pos = 12 + name_len + 4;
        assert_eq!(&packet[ttl_pos..ttl_pos + 4], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_query_packet_yields_no_services() {
        let packet = build_ptr_question(DISCOVERY_SERVICE);
        let parsed = parse_service_response(&packet, DISCOVERY_SERVICE).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_truncated_packet_is_error() {
        assert!(matches!(
            parse_question(&[0x00, 0x01, 0x00]),
            Err(PacketError::Truncated { .. })
        ));
    }

    #[test]
    fn test_foreign_service_filtered() {
        let mut record = sample_record();
        record.service = "_other._tcp.local".to_string();
        let packet = build_service_announcement(&record, 120);
        let parsed = parse_service_response(&packet, DISCOVERY_SERVICE).unwrap();
        assert!(parsed.is_empty());
    }
}
