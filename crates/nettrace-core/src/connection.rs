//! Connection records
//!
//! A [`ConnectionRecord`] is the structured form of one kernel-tracked flow,
//! carrying both the monotonic counters read from the kernel and the interval
//! counters derived by the state tracker.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// A wire discriminant that does not map to a known variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown {kind} discriminant: {value}")]
pub struct UnknownDiscriminant {
    pub kind: &'static str,
    pub value: u8,
}

/// Transport protocol of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ConnectionType {
    #[default]
    Tcp,
    Udp,
}

impl ConnectionType {
    /// Kernel tuples carry a single `is_tcp` byte
    pub fn from_tcp_flag(is_tcp: u8) -> Self {
        if is_tcp == 0 {
            ConnectionType::Udp
        } else {
            ConnectionType::Tcp
        }
    }
}

impl From<ConnectionType> for u8 {
    fn from(t: ConnectionType) -> u8 {
        match t {
            ConnectionType::Tcp => 0,
            ConnectionType::Udp => 1,
        }
    }
}

impl TryFrom<u8> for ConnectionType {
    type Error = UnknownDiscriminant;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnectionType::Tcp),
            1 => Ok(ConnectionType::Udp),
            _ => Err(UnknownDiscriminant {
                kind: "connection type",
                value,
            }),
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionType::Tcp => write!(f, "tcp"),
            ConnectionType::Udp => write!(f, "udp"),
        }
    }
}

/// Address family of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ConnectionFamily {
    #[default]
    Ipv4,
    Ipv6,
}

impl From<ConnectionFamily> for u8 {
    fn from(f: ConnectionFamily) -> u8 {
        match f {
            ConnectionFamily::Ipv4 => 0,
            ConnectionFamily::Ipv6 => 1,
        }
    }
}

impl TryFrom<u8> for ConnectionFamily {
    type Error = UnknownDiscriminant;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnectionFamily::Ipv4),
            1 => Ok(ConnectionFamily::Ipv6),
            _ => Err(UnknownDiscriminant {
                kind: "address family",
                value,
            }),
        }
    }
}

impl fmt::Display for ConnectionFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionFamily::Ipv4 => write!(f, "v4"),
            ConnectionFamily::Ipv6 => write!(f, "v6"),
        }
    }
}

/// Direction of a connection relative to this host
///
/// Values outside the known range are carried through untouched so that
/// payloads produced by newer tracers still decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum ConnectionDirection {
    #[default]
    None,
    Incoming,
    Outgoing,
    Local,
    Other(u8),
}

impl From<u8> for ConnectionDirection {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionDirection::None,
            1 => ConnectionDirection::Incoming,
            2 => ConnectionDirection::Outgoing,
            3 => ConnectionDirection::Local,
            other => ConnectionDirection::Other(other),
        }
    }
}

impl From<ConnectionDirection> for u8 {
    fn from(d: ConnectionDirection) -> u8 {
        match d {
            ConnectionDirection::None => 0,
            ConnectionDirection::Incoming => 1,
            ConnectionDirection::Outgoing => 2,
            ConnectionDirection::Local => 3,
            ConnectionDirection::Other(v) => v,
        }
    }
}

impl fmt::Display for ConnectionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionDirection::None => write!(f, "none"),
            ConnectionDirection::Incoming => write!(f, "incoming"),
            ConnectionDirection::Outgoing => write!(f, "outgoing"),
            ConnectionDirection::Local => write!(f, "local"),
            ConnectionDirection::Other(v) => write!(f, "other({})", v),
        }
    }
}

impl ConnectionDirection {
    /// Label a record relative to this host.
    ///
    /// Loopback or self-addressed traffic is local. A flow whose source port
    /// is one of our listening ports was accepted, so it is incoming.
    pub fn classify(record: &ConnectionRecord, listening: &ListeningPorts) -> Self {
        if record.dest.is_loopback() || record.dest == record.source {
            return ConnectionDirection::Local;
        }
        if listening.contains(record.conn_type, record.sport) {
            return ConnectionDirection::Incoming;
        }
        ConnectionDirection::Outgoing
    }
}

/// Ports this host is listening on, per protocol
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListeningPorts {
    ports: HashSet<(ConnectionType, u16)>,
}

impl ListeningPorts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, conn_type: ConnectionType, port: u16) {
        self.ports.insert((conn_type, port));
    }

    pub fn contains(&self, conn_type: ConnectionType, port: u16) -> bool {
        self.ports.contains(&(conn_type, port))
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

impl FromIterator<(ConnectionType, u16)> for ListeningPorts {
    fn from_iter<I: IntoIterator<Item = (ConnectionType, u16)>>(iter: I) -> Self {
        Self {
            ports: iter.into_iter().collect(),
        }
    }
}

/// Raw address octets, the structured form of an endpoint address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StructuredAddress {
    /// 4 octets for IPv4, 16 for IPv6
    pub octets: Vec<u8>,
}

/// Endpoint address as it appears on the wire
///
/// Payloads have historically carried either dotted/colon text or a
/// structured value; both decode into this type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Address {
    Text(String),
    Structured(StructuredAddress),
}

impl Address {
    /// Build an address in text or structured form
    pub fn from_ip(ip: IpAddr, structured: bool) -> Self {
        if structured {
            let octets = match ip {
                IpAddr::V4(v4) => v4.octets().to_vec(),
                IpAddr::V6(v6) => v6.octets().to_vec(),
            };
            Address::Structured(StructuredAddress { octets })
        } else {
            Address::Text(ip.to_string())
        }
    }

    /// Interpret the address as an IP, if it is one
    pub fn to_ip(&self) -> Option<IpAddr> {
        match self {
            Address::Text(s) => s.parse().ok(),
            Address::Structured(s) => match s.octets.len() {
                4 => {
                    let mut buf = [0u8; 4];
                    buf.copy_from_slice(&s.octets);
                    Some(IpAddr::V4(Ipv4Addr::from(buf)))
                }
                16 => {
                    let mut buf = [0u8; 16];
                    buf.copy_from_slice(&s.octets);
                    Some(IpAddr::V6(Ipv6Addr::from(buf)))
                }
                _ => None,
            },
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.to_ip().map(|ip| ip.is_loopback()).unwrap_or(false)
    }
}

impl Default for Address {
    fn default() -> Self {
        Address::Text(String::new())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Text(s) => write!(f, "{}", s),
            Address::Structured(_) => match self.to_ip() {
                Some(ip) => write!(f, "{}", ip),
                None => write!(f, "<invalid>"),
            },
        }
    }
}

/// NAT translation learned from conntrack
///
/// Holds the addresses seen on the reply direction of a translated flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct IPTranslation {
    pub repl_src_ip: String,
    pub repl_dst_ip: String,
    pub repl_src_port: u16,
    pub repl_dst_port: u16,
}

/// Identity of one flow in tracker state
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub pid: u32,
    pub net_ns: u32,
    pub conn_type: ConnectionType,
    pub family: ConnectionFamily,
    pub source: Address,
    pub sport: u16,
    pub dest: Address,
    pub dport: u16,
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}{}] pid={} ns={} {}:{} -> {}:{}",
            self.conn_type,
            self.family,
            self.pid,
            self.net_ns,
            self.source,
            self.sport,
            self.dest,
            self.dport
        )
    }
}

/// One connection as emitted on the wire
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionRecord {
    pub source: Address,
    pub dest: Address,

    /// Bytes sent since the flow was first seen by the kernel
    pub monotonic_sent_bytes: u64,
    /// Bytes sent since the previous poll
    pub last_sent_bytes: u64,
    pub monotonic_recv_bytes: u64,
    pub last_recv_bytes: u64,

    /// Poll time of the most recent observation
    pub last_update_epoch: u64,

    pub monotonic_retransmits: u32,
    pub last_retransmits: u32,

    pub pid: u32,
    pub net_ns: u32,
    pub sport: u16,
    pub dport: u16,

    #[serde(rename = "type")]
    pub conn_type: ConnectionType,
    pub family: ConnectionFamily,
    pub direction: ConnectionDirection,

    /// NAT translation, `null` when the flow is not translated
    #[serde(
        rename = "conntrack",
        deserialize_with = "crate::codec::lenient_translation"
    )]
    pub ip_translation: Option<IPTranslation>,
}

impl ConnectionRecord {
    /// Tracker identity of this record
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey {
            pid: self.pid,
            net_ns: self.net_ns,
            conn_type: self.conn_type,
            family: self.family,
            source: self.source.clone(),
            sport: self.sport,
            dest: self.dest.clone(),
            dport: self.dport,
        }
    }
}

/// The set of connections handed to the transport collaborator
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Connections {
    #[serde(
        rename = "connections",
        default,
        deserialize_with = "crate::codec::null_as_empty"
    )]
    pub conns: Vec<ConnectionRecord>,
}

impl Connections {
    pub fn new(conns: Vec<ConnectionRecord>) -> Self {
        Self { conns }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}
