//! Kernel record layouts and decoding
//!
//! The probes store one `(tuple, stats)` pair per flow in a hash map per
//! address family. Records are little-endian C structs with the layouts
//! below; all interpretation of their bytes happens in this module.
//!
//! ```text
//! ipv4_tuple (24 bytes)            ipv6_tuple (48 bytes)
//!   0  saddr   u32                   0  saddr_h u64
//!   4  daddr   u32                   8  saddr_l u64
//!   8  sport   u16                  16  daddr_h u64
//!  10  dport   u16                  24  daddr_l u64
//!  12  netns   u32                  32  sport   u16
//!  16  pid     u32                  34  dport   u16
//!  20  is_tcp  u8                   36  netns   u32
//!                                   40  pid     u32
//! conn_stats_ts (32 bytes)          44  is_tcp  u8
//!   0  send_bytes  u64
//!   8  recv_bytes  u64
//!  16  timestamp   u64
//!  24  retransmits u32
//! ```

use nettrace_core::{
    Address, ConnectionDirection, ConnectionFamily, ConnectionRecord, ConnectionType,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Size of an IPv4 tuple record
pub const TUPLE_V4_LEN: usize = 24;

/// Size of an IPv6 tuple record
pub const TUPLE_V6_LEN: usize = 48;

/// Size of a stats record
pub const STATS_LEN: usize = 32;

/// Raw IPv4 tuple bytes as stored in the kernel map
pub type RawTupleV4 = [u8; TUPLE_V4_LEN];

/// Raw IPv6 tuple bytes as stored in the kernel map
pub type RawTupleV6 = [u8; TUPLE_V6_LEN];

/// Raw stats bytes as stored in the kernel map
pub type RawStats = [u8; STATS_LEN];

fn u16_at(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn u32_at(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

fn u64_at(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

/// Decoded IPv4 tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnTupleV4 {
    pub saddr: u32,
    pub daddr: u32,
    pub sport: u16,
    pub dport: u16,
    pub netns: u32,
    pub pid: u32,
    pub is_tcp: u8,
}

impl ConnTupleV4 {
    pub fn decode(raw: &RawTupleV4) -> Self {
        Self {
            saddr: u32_at(raw, 0),
            daddr: u32_at(raw, 4),
            sport: u16_at(raw, 8),
            dport: u16_at(raw, 10),
            netns: u32_at(raw, 12),
            pid: u32_at(raw, 16),
            is_tcp: raw[20],
        }
    }

    /// Inverse of [`ConnTupleV4::decode`]
    #[cfg(test)]
    pub fn encode(&self) -> RawTupleV4 {
        let mut raw = [0u8; TUPLE_V4_LEN];
        raw[0..4].copy_from_slice(&self.saddr.to_le_bytes());
        raw[4..8].copy_from_slice(&self.daddr.to_le_bytes());
        raw[8..10].copy_from_slice(&self.sport.to_le_bytes());
        raw[10..12].copy_from_slice(&self.dport.to_le_bytes());
        raw[12..16].copy_from_slice(&self.netns.to_le_bytes());
        raw[16..20].copy_from_slice(&self.pid.to_le_bytes());
        raw[20] = self.is_tcp;
        raw
    }
}

/// Decoded IPv6 tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnTupleV6 {
    pub saddr_h: u64,
    pub saddr_l: u64,
    pub daddr_h: u64,
    pub daddr_l: u64,
    pub sport: u16,
    pub dport: u16,
    pub netns: u32,
    pub pid: u32,
    pub is_tcp: u8,
}

impl ConnTupleV6 {
    pub fn decode(raw: &RawTupleV6) -> Self {
        Self {
            saddr_h: u64_at(raw, 0),
            saddr_l: u64_at(raw, 8),
            daddr_h: u64_at(raw, 16),
            daddr_l: u64_at(raw, 24),
            sport: u16_at(raw, 32),
            dport: u16_at(raw, 34),
            netns: u32_at(raw, 36),
            pid: u32_at(raw, 40),
            is_tcp: raw[44],
        }
    }

    /// Inverse of [`ConnTupleV6::decode`]
    #[cfg(test)]
    pub fn encode(&self) -> RawTupleV6 {
        let mut raw = [0u8; TUPLE_V6_LEN];
        raw[0..8].copy_from_slice(&self.saddr_h.to_le_bytes());
        raw[8..16].copy_from_slice(&self.saddr_l.to_le_bytes());
        raw[16..24].copy_from_slice(&self.daddr_h.to_le_bytes());
        raw[24..32].copy_from_slice(&self.daddr_l.to_le_bytes());
        raw[32..34].copy_from_slice(&self.sport.to_le_bytes());
        raw[34..36].copy_from_slice(&self.dport.to_le_bytes());
        raw[36..40].copy_from_slice(&self.netns.to_le_bytes());
        raw[40..44].copy_from_slice(&self.pid.to_le_bytes());
        raw[44] = self.is_tcp;
        raw
    }
}

/// Decoded per-flow counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnStats {
    pub send_bytes: u64,
    pub recv_bytes: u64,
    /// Kernel monotonic clock (ns) of the last update
    pub timestamp: u64,
    /// Always zero for UDP
    pub retransmits: u32,
}

impl ConnStats {
    pub fn decode(raw: &RawStats) -> Self {
        Self {
            send_bytes: u64_at(raw, 0),
            recv_bytes: u64_at(raw, 8),
            timestamp: u64_at(raw, 16),
            retransmits: u32_at(raw, 24),
        }
    }

    #[cfg(test)]
    pub fn encode(&self) -> RawStats {
        let mut raw = [0u8; STATS_LEN];
        raw[0..8].copy_from_slice(&self.send_bytes.to_le_bytes());
        raw[8..16].copy_from_slice(&self.recv_bytes.to_le_bytes());
        raw[16..24].copy_from_slice(&self.timestamp.to_le_bytes());
        raw[24..28].copy_from_slice(&self.retransmits.to_le_bytes());
        raw
    }

    /// Whether the kernel entry has been idle for longer than `timeout`
    pub fn is_expired(&self, latest_time: u64, timeout: u64) -> bool {
        crate::tracker::is_expired(latest_time, self.timestamp, timeout)
    }
}

/// IPv4 address from the 32-bit value as the kernel stored it
pub fn v4_ip(addr: u32) -> Ipv4Addr {
    Ipv4Addr::from(addr.to_le_bytes())
}

/// IPv6 address from its two 64-bit halves
pub fn v6_ip(addr_h: u64, addr_l: u64) -> Ipv6Addr {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&addr_h.to_le_bytes());
    buf[8..].copy_from_slice(&addr_l.to_le_bytes());
    Ipv6Addr::from(buf)
}

/// IPv6 endpoint as reported; an IPv4-mapped address (`::ffff:a.b.c.d`)
/// from a dual-stack socket becomes the plain IPv4 address
pub fn v6_endpoint(addr_h: u64, addr_l: u64) -> IpAddr {
    let ip = v6_ip(addr_h, addr_l);
    match ip.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(ip),
    }
}

/// Build a record from an IPv4 tuple; interval counters stay zero
pub fn conn_stats_from_v4(t: &ConnTupleV4, s: &ConnStats, structured: bool) -> ConnectionRecord {
    ConnectionRecord {
        pid: t.pid,
        net_ns: t.netns,
        conn_type: ConnectionType::from_tcp_flag(t.is_tcp),
        family: ConnectionFamily::Ipv4,
        source: Address::from_ip(IpAddr::V4(v4_ip(t.saddr)), structured),
        dest: Address::from_ip(IpAddr::V4(v4_ip(t.daddr)), structured),
        sport: t.sport,
        dport: t.dport,
        monotonic_sent_bytes: s.send_bytes,
        monotonic_recv_bytes: s.recv_bytes,
        monotonic_retransmits: s.retransmits,
        direction: ConnectionDirection::None,
        ..Default::default()
    }
}

/// Build a record from an IPv6 tuple; interval counters stay zero
pub fn conn_stats_from_v6(t: &ConnTupleV6, s: &ConnStats, structured: bool) -> ConnectionRecord {
    ConnectionRecord {
        pid: t.pid,
        net_ns: t.netns,
        conn_type: ConnectionType::from_tcp_flag(t.is_tcp),
        family: ConnectionFamily::Ipv6,
        source: Address::from_ip(v6_endpoint(t.saddr_h, t.saddr_l), structured),
        dest: Address::from_ip(v6_endpoint(t.daddr_h, t.daddr_l), structured),
        sport: t.sport,
        dport: t.dport,
        monotonic_sent_bytes: s.send_bytes,
        monotonic_recv_bytes: s.recv_bytes,
        monotonic_retransmits: s.retransmits,
        direction: ConnectionDirection::None,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_addresses() {
        assert_eq!(v4_ip(0).to_string(), "0.0.0.0");
        assert_eq!(v6_endpoint(0, 0).to_string(), "::");
    }

    #[test]
    fn test_v4_little_endian_packing() {
        // 10.0.2.15 as the kernel stores it: network order read as a LE u32
        let addr = u32::from_le_bytes([10, 0, 2, 15]);
        assert_eq!(v4_ip(addr).to_string(), "10.0.2.15");
    }

    #[test]
    fn test_v6_halves() {
        let loopback = Ipv6Addr::LOCALHOST.octets();
        let mut h = [0u8; 8];
        let mut l = [0u8; 8];
        h.copy_from_slice(&loopback[..8]);
        l.copy_from_slice(&loopback[8..]);
        assert_eq!(
            v6_endpoint(u64::from_le_bytes(h), u64::from_le_bytes(l)).to_string(),
            "::1"
        );
    }

    #[test]
    fn test_decode_v4_record() {
        let mut raw = [0u8; TUPLE_V4_LEN];
        raw[0..4].copy_from_slice(&[192, 168, 1, 10]);
        raw[4..8].copy_from_slice(&[93, 184, 216, 34]);
        raw[8..10].copy_from_slice(&51234u16.to_le_bytes());
        raw[10..12].copy_from_slice(&443u16.to_le_bytes());
        raw[12..16].copy_from_slice(&4026531992u32.to_le_bytes());
        raw[16..20].copy_from_slice(&4242u32.to_le_bytes());
        raw[20] = 1;

        let stats = ConnStats {
            send_bytes: 1024,
            recv_bytes: 2048,
            timestamp: 99,
            retransmits: 2,
        };

        let tuple = ConnTupleV4::decode(&raw);
        let record = conn_stats_from_v4(&tuple, &ConnStats::decode(&stats.encode()), false);

        assert_eq!(record.source.to_string(), "192.168.1.10");
        assert_eq!(record.dest.to_string(), "93.184.216.34");
        assert_eq!(record.sport, 51234);
        assert_eq!(record.dport, 443);
        assert_eq!(record.net_ns, 4026531992);
        assert_eq!(record.pid, 4242);
        assert_eq!(record.conn_type, ConnectionType::Tcp);
        assert_eq!(record.family, ConnectionFamily::Ipv4);
        assert_eq!(record.monotonic_sent_bytes, 1024);
        assert_eq!(record.monotonic_recv_bytes, 2048);
        assert_eq!(record.monotonic_retransmits, 2);
        assert_eq!(record.last_sent_bytes, 0);
        assert_eq!(record.last_recv_bytes, 0);
        assert_eq!(tuple.encode(), raw);
    }

    #[test]
    fn test_decode_v6_udp_record() {
        let tuple = ConnTupleV6 {
            saddr_h: 0,
            saddr_l: 0,
            daddr_h: 0,
            daddr_l: u64::from_le_bytes([0, 0, 0, 0, 0, 0, 0, 1]),
            sport: 5353,
            dport: 53,
            netns: 1,
            pid: 7,
            is_tcp: 0,
        };
        let decoded = ConnTupleV6::decode(&tuple.encode());
        assert_eq!(decoded, tuple);

        let record = conn_stats_from_v6(&decoded, &ConnStats::default(), true);
        assert_eq!(record.source.to_string(), "::");
        assert_eq!(record.dest.to_string(), "::1");
        assert!(record.dest.is_loopback());
        assert_eq!(record.conn_type, ConnectionType::Udp);
        assert_eq!(record.family, ConnectionFamily::Ipv6);
    }

    fn v6_halves(ip: Ipv6Addr) -> (u64, u64) {
        let octets = ip.octets();
        let mut h = [0u8; 8];
        let mut l = [0u8; 8];
        h.copy_from_slice(&octets[..8]);
        l.copy_from_slice(&octets[8..]);
        (u64::from_le_bytes(h), u64::from_le_bytes(l))
    }

    #[test]
    fn test_v4_mapped_v6_renders_as_v4() {
        let (lo_h, lo_l) = v6_halves(Ipv4Addr::LOCALHOST.to_ipv6_mapped());
        assert_eq!(v6_endpoint(lo_h, lo_l).to_string(), "127.0.0.1");

        let (src_h, src_l) = v6_halves("::ffff:10.0.0.5".parse().unwrap());
        let tuple = ConnTupleV6 {
            saddr_h: src_h,
            saddr_l: src_l,
            daddr_h: lo_h,
            daddr_l: lo_l,
            sport: 40000,
            dport: 8080,
            netns: 1,
            pid: 7,
            is_tcp: 1,
        };
        let record = conn_stats_from_v6(&tuple, &ConnStats::default(), false);
        assert_eq!(record.source.to_string(), "10.0.0.5");
        assert_eq!(record.dest.to_string(), "127.0.0.1");
        assert!(record.dest.is_loopback());
        assert_eq!(record.family, ConnectionFamily::Ipv6);

        let structured = conn_stats_from_v6(&tuple, &ConnStats::default(), true);
        assert_eq!(structured.source.to_ip(), Some("10.0.0.5".parse().unwrap()));

        // Other v6 addresses are left alone
        let (h, l) = v6_halves("2001:db8::1".parse().unwrap());
        assert_eq!(v6_endpoint(h, l).to_string(), "2001:db8::1");
    }
}
