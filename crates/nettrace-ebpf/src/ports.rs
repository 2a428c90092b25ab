//! Listening sockets via the /proc filesystem
//!
//! Direction classification needs the set of local ports that accept
//! connections. These are read from `/proc/net/{tcp,tcp6,udp,udp6}` on every
//! poll.

use nettrace_core::{ConnectionType, ListeningPorts};
use std::fs;
use std::path::Path;
use tracing::{debug, trace};

/// `TCP_LISTEN` in the `st` column
const TCP_STATE_LISTEN: u8 = 0x0A;
/// `TCP_CLOSE`, which unconnected bound UDP sockets report
const UDP_STATE_UNCONNECTED: u8 = 0x07;

/// Socket tables and the protocol each describes
const PROC_NET_TABLES: [(&str, ConnectionType); 4] = [
    ("tcp", ConnectionType::Tcp),
    ("tcp6", ConnectionType::Tcp),
    ("udp", ConnectionType::Udp),
    ("udp6", ConnectionType::Udp),
];

/// Read listening ports from a directory laid out like `/proc/net`.
///
/// Missing tables are skipped; an IPv6-disabled host has no `tcp6`.
pub fn read_listening_ports_from(dir: &Path) -> ListeningPorts {
    let mut listening = ListeningPorts::new();

    for (name, conn_type) in PROC_NET_TABLES {
        let path = dir.join(name);
        match fs::read_to_string(&path) {
            Ok(content) => parse_socket_table(&content, conn_type, &mut listening),
            Err(e) => trace!("Skipping {}: {}", path.display(), e),
        }
    }

    debug!("Found {} listening ports", listening.len());
    listening
}

/// Parse one socket table, header line included
fn parse_socket_table(content: &str, conn_type: ConnectionType, out: &mut ListeningPorts) {
    let wanted = match conn_type {
        ConnectionType::Tcp => TCP_STATE_LISTEN,
        ConnectionType::Udp => UDP_STATE_UNCONNECTED,
    };

    for line in content.lines().skip(1) {
        if let Some((port, state)) = parse_socket_line(line) {
            if state == wanted {
                out.insert(conn_type, port);
            }
        }
    }
}

/// Local port and state of one table row
///
/// Format: `sl local_address rem_address st ...`, with the local address
/// as `HEXIP:HEXPORT`. The IP width differs between v4 and v6 tables but
/// the port is always the part after the colon.
fn parse_socket_line(line: &str) -> Option<(u16, u8)> {
    let mut parts = line.split_whitespace();
    let _slot = parts.next()?;
    let local = parts.next()?;
    let _remote = parts.next()?;
    let state = parts.next()?;

    let (_, port_hex) = local.rsplit_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let state = u8::from_str_radix(state, 16).ok()?;

    Some((port, state))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TCP: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 21012 1 0000000000000000 100 0 0 10 0
   1: 0100007F:0277 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 18201 1 0000000000000000 100 0 0 10 0
   2: 0F02000A:B3E2 5DB8D822:01BB 01 00000000:00000000 02:000A7D3A 00000000  1000        0 99812 2 0000000000000000 20 4 30 10 -1
";

    const TCP6: &str = "  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000000000000:0016 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 20311 1 0000000000000000 100 0 0 10 0
";

    const UDP: &str = "   sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode ref pointer drops
  123: 3500007F:0035 00000000:0000 07 00000000:00000000 00:00000000 00000000   101        0 17760 2 0000000000000000 0
  456: 0F02000A:9C40 08080808:0035 01 00000000:00000000 00:00000000 00000000  1000        0 55321 2 0000000000000000 0
";

    #[test]
    fn test_parse_socket_line() {
        let line = "   0: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 21012";
        assert_eq!(parse_socket_line(line), Some((8080, 0x0A)));
        assert_eq!(parse_socket_line("garbage"), None);
        assert_eq!(parse_socket_line("0: 00000000:ZZZZ 00000000:0000 0A"), None);
    }

    #[test]
    fn test_tcp_listeners_only() {
        let mut ports = ListeningPorts::new();
        parse_socket_table(TCP, ConnectionType::Tcp, &mut ports);

        assert!(ports.contains(ConnectionType::Tcp, 8080));
        assert!(ports.contains(ConnectionType::Tcp, 631));
        // established outbound socket
        assert!(!ports.contains(ConnectionType::Tcp, 0xB3E2));
        assert!(!ports.contains(ConnectionType::Udp, 8080));
    }

    #[test]
    fn test_udp_bound_sockets() {
        let mut ports = ListeningPorts::new();
        parse_socket_table(UDP, ConnectionType::Udp, &mut ports);

        assert!(ports.contains(ConnectionType::Udp, 53));
        assert!(!ports.contains(ConnectionType::Udp, 0x9C40));
        assert_eq!(ports.len(), 1);
    }

    #[test]
    fn test_read_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("tcp"), TCP).unwrap();
        fs::write(dir.path().join("tcp6"), TCP6).unwrap();
        fs::write(dir.path().join("udp"), UDP).unwrap();
        // no udp6

        let ports = read_listening_ports_from(dir.path());
        assert!(ports.contains(ConnectionType::Tcp, 22));
        assert!(ports.contains(ConnectionType::Tcp, 8080));
        assert!(ports.contains(ConnectionType::Udp, 53));
        assert_eq!(ports.len(), 4);
    }
}
