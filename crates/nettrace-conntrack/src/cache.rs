//! NAT translation cache
//!
//! Rebuilt from each conntrack dump. Every translated entry is reachable from
//! both ends: a socket on the pre-NAT side sees the original tuple, a socket
//! on the post-NAT side sees the reply tuple. Either way the translation is
//! the tuple of the other direction, the packets travelling back toward that
//! socket.

use crate::netlink::{ConntrackEntry, Tuple, IPPROTO_TCP, IPPROTO_UDP};
use nettrace_core::{ConnectionKey, ConnectionType, IPTranslation};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Lookup key, a flow as seen by one of its sockets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TranslationKey {
    pub proto: u8,
    pub src: IpAddr,
    pub sport: u16,
    pub dst: IpAddr,
    pub dport: u16,
}

impl TranslationKey {
    /// `None` when either address is not an IP
    pub fn from_connection(key: &ConnectionKey) -> Option<Self> {
        Some(Self {
            proto: match key.conn_type {
                ConnectionType::Tcp => IPPROTO_TCP,
                ConnectionType::Udp => IPPROTO_UDP,
            },
            src: key.source.to_ip()?,
            sport: key.sport,
            dst: key.dest.to_ip()?,
            dport: key.dport,
        })
    }
}

impl From<&Tuple> for TranslationKey {
    fn from(t: &Tuple) -> Self {
        Self {
            proto: t.proto,
            src: t.src,
            sport: t.sport,
            dst: t.dst,
            dport: t.dport,
        }
    }
}

/// Translation carrying the tuple of the opposite direction as-is
fn translation_of(tuple: &Tuple) -> IPTranslation {
    IPTranslation {
        repl_src_ip: tuple.src.to_string(),
        repl_dst_ip: tuple.dst.to_string(),
        repl_src_port: tuple.sport,
        repl_dst_port: tuple.dport,
    }
}

/// Bounded map from flow to NAT translation
pub struct TranslationCache {
    entries: RwLock<HashMap<TranslationKey, IPTranslation>>,
    max_entries: usize,
    populated: AtomicBool,
}

impl TranslationCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries,
            populated: AtomicBool::new(false),
        }
    }

    /// Replace the contents with the NAT entries of a fresh dump.
    ///
    /// Returns the number of keys now cached.
    pub fn replace(&self, dump: &[ConntrackEntry]) -> usize {
        let mut fresh = HashMap::new();
        let mut truncated = false;

        for entry in dump.iter().filter(|e| e.is_nat()) {
            if fresh.len() + 2 > self.max_entries {
                truncated = true;
                break;
            }
            fresh.insert(
                TranslationKey::from(&entry.orig),
                translation_of(&entry.reply),
            );
            fresh.insert(
                TranslationKey::from(&entry.reply),
                translation_of(&entry.orig),
            );
        }

        if truncated {
            warn!(
                "Conntrack cache full at {} keys, remaining NAT entries ignored",
                self.max_entries
            );
        }

        let count = fresh.len();
        *self.entries.write() = fresh;
        self.populated.store(true, Ordering::Release);
        debug!("Translation cache holds {} keys", count);
        count
    }

    /// Whether any dump has been loaded yet
    pub fn is_populated(&self) -> bool {
        self.populated.load(Ordering::Acquire)
    }

    pub fn get(&self, key: &TranslationKey) -> Option<IPTranslation> {
        self.entries.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::tests::snat_entry;
    use nettrace_core::{Address, ConnectionFamily};

    fn key(src: &str, sport: u16, dst: &str, dport: u16) -> ConnectionKey {
        ConnectionKey {
            pid: 1,
            net_ns: 1,
            conn_type: ConnectionType::Tcp,
            family: ConnectionFamily::Ipv4,
            source: Address::Text(src.to_string()),
            sport,
            dest: Address::Text(dst.to_string()),
            dport,
        }
    }

    #[test]
    fn test_both_ends_resolve() {
        let (orig, reply) = snat_entry();
        let cache = TranslationCache::new(16);
        assert_eq!(cache.replace(&[ConntrackEntry { orig, reply }]), 2);

        let k = TranslationKey::from_connection(&key("10.0.0.5", 40000, "93.184.216.34", 443));
        let t = cache.get(&k.unwrap()).unwrap();
        assert_eq!(t.repl_src_ip, "93.184.216.34");
        assert_eq!(t.repl_dst_ip, "192.168.1.10");
        assert_eq!(t.repl_src_port, 443);
        assert_eq!(t.repl_dst_port, 61000);

        let k = TranslationKey::from_connection(&key("93.184.216.34", 443, "192.168.1.10", 61000));
        let t = cache.get(&k.unwrap()).unwrap();
        assert_eq!(t.repl_src_ip, "10.0.0.5");
        assert_eq!(t.repl_src_port, 40000);
        assert_eq!(t.repl_dst_ip, "93.184.216.34");
        assert_eq!(t.repl_dst_port, 443);
    }

    #[test]
    fn test_untranslated_entries_ignored() {
        let (orig, _) = snat_entry();
        let cache = TranslationCache::new(16);
        let plain = ConntrackEntry {
            orig,
            reply: orig.reversed(),
        };
        assert_eq!(cache.replace(&[plain]), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_replace_drops_stale_keys() {
        let (orig, reply) = snat_entry();
        let cache = TranslationCache::new(16);
        cache.replace(&[ConntrackEntry { orig, reply }]);
        cache.replace(&[]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_bounded() {
        let (orig, reply) = snat_entry();
        let mut other = ConntrackEntry { orig, reply };
        other.orig.sport = 40001;
        other.reply.dport = 61001;

        let cache = TranslationCache::new(3);
        assert_eq!(cache.replace(&[ConntrackEntry { orig, reply }, other]), 2);
    }

    #[test]
    fn test_non_ip_address() {
        assert!(TranslationKey::from_connection(&key("", 1, "10.0.0.1", 2)).is_none());
    }
}
