//! Conntrack-backed translation source

use crate::cache::{TranslationCache, TranslationKey};
use crate::netlink::ConntrackResult;
use async_trait::async_trait;
use nettrace_core::config::ConntrackSettings;
use nettrace_core::translation::{TranslationError, TranslationResult};
use nettrace_core::{ConnectionKey, IPTranslation, TranslationSource};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Periodically dumps the kernel conntrack table and answers lookups from
/// the last dump
pub struct NetlinkConntracker {
    cache: TranslationCache,
    seq: AtomicU32,
    refresh_interval: Duration,
}

impl NetlinkConntracker {
    pub fn new(settings: &ConntrackSettings) -> Self {
        Self {
            cache: TranslationCache::new(settings.max_entries),
            seq: AtomicU32::new(1),
            refresh_interval: Duration::from_secs(settings.refresh_interval_secs.max(1)),
        }
    }

    /// Dump the table once and rebuild the cache
    #[cfg(target_os = "linux")]
    pub async fn refresh(&self) -> ConntrackResult<usize> {
        use crate::netlink::ConntrackError;
        use crate::socket::NetlinkSocket;

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let entries = tokio::task::spawn_blocking(move || NetlinkSocket::open()?.dump(seq))
            .await
            .map_err(|e| ConntrackError::Socket(std::io::Error::other(e)))??;

        Ok(self.cache.replace(&entries))
    }

    #[cfg(not(target_os = "linux"))]
    pub async fn refresh(&self) -> ConntrackResult<usize> {
        let _ = self.seq.fetch_add(1, Ordering::Relaxed);
        Err(crate::netlink::ConntrackError::Unsupported)
    }

    /// Refresh on a fixed interval until the handle is aborted
    pub fn spawn_refresher(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let period = self.refresh_interval;

        tokio::spawn(async move {
            info!("Conntrack refresher started (every {:?})", period);
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match this.refresh().await {
                    Ok(count) => debug!("Conntrack refreshed, {} translation keys", count),
                    Err(e) => warn!("Conntrack refresh failed: {}", e),
                }
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> &TranslationCache {
        &self.cache
    }
}

#[async_trait]
impl TranslationSource for NetlinkConntracker {
    fn name(&self) -> &str {
        "netlink-conntrack"
    }

    async fn lookup_translation(
        &self,
        key: &ConnectionKey,
    ) -> TranslationResult<Option<IPTranslation>> {
        if !self.cache.is_populated() {
            return Err(TranslationError::Unavailable(
                "no conntrack dump loaded yet".to_string(),
            ));
        }
        Ok(TranslationKey::from_connection(key).and_then(|k| self.cache.get(&k)))
    }

    fn len(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::tests::{conntrack_message, done_message, snat_entry};
    use crate::netlink::{parse_messages, Message};
    use nettrace_core::{Address, ConnectionFamily, ConnectionType};

    #[tokio::test]
    async fn test_lookup_from_dump() {
        let (orig, reply) = snat_entry();
        let mut data = conntrack_message(&orig, &reply);
        data.extend(done_message());

        let entries: Vec<_> = parse_messages(&data)
            .unwrap()
            .into_iter()
            .filter_map(|m| match m {
                Message::Conntrack(e) => Some(e),
                _ => None,
            })
            .collect();

        let tracker = NetlinkConntracker::new(&ConntrackSettings::default());
        tracker.cache().replace(&entries);
        assert!(tracker.cache().is_populated());
        assert_eq!(tracker.len(), 2);

        let key = ConnectionKey {
            pid: 7,
            net_ns: 1,
            conn_type: ConnectionType::Tcp,
            family: ConnectionFamily::Ipv4,
            source: Address::Text("10.0.0.5".to_string()),
            sport: 40000,
            dest: Address::Text("93.184.216.34".to_string()),
            dport: 443,
        };
        let found = tracker.lookup_translation(&key).await.unwrap().unwrap();
        assert_eq!(found.repl_dst_ip, "192.168.1.10");

        let mut udp = key.clone();
        udp.conn_type = ConnectionType::Udp;
        assert!(tracker.lookup_translation(&udp).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unavailable_before_first_dump() {
        let tracker = NetlinkConntracker::new(&ConntrackSettings::default());
        let key = ConnectionKey {
            pid: 7,
            net_ns: 1,
            conn_type: ConnectionType::Tcp,
            family: ConnectionFamily::Ipv4,
            source: Address::Text("10.0.0.5".to_string()),
            sport: 40000,
            dest: Address::Text("93.184.216.34".to_string()),
            dport: 443,
        };
        assert!(matches!(
            tracker.lookup_translation(&key).await,
            Err(TranslationError::Unavailable(_))
        ));

        // An empty dump still counts as loaded
        tracker.cache().replace(&[]);
        assert!(tracker.lookup_translation(&key).await.unwrap().is_none());
    }
}
