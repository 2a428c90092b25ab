//! Bounded NAT lookups
//!
//! The poll loop must not stall on a slow conntrack source, so every lookup
//! goes through [`NatEnricher`], which gives up after a fixed timeout and
//! reports no translation.

use async_trait::async_trait;
use nettrace_core::translation::TranslationResult;
use nettrace_core::{ConnectionKey, IPTranslation, TranslationSource};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Wraps a translation source with a per-lookup timeout
pub struct NatEnricher {
    inner: Arc<dyn TranslationSource>,
    timeout: Duration,
}

impl NatEnricher {
    pub fn new(inner: Arc<dyn TranslationSource>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl TranslationSource for NatEnricher {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn lookup_translation(
        &self,
        key: &ConnectionKey,
    ) -> TranslationResult<Option<IPTranslation>> {
        match tokio::time::timeout(self.timeout, self.inner.lookup_translation(key)).await {
            Ok(Ok(found)) => Ok(found),
            Ok(Err(e)) => {
                debug!("{} lookup for {} failed: {}", self.inner.name(), key, e);
                Ok(None)
            }
            Err(_) => {
                debug!(
                    "{} lookup for {} timed out after {:?}",
                    self.inner.name(),
                    key,
                    self.timeout
                );
                Ok(None)
            }
        }
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nettrace_core::translation::TranslationError;
    use nettrace_core::{Address, ConnectionFamily, ConnectionType};
    use parking_lot::RwLock;
    use std::collections::HashMap;

    /// Fixed translations held in memory
    #[derive(Default)]
    struct StaticTranslations {
        entries: RwLock<HashMap<ConnectionKey, IPTranslation>>,
    }

    impl StaticTranslations {
        fn new() -> Self {
            Self::default()
        }

        fn insert(&self, key: ConnectionKey, translation: IPTranslation) {
            self.entries.write().insert(key, translation);
        }

        fn remove(&self, key: &ConnectionKey) -> Option<IPTranslation> {
            self.entries.write().remove(key)
        }
    }

    #[async_trait]
    impl TranslationSource for StaticTranslations {
        fn name(&self) -> &str {
            "static"
        }

        async fn lookup_translation(
            &self,
            key: &ConnectionKey,
        ) -> TranslationResult<Option<IPTranslation>> {
            Ok(self.entries.read().get(key).cloned())
        }

        fn len(&self) -> usize {
            self.entries.read().len()
        }
    }

    fn key(sport: u16) -> ConnectionKey {
        ConnectionKey {
            pid: 1,
            net_ns: 1,
            conn_type: ConnectionType::Tcp,
            family: ConnectionFamily::Ipv4,
            source: Address::Text("10.0.0.5".to_string()),
            sport,
            dest: Address::Text("10.96.0.10".to_string()),
            dport: 53,
        }
    }

    fn translation() -> IPTranslation {
        IPTranslation {
            repl_src_ip: "10.244.1.7".to_string(),
            repl_dst_ip: "10.0.0.5".to_string(),
            repl_src_port: 53,
            repl_dst_port: 40000,
        }
    }

    struct SlowSource;

    #[async_trait]
    impl TranslationSource for SlowSource {
        fn name(&self) -> &str {
            "slow"
        }

        async fn lookup_translation(
            &self,
            _key: &ConnectionKey,
        ) -> TranslationResult<Option<IPTranslation>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Some(translation()))
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl TranslationSource for BrokenSource {
        fn name(&self) -> &str {
            "broken"
        }

        async fn lookup_translation(
            &self,
            _key: &ConnectionKey,
        ) -> TranslationResult<Option<IPTranslation>> {
            Err(TranslationError::Unavailable("socket closed".to_string()))
        }
    }

    #[tokio::test]
    async fn test_hit_and_miss() {
        let source = Arc::new(StaticTranslations::new());
        source.insert(key(40000), translation());

        let enricher = NatEnricher::new(source.clone(), Duration::from_millis(50));
        assert_eq!(
            enricher.lookup_translation(&key(40000)).await.unwrap(),
            Some(translation())
        );
        assert_eq!(enricher.lookup_translation(&key(40001)).await.unwrap(), None);
        assert_eq!(enricher.len(), 1);
        assert_eq!(enricher.name(), "static");

        source.remove(&key(40000));
        assert!(enricher.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_yields_no_translation() {
        let enricher = NatEnricher::new(Arc::new(SlowSource), Duration::from_millis(50));
        assert_eq!(enricher.lookup_translation(&key(40000)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_source_error_yields_no_translation() {
        let enricher = NatEnricher::new(Arc::new(BrokenSource), Duration::from_millis(50));
        assert_eq!(enricher.lookup_translation(&key(40000)).await.unwrap(), None);
    }
}
