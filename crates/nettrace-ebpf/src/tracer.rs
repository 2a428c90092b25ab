//! Network tracer
//!
//! One call to [`NetworkTracer::get_connections`] is one poll: read both
//! kernel tables, decode, evict stale kernel entries, label direction, fold
//! into the state tracker, and attach NAT translations.

use crate::compat::{self, CompatError};
use crate::ports;
use crate::tables::{KernelTables, TablesError};
use crate::tracker::{ConnectionStateTracker, TrackerStats};
use crate::types::{conn_stats_from_v4, conn_stats_from_v6, ConnStats, ConnTupleV4, ConnTupleV6};
use futures::stream::{self, StreamExt};
use nettrace_core::{
    ConnectionDirection, ConnectionKey, ConnectionRecord, Connections, IPTranslation,
    TracerConfig, TranslationSource,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Tracer errors
#[derive(Error, Debug)]
pub enum TracerError {
    #[error("Kernel not supported: {0}")]
    Compatibility(#[from] CompatError),

    #[error(transparent)]
    Tables(#[from] TablesError),

    #[error("Network tracing is disabled in configuration")]
    Disabled,

    #[error("No eBPF object configured, set [tracer] bpf_object_path")]
    NoObject,
}

pub type TracerResult<T> = Result<T, TracerError>;

/// NAT lookups in flight at once during a poll
const LOOKUP_CONCURRENCY: usize = 64;

/// Poll counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TracerStats {
    pub polls: u64,
    pub kernel_evictions: u64,
    pub tracker: TrackerStats,
}

/// Polls the kernel connection tables
pub struct NetworkTracer {
    tables: Mutex<Box<dyn KernelTables>>,
    tracker: Mutex<ConnectionStateTracker>,
    translations: Option<Arc<dyn TranslationSource>>,
    lookup_budget: Duration,
    last: Mutex<Vec<ConnectionRecord>>,
    proc_net: PathBuf,
    timeout: u64,
    structured_addresses: bool,
    collect_ipv6: bool,
    polls: AtomicU64,
    kernel_evictions: AtomicU64,
}

impl NetworkTracer {
    /// Check the running kernel, load the configured eBPF object, and build
    /// a tracer over it
    #[cfg(target_os = "linux")]
    pub fn start(
        config: &TracerConfig,
        translations: Option<Arc<dyn TranslationSource>>,
    ) -> TracerResult<Self> {
        use crate::tables::AyaKernelTables;

        let code = compat::current_kernel_version_code()?;
        Self::check(config, code)?;

        let path = config
            .tracer
            .bpf_object_path
            .as_deref()
            .ok_or(TracerError::NoObject)?;
        let tables = AyaKernelTables::load(path.as_ref(), config.tracer.collect_ipv6)?;

        Self::build(config, Box::new(tables), translations)
    }

    /// Build a tracer over the given tables, after checking `kernel_code`
    pub fn with_tables(
        config: &TracerConfig,
        kernel_code: u32,
        tables: Box<dyn KernelTables>,
        translations: Option<Arc<dyn TranslationSource>>,
    ) -> TracerResult<Self> {
        Self::check(config, kernel_code)?;
        Self::build(config, tables, translations)
    }

    /// Compatibility gate; must pass before any probe is loaded
    pub fn check(config: &TracerConfig, kernel_code: u32) -> TracerResult<()> {
        if !config.tracer.enabled {
            return Err(TracerError::Disabled);
        }
        compat::verify_os_version(kernel_code, &config.tracer.excluded_linux_versions)?;
        info!(
            "Kernel {} supported",
            compat::kernel_code_to_string(kernel_code)
        );
        Ok(())
    }

    fn build(
        config: &TracerConfig,
        tables: Box<dyn KernelTables>,
        translations: Option<Arc<dyn TranslationSource>>,
    ) -> TracerResult<Self> {
        let timeout = config.connection_timeout_ns();
        if let Some(source) = &translations {
            info!("NAT translations from {}", source.name());
        }

        Ok(Self {
            tables: Mutex::new(tables),
            tracker: Mutex::new(ConnectionStateTracker::new(
                timeout,
                config.tracer.max_tracked_connections,
            )),
            translations,
            lookup_budget: Duration::from_millis(config.conntrack.poll_budget_ms),
            last: Mutex::new(Vec::new()),
            proc_net: PathBuf::from("/proc/net"),
            timeout,
            structured_addresses: config.tracer.structured_addresses,
            collect_ipv6: config.tracer.collect_ipv6,
            polls: AtomicU64::new(0),
            kernel_evictions: AtomicU64::new(0),
        })
    }

    /// Read listening sockets from another directory laid out like /proc/net
    #[cfg(test)]
    pub(crate) fn with_proc_net(mut self, dir: impl Into<PathBuf>) -> Self {
        self.proc_net = dir.into();
        self
    }

    /// Run one poll. `now` is in the kernel's monotonic clock, see
    /// [`monotonic_now_ns`].
    pub async fn get_connections(&self, now: u64) -> TracerResult<Connections> {
        let mut observed = self.read_tables()?;

        let listening = ports::read_listening_ports_from(&self.proc_net);
        for record in &mut observed {
            record.direction = ConnectionDirection::classify(record, &listening);
        }

        let mut records = self.tracker.lock().update(now, observed);

        if let Some(source) = &self.translations {
            self.translate(source.as_ref(), &mut records).await;
        }

        self.polls.fetch_add(1, Ordering::Relaxed);
        *self.last.lock() = records.clone();
        debug!("Poll produced {} connections", records.len());

        Ok(Connections::new(records))
    }

    /// Attach NAT translations, a bounded number of lookups at a time. Lookups
    /// still pending when the poll's lookup budget runs out yield none.
    async fn translate(&self, source: &dyn TranslationSource, records: &mut [ConnectionRecord]) {
        let deadline = Instant::now() + self.lookup_budget;
        let keys: Vec<ConnectionKey> = records.iter().map(ConnectionRecord::key).collect();

        let found: Vec<Option<IPTranslation>> = stream::iter(keys.iter())
            .map(|key| async move {
                match tokio::time::timeout_at(deadline, source.lookup_translation(key)).await {
                    Ok(Ok(found)) => found,
                    Ok(Err(e)) => {
                        debug!("Translation lookup for {} failed: {}", key, e);
                        None
                    }
                    Err(_) => None,
                }
            })
            .buffered(LOOKUP_CONCURRENCY)
            .collect()
            .await;

        let mut translated = 0usize;
        for (record, translation) in records.iter_mut().zip(found) {
            if translation.is_some() {
                translated += 1;
            }
            record.ip_translation = translation;
        }
        if Instant::now() >= deadline {
            debug!(
                "Translation budget of {:?} exhausted, later lookups skipped",
                self.lookup_budget
            );
        }
        trace!("{} of {} connections translated", translated, records.len());
    }

    /// Read and decode both tables, evicting stale kernel entries
    fn read_tables(&self) -> TracerResult<Vec<ConnectionRecord>> {
        let mut tables = self.tables.lock();

        let v4 = tables.read_v4()?;
        let v6 = if self.collect_ipv6 {
            tables.read_v6()?
        } else {
            Vec::new()
        };

        let v4: Vec<_> = v4
            .into_iter()
            .map(|(k, s)| (k, ConnStats::decode(&s)))
            .collect();
        let v6: Vec<_> = v6
            .into_iter()
            .map(|(k, s)| (k, ConnStats::decode(&s)))
            .collect();

        let latest = v4
            .iter()
            .map(|(_, s)| s.timestamp)
            .chain(v6.iter().map(|(_, s)| s.timestamp))
            .max()
            .unwrap_or(0);

        let mut records = Vec::with_capacity(v4.len() + v6.len());
        let mut evicted = 0u64;

        for (raw, stats) in v4 {
            if stats.is_expired(latest, self.timeout) {
                match tables.remove_v4(&raw) {
                    Ok(()) => evicted += 1,
                    Err(e) => warn!("Failed to evict IPv4 entry: {}", e),
                }
                continue;
            }
            let tuple = ConnTupleV4::decode(&raw);
            records.push(conn_stats_from_v4(&tuple, &stats, self.structured_addresses));
        }

        for (raw, stats) in v6 {
            if stats.is_expired(latest, self.timeout) {
                match tables.remove_v6(&raw) {
                    Ok(()) => evicted += 1,
                    Err(e) => warn!("Failed to evict IPv6 entry: {}", e),
                }
                continue;
            }
            let tuple = ConnTupleV6::decode(&raw);
            records.push(conn_stats_from_v6(&tuple, &stats, self.structured_addresses));
        }

        if evicted > 0 {
            debug!("Evicted {} stale kernel entries", evicted);
            self.kernel_evictions.fetch_add(evicted, Ordering::Relaxed);
        }

        Ok(records)
    }

    /// Last emitted set, without polling
    pub fn snapshot(&self) -> Connections {
        Connections::new(self.last.lock().clone())
    }

    pub fn stats(&self) -> TracerStats {
        TracerStats {
            polls: self.polls.load(Ordering::Relaxed),
            kernel_evictions: self.kernel_evictions.load(Ordering::Relaxed),
            tracker: self.tracker.lock().stats(),
        }
    }
}

/// Current `CLOCK_MONOTONIC` time in nanoseconds, the clock the probes stamp
/// entries with
#[cfg(target_os = "linux")]
pub fn monotonic_now_ns() -> u64 {
    use nix::time::{clock_gettime, ClockId};

    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => (ts.tv_sec() as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(ts.tv_nsec() as u64),
        Err(e) => {
            warn!("clock_gettime(CLOCK_MONOTONIC) failed: {}", e);
            0
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn monotonic_now_ns() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}
