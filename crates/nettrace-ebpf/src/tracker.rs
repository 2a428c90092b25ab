//! Connection state tracker
//!
//! Keeps the last record seen for every flow and turns the kernel's
//! monotonic counters into per-poll interval counters.
//!
//! A flow that disappears from the kernel table is still reported, with its
//! last monotonic counters and zero interval counters, until it has gone
//! unobserved for longer than the timeout. It is then dropped for good; if
//! the kernel reports the same key again it starts over as a new flow.

use nettrace_core::{ConnectionKey, ConnectionRecord};
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace, warn};

/// `latest_time - timestamp > timeout`; a gap equal to the timeout is not
/// expired, and a timestamp ahead of `latest_time` never is.
pub fn is_expired(latest_time: u64, timestamp: u64, timeout: u64) -> bool {
    latest_time.saturating_sub(timestamp) > timeout
}

/// Interval since the previous observation. A counter that went backwards
/// was reset, so the whole current value is new.
fn interval_u64(current: u64, previous: u64) -> u64 {
    if current >= previous {
        current - previous
    } else {
        current
    }
}

fn interval_u32(current: u32, previous: u32) -> u32 {
    if current >= previous {
        current - previous
    } else {
        current
    }
}

/// Tracker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    /// Flows currently held
    pub tracked: usize,
    /// Flows dropped after the timeout, since start
    pub expired: u64,
    /// New flows refused because the tracker was full, since start
    pub rejected: u64,
}

/// Per-flow delta bookkeeping
pub struct ConnectionStateTracker {
    state: HashMap<ConnectionKey, ConnectionRecord>,
    timeout: u64,
    max_connections: usize,
    expired: u64,
    rejected: u64,
}

impl ConnectionStateTracker {
    /// `timeout` is in the same clock as the `now` passed to [`update`](Self::update)
    pub fn new(timeout: u64, max_connections: usize) -> Self {
        Self {
            state: HashMap::new(),
            timeout,
            max_connections,
            expired: 0,
            rejected: 0,
        }
    }

    /// Fold one poll's worth of decoded records into the state.
    ///
    /// Returns observed records with interval counters filled in, followed by
    /// unobserved flows that have not yet expired. Flows that time out in this
    /// poll free their slots before new flows are admitted.
    pub fn update(&mut self, now: u64, observed: Vec<ConnectionRecord>) -> Vec<ConnectionRecord> {
        let mut seen = HashSet::with_capacity(observed.len());
        let mut fresh = Vec::with_capacity(observed.len());
        for record in observed {
            let key = record.key();
            if seen.insert(key.clone()) {
                fresh.push((key, record));
            } else {
                warn!("Duplicate kernel entry for {} in one poll, ignoring", key);
            }
        }

        let timeout = self.timeout;
        let mut expired = 0u64;
        self.state.retain(|key, record| {
            if seen.contains(key) || !is_expired(now, record.last_update_epoch, timeout) {
                return true;
            }
            trace!("Flow {} expired", key);
            expired += 1;
            false
        });
        if expired > 0 {
            debug!("Expired {} flows, {} still tracked", expired, self.state.len());
        }
        self.expired += expired;

        let mut out = Vec::with_capacity(fresh.len());
        for (key, mut record) in fresh {
            match self.state.get(&key) {
                Some(previous) => {
                    record.last_sent_bytes =
                        interval_u64(record.monotonic_sent_bytes, previous.monotonic_sent_bytes);
                    record.last_recv_bytes =
                        interval_u64(record.monotonic_recv_bytes, previous.monotonic_recv_bytes);
                    record.last_retransmits = interval_u32(
                        record.monotonic_retransmits,
                        previous.monotonic_retransmits,
                    );
                }
                None => {
                    if self.state.len() >= self.max_connections {
                        self.rejected += 1;
                        debug!("Tracker full ({}), dropping new flow {}", self.state.len(), key);
                        continue;
                    }
                    trace!("New flow {}", key);
                    record.last_sent_bytes = record.monotonic_sent_bytes;
                    record.last_recv_bytes = record.monotonic_recv_bytes;
                    record.last_retransmits = record.monotonic_retransmits;
                }
            }

            record.last_update_epoch = now;
            self.state.insert(key, record.clone());
            out.push(record);
        }

        for (key, record) in &self.state {
            if seen.contains(key) {
                continue;
            }
            let mut idle = record.clone();
            idle.last_sent_bytes = 0;
            idle.last_recv_bytes = 0;
            idle.last_retransmits = 0;
            out.push(idle);
        }

        out
    }

    #[cfg(test)]
    pub fn get(&self, key: &ConnectionKey) -> Option<&ConnectionRecord> {
        self.state.get(key)
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            tracked: self.state.len(),
            expired: self.expired,
            rejected: self.rejected,
        }
    }
}
