//! NAT translations from the kernel conntrack table
//!
//! [`NetlinkConntracker`] keeps a cache of translated flows refreshed over
//! ctnetlink; [`NatEnricher`] puts a deadline on every lookup.

pub mod cache;
pub mod conntracker;
pub mod enricher;
pub mod netlink;
#[cfg(target_os = "linux")]
pub mod socket;

pub use cache::{TranslationCache, TranslationKey};
pub use conntracker::NetlinkConntracker;
pub use enricher::NatEnricher;
pub use netlink::{ConntrackEntry, ConntrackError, ConntrackResult};
