//! Kernel connection tables
//!
//! The probes keep one hash map per address family, keyed by the raw tuple
//! with raw stats as the value. [`KernelTables`] is the read/evict surface the
//! tracer polls; [`AyaKernelTables`] is the real implementation.

use crate::types::{RawStats, RawTupleV4, RawTupleV6};
#[cfg(test)]
use std::collections::HashMap;
use thiserror::Error;

/// Map holding IPv4 flows
pub const CONN_STATS_V4_MAP: &str = "conn_stats_ipv4";
/// Map holding IPv6 flows
pub const CONN_STATS_V6_MAP: &str = "conn_stats_ipv6";

/// Kernel table errors
#[derive(Error, Debug)]
pub enum TablesError {
    #[error("Failed to read eBPF object {path}: {source}")]
    ObjectRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to load eBPF object: {0}")]
    Load(String),

    #[error("Failed to attach probe {program}: {reason}")]
    Attach { program: String, reason: String },

    #[error("Map {0} not found in eBPF object")]
    MapNotFound(&'static str),

    #[error("Map operation on {map} failed: {reason}")]
    Map { map: &'static str, reason: String },

    #[error("eBPF is not supported on this platform")]
    Unsupported,
}

pub type TablesResult<T> = Result<T, TablesError>;

/// Raw access to the per-family connection maps
pub trait KernelTables: Send {
    fn read_v4(&mut self) -> TablesResult<Vec<(RawTupleV4, RawStats)>>;

    fn read_v6(&mut self) -> TablesResult<Vec<(RawTupleV6, RawStats)>>;

    fn remove_v4(&mut self, key: &RawTupleV4) -> TablesResult<()>;

    fn remove_v6(&mut self, key: &RawTupleV6) -> TablesResult<()>;
}

/// Kernel function a probe program attaches to, from its name.
///
/// Programs are named `kprobe__<function>` or `kretprobe__<function>`.
pub fn probe_target(program: &str) -> Option<&str> {
    program
        .strip_prefix("kretprobe__")
        .or_else(|| program.strip_prefix("kprobe__"))
        .filter(|f| !f.is_empty())
}

/// In-memory tables
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct MemoryTables {
    pub v4: HashMap<RawTupleV4, RawStats>,
    pub v6: HashMap<RawTupleV6, RawStats>,
}

#[cfg(test)]
impl MemoryTables {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl KernelTables for MemoryTables {
    fn read_v4(&mut self) -> TablesResult<Vec<(RawTupleV4, RawStats)>> {
        Ok(self.v4.iter().map(|(k, v)| (*k, *v)).collect())
    }

    fn read_v6(&mut self) -> TablesResult<Vec<(RawTupleV6, RawStats)>> {
        Ok(self.v6.iter().map(|(k, v)| (*k, *v)).collect())
    }

    fn remove_v4(&mut self, key: &RawTupleV4) -> TablesResult<()> {
        self.v4.remove(key);
        Ok(())
    }

    fn remove_v6(&mut self, key: &RawTupleV6) -> TablesResult<()> {
        self.v6.remove(key);
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub use self::linux::AyaKernelTables;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use aya::maps::{HashMap as AyaHashMap, MapData};
    use aya::programs::{KProbe, Program};
    use aya::Ebpf;
    use std::path::Path;
    use tracing::{debug, info, warn};

    type V4Map = AyaHashMap<MapData, RawTupleV4, RawStats>;
    type V6Map = AyaHashMap<MapData, RawTupleV6, RawStats>;

    /// Tables backed by a loaded eBPF object
    pub struct AyaKernelTables {
        // Dropping the object detaches the probes
        _ebpf: Ebpf,
        v4: V4Map,
        v6: Option<V6Map>,
    }

    impl AyaKernelTables {
        /// Load the object, attach every kprobe in it, and take the maps
        pub fn load(path: &Path, collect_ipv6: bool) -> TablesResult<Self> {
            let bytecode = std::fs::read(path).map_err(|source| TablesError::ObjectRead {
                path: path.display().to_string(),
                source,
            })?;

            bump_memlock_rlimit();

            info!("Loading eBPF object {} ({} bytes)", path.display(), bytecode.len());
            let mut ebpf = Ebpf::load(&bytecode).map_err(|e| TablesError::Load(e.to_string()))?;

            let mut attached = 0;
            for (name, program) in ebpf.programs_mut() {
                let Program::KProbe(probe) = program else {
                    debug!("Skipping non-kprobe program {}", name);
                    continue;
                };
                let Some(function) = probe_target(name) else {
                    warn!("Cannot derive kernel function from program name {}", name);
                    continue;
                };
                attach_kprobe(name, function, probe)?;
                attached += 1;
            }
            info!("Attached {} probes", attached);

            let v4 = take_map(&mut ebpf, CONN_STATS_V4_MAP)?;
            let v6 = if collect_ipv6 {
                Some(take_map(&mut ebpf, CONN_STATS_V6_MAP)?)
            } else {
                None
            };

            Ok(Self { _ebpf: ebpf, v4, v6 })
        }
    }

    fn attach_kprobe(name: &str, function: &str, probe: &mut KProbe) -> TablesResult<()> {
        let attach_err = |reason: String| TablesError::Attach {
            program: name.to_string(),
            reason,
        };
        probe.load().map_err(|e| attach_err(e.to_string()))?;
        probe
            .attach(function, 0)
            .map_err(|e| attach_err(e.to_string()))?;
        debug!("Attached {} to {}", name, function);
        Ok(())
    }

    fn take_map<K: aya::Pod, V: aya::Pod>(
        ebpf: &mut Ebpf,
        name: &'static str,
    ) -> TablesResult<AyaHashMap<MapData, K, V>> {
        let map = ebpf.take_map(name).ok_or(TablesError::MapNotFound(name))?;
        AyaHashMap::try_from(map).map_err(|e| TablesError::Map {
            map: name,
            reason: e.to_string(),
        })
    }

    /// Locked memory limits block map creation before 5.11
    fn bump_memlock_rlimit() {
        let rlim = libc::rlimit {
            rlim_cur: libc::RLIM_INFINITY,
            rlim_max: libc::RLIM_INFINITY,
        };
        let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
        if ret != 0 {
            warn!("Failed to remove limit on locked memory (ret={})", ret);
        }
    }

    fn read_map<K: aya::Pod, V: aya::Pod>(
        map: &AyaHashMap<MapData, K, V>,
        name: &'static str,
    ) -> TablesResult<Vec<(K, V)>> {
        let mut entries = Vec::new();
        for item in map.iter() {
            match item {
                Ok(entry) => entries.push(entry),
                // Entries can vanish between key iteration and lookup
                Err(aya::maps::MapError::KeyNotFound) => continue,
                Err(e) => {
                    return Err(TablesError::Map {
                        map: name,
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(entries)
    }

    fn remove_entry<K: aya::Pod, V: aya::Pod>(
        map: &mut AyaHashMap<MapData, K, V>,
        name: &'static str,
        key: &K,
    ) -> TablesResult<()> {
        match map.remove(key) {
            Ok(()) | Err(aya::maps::MapError::KeyNotFound) => Ok(()),
            Err(e) => Err(TablesError::Map {
                map: name,
                reason: e.to_string(),
            }),
        }
    }

    impl KernelTables for AyaKernelTables {
        fn read_v4(&mut self) -> TablesResult<Vec<(RawTupleV4, RawStats)>> {
            read_map(&self.v4, CONN_STATS_V4_MAP)
        }

        fn read_v6(&mut self) -> TablesResult<Vec<(RawTupleV6, RawStats)>> {
            match &self.v6 {
                Some(map) => read_map(map, CONN_STATS_V6_MAP),
                None => Ok(Vec::new()),
            }
        }

        fn remove_v4(&mut self, key: &RawTupleV4) -> TablesResult<()> {
            remove_entry(&mut self.v4, CONN_STATS_V4_MAP, key)
        }

        fn remove_v6(&mut self, key: &RawTupleV6) -> TablesResult<()> {
            match &mut self.v6 {
                Some(map) => remove_entry(map, CONN_STATS_V6_MAP, key),
                None => Ok(()),
            }
        }
    }
}
