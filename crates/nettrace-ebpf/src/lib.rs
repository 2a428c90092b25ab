//! Kernel connection tracing for nettrace
//!
//! Reads the per-flow counters kept by the kernel probes and turns them into
//! [`nettrace_core::ConnectionRecord`]s:
//!
//! - [`compat`]: refuses kernels the probes are known not to work on
//! - [`types`]: decoding of the raw tuple and stats records
//! - [`tracker`]: interval counters and expiry
//! - [`ports`]: listening sockets, for direction labelling
//! - [`tables`]: the kernel maps themselves
//! - [`tracer`]: one poll over all of the above

pub mod compat;
pub mod ports;
pub mod tables;
pub mod tracer;
pub mod tracker;
pub mod types;

pub use compat::{verify_os_version, CompatError};
pub use tables::{KernelTables, TablesError};
#[cfg(target_os = "linux")]
pub use tables::AyaKernelTables;
pub use tracer::{monotonic_now_ns, NetworkTracer, TracerError, TracerStats};
pub use tracker::{is_expired, ConnectionStateTracker};
pub use types::{ConnStats, ConnTupleV4, ConnTupleV6};
