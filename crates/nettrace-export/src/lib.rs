//! Connection set exporters for nettrace

pub mod jsonl;
#[cfg(unix)]
pub mod socket;

pub use jsonl::{read_payloads, JsonlExporter, JsonlExporterConfig};
#[cfg(unix)]
pub use socket::SnapshotServer;

use async_trait::async_trait;
use nettrace_core::{CodecError, Connections};
use thiserror::Error;

/// Export errors
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Exporter {0} is not open")]
    NotOpen(String),
}

pub type ExportResult<T> = Result<T, ExportError>;

/// Destination for polled connection sets
#[async_trait]
pub trait ConnectionExporter: Send + Sync {
    fn name(&self) -> &str;

    /// Write one connection set
    async fn export(&self, conns: &Connections) -> ExportResult<()>;

    async fn flush(&self) -> ExportResult<()> {
        Ok(())
    }
}
