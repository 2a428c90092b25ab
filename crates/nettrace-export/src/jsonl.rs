//! JSONL file exporter

use crate::{ConnectionExporter, ExportError, ExportResult};
use async_trait::async_trait;
use nettrace_core::codec::{decode_stream, encode, EncodeOptions};
use nettrace_core::config::ExportSettings;
use nettrace_core::Connections;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// JSONL exporter configuration
#[derive(Debug, Clone)]
pub struct JsonlExporterConfig {
    /// Output file path
    pub path: PathBuf,

    /// Whether to append to existing file
    pub append: bool,

    /// Pretty print JSON (output is then no longer one payload per line)
    pub pretty: bool,

    /// Flush after each write
    pub flush_each: bool,

    /// Write an empty set as `[]` instead of `null`
    pub nil_slice_as_empty: bool,
}

impl Default for JsonlExporterConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/nettrace-connections.jsonl"),
            append: true,
            pretty: false,
            flush_each: true,
            nil_slice_as_empty: false,
        }
    }
}

impl From<&ExportSettings> for JsonlExporterConfig {
    fn from(settings: &ExportSettings) -> Self {
        Self {
            path: PathBuf::from(&settings.jsonl.path),
            append: settings.jsonl.append,
            pretty: settings.jsonl.pretty,
            flush_each: settings.jsonl.flush_each,
            nil_slice_as_empty: settings.nil_slice_as_empty,
        }
    }
}

/// JSONL file exporter
pub struct JsonlExporter {
    config: JsonlExporterConfig,
    writer: Mutex<Option<BufWriter<File>>>,
    payloads_written: AtomicU64,
}

impl JsonlExporter {
    pub fn new(config: JsonlExporterConfig) -> Self {
        Self {
            config,
            writer: Mutex::new(None),
            payloads_written: AtomicU64::new(0),
        }
    }

    /// Open the output file, creating parent directories as needed
    pub fn open(&self) -> ExportResult<()> {
        let mut writer = self.writer.lock();
        if writer.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = if self.config.append {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.config.path)?
        } else {
            File::create(&self.config.path)?
        };

        *writer = Some(BufWriter::new(file));
        info!("JSONL exporter writing to: {:?}", self.config.path);
        Ok(())
    }

    /// Flush and close the output file
    pub fn close(&self) -> ExportResult<()> {
        if let Some(mut w) = self.writer.lock().take() {
            w.flush()?;
        }
        Ok(())
    }

    pub fn payloads_written(&self) -> u64 {
        self.payloads_written.load(Ordering::Relaxed)
    }

    fn options(&self) -> EncodeOptions {
        EncodeOptions {
            nil_slice_as_empty: self.config.nil_slice_as_empty,
            pretty: self.config.pretty,
        }
    }
}

#[async_trait]
impl ConnectionExporter for JsonlExporter {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn export(&self, conns: &Connections) -> ExportResult<()> {
        let payload = encode(conns, &self.options())?;

        let mut guard = self.writer.lock();
        let w = guard
            .as_mut()
            .ok_or_else(|| ExportError::NotOpen(self.name().to_string()))?;

        w.write_all(&payload)?;
        w.write_all(b"\n")?;

        if self.config.flush_each {
            w.flush()?;
        }

        let total = self.payloads_written.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Wrote payload #{} ({} connections)", total, conns.len());
        Ok(())
    }

    async fn flush(&self) -> ExportResult<()> {
        if let Some(w) = self.writer.lock().as_mut() {
            w.flush()?;
        }
        Ok(())
    }
}

/// Read every payload from a JSONL file written by [`JsonlExporter`]
pub fn read_payloads(path: &Path) -> ExportResult<Vec<Connections>> {
    let data = std::fs::read(path)?;
    Ok(decode_stream(&data)?)
}
