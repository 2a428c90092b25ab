//! Unix socket serving the most recent connection set
//!
//! Every client that connects receives one encoded payload followed by a
//! newline, then the server closes the stream.

use crate::ExportResult;
use nettrace_core::codec::{encode, EncodeOptions};
use nettrace_core::Connections;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Serves connection sets to local readers
pub struct SnapshotServer {
    socket_path: PathBuf,
    options: EncodeOptions,
    requests: Arc<AtomicU64>,
}

impl SnapshotServer {
    pub fn new(socket_path: impl Into<PathBuf>, options: EncodeOptions) -> Self {
        Self {
            socket_path: socket_path.into(),
            options,
            requests: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Clients served since start
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Bind the socket and answer every client with `snapshot()` until the
    /// returned handle is aborted
    pub async fn start<F>(&self, snapshot: F) -> ExportResult<JoinHandle<()>>
    where
        F: Fn() -> Connections + Send + Sync + 'static,
    {
        // A socket left behind by a previous run blocks bind
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!("Serving connections on {}", self.socket_path.display());

        let snapshot = Arc::new(snapshot);
        let options = self.options;
        let requests = Arc::clone(&self.requests);

        Ok(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        requests.fetch_add(1, Ordering::Relaxed);
                        let conns = snapshot();
                        tokio::spawn(async move {
                            if let Err(e) = send_snapshot(stream, &conns, &options).await {
                                warn!("Failed to serve connections: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        }))
    }

    /// Remove the socket file
    pub fn remove_socket(&self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!(
                "Could not remove {}: {}",
                self.socket_path.display(),
                e
            );
        }
    }
}

async fn send_snapshot(
    mut stream: UnixStream,
    conns: &Connections,
    options: &EncodeOptions,
) -> ExportResult<()> {
    let mut payload = encode(conns, options)?;
    payload.push(b'\n');
    stream.write_all(&payload).await?;
    stream.shutdown().await?;
    debug!("Served {} connections", conns.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nettrace_core::codec::decode;
    use nettrace_core::{Address, ConnectionRecord};
    use tokio::io::AsyncReadExt;

    fn conns() -> Connections {
        Connections::new(vec![ConnectionRecord {
            source: Address::Text("10.0.0.1".to_string()),
            dest: Address::Text("10.0.0.2".to_string()),
            sport: 40000,
            dport: 443,
            monotonic_sent_bytes: 512,
            ..Default::default()
        }])
    }

    async fn read_all(path: &Path) -> Vec<u8> {
        let mut stream = UnixStream::connect(path).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_serves_latest_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("nettrace.sock");

        let server = SnapshotServer::new(&path, EncodeOptions::default());
        let handle = server.start(conns).await.unwrap();

        let first = read_all(&path).await;
        assert_eq!(first.last(), Some(&b'\n'));
        assert_eq!(decode(&first[..first.len() - 1]).unwrap(), conns());

        read_all(&path).await;
        assert_eq!(server.requests(), 2);

        handle.abort();
        server.remove_socket();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nettrace.sock");
        std::fs::write(&path, b"stale").unwrap();

        let options = EncodeOptions {
            nil_slice_as_empty: true,
            ..Default::default()
        };
        let server = SnapshotServer::new(&path, options);
        let handle = server.start(Connections::default).await.unwrap();

        assert_eq!(read_all(&path).await, b"{\"connections\":[]}\n");
        handle.abort();
    }
}
