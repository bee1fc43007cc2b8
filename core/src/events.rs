//! Discovery-event wire protocol.
//!
//! A standalone monitor process pushes newline-delimited JSON over a Unix
//! domain socket to a bus that opted in with `--listen`: one `hello` line
//! carrying the protocol version, then one `discovery` line per settled
//! candidate. The stream is one-directional; the bus never replies. Several
//! monitors may feed one bus, and discovery is idempotent, so a monitor
//! reconnecting and re-sending is harmless.

use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::error::BusError;

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireMessage {
    Hello {
        version: u32,
    },
    Discovery {
        path: PathBuf,
        observed_at: DateTime<Utc>,
    },
}

/// Bus side: accepts monitor connections and funnels their discoveries
/// into one channel. Dropping the listener stops accepting and removes
/// the socket file.
pub struct EventListener {
    path: PathBuf,
    rx: mpsc::Receiver<PathBuf>,
    accept_task: JoinHandle<()>,
}

impl EventListener {
    pub fn bind(path: &Path) -> Result<EventListener, BusError> {
        // A stale socket file from a previous run refuses new binds.
        if path.exists() {
            std::fs::remove_file(path).map_err(|e| BusError::io(path, e))?;
        }
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| BusError::io(path, e))?;
        }
        let listener = UnixListener::bind(path).map_err(|e| BusError::io(path, e))?;
        debug!(socket = %path.display(), "listening for discovery events");

        let (tx, rx) = mpsc::channel(64);
        let accept_task = tokio::spawn(accept_loop(listener, tx));
        Ok(EventListener {
            path: path.to_path_buf(),
            rx,
            accept_task,
        })
    }

    /// Next discovered path from any connected monitor.
    pub async fn recv(&mut self) -> Option<PathBuf> {
        self.rx.recv().await
    }
}

impl Drop for EventListener {
    fn drop(&mut self) {
        self.accept_task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn accept_loop(listener: UnixListener, tx: mpsc::Sender<PathBuf>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, tx).await {
                        warn!(%err, "monitor connection error");
                    }
                });
            }
            Err(err) => {
                warn!(%err, "accept error on discovery socket");
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, tx: mpsc::Sender<PathBuf>) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let mut greeted = false;

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let message = match serde_json::from_str::<WireMessage>(trimmed) {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, "skipping malformed event line");
                continue;
            }
        };
        match message {
            WireMessage::Hello { version } => {
                if version != PROTOCOL_VERSION {
                    warn!(
                        client = version,
                        server = PROTOCOL_VERSION,
                        "rejecting monitor with incompatible protocol version"
                    );
                    break;
                }
                greeted = true;
            }
            WireMessage::Discovery { path, observed_at } => {
                if !greeted {
                    warn!("discovery before hello, dropping connection");
                    break;
                }
                debug!(path = %path.display(), %observed_at, "discovery received");
                if tx.send(path).await.is_err() {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Monitor side: connects to a bus and emits discovery lines. The hello
/// handshake is sent as part of `connect`.
#[derive(Debug)]
pub struct EventEmitter {
    socket: PathBuf,
    stream: UnixStream,
}

impl EventEmitter {
    pub async fn connect(socket: &Path) -> Result<EventEmitter, BusError> {
        let stream = UnixStream::connect(socket)
            .await
            .map_err(|e| BusError::io(socket, e))?;
        let mut emitter = EventEmitter {
            socket: socket.to_path_buf(),
            stream,
        };
        emitter
            .send(&WireMessage::Hello {
                version: PROTOCOL_VERSION,
            })
            .await?;
        Ok(emitter)
    }

    pub async fn emit_discovery(&mut self, path: &Path) -> Result<(), BusError> {
        self.send(&WireMessage::Discovery {
            path: path.to_path_buf(),
            observed_at: Utc::now(),
        })
        .await
    }

    async fn send(&mut self, message: &WireMessage) -> Result<(), BusError> {
        let mut bytes = serde_json::to_vec(message)
            .map_err(|e| BusError::io(&self.socket, std::io::Error::other(e)))?;
        bytes.push(b'\n');
        self.stream
            .write_all(&bytes)
            .await
            .map_err(|e| BusError::io(&self.socket, e))?;
        self.stream
            .flush()
            .await
            .map_err(|e| BusError::io(&self.socket, e))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn discoveries_flow_from_emitter_to_listener() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("bus.sock");
        let mut listener = EventListener::bind(&socket).unwrap();

        let mut emitter = EventEmitter::connect(&socket).await.unwrap();
        emitter.emit_discovery(Path::new("/roots/a/vol1.zip")).await.unwrap();
        emitter.emit_discovery(Path::new("/roots/a/vol2.cbz")).await.unwrap();

        assert_eq!(
            listener.recv().await,
            Some(PathBuf::from("/roots/a/vol1.zip"))
        );
        assert_eq!(
            listener.recv().await,
            Some(PathBuf::from("/roots/a/vol2.cbz"))
        );
    }

    #[tokio::test]
    async fn incompatible_hello_drops_the_connection() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("bus.sock");
        let mut listener = EventListener::bind(&socket).unwrap();

        let mut raw = UnixStream::connect(&socket).await.unwrap();
        raw.write_all(b"{\"type\":\"hello\",\"version\":99}\n").await.unwrap();
        raw.write_all(
            b"{\"type\":\"discovery\",\"path\":\"/x.zip\",\"observed_at\":\"2026-08-25T00:00:00Z\"}\n",
        )
        .await
        .unwrap();

        let got = tokio::time::timeout(Duration::from_millis(200), listener.recv()).await;
        assert!(got.is_err(), "nothing should arrive from a rejected client");
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("bus.sock");
        let mut listener = EventListener::bind(&socket).unwrap();

        let mut raw = UnixStream::connect(&socket).await.unwrap();
        raw.write_all(b"{\"type\":\"hello\",\"version\":1}\n").await.unwrap();
        raw.write_all(b"this is not json\n").await.unwrap();
        raw.write_all(
            b"{\"type\":\"discovery\",\"path\":\"/ok.zip\",\"observed_at\":\"2026-08-25T00:00:00Z\"}\n",
        )
        .await
        .unwrap();

        assert_eq!(listener.recv().await, Some(PathBuf::from("/ok.zip")));
    }

    #[tokio::test]
    async fn a_stale_socket_file_is_replaced_on_bind() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("bus.sock");
        // A crashed process leaves its socket file behind.
        std::fs::write(&socket, b"stale").unwrap();
        let mut listener = EventListener::bind(&socket).unwrap();

        let mut emitter = EventEmitter::connect(&socket).await.unwrap();
        emitter.emit_discovery(Path::new("/again.zip")).await.unwrap();
        assert_eq!(listener.recv().await, Some(PathBuf::from("/again.zip")));
    }

    #[tokio::test]
    async fn a_restarted_listener_serves_a_reconnecting_emitter() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("bus.sock");
        let mut listener = EventListener::bind(&socket).unwrap();
        let mut stale = EventEmitter::connect(&socket).await.unwrap();
        stale.emit_discovery(Path::new("/before.zip")).await.unwrap();
        assert_eq!(listener.recv().await, Some(PathBuf::from("/before.zip")));

        // Bus restart: the old listener goes away, a new one binds the
        // same path.
        drop(listener);
        let mut listener = EventListener::bind(&socket).unwrap();

        // The dropped bus side stops reading, so the old connection dies;
        // at most one in-flight line is absorbed before writes fail.
        let mut stale_failed = false;
        for _ in 0..20 {
            if stale.emit_discovery(Path::new("/lost.zip")).await.is_err() {
                stale_failed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(stale_failed, "writes on the dead connection should fail");

        // A fresh connect is all a monitor needs after the failure.
        let mut fresh = EventEmitter::connect(&socket).await.unwrap();
        fresh.emit_discovery(Path::new("/after.zip")).await.unwrap();
        assert_eq!(listener.recv().await, Some(PathBuf::from("/after.zip")));
    }

    #[tokio::test]
    async fn connect_fails_while_no_bus_listens() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("bus.sock");
        let err = EventEmitter::connect(&socket).await.unwrap_err();
        assert!(matches!(err, BusError::Io { .. }));
    }
}
