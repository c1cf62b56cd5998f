//! Line-framed duplex connection to one peer node
//!
//! Each connection owns one socket. Writes are serialized behind an async
//! mutex; a single receive task reads one line at a time and hands the
//! decoded message to the handler before reading the next one, so messages
//! from one peer are processed in send order.

use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::cluster::node::NodeId;
use crate::common::{Error, Result};
use crate::protocol::{Query, KILL};

/// Receiver of decoded messages.
pub trait MessageHandler: Send + Sync {
    /// Process one message from `from`. The next message on the same
    /// connection is not read until this future completes.
    fn handle(&self, from: NodeId, query: Query) -> BoxFuture<'_, ()>;
}

pub struct Connection {
    id: u64,
    local: NodeId,
    remote: NodeId,
    writer: Mutex<Option<BufWriter<OwnedWriteHalf>>>,
    connected: AtomicBool,
    released: AtomicBool,
    shutdown: Notify,
}

impl Connection {
    pub(crate) fn new(id: u64, local: NodeId, remote: NodeId, writer: BufWriter<OwnedWriteHalf>) -> Arc<Self> {
        Arc::new(Self {
            id,
            local,
            remote,
            writer: Mutex::new(Some(writer)),
            connected: AtomicBool::new(true),
            released: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local
    }

    pub fn remote_node(&self) -> &NodeId {
        &self.remote
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Send one message as a single line and flush.
    pub async fn send(&self, query: &Query) -> Result<()> {
        let line = query.encode()?;
        self.write_line(&line).await
    }

    /// Ask the peer to close its read loop, then close locally.
    pub async fn terminate(&self) {
        if let Err(e) = self.write_line(KILL).await {
            debug!("Could not send {} to {}: {}", KILL, self.remote, e);
        }
        self.disconnect();
    }

    /// Stop the receive loop and release the socket. Idempotent.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            debug!("Disconnecting connection {} to {}", self.id, self.remote);
        }
        self.shutdown.notify_one();
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::NotConnected(self.remote.to_string()))?;

        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            self.connected.store(false, Ordering::Release);
            self.shutdown.notify_one();
            return Err(Error::ConnectionFailed(format!(
                "write to {} failed: {}",
                self.remote, e
            )));
        }
        trace!("Sent to {}: {}", self.remote, line);
        Ok(())
    }

    /// Release the write half exactly once. Close failures are only logged.
    async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connected.store(false, Ordering::Release);
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Error closing connection {} to {}: {}", self.id, self.remote, e);
            }
        }
    }

    /// Start the receive loop. `on_close` runs once after the socket is released.
    pub(crate) fn spawn_receive_loop<F>(
        self: &Arc<Self>,
        reader: BufReader<OwnedReadHalf>,
        handler: Arc<dyn MessageHandler>,
        on_close: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(&Connection) + Send + 'static,
    {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = reader.lines();
            loop {
                tokio::select! {
                    _ = conn.shutdown.notified() => break,
                    next = lines.next_line() => match next {
                        Ok(Some(line)) => {
                            let line = line.trim();
                            if line.eq_ignore_ascii_case(KILL) {
                                debug!("Peer {} closed connection {}", conn.remote, conn.id);
                                break;
                            }
                            if line.is_empty() {
                                continue;
                            }
                            match Query::decode(line) {
                                Ok(query) => handler.handle(conn.remote.clone(), query).await,
                                Err(e) => warn!("Dropping message from {}: {}", conn.remote, e),
                            }
                        }
                        Ok(None) => {
                            debug!("Connection {} to {} reached end of stream", conn.id, conn.remote);
                            break;
                        }
                        Err(e) => {
                            warn!("Dropped socket connection {} to {}: {}", conn.id, conn.remote, e);
                            break;
                        }
                    }
                }
            }

            conn.release().await;
            on_close(&*conn);
        })
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("connected", &self.is_connected())
            .finish()
    }
}
