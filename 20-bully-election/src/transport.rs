//! One connection per message, in both directions.
//!
//! Outbound, every message opens a fresh TCP connection, writes one line and
//! closes it. There is no pooling and no retry: a failed send is logged and
//! dropped, and the protocol's periodic broadcasts make up for it. Inbound,
//! the node reads a single line from each accepted connection.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::join_all;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::NodeId;
use crate::message::{Message, MessageKind, read_line, write_line};
use crate::registry::PeerRef;

/// Sends protocol messages on behalf of one node.
#[derive(Debug, Clone)]
pub struct Transport {
    id: NodeId,
    send_timeout: Duration,
}

impl Transport {
    pub fn new(id: NodeId, send_timeout: Duration) -> Self {
        Self { id, send_timeout }
    }

    /// Stamps a fresh message of `kind` and delivers it to `peer`.
    pub async fn send(&self, peer: PeerRef, kind: MessageKind) -> Result<()> {
        let message = Message::new(self.id, kind);
        send_line(peer.addr, &message.encode(), self.send_timeout)
            .await
            .with_context(|| format!("failed to send {kind} to node {} at {}", peer.id, peer.addr))
    }

    /// Sends `kind` to every peer concurrently and returns how many
    /// deliveries succeeded. Failures are logged, never retried.
    pub async fn broadcast(&self, peers: &[PeerRef], kind: MessageKind) -> usize {
        let sends = peers.iter().map(|peer| async move {
            match self.send(*peer, kind).await {
                Ok(()) => {
                    debug!(node = self.id, peer = peer.id, %kind, "sent");
                    true
                }
                Err(err) => {
                    warn!(node = self.id, peer = peer.id, error = ?err, "send failed");
                    false
                }
            }
        });
        join_all(sends)
            .await
            .into_iter()
            .filter(|delivered| *delivered)
            .count()
    }
}

/// Connects to `addr`, writes `line` and closes the connection, all within
/// `limit`.
pub async fn send_line(addr: SocketAddr, line: &str, limit: Duration) -> Result<()> {
    let attempt = async {
        let mut stream = TcpStream::connect(addr).await?;
        write_line(&mut stream, line).await?;
        stream.shutdown().await?;
        Ok::<_, io::Error>(())
    };
    timeout(limit, attempt)
        .await
        .with_context(|| format!("timed out after {}ms talking to {addr}", limit.as_millis()))?
        .with_context(|| format!("i/o error talking to {addr}"))
}

/// Reads the single line an accepted connection carries. `None` means the
/// peer closed without sending anything.
pub async fn receive_line(stream: TcpStream, limit: Duration) -> Result<Option<String>> {
    let mut reader = BufReader::new(stream);
    timeout(limit, read_line(&mut reader))
        .await
        .context("timed out waiting for a line")?
        .context("failed to read line")
}
