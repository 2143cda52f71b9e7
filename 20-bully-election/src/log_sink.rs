//! Best-effort forwarding of event lines to the central log collector.
//!
//! Lines are queued on an unbounded channel and written by a background task,
//! one connection per line, in order. If the collector is down the line is
//! dropped; the node never waits on it.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::transport::send_line;

pub struct LogSink {
    tx: Option<UnboundedSender<String>>,
    task: Option<JoinHandle<()>>,
}

impl LogSink {
    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None, task: None }
    }

    /// Starts forwarding lines to the collector at `addr`.
    pub fn connect(addr: SocketAddr, send_timeout: Duration) -> Self {
        let (tx, rx) = unbounded_channel();
        let task = tokio::spawn(forward(addr, rx, send_timeout));
        Self {
            tx: Some(tx),
            task: Some(task),
        }
    }

    pub fn emit(&self, line: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(line.into());
        }
    }

    /// Flushes queued lines and stops the forwarder.
    pub async fn close(mut self) {
        self.tx.take();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn forward(addr: SocketAddr, mut rx: UnboundedReceiver<String>, send_timeout: Duration) {
    while let Some(line) = rx.recv().await {
        if let Err(err) = send_line(addr, &line, send_timeout).await {
            debug!(%addr, error = ?err, "log sink unavailable, dropping line");
        }
    }
}
