//! One connected controller's outbound side.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use fleetplex_core::ControllerId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::heartbeat::Liveness;

/// Represents a connected controller socket.
///
/// Owns no client state. Responses and pushes both go through the same
/// bounded queue, so pushes reach the socket in the order they were queued.
/// Pushes never wait for queue space; responses do.
pub struct ControllerConnection {
    /// Unique connection ID.
    pub id: ControllerId,
    /// Send channel to the socket's write task.
    tx: mpsc::Sender<Arc<String>>,
    connected_at: Instant,
    /// Ping/pong bookkeeping.
    liveness: Arc<Liveness>,
    /// Cancelled once the connection is closed; nothing is queued afterwards
    /// and the session tears the socket down.
    closed: CancellationToken,
    /// Count of messages dropped due to a full or closed channel.
    pub dropped_messages: AtomicU64,
}

impl ControllerConnection {
    /// Create a new connection.
    pub fn new(id: ControllerId, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id,
            tx,
            connected_at: Instant::now(),
            liveness: Arc::new(Liveness::new()),
            closed: CancellationToken::new(),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Queue a text message for the controller.
    ///
    /// Returns `false` if the connection is closed or the channel is full or
    /// closed, and increments the dropped message counter.
    pub fn send(&self, message: Arc<String>) -> bool {
        if !self.is_closed() && self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Queue an RPC response, waiting for queue space if needed.
    ///
    /// Returns `false` only when the response can never be delivered: the
    /// connection is closed, or the write task is gone (which closes it).
    pub async fn send_response(&self, message: Arc<String>) -> bool {
        let sent = !self.is_closed()
            && tokio::select! {
                biased;
                () = self.closed.cancelled() => false,
                sent = self.tx.send(message) => sent.is_ok(),
            };
        if !sent {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            self.mark_closed();
        }
        sent
    }

    /// Serialize a value and queue it.
    pub fn send_json<T: serde::Serialize>(&self, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.send(Arc::new(json)),
            Err(_) => false,
        }
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Stop accepting outbound messages and signal the session to close.
    pub fn mark_closed(&self) {
        self.closed.cancel();
    }

    /// Whether [`mark_closed`](Self::mark_closed) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Heartbeat state shared with the write task.
    pub fn liveness(&self) -> &Arc<Liveness> {
        &self.liveness
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
