//! `ClientSession` backed by an endpoint WebSocket.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use fleetplex_core::{ClientHandle, ClientSession, ClientSessionError};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::protocol::EndpointFrame;

type Reply = Result<Vec<u8>, ClientSessionError>;

#[derive(Default)]
struct Pending {
    waiters: HashMap<String, oneshot::Sender<Reply>>,
    closed: bool,
}

/// Proxy for one managed endpoint connected to the broker.
///
/// Each `execute` sends a `command` frame tagged with a fresh ID and waits
/// for the matching `result` or `error` frame. When the socket goes away
/// every waiter fails with [`ClientSessionError::Unreachable`].
pub struct RemoteClientSession {
    handle: ClientHandle,
    tx: mpsc::Sender<Arc<String>>,
    pending: Mutex<Pending>,
    next_id: AtomicU64,
}

impl RemoteClientSession {
    /// Wrap the outbound queue of an endpoint socket.
    pub fn new(handle: ClientHandle, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            handle,
            tx,
            pending: Mutex::new(Pending::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Handle this endpoint is attached under.
    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    /// Commands awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().waiters.len()
    }

    /// Route a frame received from the endpoint to its waiter.
    ///
    /// Returns `false` for unsolicited frames and unknown IDs.
    pub fn complete(&self, frame: EndpointFrame) -> bool {
        let (id, reply) = match frame {
            EndpointFrame::Result { id, result } => (id, Ok(result)),
            EndpointFrame::Error { id, message } => (id, Err(ClientSessionError::Rejected { message })),
            EndpointFrame::Command { id, .. } => {
                warn!(handle = %self.handle, id, "endpoint sent a command frame, ignoring");
                return false;
            }
        };
        let Some(waiter) = self.pending.lock().waiters.remove(&id) else {
            debug!(handle = %self.handle, id, "reply for unknown or abandoned command");
            return false;
        };
        // The caller may have given up (timeout); nothing to do then.
        let _ = waiter.send(reply);
        true
    }

    /// Fail every waiter and refuse further commands.
    pub fn fail_all(&self, reason: &str) {
        let waiters = {
            let mut pending = self.pending.lock();
            pending.closed = true;
            std::mem::take(&mut pending.waiters)
        };
        if !waiters.is_empty() {
            debug!(handle = %self.handle, count = waiters.len(), reason, "failing pending commands");
        }
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(ClientSessionError::unreachable(reason)));
        }
    }

    fn forget(&self, id: &str) {
        let _ = self.pending.lock().waiters.remove(id);
    }
}

/// Removes the waiter if `execute` is dropped before the reply arrives.
struct WaiterGuard<'a> {
    session: &'a RemoteClientSession,
    id: String,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.session.forget(&self.id);
    }
}

#[async_trait]
impl ClientSession for RemoteClientSession {
    async fn execute(&self, command: Vec<u8>) -> Result<Vec<u8>, ClientSessionError> {
        let id = format!("c{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.closed {
                return Err(ClientSessionError::unreachable("endpoint disconnected"));
            }
            let _ = pending.waiters.insert(id.clone(), reply_tx);
        }
        let _guard = WaiterGuard {
            session: self,
            id: id.clone(),
        };

        let frame = serde_json::to_string(&EndpointFrame::Command { id, command })
            .map_err(|e| ClientSessionError::unreachable(format!("failed to encode command: {e}")))?;
        if self.tx.send(Arc::new(frame)).await.is_err() {
            return Err(ClientSessionError::unreachable("endpoint socket closed"));
        }

        reply_rx
            .await
            .unwrap_or_else(|_| Err(ClientSessionError::unreachable("endpoint disconnected before replying")))
    }
}
