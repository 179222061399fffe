//! Ping/pong liveness, inbound frame decoding, and the outbound writer
//! shared by both socket kinds.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Ping cadence and silence limit for one socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between server-initiated Ping frames.
    pub interval: Duration,
    /// Silence longer than this closes the socket.
    pub timeout: Duration,
}

impl HeartbeatConfig {
    /// Build from whole seconds. A zero interval is clamped to one second.
    pub fn from_secs(interval_secs: u64, timeout_secs: u64) -> Self {
        Self {
            interval: Duration::from_secs(interval_secs.max(1)),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::from_secs(30, 90)
    }
}

/// Tracks whether the peer has been heard from recently.
#[derive(Debug)]
pub struct Liveness {
    is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
}

impl Liveness {
    /// A fresh peer counts as alive.
    pub fn new() -> Self {
        Self {
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(Instant::now()),
        }
    }

    /// Record activity from the peer.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Check and reset the alive flag.
    ///
    /// Returns `true` if the peer was active since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last recorded activity.
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// What a reader loop does with one incoming frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// A JSON payload to process.
    Text(String),
    /// The peer is closing the socket.
    Close,
    /// Nothing to process.
    Skip,
}

/// Decode an incoming frame. Binary frames carrying UTF-8 are treated as
/// text; anything else in a binary frame is skipped.
pub fn classify(msg: Message) -> Inbound {
    match msg {
        Message::Text(t) => Inbound::Text(t.as_str().to_owned()),
        Message::Binary(data) => match String::from_utf8(data.to_vec()) {
            Ok(text) => Inbound::Text(text),
            Err(_) => {
                debug!(len = data.len(), "non-UTF8 binary frame, skipping");
                Inbound::Skip
            }
        },
        Message::Close(_) => Inbound::Close,
        Message::Ping(_) | Message::Pong(_) => Inbound::Skip,
    }
}

/// Why the outbound writer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundExit {
    /// Every sender for the queue was dropped.
    ChannelClosed,
    /// Writing to the socket failed.
    SocketError,
    /// The peer stayed silent past the heartbeat timeout.
    TimedOut,
    /// Server shutdown.
    Cancelled,
}

/// Drain `rx` into the socket sink and keep the peer honest with pings.
pub async fn run_outbound<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Arc<String>>,
    liveness: Arc<Liveness>,
    config: HeartbeatConfig,
    cancel: CancellationToken,
) -> OutboundExit
where
    S: Sink<Message> + Unpin,
{
    let mut ping_interval = tokio::time::interval(config.interval);
    // Skip the immediate first tick
    let _ = ping_interval.tick().await;

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(text) = msg else {
                    return OutboundExit::ChannelClosed;
                };
                if sink.send(Message::Text(text.to_string().into())).await.is_err() {
                    return OutboundExit::SocketError;
                }
            }
            _ = ping_interval.tick() => {
                if !liveness.check_alive() && liveness.last_pong_elapsed() > config.timeout {
                    warn!(timeout = ?config.timeout, "peer unresponsive, disconnecting");
                    return OutboundExit::TimedOut;
                }
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return OutboundExit::SocketError;
                }
            }
            () = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return OutboundExit::Cancelled;
            }
        }
    }
}
