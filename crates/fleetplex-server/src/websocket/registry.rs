//! The broker's directory of connected controllers and attached clients.
//!
//! One registry exists per server and is passed explicitly to every session.
//! All state sits behind a single lock: a mutation and the fan-out of the
//! lifecycle event it causes happen in one critical section, so every
//! controller sees lifecycle events in mutation order and a controller that
//! registers later never sees an earlier event.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use fleetplex_core::{ClientHandle, ClientSession, ControllerId};
use metrics::counter;
use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, info, warn};

use super::connection::ControllerConnection;
use crate::metrics::WS_BROADCAST_DROPS_TOTAL;
use crate::rpc::types::RpcEvent;

/// Push sent when a client attaches.
pub const CLIENT_CONNECTED: &str = "client.connected";
/// Push sent when a client detaches.
pub const CLIENT_DISCONNECTED: &str = "client.disconnected";

/// Client lifecycle change fanned out to controllers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    /// A client attached under this handle.
    Connected(ClientHandle),
    /// The client under this handle detached.
    Disconnected(ClientHandle),
}

impl ClientEvent {
    /// Wire event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Connected(_) => CLIENT_CONNECTED,
            Self::Disconnected(_) => CLIENT_DISCONNECTED,
        }
    }

    /// The handle the event is about.
    pub fn handle(&self) -> &ClientHandle {
        match self {
            Self::Connected(h) | Self::Disconnected(h) => h,
        }
    }

    /// Build the wire event.
    pub fn to_rpc_event(&self) -> RpcEvent {
        RpcEvent::new(self.event_type(), Some(json!({ "handle": self.handle() })))
    }
}

/// Result of one fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Controllers the event was queued for.
    pub delivered: usize,
    /// Controllers whose queue rejected the event.
    pub failed: usize,
}

#[derive(Default)]
struct RegistryInner {
    controllers: HashMap<ControllerId, Arc<ControllerConnection>>,
    clients: BTreeMap<ClientHandle, Arc<dyn ClientSession>>,
}

/// Connected controllers and attached clients.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Controllers ─────────────────────────────────────────────────

    /// Add a controller. It receives every event broadcast from now on.
    pub fn register_controller(&self, connection: Arc<ControllerConnection>) {
        let mut inner = self.inner.write();
        let id = connection.id.clone();
        if inner.controllers.insert(id.clone(), connection).is_some() {
            warn!(controller_id = %id, "controller registered twice, replacing");
        }
        debug!(controller_id = %id, controllers = inner.controllers.len(), "controller registered");
    }

    /// Remove a controller. Absent IDs are a no-op; returns whether one was removed.
    pub fn unregister_controller(&self, id: &ControllerId) -> bool {
        let removed = self.inner.write().controllers.remove(id).is_some();
        if removed {
            debug!(controller_id = %id, "controller unregistered");
        }
        removed
    }

    /// Number of registered controllers.
    pub fn controller_count(&self) -> usize {
        self.inner.read().controllers.len()
    }

    /// Whether `id` is registered.
    pub fn has_controller(&self, id: &ControllerId) -> bool {
        self.inner.read().controllers.contains_key(id)
    }

    // ── Clients ─────────────────────────────────────────────────────

    /// Insert or replace the session for `handle` (last write wins).
    ///
    /// Returns the displaced session, if any. Does not notify controllers;
    /// see [`attach_client`](Self::attach_client).
    pub fn register_client(
        &self,
        handle: ClientHandle,
        session: Arc<dyn ClientSession>,
    ) -> Option<Arc<dyn ClientSession>> {
        self.inner.write().clients.insert(handle, session)
    }

    /// Remove the session for `handle`, if present.
    pub fn unregister_client(&self, handle: &str) -> Option<Arc<dyn ClientSession>> {
        self.inner.write().clients.remove(handle)
    }

    /// Resolve a handle to its session.
    pub fn lookup_client(&self, handle: &str) -> Option<Arc<dyn ClientSession>> {
        self.inner.read().clients.get(handle).cloned()
    }

    /// All registered handles, ascending.
    pub fn enumerate_handles(&self) -> Vec<ClientHandle> {
        self.inner.read().clients.keys().cloned().collect()
    }

    /// Number of registered clients.
    pub fn client_count(&self) -> usize {
        self.inner.read().clients.len()
    }

    // ── Fan-out ─────────────────────────────────────────────────────

    /// Queue `event` for every registered controller.
    ///
    /// A controller whose queue rejects the event would silently miss part
    /// of the lifecycle stream, so it is unregistered and its connection
    /// closed; the rest still receive the event.
    pub fn broadcast(&self, event: &ClientEvent) -> BroadcastOutcome {
        let mut inner = self.inner.write();
        Self::fan_out(&mut inner, event)
    }

    /// Register `session` under `handle` and announce it, atomically.
    pub fn attach_client(&self, handle: ClientHandle, session: Arc<dyn ClientSession>) -> BroadcastOutcome {
        let mut inner = self.inner.write();
        if inner.clients.insert(handle.clone(), session).is_some() {
            info!(handle = %handle, "client handle re-attached, replacing previous session");
        }
        Self::fan_out(&mut inner, &ClientEvent::Connected(handle))
    }

    /// Remove `handle` and announce it, atomically. No event if it was absent.
    pub fn detach_client(&self, handle: &str) -> Option<BroadcastOutcome> {
        let mut inner = self.inner.write();
        let (handle, _session) = inner.clients.remove_entry(handle)?;
        Some(Self::fan_out(&mut inner, &ClientEvent::Disconnected(handle)))
    }

    /// Like [`detach_client`](Self::detach_client), but only if `handle` is
    /// still bound to this exact `session`.
    ///
    /// An endpoint whose handle was taken over by a newer attachment must not
    /// remove its replacement when it goes away.
    pub fn detach_client_session(
        &self,
        handle: &str,
        session: &Arc<dyn ClientSession>,
    ) -> Option<BroadcastOutcome> {
        let mut inner = self.inner.write();
        let current = inner.clients.get(handle)?;
        if !Arc::ptr_eq(current, session) {
            debug!(handle, "handle rebound to a newer session, leaving it attached");
            return None;
        }
        let (handle, _session) = inner.clients.remove_entry(handle)?;
        Some(Self::fan_out(&mut inner, &ClientEvent::Disconnected(handle)))
    }

    fn fan_out(inner: &mut RegistryInner, event: &ClientEvent) -> BroadcastOutcome {
        let json = match serde_json::to_string(&event.to_rpc_event()) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!(event_type = event.event_type(), error = %e, "failed to serialize event");
                return BroadcastOutcome::default();
            }
        };

        let mut outcome = BroadcastOutcome::default();
        let mut lagging = Vec::new();
        for conn in inner.controllers.values() {
            if conn.send(json.clone()) {
                outcome.delivered += 1;
            } else {
                outcome.failed += 1;
                counter!(WS_BROADCAST_DROPS_TOTAL).increment(1);
                lagging.push(conn.id.clone());
            }
        }
        for id in lagging {
            if let Some(conn) = inner.controllers.remove(&id) {
                conn.mark_closed();
                warn!(
                    controller_id = %id,
                    event_type = event.event_type(),
                    "failed to push event, disconnecting controller"
                );
            }
        }
        debug!(
            event_type = event.event_type(),
            handle = %event.handle(),
            delivered = outcome.delivered,
            failed = outcome.failed,
            "broadcast client event"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fleetplex_core::ClientSessionError;
    use tokio::sync::mpsc;

    struct NullSession;

    #[async_trait]
    impl ClientSession for NullSession {
        async fn execute(&self, _command: Vec<u8>) -> Result<Vec<u8>, ClientSessionError> {
            Ok(Vec::new())
        }
    }

    fn session() -> Arc<dyn ClientSession> {
        Arc::new(NullSession)
    }

    fn controller(id: &str, capacity: usize) -> (Arc<ControllerConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(ControllerConnection::new(ControllerId::from(id), tx)), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<(String, String)> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            let v: serde_json::Value = serde_json::from_str(&msg).unwrap();
            out.push((
                v["type"].as_str().unwrap().to_owned(),
                v["data"]["handle"].as_str().unwrap().to_owned(),
            ));
        }
        out
    }

    fn handles(reg: &ConnectionRegistry) -> Vec<String> {
        reg.enumerate_handles().into_iter().map(ClientHandle::into_inner).collect()
    }

    #[test]
    fn empty_registry() {
        let reg = ConnectionRegistry::new();
        assert_eq!(reg.controller_count(), 0);
        assert!(reg.enumerate_handles().is_empty());
        assert!(reg.lookup_client("pc1").is_none());
    }

    #[test]
    fn enumerate_is_sorted() {
        let reg = ConnectionRegistry::new();
        for h in ["pc3", "pc1", "lab-2", "pc2"] {
            let _ = reg.register_client(h.into(), session());
        }
        assert_eq!(handles(&reg), vec!["lab-2", "pc1", "pc2", "pc3"]);
    }

    #[test]
    fn register_client_last_write_wins() {
        let reg = ConnectionRegistry::new();
        let first = session();
        let second = session();
        assert!(reg.register_client("pc1".into(), first.clone()).is_none());
        let displaced = reg.register_client("pc1".into(), second.clone()).unwrap();
        assert!(Arc::ptr_eq(&displaced, &first));
        assert!(Arc::ptr_eq(&reg.lookup_client("pc1").unwrap(), &second));
        assert_eq!(reg.client_count(), 1);
    }

    #[test]
    fn unregister_missing_is_noop() {
        let reg = ConnectionRegistry::new();
        assert!(reg.unregister_client("ghost").is_none());
        assert!(!reg.unregister_controller(&ControllerId::from("ghost")));
    }

    #[test]
    fn unregister_controller_twice() {
        let reg = ConnectionRegistry::new();
        let (c, _rx) = controller("c1", 8);
        reg.register_controller(c.clone());
        assert!(reg.has_controller(&c.id));
        assert!(reg.unregister_controller(&c.id));
        assert!(!reg.unregister_controller(&c.id));
        assert_eq!(reg.controller_count(), 0);
    }

    #[test]
    fn attach_reaches_every_active_controller_once() {
        let reg = ConnectionRegistry::new();
        let (a, mut a_rx) = controller("a", 8);
        let (b, mut b_rx) = controller("b", 8);
        reg.register_controller(a);
        reg.register_controller(b);

        let outcome = reg.attach_client("pc1".into(), session());
        assert_eq!(outcome, BroadcastOutcome { delivered: 2, failed: 0 });

        let (late, mut late_rx) = controller("late", 8);
        reg.register_controller(late);

        assert_eq!(drain(&mut a_rx), vec![("client.connected".into(), "pc1".into())]);
        assert_eq!(drain(&mut b_rx), vec![("client.connected".into(), "pc1".into())]);
        assert!(drain(&mut late_rx).is_empty());
    }

    #[test]
    fn events_arrive_in_mutation_order() {
        let reg = ConnectionRegistry::new();
        let (a, mut a_rx) = controller("a", 16);
        reg.register_controller(a);

        let _ = reg.attach_client("pc1".into(), session());
        let _ = reg.attach_client("pc2".into(), session());
        let _ = reg.detach_client("pc1");
        let _ = reg.attach_client("pc1".into(), session());

        assert_eq!(
            drain(&mut a_rx),
            vec![
                ("client.connected".into(), "pc1".into()),
                ("client.connected".into(), "pc2".into()),
                ("client.disconnected".into(), "pc1".into()),
                ("client.connected".into(), "pc1".into()),
            ]
        );
    }

    #[test]
    fn failing_controller_does_not_block_others() {
        let reg = ConnectionRegistry::new();
        let (full, _full_rx) = controller("full", 1);
        assert!(full.send(Arc::new("filler".into())));
        let (gone, gone_rx) = controller("gone", 4);
        drop(gone_rx);
        let (ok, mut ok_rx) = controller("ok", 4);
        reg.register_controller(full.clone());
        reg.register_controller(gone);
        reg.register_controller(ok);

        let outcome = reg.broadcast(&ClientEvent::Connected("pc1".into()));
        assert_eq!(outcome, BroadcastOutcome { delivered: 1, failed: 2 });
        assert_eq!(drain(&mut ok_rx).len(), 1);
        assert_eq!(full.drop_count(), 1);
        assert!(full.is_closed());
        assert_eq!(reg.controller_count(), 1);
        assert!(!reg.has_controller(&full.id));
    }

    #[test]
    fn lagging_controller_is_disconnected_instead_of_missing_events() {
        let reg = ConnectionRegistry::new();
        let (slow, mut slow_rx) = controller("slow", 1);
        let (ok, mut ok_rx) = controller("ok", 4);
        reg.register_controller(slow.clone());
        reg.register_controller(ok);

        assert_eq!(reg.attach_client("pc1".into(), session()), BroadcastOutcome { delivered: 2, failed: 0 });
        assert_eq!(reg.attach_client("pc2".into(), session()), BroadcastOutcome { delivered: 1, failed: 1 });
        assert!(!reg.has_controller(&slow.id));
        assert!(slow.is_closed());

        let _ = reg.detach_client("pc1");
        assert_eq!(drain(&mut slow_rx), vec![("client.connected".into(), "pc1".into())]);
        assert_eq!(drain(&mut ok_rx).len(), 3);
    }

    #[test]
    fn unregistered_controller_gets_nothing() {
        let reg = ConnectionRegistry::new();
        let (a, mut a_rx) = controller("a", 8);
        let (b, mut b_rx) = controller("b", 8);
        reg.register_controller(a.clone());
        reg.register_controller(b);
        let _ = reg.unregister_controller(&a.id);

        let _ = reg.attach_client("pc1".into(), session());
        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(drain(&mut b_rx).len(), 1);
        assert_eq!(handles(&reg), vec!["pc1"]);
    }

    #[test]
    fn detach_absent_emits_nothing() {
        let reg = ConnectionRegistry::new();
        let (a, mut a_rx) = controller("a", 8);
        reg.register_controller(a);
        assert!(reg.detach_client("pc1").is_none());
        assert!(drain(&mut a_rx).is_empty());
    }

    #[test]
    fn detach_session_ignores_replaced_handle() {
        let reg = ConnectionRegistry::new();
        let (a, mut a_rx) = controller("a", 8);
        reg.register_controller(a);
        let old = session();
        let new = session();
        let _ = reg.attach_client("pc1".into(), old.clone());
        let _ = reg.attach_client("pc1".into(), new.clone());

        assert!(reg.detach_client_session("pc1", &old).is_none());
        assert!(Arc::ptr_eq(&reg.lookup_client("pc1").unwrap(), &new));

        assert!(reg.detach_client_session("pc1", &new).is_some());
        assert!(reg.lookup_client("pc1").is_none());
        let kinds: Vec<String> = drain(&mut a_rx).into_iter().map(|(t, _)| t).collect();
        assert_eq!(kinds, vec!["client.connected", "client.connected", "client.disconnected"]);
    }

    #[test]
    fn event_wire_shape() {
        let v = serde_json::to_value(ClientEvent::Disconnected("pc7".into()).to_rpc_event()).unwrap();
        assert_eq!(v["type"], CLIENT_DISCONNECTED);
        assert_eq!(v["data"]["handle"], "pc7");
    }

    #[test]
    fn concurrent_mutations_stay_consistent() {
        let reg = Arc::new(ConnectionRegistry::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let handle = format!("t{t}-{i}");
                        let _ = reg.attach_client(handle.as_str().into(), session());
                        if i % 2 == 0 {
                            let _ = reg.detach_client(&handle);
                        }
                        let snapshot = reg.enumerate_handles();
                        assert!(snapshot.windows(2).all(|w| w[0] < w[1]));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(reg.client_count(), 8 * 100);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeSet;

        #[derive(Debug, Clone)]
        enum Op {
            Register(u8),
            Unregister(u8),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0u8..16).prop_map(Op::Register),
                (0u8..16).prop_map(Op::Unregister),
            ]
        }

        proptest! {
            #[test]
            fn enumerate_matches_model(ops in proptest::collection::vec(op(), 0..64)) {
                let reg = ConnectionRegistry::new();
                let mut model = BTreeSet::new();
                for op in ops {
                    match op {
                        Op::Register(n) => {
                            let _ = reg.register_client(format!("h{n:02}").into(), session());
                            let _ = model.insert(format!("h{n:02}"));
                        }
                        Op::Unregister(n) => {
                            let _ = reg.unregister_client(&format!("h{n:02}"));
                            let _ = model.remove(&format!("h{n:02}"));
                        }
                    }
                }
                let expected: Vec<String> = model.into_iter().collect();
                prop_assert_eq!(handles(&reg), expected);
            }
        }
    }
}
