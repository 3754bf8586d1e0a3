//! The client-session router (§4.7): tracks which session currently owns
//! each cid and fans plugin traffic in and out of them. Grounded on
//! `original_source/src/master/plugin.py`'s `Plugins` class, which plays the
//! same role (`registerClient`/`unregisterClient`/`broadcast`/`sendToClient`/
//! `passMessageToPlugin`) for the Python master.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use ucollect_core::ids::ClientId;
use ucollect_core::protocol::routed_payload;

use crate::plugin::{ClientInfo, SessionHandle, VersionPredicate};
use crate::registry::PluginRegistry;

/// A session is considered abandoned, and therefore replaceable by a fresh
/// login for the same cid, once this long has passed since its last pong
/// (§4.3, §4.7) — the ping/pong watchdog would have aborted it well before
/// this if it were still alive and well-behaved, so a session still present
/// in the map past this age is presumed stuck rather than merely quiet.
const STALE_SESSION_AGE: Duration = Duration::from_secs(900);

/// Routes plugin traffic to and from logged-in client sessions.
///
/// Holds no opinion about *how* a session is implemented (TCP socket, test
/// double, whatever `ucollect-worker` builds) — only the `SessionHandle`
/// contract.
pub struct ClientRouter {
    sessions: DashMap<ClientId, Arc<dyn SessionHandle>>,
    plugins: Arc<PluginRegistry>,
}

impl ClientRouter {
    pub fn new(plugins: Arc<PluginRegistry>) -> Self {
        Self {
            sessions: DashMap::new(),
            plugins,
        }
    }

    /// Register a newly logged-in session. Refuses (returns `false`,
    /// leaving the existing session untouched) if another session for the
    /// same cid is already registered and has not gone stale; otherwise
    /// installs the new session and calls `client_connected` on every
    /// hosted plugin, mirroring `plugin.py`'s unconditional clientConnected
    /// fan-out at registration time (distinct from the narrower fan-out
    /// `ucollect-worker` performs during version negotiation — see §4.9).
    pub async fn register_client(&self, session: Arc<dyn SessionHandle>) -> bool {
        let cid = session.cid().clone();
        {
            if let Some(existing) = self.sessions.get(&cid) {
                if !is_stale(existing.last_pong()) {
                    return false;
                }
            }
        }
        self.sessions.insert(cid.clone(), session.clone());

        let info = ClientInfo {
            cid,
            protocol_version: session.protocol_version(),
        };
        for plugin in self.plugins.iter() {
            plugin.client_connected(info.clone(), session.clone()).await;
        }
        true
    }

    /// Remove `session` from the routing table, but only if it is still the
    /// registered handle for its cid — a session replaced by a newer login
    /// (see `register_client`) must not be able to unregister the session
    /// that superseded it. Identity is pointer equality (`Arc::ptr_eq`),
    /// resolving the corresponding Open Question (DESIGN.md #2).
    pub async fn unregister_client(&self, session: &Arc<dyn SessionHandle>) {
        let cid = session.cid().clone();
        let removed = match self.sessions.get(&cid) {
            Some(entry) if Arc::ptr_eq(&*entry, session) => true,
            _ => false,
        };
        if !removed {
            return;
        }
        self.sessions.remove(&cid);

        let info = ClientInfo {
            cid,
            protocol_version: session.protocol_version(),
        };
        for plugin in self.plugins.iter() {
            plugin.client_disconnected(info.clone()).await;
        }
    }

    /// Send `msg` (already plugin-payload, not yet `'R'`-wrapped) to every
    /// session that supports `plugin_name`, optionally narrowed by
    /// `predicate` over the client's negotiated version (§4.7).
    pub fn broadcast(&self, plugin_name: &str, msg: &[u8], predicate: Option<VersionPredicate>) {
        let frame = routed_payload(plugin_name, msg);
        let mut delivered = 0usize;
        for entry in self.sessions.iter() {
            let session = entry.value();
            let Some(version) = session.plugin_version(plugin_name) else {
                continue;
            };
            if let Some(pred) = &predicate {
                if !pred(version) {
                    continue;
                }
            }
            if session.send_frame(frame.clone()) {
                delivered += 1;
            }
        }
        tracing::trace!(plugin = plugin_name, delivered, "broadcast complete");
    }

    /// Send `msg` to exactly one client, if it is registered and supports
    /// `plugin_name`. Returns `false` otherwise.
    pub fn send(&self, to: &ClientId, plugin_name: &str, msg: &[u8]) -> bool {
        match self.sessions.get(to) {
            Some(session) if session.supports_plugin(plugin_name) => {
                session.send_frame(routed_payload(plugin_name, msg))
            }
            _ => false,
        }
    }

    /// Dispatch an inbound `'R'` frame's payload to the named plugin. Drops
    /// the message with a debug log if no such plugin is hosted (clients
    /// can legitimately address stale or unknown plugin names, this is not
    /// a protocol violation — §4.7).
    pub async fn route_to_plugin(&self, plugin_name: &str, payload: Bytes, from: &ClientId) {
        match self.plugins.get(plugin_name) {
            Some(plugin) => {
                let protocol_version = self
                    .sessions
                    .get(from)
                    .map(|s| s.protocol_version())
                    .unwrap_or(0);
                let info = ClientInfo {
                    cid: from.clone(),
                    protocol_version,
                };
                plugin.message_from_client(info, payload).await;
            }
            None => tracing::debug!(plugin = plugin_name, cid = %from, "message for unknown plugin"),
        }
    }

    pub fn is_registered(&self, cid: &ClientId) -> bool {
        self.sessions.contains_key(cid)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

fn is_stale(last_pong: Instant) -> bool {
    last_pong + STALE_SESSION_AGE < Instant::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::test_support::{CountingPlugin, MockSession};
    use std::sync::atomic::Ordering;

    fn router_with(plugin: Arc<CountingPlugin>) -> ClientRouter {
        let mut registry = PluginRegistry::new();
        registry.register(plugin);
        ClientRouter::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn register_calls_connected_on_every_plugin() {
        let plugin = CountingPlugin::new("buckets");
        let router = router_with(plugin.clone());
        let session = MockSession::new("aaaa");
        assert!(router.register_client(session).await);
        assert_eq!(plugin.connected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_register_for_same_cid_is_refused_while_fresh() {
        let plugin = CountingPlugin::new("buckets");
        let router = router_with(plugin.clone());
        let first = MockSession::new("aaaa");
        let second = MockSession::new("aaaa");
        assert!(router.register_client(first).await);
        assert!(!router.register_client(second).await);
        assert_eq!(plugin.connected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_session_is_replaced() {
        let plugin = CountingPlugin::new("buckets");
        let router = router_with(plugin.clone());
        let first = MockSession::new("aaaa");
        *first.last_pong.lock().unwrap() = Instant::now() - Duration::from_secs(1000);
        let second = MockSession::new("aaaa");
        assert!(router.register_client(first).await);
        assert!(router.register_client(second).await);
        assert_eq!(plugin.connected.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unregister_only_removes_matching_identity() {
        let plugin = CountingPlugin::new("buckets");
        let router = router_with(plugin.clone());
        let stale = MockSession::new("aaaa");
        *stale.last_pong.lock().unwrap() = Instant::now() - Duration::from_secs(1000);
        let fresh = MockSession::new("aaaa");
        router.register_client(stale.clone()).await;
        router.register_client(fresh.clone()).await; // fresh now owns "aaaa"

        router.unregister_client(&stale).await; // stale handle, should be a no-op
        assert!(router.is_registered(&fresh.cid().clone()));

        router.unregister_client(&fresh).await;
        assert!(!router.is_registered(&fresh.cid().clone()));
        assert_eq!(plugin.disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_requires_plugin_support() {
        let plugin = CountingPlugin::new("buckets");
        let router = router_with(plugin.clone());
        let plain = MockSession::new("aaaa");
        router.register_client(plain.clone()).await;
        assert!(!router.send(plain.cid(), "buckets", b"hi"));

        let subscribed = MockSession::new("bbbb").with_plugin("buckets", 1);
        router.register_client(subscribed.clone()).await;
        assert!(router.send(subscribed.cid(), "buckets", b"hi"));
        assert_eq!(subscribed.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn broadcast_respects_version_predicate() {
        let plugin = CountingPlugin::new("buckets");
        let router = router_with(plugin.clone());
        let v1 = MockSession::new("aaaa").with_plugin("buckets", 1);
        let v2 = MockSession::new("bbbb").with_plugin("buckets", 2);
        router.register_client(v1.clone()).await;
        router.register_client(v2.clone()).await;

        let predicate: VersionPredicate = Arc::new(|v| v >= 2);
        router.broadcast("buckets", b"tick", Some(predicate));

        assert!(v1.sent.lock().unwrap().is_empty());
        assert_eq!(v2.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn route_to_plugin_delivers_payload_to_registered_plugin() {
        let plugin = CountingPlugin::new("buckets");
        let router = router_with(plugin.clone());
        let session = MockSession::new("aaaa");
        router.register_client(session.clone()).await;

        router
            .route_to_plugin("buckets", Bytes::from_static(b"hi"), session.cid())
            .await;
        assert_eq!(plugin.messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn route_to_plugin_for_unknown_plugin_is_a_no_op() {
        let plugin = CountingPlugin::new("buckets");
        let router = router_with(plugin.clone());
        let cid = ClientId::from_raw_bytes(b"aaaa");
        router
            .route_to_plugin("nonexistent", Bytes::from_static(b"hi"), &cid)
            .await;
        assert!(plugin.messages.lock().unwrap().is_empty());
    }
}
