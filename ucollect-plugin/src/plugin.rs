//! The plugin hosting contract (§4.7), replacing the teacher's HTTP-phase
//! `Plugin` trait with one shaped around client sessions rather than HTTP
//! requests — there is no request/response phase pipeline in this protocol,
//! only a stream of framed messages per connected client.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use ucollect_core::ids::ClientId;

/// What a plugin is told about the client a message came from, or that just
/// (dis)connected. Deliberately thin — plugins that need more (address-set
/// membership, DB-backed state) fetch it themselves rather than having it
/// threaded through every call, matching `plugin.py`'s `Client` objects
/// carrying only `cid` across the plugin boundary.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub cid: ClientId,
    pub protocol_version: u8,
}

/// A predicate over a client's negotiated version for a given plugin, used
/// by `ClientRouter::broadcast` to address a subset of subscribers (e.g.
/// "only version >= 2") without the router needing to know what any
/// plugin's versions mean (§4.7, §4.9).
pub type VersionPredicate = Arc<dyn Fn(u16) -> bool + Send + Sync>;

/// A handle to a live, logged-in client session, as seen from plugin code.
///
/// Implemented by the worker crate's session type; kept as a trait here so
/// `ucollect-plugin` never depends on `ucollect-worker` (the router lives
/// below the session implementation, not above it).
pub trait SessionHandle: Send + Sync {
    fn cid(&self) -> &ClientId;

    fn protocol_version(&self) -> u8;

    /// `None` if this client never negotiated (or no longer supports) the
    /// named plugin; `Some(version)` otherwise (§4.9).
    fn plugin_version(&self, plugin_name: &str) -> Option<u16>;

    fn supports_plugin(&self, plugin_name: &str) -> bool {
        self.plugin_version(plugin_name).is_some()
    }

    /// Enqueue a raw outbound frame payload (already `routed_payload`-wrapped
    /// by the caller). Returns `false` if the session is gone or its outbound
    /// queue is closed; the router treats that as "nothing to do", mirroring
    /// `plugin.py`'s best-effort send.
    fn send_frame(&self, payload: Bytes) -> bool;

    /// Timestamp of the last pong received from this client, used by
    /// `ClientRouter::register_client`'s stale-session replacement rule.
    fn last_pong(&self) -> Instant;
}

/// A plugin hosted by the worker process.
///
/// `client_connected`/`client_disconnected` default to no-ops: most plugins
/// (e.g. a pure request/response plugin) only care about
/// `message_from_client` and have nothing to do on (dis)connect, mirroring
/// `plugin.py`'s `Plugin` base class, whose `clientConnected`/
/// `clientDisconnected` are empty by default and only overridden by plugins
/// that track per-client state (e.g. the address-set diff plugin).
#[async_trait]
pub trait Plugin: Send + Sync {
    /// The name this plugin is addressed by in routed frames (§4.7) and
    /// looked up under in `known_plugins` (§4.9).
    fn name(&self) -> &str;

    async fn client_connected(&self, _client: ClientInfo, _session: Arc<dyn SessionHandle>) {}

    async fn client_disconnected(&self, _client: ClientInfo) {}

    /// A frame routed to this plugin by a logged-in client. `payload` is the
    /// bytes following the plugin name in the `'R'` frame (§4.7).
    async fn message_from_client(&self, client: ClientInfo, payload: Bytes);
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub struct MockSession {
        pub cid: ClientId,
        pub versions: std::collections::HashMap<String, u16>,
        pub sent: Mutex<Vec<Bytes>>,
        pub alive: std::sync::atomic::AtomicBool,
        pub last_pong: Mutex<Instant>,
    }

    impl MockSession {
        pub fn new(cid: &str) -> Arc<Self> {
            Arc::new(Self {
                cid: ClientId::from_raw_bytes(cid.as_bytes()),
                versions: std::collections::HashMap::new(),
                sent: Mutex::new(Vec::new()),
                alive: std::sync::atomic::AtomicBool::new(true),
                last_pong: Mutex::new(Instant::now()),
            })
        }

        pub fn with_plugin(mut self: Arc<Self>, plugin: &str, version: u16) -> Arc<Self> {
            Arc::get_mut(&mut self)
                .expect("no other refs yet")
                .versions
                .insert(plugin.to_string(), version);
            self
        }
    }

    impl SessionHandle for MockSession {
        fn cid(&self) -> &ClientId {
            &self.cid
        }

        fn protocol_version(&self) -> u8 {
            1
        }

        fn plugin_version(&self, plugin_name: &str) -> Option<u16> {
            self.versions.get(plugin_name).copied()
        }

        fn send_frame(&self, payload: Bytes) -> bool {
            if !self.alive.load(Ordering::SeqCst) {
                return false;
            }
            self.sent.lock().unwrap().push(payload);
            true
        }

        fn last_pong(&self) -> Instant {
            *self.last_pong.lock().unwrap()
        }
    }

    pub struct CountingPlugin {
        pub name: &'static str,
        pub connected: AtomicUsize,
        pub disconnected: AtomicUsize,
        pub messages: Mutex<Vec<Bytes>>,
    }

    impl CountingPlugin {
        pub fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                connected: AtomicUsize::new(0),
                disconnected: AtomicUsize::new(0),
                messages: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Plugin for CountingPlugin {
        fn name(&self) -> &str {
            self.name
        }

        async fn client_connected(&self, _client: ClientInfo, _session: Arc<dyn SessionHandle>) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        async fn client_disconnected(&self, _client: ClientInfo) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }

        async fn message_from_client(&self, _client: ClientInfo, payload: Bytes) {
            self.messages.lock().unwrap().push(payload);
        }
    }
}
