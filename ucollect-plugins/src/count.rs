//! A minimal example plugin proving the hosting contract's per-client
//! state pattern: keep the `SessionHandle` handed to `client_connected` so
//! later messages can reply directly, without going back through the
//! router. Named `Count` to match one of `LEGACY_PROTO0_PLUGINS`, but this
//! is a demonstration stand-in, not the real packet-counter plugin (out of
//! scope — spec.md §1).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use ucollect_core::ids::ClientId;
use ucollect_core::protocol::routed_payload;
use ucollect_plugin::{ClientInfo, Plugin, SessionHandle};

struct ClientState {
    session: Arc<dyn SessionHandle>,
    messages: AtomicU64,
}

pub struct CountPlugin {
    clients: DashMap<ClientId, ClientState>,
}

impl CountPlugin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clients: DashMap::new(),
        })
    }
}

#[async_trait]
impl Plugin for CountPlugin {
    fn name(&self) -> &str {
        "Count"
    }

    async fn client_connected(&self, client: ClientInfo, session: Arc<dyn SessionHandle>) {
        self.clients.insert(
            client.cid,
            ClientState {
                session,
                messages: AtomicU64::new(0),
            },
        );
    }

    async fn client_disconnected(&self, client: ClientInfo) {
        self.clients.remove(&client.cid);
    }

    async fn message_from_client(&self, client: ClientInfo, _payload: Bytes) {
        let Some(state) = self.clients.get(&client.cid) else {
            tracing::debug!(cid = %client.cid, "Count message from unregistered client");
            return;
        };
        let total = state.messages.fetch_add(1, Ordering::SeqCst) + 1;
        state
            .session
            .send_frame(routed_payload("Count", &total.to_be_bytes()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    struct TestSession {
        cid: ClientId,
        sent: Mutex<Vec<Bytes>>,
    }

    impl SessionHandle for TestSession {
        fn cid(&self) -> &ClientId {
            &self.cid
        }
        fn protocol_version(&self) -> u8 {
            1
        }
        fn plugin_version(&self, _plugin_name: &str) -> Option<u16> {
            Some(1)
        }
        fn send_frame(&self, payload: Bytes) -> bool {
            self.sent.lock().unwrap().push(payload);
            true
        }
        fn last_pong(&self) -> Instant {
            Instant::now()
        }
    }

    #[tokio::test]
    async fn counts_messages_per_client_and_replies() {
        let plugin = CountPlugin::new();
        let cid = ClientId::from_raw_bytes(b"aaaa");
        let session = Arc::new(TestSession {
            cid: cid.clone(),
            sent: Mutex::new(Vec::new()),
        });
        plugin
            .client_connected(
                ClientInfo {
                    cid: cid.clone(),
                    protocol_version: 1,
                },
                session.clone(),
            )
            .await;

        for _ in 0..3 {
            plugin
                .message_from_client(
                    ClientInfo {
                        cid: cid.clone(),
                        protocol_version: 1,
                    },
                    Bytes::from_static(b"x"),
                )
                .await;
        }
        assert_eq!(session.sent.lock().unwrap().len(), 3);

        plugin
            .client_disconnected(ClientInfo {
                cid: cid.clone(),
                protocol_version: 1,
            })
            .await;
        assert!(plugin.clients.get(&cid).is_none());
    }
}
