use async_trait::async_trait;
use bytes::Bytes;
use ucollect_plugin::{ClientInfo, Plugin};

/// Example plugin, named `Buckets` to match `LEGACY_PROTO0_PLUGINS`; not
/// the real bucket-hash anomaly detector (out of scope — spec.md §1).
/// Demonstrates a plugin that rejects oversized payloads rather than
/// queueing them, the shape a real bounded-memory plugin would follow.
pub struct BucketsPlugin {
    max_payload: usize,
}

impl BucketsPlugin {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Default for BucketsPlugin {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

#[async_trait]
impl Plugin for BucketsPlugin {
    fn name(&self) -> &str {
        "Buckets"
    }

    async fn message_from_client(&self, client: ClientInfo, payload: Bytes) {
        if payload.len() > self.max_payload {
            tracing::warn!(
                cid = %client.cid,
                bytes = payload.len(),
                limit = self.max_payload,
                "Buckets payload too large, dropped"
            );
            return;
        }
        tracing::debug!(cid = %client.cid, bytes = payload.len(), "Buckets message accepted");
    }
}
