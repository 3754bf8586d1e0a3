use async_trait::async_trait;
use bytes::Bytes;
use ucollect_plugin::{ClientInfo, Plugin};

/// Stateless example plugin: logs every message at trace level and does
/// nothing else. Demonstrates the minimal contract a plugin can satisfy —
/// only `name()` and `message_from_client` are required, both hooks default
/// to no-ops otherwise. Named `Sniff` to match `LEGACY_PROTO0_PLUGINS`; not
/// the real cert/ping sniffer plugin (out of scope — spec.md §1).
pub struct SniffPlugin;

#[async_trait]
impl Plugin for SniffPlugin {
    fn name(&self) -> &str {
        "Sniff"
    }

    async fn message_from_client(&self, client: ClientInfo, payload: Bytes) {
        tracing::trace!(cid = %client.cid, bytes = payload.len(), "Sniff message");
    }
}
