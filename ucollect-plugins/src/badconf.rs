use async_trait::async_trait;
use bytes::Bytes;
use ucollect_plugin::{ClientInfo, Plugin};

/// Example plugin, named `Badconf` to match `LEGACY_PROTO0_PLUGINS`; not the
/// real misconfiguration-report plugin (out of scope — spec.md §1).
pub struct BadconfPlugin;

#[async_trait]
impl Plugin for BadconfPlugin {
    fn name(&self) -> &str {
        "Badconf"
    }

    async fn message_from_client(&self, client: ClientInfo, payload: Bytes) {
        tracing::debug!(cid = %client.cid, bytes = payload.len(), "Badconf report received");
    }
}
