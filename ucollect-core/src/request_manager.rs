use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::oneshot;

/// Outcome delivered to a caller awaiting a request-manager response.
///
/// Exactly one of `Data`/`Missing` is ever sent; if neither arrives before
/// the request's own deadline, `trim` drops the entry and the receiver is
/// simply never resolved (§4.5) — callers that need a hard guarantee must
/// wrap this in their own timeout, the request manager does not provide one.
#[derive(Debug)]
pub enum RequestOutcome {
    Data(Bytes),
    Missing,
}

struct Pending {
    deadline: Instant,
    responder: oneshot::Sender<RequestOutcome>,
}

/// Assigns 32-bit rolling correlation ids to outgoing plugin requests and
/// routes the matching response back to the registering caller (§4.5).
pub struct RequestManager {
    next_id: u32,
    pending: HashMap<u32, Pending>,
}

impl RequestManager {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            pending: HashMap::new(),
        }
    }

    /// Reserve the next id and register a deadline for it. Returns the id
    /// and a receiver that resolves when `response`/`missing` fires, or
    /// never resolves if `trim` drops the entry first.
    pub fn register(&mut self, deadline: Instant) -> (u32, oneshot::Receiver<RequestOutcome>) {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, Pending { deadline, responder: tx });
        (id, rx)
    }

    /// A success reply arrived for `id`. Unknown ids are logged and ignored
    /// (they may have already been trimmed).
    pub fn response(&mut self, id: u32, data: Bytes) {
        if let Some(pending) = self.pending.remove(&id) {
            let _ = pending.responder.send(RequestOutcome::Data(data));
        } else {
            tracing::warn!(request_id = id, "response for unknown or expired request id");
        }
    }

    /// An explicit "no data" reply arrived for `id`.
    pub fn missing(&mut self, id: u32) {
        if let Some(pending) = self.pending.remove(&id) {
            let _ = pending.responder.send(RequestOutcome::Missing);
        } else {
            tracing::warn!(request_id = id, "missing-notice for unknown or expired request id");
        }
    }

    /// Drop every entry whose deadline has passed; their receivers are
    /// simply never resolved. Returns the number of entries dropped.
    pub fn trim(&mut self, now: Instant) -> usize {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline < now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.pending.remove(id);
        }
        expired.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for RequestManager {
    fn default() -> Self {
        Self::new()
    }
}
