//! Worker-local view of the globally synchronized timer plane (§4.11's
//! "worker-local supplement"), grounded on `timers.py`'s `global_timer`/
//! `global_timer_cb`: plugins never see `'T'`/`'t'` frames themselves, only
//! a `register(name, interval, callback)` call and an eventual invocation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use ucollect_core::error::CoreError;
use ucollect_core::protocol::{extract_string, format_string, opcode};

/// Parse a `'t' || str(timerId)` tick frame's body (opcode already
/// stripped).
pub fn parse_tick(body: &[u8]) -> Result<String, CoreError> {
    let (timer_id, _) = extract_string(body)?;
    Ok(String::from_utf8_lossy(timer_id).into_owned())
}

type Callback = Box<dyn Fn() + Send + Sync>;

/// Registers named global timers with the gatekeeper and dispatches its
/// `'t'` ticks back to the callback that registered each name. One per
/// worker process, shared by every plugin that uses a global timer.
pub struct GlobalTimerRegistry {
    to_gatekeeper: mpsc::UnboundedSender<Bytes>,
    callbacks: Mutex<HashMap<String, Callback>>,
}

impl GlobalTimerRegistry {
    pub fn new(to_gatekeeper: mpsc::UnboundedSender<Bytes>) -> Arc<Self> {
        Arc::new(Self {
            to_gatekeeper,
            callbacks: Mutex::new(HashMap::new()),
        })
    }

    /// Register `callback` under `name` and ask the gatekeeper to
    /// subscribe this worker to a synchronized timer of that name and
    /// interval (§4.11). Dedup of "does a ticker already exist for this
    /// name" happens on the gatekeeper, across every worker — this call
    /// always sends `'T'`, matching `timers.py`'s unconditional
    /// `send_to_master` on every `global_timer()` call.
    pub async fn register(
        self: &Arc<Self>,
        name: impl Into<String>,
        interval: Duration,
        callback: impl Fn() + Send + Sync + 'static,
    ) {
        let name = name.into();
        self.callbacks
            .lock()
            .await
            .insert(name.clone(), Box::new(callback));

        let mut payload = vec![opcode::TIMER_SUBSCRIBE];
        payload.extend((interval.as_secs() as u32).to_be_bytes());
        payload.extend(format_string(name.as_bytes()));
        if self.to_gatekeeper.send(Bytes::from(payload)).is_err() {
            tracing::warn!(timer = %name, "control channel closed, timer subscription dropped");
        }
    }

    /// Invoke the callback registered for `timer_id`, if any. Called from
    /// the control-stream reader loop upon receiving a `'t'` frame.
    pub async fn dispatch_tick(&self, timer_id: &str) {
        let callbacks = self.callbacks.lock().await;
        match callbacks.get(timer_id) {
            Some(callback) => callback(),
            None => tracing::warn!(timer = timer_id, "tick for an unregistered timer"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn tick_frame_round_trips() {
        let body = format_string(b"gc-sweep");
        assert_eq!(parse_tick(&body).unwrap(), "gc-sweep");
    }

    #[tokio::test]
    async fn register_sends_a_subscribe_frame() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = GlobalTimerRegistry::new(tx);
        registry.register("gc-sweep", Duration::from_secs(60), || {}).await;

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame[0], opcode::TIMER_SUBSCRIBE);
        let interval = u32::from_be_bytes(frame[1..5].try_into().unwrap());
        assert_eq!(interval, 60);
        let (name, _) = extract_string(&frame[5..]).unwrap();
        assert_eq!(name, b"gc-sweep");
    }

    #[tokio::test]
    async fn dispatch_invokes_the_registered_callback() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry = GlobalTimerRegistry::new(tx);
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        registry
            .register("gc-sweep", Duration::from_secs(60), move || {
                count_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        registry.dispatch_tick("gc-sweep").await;
        registry.dispatch_tick("gc-sweep").await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dispatch_for_unknown_timer_does_not_panic() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry = GlobalTimerRegistry::new(tx);
        registry.dispatch_tick("no-such-timer").await;
    }
}
