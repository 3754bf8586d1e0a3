//! Gatekeeper-side view of the worker pool: per-worker control plane and
//! the `hash(cid) mod N` handoff routing (§4.11), grounded on
//! `original_source/gatekeeper2worker.py`.
//!
//! Each worker is reached over two separate channels opened at supervisor
//! startup: a framed AF_UNIX control stream carrying `'l'`/`'T'`/`'t'`
//! frames, and a second, raw `UnixStream` used purely to carry the
//! `SCM_RIGHTS` ancillary message with a handed-off client fd. Keeping fd
//! transfer off the framed stream avoids ever having to interleave a
//! `sendmsg` ancillary payload with the length-prefixed protocol bytes.

use std::collections::{hash_map::DefaultHasher, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::io::IoSlice;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{error, warn};

use ucollect_core::error::CoreError;
use ucollect_core::ids::ClientId;
use ucollect_core::protocol::{extract_string, format_string, opcode, FrameCodec};

/// One worker's two channels, plus the outbound frame queue its writer
/// task drains. Control-frame writes (handoff envelopes and timer ticks)
/// all funnel through `to_worker` so only one task ever touches the
/// control stream's write half.
pub struct WorkerHandle {
    pub index: usize,
    to_worker: mpsc::UnboundedSender<Bytes>,
    fd_channel: Arc<Mutex<UnixStream>>,
}

impl WorkerHandle {
    /// Take ownership of an already-connected control stream and fd
    /// channel (opened by the supervisor before `fork`/`exec`-ing the
    /// worker), start its writer task, and start reading `'T'` timer
    /// subscribe frames, forwarding them over `timer_events`.
    pub fn spawn(
        index: usize,
        control: UnixStream,
        fd_channel: UnixStream,
        timer_events: mpsc::UnboundedSender<(usize, String, Duration)>,
    ) -> Arc<Self> {
        let (read_half, write_half) = control.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(Self {
            index,
            to_worker: tx,
            fd_channel: Arc::new(Mutex::new(fd_channel)),
        });
        tokio::spawn(writer_loop(write_half, rx));
        tokio::spawn(reader_loop(index, read_half, timer_events));
        handle
    }

    /// Queue a raw control frame (already including its opcode byte) to
    /// be written to this worker.
    pub fn enqueue(&self, frame: Bytes) {
        if self.to_worker.send(frame).is_err() {
            warn!(worker = self.index, "control channel closed, dropping frame");
        }
    }

    /// Perform the client handoff (§4.11): write the `'l'` envelope, then
    /// pass the accepted client's fd over the paired raw socket via
    /// `SCM_RIGHTS`.
    pub async fn handoff(
        &self,
        cid: &ClientId,
        replay: &[Bytes],
        leftover: &[u8],
        client: TcpStream,
    ) -> Result<(), CoreError> {
        let mut envelope = vec![opcode::HANDOFF];
        envelope.extend(format_string(cid.as_str().as_bytes()));
        envelope.extend(format_string(replay.len().to_string().as_bytes()));
        for frame in replay {
            envelope.extend(format_string(frame));
        }
        envelope.extend(format_string(leftover));
        self.enqueue(Bytes::from(envelope));

        let std_stream = client
            .into_std()
            .map_err(|err| CoreError::Internal(format!("fd handoff prep failed: {err}")))?;
        std_stream
            .set_nonblocking(false)
            .map_err(|err| CoreError::Internal(format!("fd handoff prep failed: {err}")))?;
        let owned: OwnedFd = std_stream.into();

        let fd_channel = self.fd_channel.clone();
        tokio::task::spawn_blocking(move || send_fd(&fd_channel, owned))
            .await
            .map_err(|err| CoreError::Internal(format!("fd handoff task panicked: {err}")))??;
        Ok(())
    }
}

/// Blocking `sendmsg` carrying one marker byte plus the client fd as a
/// `SCM_RIGHTS` ancillary message. Called via `spawn_blocking` since
/// `nix::sys::socket::sendmsg` has no async counterpart.
fn send_fd(fd_channel: &Arc<Mutex<UnixStream>>, fd: OwnedFd) -> Result<(), CoreError> {
    let guard = fd_channel.blocking_lock();
    let raw = guard.as_raw_fd();
    let marker = [0u8];
    let iov = [IoSlice::new(&marker)];
    let fds = [fd.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg(raw, &iov, &cmsg, MsgFlags::empty(), None::<&UnixAddr>)
        .map_err(|errno| CoreError::Internal(format!("sendmsg failed: {errno}")))?;
    Ok(())
}

async fn writer_loop(write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    let mut framed = FramedWrite::new(write_half, FrameCodec::gatekeeper());
    while let Some(frame) = rx.recv().await {
        if let Err(err) = framed.send(frame).await {
            error!(%err, "failed writing to worker control stream, worker is unreachable");
            return;
        }
    }
}

/// Parse a `'T' || u32 intervalSeconds || str(timerId)` subscribe frame's
/// body (the opcode byte already stripped — §4.11).
fn parse_timer_subscribe(body: &[u8]) -> Option<(String, Duration)> {
    let interval_secs = u32::from_be_bytes(body.get(..4)?.try_into().ok()?);
    let (timer_id, _) = extract_string(&body[4..]).ok()?;
    Some((
        String::from_utf8_lossy(timer_id).into_owned(),
        Duration::from_secs(interval_secs as u64),
    ))
}

async fn reader_loop(
    index: usize,
    read_half: OwnedReadHalf,
    timer_events: mpsc::UnboundedSender<(usize, String, Duration)>,
) {
    let mut framed = FramedRead::new(read_half, FrameCodec::gatekeeper());
    while let Some(frame) = framed.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                error!(worker = index, %err, "worker control stream read failed");
                return;
            }
        };
        if frame.first() != Some(&opcode::TIMER_SUBSCRIBE) {
            warn!(worker = index, opcode = ?frame.first(), "unexpected control frame from worker");
            continue;
        }
        match parse_timer_subscribe(&frame[1..]) {
            Some((timer_id, interval)) => {
                let _ = timer_events.send((index, timer_id, interval));
            }
            None => warn!(worker = index, "malformed timer subscribe frame"),
        }
    }
}

/// Pick the worker index responsible for `cid` (§4.11: `hash(cid) mod N`).
pub fn worker_index_for(cid: &ClientId, worker_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    cid.as_str().hash(&mut hasher);
    (hasher.finish() % worker_count as u64) as usize
}

/// Routes accepted clients to the right worker and owns the global timer
/// fanout (§4.11): the first `'T'` subscribe for a given timer id starts a
/// ticker; later subscribes from other workers just join its fanout set.
pub struct WorkerPool {
    workers: Vec<Arc<WorkerHandle>>,
    timers: Mutex<HashMap<String, HashSet<usize>>>,
}

impl WorkerPool {
    /// Build the pool and start draining `timer_events` (fed by each
    /// worker's [`reader_loop`]) into [`subscribe_timer`](Self::subscribe_timer).
    pub fn new(
        workers: Vec<Arc<WorkerHandle>>,
        mut timer_events: mpsc::UnboundedReceiver<(usize, String, Duration)>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            workers,
            timers: Mutex::new(HashMap::new()),
        });
        let pool_for_events = pool.clone();
        tokio::spawn(async move {
            while let Some((worker, timer_id, interval)) = timer_events.recv().await {
                pool_for_events.subscribe_timer(worker, timer_id, interval).await;
            }
        });
        pool
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn route(&self, cid: &ClientId) -> Arc<WorkerHandle> {
        let index = worker_index_for(cid, self.workers.len());
        self.workers[index].clone()
    }

    /// Handle a `'T' || u32 interval || str(timerId)` subscribe frame from
    /// `from_worker`. Starts a fanout ticker the first time a given
    /// `timer_id` is seen; later subscribers just join the existing set.
    pub async fn subscribe_timer(
        self: &Arc<Self>,
        from_worker: usize,
        timer_id: String,
        interval: Duration,
    ) {
        let mut timers = self.timers.lock().await;
        let is_new = !timers.contains_key(&timer_id);
        timers.entry(timer_id.clone()).or_default().insert(from_worker);
        drop(timers);

        if is_new {
            let pool = self.clone();
            tokio::spawn(async move { pool.run_ticker(timer_id, interval).await });
        }
    }

    async fn run_ticker(self: Arc<Self>, timer_id: String, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick is immediate; skip it
        loop {
            ticker.tick().await;
            let subscribers: Vec<usize> = {
                let timers = self.timers.lock().await;
                match timers.get(&timer_id) {
                    Some(set) if !set.is_empty() => set.iter().copied().collect(),
                    _ => return,
                }
            };
            let mut payload = vec![opcode::TIMER_TICK];
            payload.extend(format_string(timer_id.as_bytes()));
            let frame = Bytes::from(payload);
            for index in subscribers {
                if let Some(worker) = self.workers.get(index) {
                    worker.enqueue(frame.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_index_is_stable_for_the_same_cid() {
        let cid = ClientId::from_raw_bytes(b"ABCDEF01");
        let a = worker_index_for(&cid, 8);
        let b = worker_index_for(&cid, 8);
        assert_eq!(a, b);
        assert!(a < 8);
    }

    #[test]
    fn worker_index_is_in_range_for_various_pool_sizes() {
        let cid = ClientId::from_raw_bytes(b"0123456789ABCDEF");
        for n in 1..=16 {
            assert!(worker_index_for(&cid, n) < n);
        }
    }

    #[test]
    fn timer_subscribe_round_trips() {
        let mut payload = 15u32.to_be_bytes().to_vec();
        payload.extend(format_string(b"gc-sweep"));
        let (timer_id, interval) = parse_timer_subscribe(&payload).unwrap();
        assert_eq!(timer_id, "gc-sweep");
        assert_eq!(interval, Duration::from_secs(15));
    }

    #[tokio::test]
    async fn enqueued_frame_reaches_worker_control_stream() {
        use tokio::io::AsyncReadExt;

        let (control_a, mut control_b) = UnixStream::pair().unwrap();
        let (fd_a, _fd_b) = UnixStream::pair().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = WorkerHandle::spawn(0, control_a, fd_a, tx);
        drop(rx);

        handle.enqueue(Bytes::from_static(b"\x74hello"));

        let mut len_buf = [0u8; 4];
        control_b.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        control_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"\x74hello");
    }

    #[tokio::test]
    async fn worker_subscribe_frame_is_forwarded_as_a_timer_event() {
        use tokio::io::AsyncWriteExt;

        let (control_a, mut control_b) = UnixStream::pair().unwrap();
        let (fd_a, _fd_b) = UnixStream::pair().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = WorkerHandle::spawn(3, control_a, fd_a, tx);

        let mut payload = vec![opcode::TIMER_SUBSCRIBE];
        payload.extend(300u32.to_be_bytes());
        payload.extend(format_string(b"reload"));
        let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
        frame.extend(payload);
        control_b.write_all(&frame).await.unwrap();

        let (worker, timer_id, interval) = rx.recv().await.unwrap();
        assert_eq!(worker, 3);
        assert_eq!(timer_id, "reload");
        assert_eq!(interval, Duration::from_secs(300));
    }
}
