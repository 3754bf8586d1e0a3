//! Client for the external authenticator daemon (§4.10), grounded on
//! `original_source/auth.py`'s `AuthenticatorClient`: one TCP connection,
//! FIFO-correlated `HALF <cid> <hex challenge> <hex response>\n` requests
//! and `YES`/anything-else line replies, a reconnect loop on disconnect,
//! and a watchdog re-armed after every flush that forces a reconnect if no
//! reply has arrived by its deadline even though the socket itself looks
//! alive.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{sleep, sleep_until, Instant as TokioInstant};
use tracing::{debug, warn};

/// Delay between reconnect attempts after the authenticator connection
/// drops.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// How long after a flush the watchdog waits for a reply before forcing a
/// reconnect (§4.10: `__sendAll` re-arms `reactor.callLater(60,
/// checkReceived)` on every send, rather than a free-running interval).
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);

struct Inner {
    addr: String,
    received: AtomicU64,
    force_reconnect: Notify,
    /// Armed by the connection loop after each successful flush: the
    /// deadline to check by, and the `received` count seen at arm time.
    watchdog_deadline: std::sync::Mutex<Option<(TokioInstant, u64)>>,
    rearm_watchdog: Notify,
}

impl Inner {
    /// Re-arm the watchdog the way `auth.py`'s `__sendAll` re-arms
    /// `checkReceived` after every flush of the FIFO: note how many replies
    /// have arrived so far and give the daemon `WATCHDOG_INTERVAL` to reply
    /// before forcing a reconnect.
    fn rearm_watchdog(&self) {
        let snapshot = self.received.load(Ordering::SeqCst);
        *self.watchdog_deadline.lock().unwrap() =
            Some((TokioInstant::now() + WATCHDOG_INTERVAL, snapshot));
        self.rearm_watchdog.notify_one();
    }
}

/// Handle to the background authenticator connection. Cloning is cheap;
/// every clone shares the same connection and request queue.
#[derive(Clone)]
pub struct AuthenticatorClient {
    inner: Arc<Inner>,
    requests: mpsc::UnboundedSender<(String, oneshot::Sender<bool>)>,
}

impl AuthenticatorClient {
    /// Start the background connection/reconnect task against `addr`
    /// (`host:port`) and return a handle to submit auth requests.
    pub fn spawn(addr: impl Into<String>) -> Self {
        let inner = Arc::new(Inner {
            addr: addr.into(),
            received: AtomicU64::new(0),
            force_reconnect: Notify::new(),
            watchdog_deadline: std::sync::Mutex::new(None),
            rearm_watchdog: Notify::new(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(connection_loop(inner.clone(), rx));
        tokio::spawn(watchdog_loop(inner.clone()));
        Self {
            inner,
            requests: tx,
        }
    }

    /// Ask the authenticator whether `response_hex` is the right answer to
    /// `challenge_hex` for `cid`. Resolves to `false` if the connection is
    /// lost before a reply arrives — a dropped connection is a credentials
    /// failure from the caller's point of view, not a retryable error.
    pub async fn auth(&self, cid: &str, challenge_hex: &str, response_hex: &str) -> bool {
        let line = format!("HALF {cid} {challenge_hex} {response_hex}\n");
        let (tx, rx) = oneshot::channel();
        if self.requests.send((line, tx)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

async fn connection_loop(
    inner: Arc<Inner>,
    mut rx: mpsc::UnboundedReceiver<(String, oneshot::Sender<bool>)>,
) {
    loop {
        let stream = match TcpStream::connect(&inner.addr).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(addr = %inner.addr, %err, "authenticator connect failed, retrying");
                sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        debug!(addr = %inner.addr, "authenticator connected");
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut in_flight: VecDeque<oneshot::Sender<bool>> = VecDeque::new();

        loop {
            tokio::select! {
                biased;

                _ = inner.force_reconnect.notified() => {
                    warn!("authenticator watchdog forced a reconnect");
                    break;
                }
                maybe_req = rx.recv() => {
                    match maybe_req {
                        Some((line, tx)) => {
                            if write_half.write_all(line.as_bytes()).await.is_err() {
                                let _ = tx.send(false);
                                break;
                            }
                            in_flight.push_back(tx);
                            inner.rearm_watchdog();
                        }
                        None => {
                            fail_all(&mut in_flight);
                            return;
                        }
                    }
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(text)) => {
                            inner.received.fetch_add(1, Ordering::SeqCst);
                            if let Some(tx) = in_flight.pop_front() {
                                let trimmed = text.trim();
                                let _ = tx.send(trimmed == "YES");
                                if trimmed == "QUIT" {
                                    break;
                                }
                            }
                        }
                        _ => break,
                    }
                }
            }
        }

        fail_all(&mut in_flight);
        sleep(RECONNECT_DELAY).await;
    }
}

fn fail_all(in_flight: &mut VecDeque<oneshot::Sender<bool>>) {
    while let Some(tx) = in_flight.pop_front() {
        let _ = tx.send(false);
    }
}

/// Waits on whatever deadline the connection loop last armed via
/// [`Inner::rearm_watchdog`], re-reading it each time a fresh send resets
/// it — never a free-running tick independent of actual traffic.
async fn watchdog_loop(inner: Arc<Inner>) {
    loop {
        let Some((deadline, snapshot)) = *inner.watchdog_deadline.lock().unwrap() else {
            inner.rearm_watchdog.notified().await;
            continue;
        };
        tokio::select! {
            _ = sleep_until(deadline) => {
                if inner.received.load(Ordering::SeqCst) == snapshot {
                    inner.force_reconnect.notify_one();
                }
                *inner.watchdog_deadline.lock().unwrap() = None;
            }
            _ = inner.rearm_watchdog.notified() => {
                // A new send moved the deadline out from under us; loop
                // around and pick up the freshly armed one.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn successful_reply_resolves_true() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 256];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(String::from_utf8_lossy(&buf[..n]), "HALF ABCDEF aa bb\n");
            socket.write_all(b"YES\n").await.unwrap();
        });

        let client = AuthenticatorClient::spawn(addr.to_string());
        let ok = client.auth("ABCDEF", "aa", "bb").await;
        assert!(ok);
    }

    #[tokio::test]
    async fn rejected_reply_resolves_false() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 256];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(b"NO\n").await.unwrap();
        });

        let client = AuthenticatorClient::spawn(addr.to_string());
        let ok = client.auth("ABCDEF", "aa", "bb").await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn dropped_connection_fails_pending_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let client = AuthenticatorClient::spawn(addr.to_string());
        let ok = client.auth("ABCDEF", "aa", "bb").await;
        assert!(!ok);
    }
}
