//! Per-connection challenge/login/handoff state machine (§4.8), grounded
//! on `original_source/client_master.py`'s gatekeeper-side session class.
//!
//! A session only ever understands two frames before the worker takes
//! over: `'L'` (login) and `'S'` (session cookie). Everything else that
//! arrives while authentication is in flight is buffered verbatim and
//! replayed to the worker as part of the handoff envelope rather than
//! interpreted here — the gatekeeper has no plugin host.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rand::RngCore;
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Framed};
use tracing::{info, warn};

use ucollect_core::error::CoreError;
use ucollect_core::ids::ClientId;
use ucollect_core::protocol::{opcode, FrameCodec};

use crate::login::{parse_login, parse_session_cookie, LOGIN_VERSION_OK};

/// §4.8: a client that hasn't sent `'H'` within this long of the challenge
/// being issued is dropped.
pub const LOGIN_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Debug, PartialEq, Eq)]
enum State {
    ChallengeSent,
    AwaitingAuth,
    Authenticated,
}

/// Outcome of driving a session to completion: either it's ready to hand
/// off to a worker, or it ended (bad version byte, auth failure, timeout,
/// disconnect) without ever reaching that point.
pub enum Outcome {
    HandOff {
        cid: ClientId,
        stream: TcpStream,
        /// Bytes already pulled off the socket into the gatekeeper's read
        /// buffer but not yet decoded into a frame — these didn't travel
        /// with the handed-off fd, so the worker must be given them
        /// directly rather than re-reading them from the socket.
        leftover: Bytes,
        replay: Vec<Bytes>,
    },
    Rejected,
}

/// Anything that can answer "is this cid/challenge/response valid" —
/// implemented by `crate::authenticator::AuthenticatorClient` in
/// production, mocked directly in tests.
#[async_trait::async_trait]
pub trait Authenticate: Send + Sync {
    async fn auth(&self, cid: &str, challenge_hex: &str, response_hex: &str) -> bool;
}

#[async_trait::async_trait]
impl Authenticate for crate::authenticator::AuthenticatorClient {
    async fn auth(&self, cid: &str, challenge_hex: &str, response_hex: &str) -> bool {
        crate::authenticator::AuthenticatorClient::auth(self, cid, challenge_hex, response_hex)
            .await
    }
}

fn generate_challenge() -> [u8; 16] {
    let mut challenge = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}

/// Drive one accepted connection from challenge issue through to handoff
/// or rejection. `stream` is consumed and, on `Outcome::HandOff`, handed
/// back so the caller can pass its raw fd to a worker.
pub async fn run(
    stream: TcpStream,
    authenticator: &(dyn Authenticate),
) -> Result<Outcome, CoreError> {
    let mut framed = Framed::new(stream, FrameCodec::gatekeeper());
    let challenge = generate_challenge();

    let mut payload = vec![opcode::CHALLENGE];
    payload.extend_from_slice(&challenge);
    framed.send(Bytes::from(payload)).await?;

    let mut state = State::ChallengeSent;
    let mut cid: Option<ClientId> = None;
    let mut replay: Vec<Bytes> = Vec::new();

    let deadline = tokio::time::sleep(LOGIN_DEADLINE);
    tokio::pin!(deadline);

    loop {
        let frame = tokio::select! {
            biased;
            _ = &mut deadline => {
                info!("login deadline exceeded, dropping connection");
                return Ok(Outcome::Rejected);
            }
            frame = framed.next() => frame,
        };

        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => return Err(err),
            None => return Ok(Outcome::Rejected),
        };

        let Some(&op) = frame.first() else {
            warn!("empty frame before handoff, dropping");
            continue;
        };
        let body = &frame[1..];

        match op {
            opcode::LOGIN if state == State::ChallengeSent => {
                let login = match parse_login(body) {
                    Ok(login) => login,
                    Err(err) => {
                        warn!(%err, "malformed login frame");
                        return Ok(Outcome::Rejected);
                    }
                };
                if login.version_byte != LOGIN_VERSION_OK {
                    framed
                        .send(Bytes::from(vec![opcode::LOGIN_FAILURE]))
                        .await?;
                    // Keep the socket open but stop participating: this
                    // rate-limits a misbehaving client's reconnect loop
                    // instead of letting it hammer a fresh TCP handshake.
                    idle_forever(&mut framed).await;
                    return Ok(Outcome::Rejected);
                }

                let parsed_cid = ClientId::from_raw_bytes(&login.cid);
                let challenge_hex = hex::encode(challenge);
                let response_hex = hex::encode(&login.response);
                state = State::AwaitingAuth;

                let ok = authenticator
                    .auth(parsed_cid.as_str(), &challenge_hex, &response_hex)
                    .await;
                if !ok {
                    framed
                        .send(Bytes::from(vec![opcode::LOGIN_FAILURE]))
                        .await?;
                    return Ok(Outcome::Rejected);
                }
                cid = Some(parsed_cid);
                state = State::Authenticated;
            }
            opcode::SESSION_COOKIE => {
                if let Err(err) = parse_session_cookie(body) {
                    warn!(%err, "malformed session cookie frame, ignoring");
                }
                // Cookies are accepted at any point but carry no
                // gatekeeper-side behaviour (§4.8): the worker is the one
                // that stores it as inert session state, so it travels in
                // the replay list like any other frame the gatekeeper
                // doesn't itself interpret.
                replay.push(frame);
            }
            opcode::HELLO if state == State::Authenticated => {
                let cid = cid.expect("Authenticated state implies cid is set");
                // The worker has its own pre-login dispatch table
                // (`'H'`/`'S'`) and never saw this frame — it travels
                // last in the replay list so the worker's dispatcher is
                // the one that actually interprets the hello version byte.
                replay.push(frame.clone());

                // `Framed::next()` only ever yields one frame per call, but
                // the client may have pipelined more right behind `'H'` in
                // the same TCP segment — those extra frames are already
                // sitting fully decoded-able in our read buffer and would
                // otherwise be silently dropped when the raw fd is handed
                // off. Drain every complete frame still in the buffer into
                // the replay list; only a genuine trailing partial frame
                // (at most a few bytes) is forwarded as raw `leftover`.
                let mut parts = framed.into_parts();
                let mut codec = FrameCodec::gatekeeper();
                while let Some(extra) = codec.decode(&mut parts.read_buf)? {
                    replay.push(extra);
                }

                return Ok(Outcome::HandOff {
                    cid,
                    stream: parts.io,
                    leftover: parts.read_buf.freeze(),
                    replay,
                });
            }
            _ => {
                replay.push(frame);
            }
        }
    }
}

/// After a rejected login, drain and discard everything the client sends
/// until it gives up and disconnects.
async fn idle_forever(framed: &mut Framed<TcpStream, FrameCodec>) {
    loop {
        match framed.next().await {
            Some(Ok(_)) => continue,
            _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream as ClientStream};
    use ucollect_core::protocol::format_string;

    struct StubAuthenticator {
        accept: bool,
    }

    #[async_trait::async_trait]
    impl Authenticate for StubAuthenticator {
        async fn auth(&self, _cid: &str, _challenge_hex: &str, _response_hex: &str) -> bool {
            self.accept
        }
    }

    async fn connected_pair() -> (TcpStream, ClientStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = ClientStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    fn raw_frame(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + payload.len());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    async fn read_frame(client: &mut ClientStream) -> Vec<u8> {
        let mut len_buf = [0u8; 4];
        client.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        client.read_exact(&mut buf).await.unwrap();
        buf
    }

    fn login_frame(version: u8, cid: &[u8], response: &[u8]) -> Vec<u8> {
        let mut payload = vec![opcode::LOGIN, version];
        payload.extend(format_string(cid));
        payload.extend(format_string(response));
        raw_frame(&payload)
    }

    #[tokio::test]
    async fn happy_path_reaches_handoff() {
        let (server, mut client) = connected_pair().await;
        let auth = StubAuthenticator { accept: true };

        let server_task = tokio::spawn(async move { run(server, &auth).await });

        let challenge = read_frame(&mut client).await;
        assert_eq!(challenge[0], opcode::CHALLENGE);
        assert_eq!(challenge.len(), 17);

        client
            .write_all(&login_frame(LOGIN_VERSION_OK, b"ABCDEF01", b"deadbeef"))
            .await
            .unwrap();
        client
            .write_all(&raw_frame(&[opcode::HELLO]))
            .await
            .unwrap();

        let outcome = server_task.await.unwrap().unwrap();
        match outcome {
            Outcome::HandOff { cid, replay, .. } => {
                assert_eq!(cid.as_str(), "4142434445463031");
                // The worker's own pre-login dispatcher needs the hello
                // frame itself, so it always travels as the last replayed
                // frame even when nothing else was buffered.
                assert_eq!(replay.len(), 1);
                assert_eq!(replay[0][0], opcode::HELLO);
            }
            Outcome::Rejected => panic!("expected a handoff"),
        }
    }

    #[tokio::test]
    async fn wrong_version_byte_gets_login_failure() {
        let (server, mut client) = connected_pair().await;
        let auth = StubAuthenticator { accept: true };
        tokio::spawn(async move { run(server, &auth).await });

        let _ = read_frame(&mut client).await;
        client
            .write_all(&login_frame(b'X', b"ABCDEF01", b"deadbeef"))
            .await
            .unwrap();

        let reply = read_frame(&mut client).await;
        assert_eq!(reply, vec![opcode::LOGIN_FAILURE]);
    }

    #[tokio::test]
    async fn authenticator_rejection_ends_in_rejected() {
        let (server, mut client) = connected_pair().await;
        let auth = StubAuthenticator { accept: false };
        let server_task = tokio::spawn(async move { run(server, &auth).await });

        let _ = read_frame(&mut client).await;
        client
            .write_all(&login_frame(LOGIN_VERSION_OK, b"ABCDEF01", b"deadbeef"))
            .await
            .unwrap();

        let reply = read_frame(&mut client).await;
        assert_eq!(reply, vec![opcode::LOGIN_FAILURE]);
        assert!(matches!(
            server_task.await.unwrap().unwrap(),
            Outcome::Rejected
        ));
    }

    #[tokio::test]
    async fn frames_before_handoff_are_buffered_for_replay() {
        let (server, mut client) = connected_pair().await;
        let auth = StubAuthenticator { accept: true };
        let server_task = tokio::spawn(async move { run(server, &auth).await });

        let _ = read_frame(&mut client).await;
        client
            .write_all(&login_frame(LOGIN_VERSION_OK, b"ABCDEF01", b"deadbeef"))
            .await
            .unwrap();
        client
            .write_all(&raw_frame(&[opcode::PING]))
            .await
            .unwrap();
        client
            .write_all(&raw_frame(&[opcode::HELLO]))
            .await
            .unwrap();

        match server_task.await.unwrap().unwrap() {
            Outcome::HandOff { replay, .. } => {
                assert_eq!(replay.len(), 2);
                assert_eq!(replay[0][0], opcode::PING);
                assert_eq!(replay[1][0], opcode::HELLO);
            }
            Outcome::Rejected => panic!("expected a handoff"),
        }
    }
}
