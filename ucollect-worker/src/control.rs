//! FD adoption and handoff-envelope parsing for the worker side of the
//! gatekeeper⇄worker control plane (§4.11, §4.12), grounded on
//! `worker2gatekeeper.py`'s `stringReceived` (the `'l'` branch) and
//! `collect-gatekeeper.py`'s `spawnProcess`, which pre-wires FD 3 to the
//! worker's half of a control socketpair before exec'ing it.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use bytes::Bytes;
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, UnixAddr};
use nix::sys::uio::IoSliceMut;
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Mutex;

use ucollect_core::error::CoreError;
use ucollect_core::ids::ClientId;
use ucollect_core::protocol::extract_string;

/// The control stream (framed `'l'`/`'T'`/`'t'` traffic) is always inherited
/// on this fd (§4.12).
pub const CONTROL_FD: RawFd = 3;
/// The raw socket used purely for `SCM_RIGHTS` client-fd transfer is always
/// inherited on this fd.
pub const FD_CHANNEL_FD: RawFd = 4;

/// Adopt the two file descriptors the supervisor pre-wired into this
/// process before exec (§4.12).
///
/// # Safety
/// Sound only at process startup, called at most once, and only because
/// the supervisor contractually guarantees FD 3 and FD 4 are open,
/// connected `AF_UNIX` sockets before this process's `main` runs — there
/// is no API-level way to adopt an inherited fd other than asserting that
/// external contract.
pub unsafe fn adopt_inherited_fds() -> std::io::Result<(UnixStream, UnixStream)> {
    let control = unsafe { std::os::unix::net::UnixStream::from_raw_fd(CONTROL_FD) };
    control.set_nonblocking(true)?;
    let control = UnixStream::from_std(control)?;

    let fd_channel = unsafe { std::os::unix::net::UnixStream::from_raw_fd(FD_CHANNEL_FD) };
    fd_channel.set_nonblocking(true)?;
    let fd_channel = UnixStream::from_std(fd_channel)?;

    Ok((control, fd_channel))
}

/// Block for one `SCM_RIGHTS` message on `fd_channel` and adopt the single
/// fd it carries as a connected TCP client socket. Run via `spawn_blocking`
/// since `nix::sys::socket::recvmsg` has no async counterpart.
pub async fn recv_client_socket(
    fd_channel: &Arc<Mutex<UnixStream>>,
) -> Result<TcpStream, CoreError> {
    let fd_channel = fd_channel.clone();
    let owned = tokio::task::spawn_blocking(move || recv_fd_blocking(&fd_channel))
        .await
        .map_err(|err| CoreError::Internal(format!("fd receive task panicked: {err}")))??;

    let std_stream: std::net::TcpStream = owned.into();
    std_stream
        .set_nonblocking(true)
        .map_err(|err| CoreError::Internal(format!("client socket adoption failed: {err}")))?;
    TcpStream::from_std(std_stream)
        .map_err(|err| CoreError::Internal(format!("client socket adoption failed: {err}")))
}

fn recv_fd_blocking(fd_channel: &Arc<Mutex<UnixStream>>) -> Result<OwnedFd, CoreError> {
    let guard = fd_channel.blocking_lock();
    let raw = guard.as_raw_fd();
    let mut marker = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut marker)];
    let mut cmsg_buffer = nix::cmsg_space!(RawFd);
    let msg = recvmsg::<UnixAddr>(raw, &mut iov, Some(&mut cmsg_buffer), MsgFlags::empty())
        .map_err(|errno| CoreError::Internal(format!("recvmsg failed: {errno}")))?;
    for cmsg in msg
        .cmsgs()
        .map_err(|err| CoreError::Internal(format!("ancillary data parse failed: {err}")))?
    {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&raw_fd) = fds.first() {
                return Ok(unsafe { OwnedFd::from_raw_fd(raw_fd) });
            }
        }
    }
    Err(CoreError::Internal("handoff carried no fd".into()))
}

/// One parsed `'l'` handoff envelope (§4.11), minus its opcode byte:
/// `str(cid) || str(decimalReplayCount) || str(frame)* || str(leftover)`.
/// The trailing `leftover` string is a Rust-specific extension over the
/// literal spec grammar (see `ucollect-gatekeeper::worker_pool`'s doc
/// comment) carrying partial-frame bytes the gatekeeper's codec had
/// already buffered but not yet decoded at handoff time.
pub struct Handoff {
    pub cid: ClientId,
    pub replay: Vec<Bytes>,
    pub leftover: Bytes,
}

pub fn parse_handoff(body: &[u8]) -> Result<Handoff, CoreError> {
    let (cid_bytes, rest) = extract_string(body)?;
    let cid = ClientId::from_hex_string(String::from_utf8_lossy(cid_bytes).into_owned());

    let (count_bytes, mut rest) = extract_string(rest)?;
    let count: usize = std::str::from_utf8(count_bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CoreError::ProtocolViolation("malformed replay count".into()))?;

    let mut replay = Vec::with_capacity(count);
    for _ in 0..count {
        let (frame, next_rest) = extract_string(rest)?;
        replay.push(Bytes::copy_from_slice(frame));
        rest = next_rest;
    }

    let (leftover, _) = extract_string(rest)?;
    Ok(Handoff {
        cid,
        replay,
        leftover: Bytes::copy_from_slice(leftover),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ucollect_core::protocol::{format_string, opcode};

    fn envelope(cid: &str, frames: &[&[u8]], leftover: &[u8]) -> Vec<u8> {
        let mut body = format_string(cid.as_bytes());
        body.extend(format_string(frames.len().to_string().as_bytes()));
        for frame in frames {
            body.extend(format_string(frame));
        }
        body.extend(format_string(leftover));
        body
    }

    #[test]
    fn parses_cid_frames_and_leftover() {
        let body = envelope("4142434445463031", &[&[opcode::HELLO], &[opcode::PING]], b"\x00\x00");
        let handoff = parse_handoff(&body).unwrap();
        assert_eq!(handoff.cid.as_str(), "4142434445463031");
        assert_eq!(handoff.replay.len(), 2);
        assert_eq!(handoff.replay[0][0], opcode::HELLO);
        assert_eq!(handoff.replay[1][0], opcode::PING);
        assert_eq!(&handoff.leftover[..], b"\x00\x00");
    }

    #[test]
    fn cid_is_not_re_hex_encoded() {
        // `from_hex_string` must preserve the wire string verbatim, unlike
        // `from_raw_bytes` which would hex-encode it a second time.
        let body = envelope("ABCDEF01", &[], b"");
        let handoff = parse_handoff(&body).unwrap();
        assert_eq!(handoff.cid.as_str(), "ABCDEF01");
    }

    #[test]
    fn zero_replay_frames_still_parses_leftover() {
        let body = envelope("00", &[], b"partial-bytes");
        let handoff = parse_handoff(&body).unwrap();
        assert!(handoff.replay.is_empty());
        assert_eq!(&handoff.leftover[..], b"partial-bytes");
    }

    #[test]
    fn rejects_truncated_envelope() {
        let mut body = format_string(b"ABCDEF01");
        body.extend(format_string(b"1"));
        assert!(parse_handoff(&body).is_err());
    }
}
