//! Pure parsing for the two frames the gatekeeper-side pre-auth dispatch
//! table understands (§4.8): `'L'` (login) and `'S'` (session cookie).
//! Kept free of any I/O so the wire-format parsing can be unit tested
//! directly.

use ucollect_core::error::CoreError;
use ucollect_core::protocol::extract_string;

/// The only accepted login version byte: `'O'` (the original's "ok"/normal
/// login path — any other value is a protocol mismatch, not a credentials
/// failure, and gets `'F'` without even reaching the authenticator).
pub const LOGIN_VERSION_OK: u8 = b'O';

pub struct LoginRequest {
    pub version_byte: u8,
    pub cid: Vec<u8>,
    pub response: Vec<u8>,
}

/// Parse the payload following the `'L'` opcode byte:
/// `versionByte || str(cid) || str(response)`.
pub fn parse_login(payload: &[u8]) -> Result<LoginRequest, CoreError> {
    let version_byte = *payload
        .first()
        .ok_or_else(|| CoreError::ProtocolViolation("empty login frame".into()))?;
    let (cid, rest) = extract_string(&payload[1..])?;
    let (response, rest) = extract_string(rest)?;
    if !rest.is_empty() {
        return Err(CoreError::ProtocolViolation(
            "trailing bytes after login response".into(),
        ));
    }
    Ok(LoginRequest {
        version_byte,
        cid: cid.to_vec(),
        response: response.to_vec(),
    })
}

/// Parse the payload following the `'S'` opcode byte: a 4-byte cookie.
pub fn parse_session_cookie(payload: &[u8]) -> Result<u32, CoreError> {
    let bytes: [u8; 4] = payload
        .try_into()
        .map_err(|_| CoreError::ProtocolViolation("session cookie must be 4 bytes".into()))?;
    Ok(u32::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ucollect_core::protocol::format_string;

    #[test]
    fn parses_well_formed_login_frame() {
        let mut payload = vec![LOGIN_VERSION_OK];
        payload.extend(format_string(b"ABCDEF01"));
        payload.extend(format_string(b"deadbeef"));
        let req = parse_login(&payload).unwrap();
        assert_eq!(req.version_byte, LOGIN_VERSION_OK);
        assert_eq!(req.cid, b"ABCDEF01");
        assert_eq!(req.response, b"deadbeef");
    }

    #[test]
    fn rejects_truncated_login_frame() {
        assert!(parse_login(&[LOGIN_VERSION_OK]).is_err());
    }

    #[test]
    fn rejects_trailing_bytes_after_response() {
        let mut payload = vec![LOGIN_VERSION_OK];
        payload.extend(format_string(b"ABCDEF01"));
        payload.extend(format_string(b"deadbeef"));
        payload.extend_from_slice(b"garbage");
        assert!(parse_login(&payload).is_err());
    }

    #[test]
    fn parses_session_cookie() {
        assert_eq!(parse_session_cookie(&[0, 0, 1, 1]).unwrap(), 257);
    }

    #[test]
    fn rejects_wrong_length_cookie() {
        assert!(parse_session_cookie(&[0, 1]).is_err());
    }
}
