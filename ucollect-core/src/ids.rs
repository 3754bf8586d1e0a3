use std::fmt;

/// An opaque client identifier.
///
/// Protocol-level cids are raw bytes the client chose at login and are
/// rendered as uppercase hex once a session is authenticated (§3). Before
/// login, a session has no real cid yet and uses a placeholder derived
/// from the peer address (`ClientId::placeholder`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(String);

impl ClientId {
    /// Build a cid from the raw bytes carried in a login frame.
    pub fn from_raw_bytes(raw: &[u8]) -> Self {
        Self(hex::encode_upper(raw))
    }

    /// A placeholder identity for a not-yet-authenticated session, derived
    /// from the peer address. Never confused with a real cid: real cids
    /// only ever come from `from_raw_bytes`.
    pub fn placeholder(peer: std::net::SocketAddr) -> Self {
        Self(format!("unauth:{peer}"))
    }

    /// Rebuild a cid from its already-rendered uppercase-hex wire form
    /// (§4.11: the gatekeeper sends `cid.as_str()`'s bytes verbatim in the
    /// handoff envelope, not the raw login bytes). Distinct from
    /// `from_raw_bytes`, which hex-encodes raw bytes — calling that here
    /// on an already-hex string would double-encode it.
    pub fn from_hex_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_raw_bytes_renders_uppercase_hex() {
        let cid = ClientId::from_raw_bytes(&[0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF]);
        assert_eq!(cid.as_str(), "0123456789ABCDEF");
    }

    #[test]
    fn placeholder_is_distinguishable_from_real_cid() {
        let addr: std::net::SocketAddr = "127.0.0.1:4242".parse().unwrap();
        let placeholder = ClientId::placeholder(addr);
        assert!(placeholder.as_str().starts_with("unauth:"));
    }

    #[test]
    fn equal_raw_bytes_produce_equal_ids() {
        let a = ClientId::from_raw_bytes(b"ABCDEF01");
        let b = ClientId::from_raw_bytes(b"ABCDEF01");
        assert_eq!(a, b);
    }
}
