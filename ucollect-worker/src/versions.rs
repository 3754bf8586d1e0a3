//! Plugin-version negotiation (§4.9), grounded on `client_worker.py`'s
//! `__handle_versions`/`__check_versions`.
//!
//! Kept pure: parsing and the activate/deactivate/reply decision are plain
//! functions over data, with no socket or plugin-registry access, so the
//! seven-step algorithm can be unit tested without spinning up a session.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;

use ucollect_core::error::CoreError;
use ucollect_core::protocol::{extract_string, format_string, opcode};

/// The four plugins a proto-0 client is assumed to have, at version 1, with
/// no allow-list check (§4.9, §2b) — proto 0 predates the allow-list and
/// negotiation machinery entirely.
pub const LEGACY_PROTO0_PLUGINS: &[(&str, u16)] =
    &[("Badconf", 1), ("Buckets", 1), ("Count", 1), ("Sniff", 1)];

/// One plugin record as advertised by the client, or as computed by a prior
/// negotiation round (in which case `active` is the *required* value this
/// worker decided, not merely what the client claimed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginRecord {
    pub name: String,
    pub version: u16,
    pub md5: [u8; 16],
    pub libname: String,
    pub active: bool,
}

/// Parse a full proto-1 `'V'` payload: a concatenation of
/// `u32Len||name||u16 version||16 bytes md5||u32Len||libname||1 byte activity`
/// records (§4.9).
pub fn parse_versions_v1(mut body: &[u8]) -> Result<Vec<PluginRecord>, CoreError> {
    let mut records = Vec::new();
    while !body.is_empty() {
        let (name, rest) = extract_string(body)?;
        let name = String::from_utf8_lossy(name).into_owned();
        let version_bytes = rest
            .get(..2)
            .ok_or_else(|| CoreError::ProtocolViolation("truncated plugin version".into()))?;
        let version = u16::from_be_bytes(version_bytes.try_into().unwrap());
        let md5_bytes = rest
            .get(2..18)
            .ok_or_else(|| CoreError::ProtocolViolation("truncated plugin md5".into()))?;
        let md5: [u8; 16] = md5_bytes.try_into().unwrap();
        let (libname, rest) = extract_string(&rest[18..])?;
        let libname = String::from_utf8_lossy(libname).into_owned();
        let activity_byte = *rest
            .first()
            .ok_or_else(|| CoreError::ProtocolViolation("missing plugin activity byte".into()))?;
        let active = activity_byte == b'A';
        body = &rest[1..];
        records.push(PluginRecord {
            name,
            version,
            md5,
            libname,
            active,
        });
    }
    Ok(records)
}

/// Parse the legacy proto-0 `'V'` shape: a flat list of `name || u16
/// version` pairs, no hash/libname/activity byte (§4.9).
pub fn parse_versions_v0(mut body: &[u8]) -> Result<HashMap<String, u16>, CoreError> {
    let mut out = HashMap::new();
    while !body.is_empty() {
        let (name, rest) = extract_string(body)?;
        let name = String::from_utf8_lossy(name).into_owned();
        let version_bytes = rest
            .get(..2)
            .ok_or_else(|| CoreError::ProtocolViolation("truncated plugin version".into()))?;
        let version = u16::from_be_bytes(version_bytes.try_into().unwrap());
        body = &rest[2..];
        out.insert(name, version);
    }
    Ok(out)
}

/// Result of running the §4.9 negotiation algorithm for one `'V'` frame.
pub struct NegotiationOutcome {
    /// Plugins to call `client_disconnected` on, in order.
    pub to_deactivate: Vec<String>,
    /// Plugins to call `client_connected` on, in order.
    pub to_activate: Vec<String>,
    /// The `'A'` reply frame, if any plugin's required state changed.
    pub reply: Option<Bytes>,
    /// The new per-plugin state to remember for the next negotiation round
    /// (and to persist to `active_plugins`/`plugin_history`).
    pub next_state: HashMap<String, PluginRecord>,
}

/// Run the §4.9 algorithm: given what the client just advertised and what
/// was required after the previous round, decide what changed.
///
/// `is_allowed` is `PluginAllowlist::is_allowed`'s exact shape
/// (`name, version, hash_hex -> bool`), injected so this stays a pure
/// function independent of `ucollect-store`.
pub fn negotiate(
    advertised: &[PluginRecord],
    previous: &HashMap<String, PluginRecord>,
    is_allowed: impl Fn(&str, u16, &str) -> bool,
) -> NegotiationOutcome {
    let mut required: HashMap<&str, bool> = HashMap::new();
    let mut change: Vec<&str> = Vec::new();
    for rec in advertised {
        let md5_hex = hex::encode(rec.md5);
        let req = is_allowed(&rec.name, rec.version, &md5_hex);
        required.insert(&rec.name, req);
        if req != rec.active {
            change.push(&rec.name);
        }
    }

    let now_active: HashSet<&str> = required
        .iter()
        .filter(|(_, &req)| req)
        .map(|(&name, _)| name)
        .collect();
    let prev_active: HashSet<&str> = previous
        .iter()
        .filter(|(_, rec)| rec.active)
        .map(|(name, _)| name.as_str())
        .collect();

    let mut to_deactivate: Vec<String> = prev_active
        .difference(&now_active)
        .map(|s| s.to_string())
        .collect();
    let mut to_activate: HashSet<String> = now_active
        .difference(&prev_active)
        .map(|s| s.to_string())
        .collect();

    for name in prev_active.intersection(&now_active) {
        let advertised_version = advertised.iter().find(|r| r.name == *name).unwrap().version;
        if previous.get(*name).map(|rec| rec.version) != Some(advertised_version) {
            to_deactivate.push(name.to_string());
            to_activate.insert(name.to_string());
        }
    }

    let reply = if change.is_empty() {
        None
    } else {
        let mut payload = vec![opcode::ACTIVATION];
        payload.extend((change.len() as u32).to_be_bytes());
        for name in &change {
            let rec = advertised.iter().find(|r| r.name == *name).unwrap();
            payload.extend(format_string(name.as_bytes()));
            payload.extend(rec.md5);
            payload.push(if required[name] { b'A' } else { b'I' });
        }
        Some(Bytes::from(payload))
    };

    let next_state = advertised
        .iter()
        .map(|rec| {
            let mut computed = rec.clone();
            computed.active = required[rec.name.as_str()];
            (rec.name.clone(), computed)
        })
        .collect();

    NegotiationOutcome {
        to_deactivate,
        to_activate: to_activate.into_iter().collect(),
        reply,
        next_state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, version: u16, active: bool) -> PluginRecord {
        PluginRecord {
            name: name.to_string(),
            version,
            md5: [0u8; 16],
            libname: format!("lib{name}.so"),
            active,
        }
    }

    #[test]
    fn v1_payload_round_trips() {
        let mut payload = Vec::new();
        payload.extend(format_string(b"Count"));
        payload.extend(3u16.to_be_bytes());
        payload.extend([0xAB; 16]);
        payload.extend(format_string(b"libcount.so"));
        payload.push(b'A');

        let records = parse_versions_v1(&payload).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "Count");
        assert_eq!(records[0].version, 3);
        assert_eq!(records[0].md5, [0xAB; 16]);
        assert_eq!(records[0].libname, "libcount.so");
        assert!(records[0].active);
    }

    #[test]
    fn v0_payload_is_flat_name_version_pairs() {
        let mut payload = Vec::new();
        payload.extend(format_string(b"Sniff"));
        payload.extend(1u16.to_be_bytes());
        payload.extend(format_string(b"Buckets"));
        payload.extend(2u16.to_be_bytes());

        let parsed = parse_versions_v0(&payload).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["Sniff"], 1);
        assert_eq!(parsed["Buckets"], 2);
    }

    #[test]
    fn newly_allowed_plugin_is_activated_and_reported() {
        let advertised = vec![record("Count", 1, false)];
        let previous = HashMap::new();
        let outcome = negotiate(&advertised, &previous, |_, _, _| true);

        assert_eq!(outcome.to_activate, vec!["Count".to_string()]);
        assert!(outcome.to_deactivate.is_empty());
        assert!(outcome.reply.is_some());
        assert!(outcome.next_state["Count"].active);
    }

    #[test]
    fn disallowed_plugin_previously_active_is_deactivated() {
        let advertised = vec![record("Count", 1, true)];
        let mut previous = HashMap::new();
        previous.insert("Count".to_string(), record("Count", 1, true));
        let outcome = negotiate(&advertised, &previous, |_, _, _| false);

        assert_eq!(outcome.to_deactivate, vec!["Count".to_string()]);
        assert!(outcome.to_activate.is_empty());
        assert!(outcome.reply.is_some());
        assert!(!outcome.next_state["Count"].active);
    }

    #[test]
    fn version_bump_on_an_allowed_plugin_reactivates_it() {
        let advertised = vec![record("Count", 2, true)];
        let mut previous = HashMap::new();
        previous.insert("Count".to_string(), record("Count", 1, true));
        let outcome = negotiate(&advertised, &previous, |_, _, _| true);

        assert_eq!(outcome.to_deactivate, vec!["Count".to_string()]);
        assert_eq!(outcome.to_activate, vec!["Count".to_string()]);
        // Required state (active) didn't change, so no reply is needed.
        assert!(outcome.reply.is_none());
    }

    #[test]
    fn unchanged_required_state_produces_no_reply_and_no_actions() {
        let advertised = vec![record("Count", 1, true)];
        let mut previous = HashMap::new();
        previous.insert("Count".to_string(), record("Count", 1, true));
        let outcome = negotiate(&advertised, &previous, |_, _, _| true);

        assert!(outcome.to_deactivate.is_empty());
        assert!(outcome.to_activate.is_empty());
        assert!(outcome.reply.is_none());
    }
}
