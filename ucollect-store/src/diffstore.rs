//! Differential address-set distribution engine (§4.6), grounded on
//! `diff_addr_store.py`. Several client-side plugins (firewall-set
//! updaters, spoof testers) subscribe to named sets of addresses that
//! change over time; this store computes compact full/incremental binary
//! diffs on request and caches them until the underlying set changes.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use sqlx::PgPool;
use tokio::time::Duration;

use crate::schema::{addr_set_columns as col, validate_identifier};
use ucollect_core::error::CoreError;

pub const RELOAD_INTERVAL: Duration = Duration::from_secs(60);

/// One address literal, in the four shapes the wire encoding supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    V4Port(Ipv4Addr, u16),
    V6Port(Ipv6Addr, u16),
}

impl Address {
    /// Encode as `length-byte || body`, with the low bit of the length byte
    /// flipped when `add` is true (§4.6).
    pub fn encode(&self, add: bool) -> Bytes {
        let (body_len, mut buf): (u8, BytesMut) = match self {
            Address::V4(a) => (4, {
                let mut b = BytesMut::with_capacity(5);
                b.put_slice(&a.octets());
                b
            }),
            Address::V6(a) => (16, {
                let mut b = BytesMut::with_capacity(17);
                b.put_slice(&a.octets());
                b
            }),
            Address::V4Port(a, p) => (6, {
                let mut b = BytesMut::with_capacity(7);
                b.put_slice(&a.octets());
                b.put_u16(*p);
                b
            }),
            Address::V6Port(a, p) => (18, {
                let mut b = BytesMut::with_capacity(19);
                b.put_slice(&a.octets());
                b.put_u16(*p);
                b
            }),
        };
        let mut len_byte = body_len + 1; // length byte counts itself
        if add {
            len_byte |= 1;
        } else {
            len_byte &= !1;
        }
        let mut out = BytesMut::with_capacity(1 + buf.len());
        out.put_u8(len_byte);
        out.put(&mut buf);
        out.freeze()
    }

    /// Decode one `(Address, add)` entry from the front of `buf`, returning
    /// the entry and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Address, bool, usize), CoreError> {
        let len_byte = *buf
            .first()
            .ok_or_else(|| CoreError::ProtocolViolation("empty address buffer".into()))?;
        let add = len_byte & 1 == 1;
        let total_len = (len_byte | 1) as usize; // total bytes this entry occupies, including the length byte
        if buf.len() < total_len {
            return Err(CoreError::ProtocolViolation(
                "truncated address entry".into(),
            ));
        }
        let body = &buf[1..total_len];
        let addr = match body.len() {
            4 => Address::V4(Ipv4Addr::new(body[0], body[1], body[2], body[3])),
            16 => {
                let octets: [u8; 16] = body.try_into().unwrap();
                Address::V6(Ipv6Addr::from(octets))
            }
            6 => {
                let port = u16::from_be_bytes([body[4], body[5]]);
                Address::V4Port(Ipv4Addr::new(body[0], body[1], body[2], body[3]), port)
            }
            18 => {
                let octets: [u8; 16] = body[0..16].try_into().unwrap();
                let port = u16::from_be_bytes([body[16], body[17]]);
                Address::V6Port(Ipv6Addr::from(octets), port)
            }
            other => {
                return Err(CoreError::ProtocolViolation(format!(
                    "unrecognized address body length {other}"
                )));
            }
        };
        Ok((addr, add, total_len))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressEntry {
    pub address: Address,
    pub add: bool,
    pub version: i64,
}

#[derive(Hash, PartialEq, Eq, Clone)]
struct CacheKey {
    name: String,
    epoch: i64,
    from_version: i64,
    to_version: i64,
    full: bool,
}

/// Injected closures replacing the original's subclass hooks
/// (`broadcastConfig`/`broadcastVersion`), per the Design Notes' guidance
/// to prefer composition over inheritance (§4.6 implementation grounding).
pub struct DiffAddrStore {
    pool: PgPool,
    table: String,
    set_column: String,
    cache: DashMap<CacheKey, Bytes>,
    versions: DashMap<String, (i64, i64)>, // name -> (epoch, version)
    on_config_changed: Arc<dyn Fn() + Send + Sync>,
    on_version_changed: Arc<dyn Fn(&str, i64, i64) + Send + Sync>,
}

impl DiffAddrStore {
    pub fn new(
        pool: PgPool,
        table: impl Into<String>,
        set_column: impl Into<String>,
        on_config_changed: impl Fn() + Send + Sync + 'static,
        on_version_changed: impl Fn(&str, i64, i64) + Send + Sync + 'static,
    ) -> Result<Self, String> {
        let table = table.into();
        let set_column = set_column.into();
        validate_identifier(&table)?;
        validate_identifier(&set_column)?;
        Ok(Self {
            pool,
            table,
            set_column,
            cache: DashMap::new(),
            versions: DashMap::new(),
            on_config_changed: Arc::new(on_config_changed),
            on_version_changed: Arc::new(on_version_changed),
        })
    }

    /// One 60-second reload tick (§4.6): recomputes `max(epoch)`/`max
    /// (version)` per set and fires the injected hooks for whatever
    /// changed, invalidating the diff cache for affected sets.
    pub async fn reload_tick(&self) -> Result<(), sqlx::Error> {
        let table = &self.table;
        let col = &self.set_column;
        let query = format!(
            "SELECT addresses.name, addresses.epoch, MAX(raw.{version}) \
             FROM {table} raw \
             JOIN (SELECT {col} name, MAX({epoch}) epoch FROM {table} GROUP BY {col}) addresses \
             ON raw.{col} = addresses.name AND raw.{epoch} = addresses.epoch \
             GROUP BY addresses.name, addresses.epoch",
            version = col::VERSION,
            epoch = col::EPOCH,
        );
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(&query).fetch_all(&self.pool).await?;

        let mut seen = std::collections::HashSet::new();
        for (name, epoch, version) in rows {
            seen.insert(name.clone());
            let changed = match self.versions.get(&name) {
                Some(existing) => *existing != (epoch, version),
                None => true,
            };
            if changed {
                self.versions.insert(name.clone(), (epoch, version));
                self.invalidate(&name);
                (self.on_version_changed)(&name, epoch, version);
            }
        }

        let removed: Vec<String> = self
            .versions
            .iter()
            .map(|e| e.key().clone())
            .filter(|name| !seen.contains(name))
            .collect();
        let config_changed = !removed.is_empty();
        for name in removed {
            self.versions.remove(&name);
            self.invalidate(&name);
        }
        if config_changed {
            (self.on_config_changed)();
        }
        Ok(())
    }

    fn invalidate(&self, name: &str) {
        self.cache.retain(|k, _| k.name != name);
    }

    /// `provideDiff` (§4.6): full updates return every address present at
    /// `(name, epoch, toVersion)` with `add=1`; incremental updates return,
    /// per address touched in `(fromVersion, toVersion]`, its last row in
    /// that range. Results are cached by `(name, epoch, from, to, full)`
    /// until the set's version changes.
    pub async fn provide_diff(
        &self,
        full: bool,
        name: &str,
        epoch: i64,
        from_version: i64,
        to_version: i64,
    ) -> Result<Bytes, sqlx::Error> {
        let key = CacheKey {
            name: name.to_string(),
            epoch,
            from_version,
            to_version,
            full,
        };
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }

        let rows = self.fetch_rows(name, epoch, from_version, to_version).await?;
        let merged = merge_diff(rows, full, from_version);
        let mut out = BytesMut::new();
        for entry in merged {
            out.put(entry.address.encode(entry.add));
        }
        let bytes = out.freeze();
        self.cache.insert(key, bytes.clone());
        Ok(bytes)
    }

    async fn fetch_rows(
        &self,
        name: &str,
        epoch: i64,
        from_version: i64,
        to_version: i64,
    ) -> Result<Vec<(i64, String, bool)>, sqlx::Error> {
        let table = &self.table;
        let set_col = &self.set_column;
        let query = format!(
            "SELECT {version}, {address}, {add} FROM {table} \
             WHERE {set_col} = $1 AND {epoch_col} = $2 AND {version} > $3 AND {version} <= $4 \
             ORDER BY {address}, {version}",
            version = col::VERSION,
            address = col::ADDRESS,
            add = col::ADD,
            epoch_col = col::EPOCH,
        );
        sqlx::query_as(&query)
            .bind(name)
            .bind(epoch)
            .bind(from_version)
            .bind(to_version)
            .fetch_all(&self.pool)
            .await
    }
}

/// Pure merge logic, independent of the DB round trip, so it can be tested
/// directly: given every row touched in `(from, to]`, ordered by
/// `(address, version)`, keep only the last row per address. A full update
/// additionally treats `from_version` as `0` conceptually and drops any
/// address whose last row is a removal (`add = false`).
fn merge_diff(rows: Vec<(i64, String, bool)>, full: bool, _from_version: i64) -> Vec<AddressEntry> {
    let mut last: HashMap<String, (i64, bool)> = HashMap::new();
    for (version, address_literal, add) in rows {
        let entry = last.entry(address_literal).or_insert((version, add));
        if version >= entry.0 {
            *entry = (version, add);
        }
    }
    let mut out: Vec<(String, i64, bool)> = last
        .into_iter()
        .filter(|(_, (_, add))| !full || *add)
        .map(|(literal, (version, add))| (literal, version, add))
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out.into_iter()
        .filter_map(|(literal, version, add)| {
            parse_address(&literal).map(|address| AddressEntry {
                address,
                add,
                version,
            })
        })
        .collect()
}

/// Parse an address literal stored as text in the `address` column back
/// into the typed `Address` the encoder expects.
fn parse_address(literal: &str) -> Option<Address> {
    if let Some((host, port)) = literal.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            if let Ok(v4) = host.parse::<Ipv4Addr>() {
                return Some(Address::V4Port(v4, port));
            }
            if let Ok(v6) = host.trim_matches(|c| c == '[' || c == ']').parse::<Ipv6Addr>() {
                return Some(Address::V6Port(v6, port));
            }
        }
    }
    if let Ok(v4) = literal.parse::<Ipv4Addr>() {
        return Some(Address::V4(v4));
    }
    if let Ok(v6) = literal.parse::<Ipv6Addr>() {
        return Some(Address::V6(v6));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_address_round_trips_through_encode_decode() {
        let addr = Address::V4(Ipv4Addr::new(192, 168, 1, 1));
        let encoded = addr.encode(true);
        let (decoded, add, consumed) = Address::decode(&encoded).unwrap();
        assert_eq!(decoded, addr);
        assert!(add);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn v6_address_round_trips() {
        let addr = Address::V6(Ipv6Addr::LOCALHOST);
        let encoded = addr.encode(false);
        let (decoded, add, _) = Address::decode(&encoded).unwrap();
        assert_eq!(decoded, addr);
        assert!(!add);
    }

    #[test]
    fn v4_port_round_trips() {
        let addr = Address::V4Port(Ipv4Addr::new(10, 0, 0, 1), 8080);
        let encoded = addr.encode(true);
        assert_eq!(encoded.len(), 7);
        let (decoded, add, consumed) = Address::decode(&encoded).unwrap();
        assert_eq!(decoded, addr);
        assert!(add);
        assert_eq!(consumed, 7);
    }

    #[test]
    fn v6_port_round_trips() {
        let addr = Address::V6Port(Ipv6Addr::LOCALHOST, 443);
        let encoded = addr.encode(true);
        assert_eq!(encoded.len(), 19);
        let (decoded, _, _) = Address::decode(&encoded).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn add_bit_does_not_disturb_length() {
        let addr = Address::V4(Ipv4Addr::new(1, 2, 3, 4));
        let with_add = addr.encode(true);
        let without_add = addr.encode(false);
        assert_eq!(with_add.len(), without_add.len());
        assert_eq!(with_add[0] & !1, without_add[0] & !1);
        assert_eq!(with_add[0] & 1, 1);
        assert_eq!(without_add[0] & 1, 0);
    }

    #[test]
    fn full_update_omits_deleted_addresses() {
        let rows = vec![
            (1, "1.1.1.1".to_string(), true),
            (2, "1.1.1.1".to_string(), false), // later removed
            (1, "2.2.2.2".to_string(), true),
        ];
        let merged = merge_diff(rows, true, 0);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].address, Address::V4("2.2.2.2".parse().unwrap()));
    }

    #[test]
    fn incremental_update_keeps_last_row_per_address_including_removals() {
        let rows = vec![
            (2, "1.1.1.1".to_string(), true),
            (3, "1.1.1.1".to_string(), false),
            (4, "3.3.3.3".to_string(), true),
        ];
        let merged = merge_diff(rows, false, 1);
        assert_eq!(merged.len(), 2);
        let removed = merged
            .iter()
            .find(|e| e.address == Address::V4("1.1.1.1".parse().unwrap()))
            .unwrap();
        assert!(!removed.add);
    }

    #[test]
    fn full_diff_matches_folded_incremental_diffs() {
        // §8 property: provideDiff(full=true, ..., 0, V) equals repeatedly
        // applying every incremental diff in (0, V].
        let all_rows = vec![
            (1, "1.1.1.1".to_string(), true),
            (2, "2.2.2.2".to_string(), true),
            (3, "1.1.1.1".to_string(), false),
            (4, "3.3.3.3".to_string(), true),
        ];
        let full = merge_diff(all_rows.clone(), true, 0);

        let mut folded: HashMap<Address, bool> = HashMap::new();
        for step in 1..=4 {
            let incremental = merge_diff(
                all_rows
                    .iter()
                    .filter(|(v, _, _)| *v == step)
                    .cloned()
                    .collect(),
                false,
                step - 1,
            );
            for entry in incremental {
                folded.insert(entry.address, entry.add);
            }
        }
        let mut expected: Vec<Address> = folded
            .into_iter()
            .filter(|(_, add)| *add)
            .map(|(addr, _)| addr)
            .collect();
        let mut actual: Vec<Address> = full.into_iter().map(|e| e.address).collect();
        expected.sort_by_key(|a| format!("{a:?}"));
        actual.sort_by_key(|a| format!("{a:?}"));
        assert_eq!(expected, actual);
    }
}
