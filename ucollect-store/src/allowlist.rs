//! Plugin-version allow-list (§4.13), grounded on `plugin_versions.py`.
//!
//! Reloaded from `known_plugins(name, version, hash, status)` every five
//! minutes; represented as `name → set<(version|None, hash|None)>` so a
//! `(name, advertisedVersion, advertisedHash)` is allowed iff any of
//! `(v,h), (nil,h), (v,nil), (nil,nil)` is present with `status = 'allowed'`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::schema::KNOWN_PLUGINS;

pub const RELOAD_INTERVAL: Duration = Duration::from_secs(300);

/// Matches `plugin_versions.py`'s `PENDING_PROPAGATION_DELAY`: a change
/// discovered via the lazy/opportunistic path (inside `is_allowed`, as a
/// side effect of a version check that happened to run during a stale
/// window) is announced to subscribers after this delay rather than
/// inline, so that several opportunistic triggers in quick succession
/// collapse into one propagation.
pub const PENDING_PROPAGATION_DELAY: Duration = Duration::from_secs(1);

type VersionHashSet = HashSet<(Option<u16>, Option<String>)>;

#[derive(Default, Clone)]
struct Snapshot {
    allowed: HashMap<String, VersionHashSet>,
}

/// A session (or whatever else needs to be told "recheck your plugin
/// versions") subscribes via `Weak` reference, matching `plugin_versions
/// .py`'s `weakref.WeakSet` — there is no explicit `unsubscribe`; a
/// vanished session is simply skipped and dropped from the list the next
/// time anyone iterates it.
pub trait Recheckable: Send + Sync {
    fn recheck_versions(&self);
}

pub struct PluginAllowlist {
    pool: PgPool,
    snapshot: ArcSwap<Snapshot>,
    subscribers: Mutex<Vec<Weak<dyn Recheckable>>>,
    propagation_pending: Mutex<bool>,
}

impl PluginAllowlist {
    pub fn new(pool: PgPool) -> Arc<Self> {
        Arc::new(Self {
            pool,
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
            subscribers: Mutex::new(Vec::new()),
            propagation_pending: Mutex::new(false),
        })
    }

    pub async fn subscribe(&self, session: Weak<dyn Recheckable>) {
        self.subscribers.lock().await.push(session);
    }

    /// `(name, version, hash)` is allowed iff any of the four wildcard
    /// combinations is present in the allow-list with `status = 'allowed'`.
    pub fn is_allowed(&self, name: &str, version: u16, hash: &str) -> bool {
        let snapshot = self.snapshot.load();
        let Some(set) = snapshot.allowed.get(name) else {
            return false;
        };
        set.contains(&(Some(version), Some(hash.to_string())))
            || set.contains(&(None, Some(hash.to_string())))
            || set.contains(&(Some(version), None))
            || set.contains(&(None, None))
    }

    /// Entry point for the opportunistic lazy-refresh path: called mid
    /// version-check when the caller suspects the cached snapshot may be
    /// stale. If this call detects a change, propagation to subscribers is
    /// deferred by `PENDING_PROPAGATION_DELAY` rather than happening
    /// inline (§4.13 propagation-delay supplement).
    pub async fn check_version(self: &Arc<Self>, name: &str, version: u16, hash: &str) -> bool {
        if self.reload().await.unwrap_or(false) {
            self.schedule_deferred_propagation();
        }
        self.is_allowed(name, version, hash)
    }

    /// Entry point for the periodic 5-minute ticker: reload and, if
    /// changed, propagate immediately.
    pub async fn periodic_reload(self: &Arc<Self>) {
        match self.reload().await {
            Ok(true) => self.propagate_now().await,
            Ok(false) => {}
            Err(err) => tracing::error!(error = %err, "allow-list reload failed"),
        }
    }

    /// Reload from `known_plugins`. Returns whether the allow-list actually
    /// changed.
    async fn reload(&self) -> Result<bool, sqlx::Error> {
        let rows: Vec<(String, Option<i32>, Option<String>)> = sqlx::query_as(&format!(
            "SELECT name, version, hash FROM {KNOWN_PLUGINS} WHERE status = 'allowed'"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut allowed: HashMap<String, VersionHashSet> = HashMap::new();
        for (name, version, hash) in rows {
            allowed
                .entry(name)
                .or_default()
                .insert((version.map(|v| v as u16), hash));
        }
        let next = Snapshot { allowed };
        let changed = {
            let current = self.snapshot.load();
            current.allowed != next.allowed
        };
        if changed {
            self.snapshot.store(Arc::new(next));
        }
        Ok(changed)
    }

    fn schedule_deferred_propagation(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            {
                let mut pending = this.propagation_pending.lock().await;
                if *pending {
                    // A propagation is already scheduled; let it cover this
                    // change too instead of stacking a second timer.
                    return;
                }
                *pending = true;
            }
            tokio::time::sleep(PENDING_PROPAGATION_DELAY).await;
            {
                let mut pending = this.propagation_pending.lock().await;
                *pending = false;
            }
            this.propagate_now().await;
        });
    }

    async fn propagate_now(&self) {
        let mut subs = self.subscribers.lock().await;
        subs.retain(|weak| {
            if let Some(session) = weak.upgrade() {
                session.recheck_versions();
                true
            } else {
                false
            }
        });
    }
}
