//! Activity-kind types backing the `activities`/`activity_types` tables
//! (§6), in the structured-record style of `ando-observability::audit_log
//! ::AuditLogEntry` — a plain serde struct rather than a query-builder,
//! serialized only for tests/diagnostics since the audit queue inserts
//! these via parameterized SQL, not JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The fixed set of activity kinds this crate itself emits (§4.8's login,
/// §4.8's disconnect-path logout). Plugins may log activities of their own
/// under arbitrary names via `AuditQueue::push_activity`, which takes a
/// plain string — this enum only names the ones the core session lifecycle
/// produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Login,
    Logout,
}

impl Activity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Activity::Login => "login",
            Activity::Logout => "logout",
        }
    }
}

impl std::fmt::Display for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row as it would be persisted to `activities`, used for diagnostics
/// and tests; the audit queue's actual insert (`ucollect-store::audit`)
/// builds this same shape directly into a parameterized query rather than
/// going through JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub cid: String,
    pub activity: String,
    pub at: DateTime<Utc>,
}

impl ActivityRecord {
    pub fn new(cid: impl Into<String>, activity: Activity, at: DateTime<Utc>) -> Self {
        Self {
            cid: cid.into(),
            activity: activity.as_str().to_string(),
            at,
        }
    }
}
