//! Clock source (§4.3): the authoritative "now" for activity timestamps and
//! diff-store bookkeeping is the database's clock, not the process's wall
//! clock, avoiding skew between the worker and whatever writes the audit
//! log. Queried lazily and cached briefly since a DB round trip per call
//! would be wasteful.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;

/// Refresh interval for the cached DB timestamp.
const CACHE_TTL: Duration = Duration::from_secs(2);

struct Cached {
    value: DateTime<Utc>,
    fetched_at: Instant,
}

/// Wraps a single `SELECT CURRENT_TIMESTAMP AT TIME ZONE 'UTC'` round trip,
/// caching the result for `CACHE_TTL` so high-frequency callers (activity
/// records, diff-store version stamping) don't each pay a query.
pub struct ClockSource {
    pool: PgPool,
    cached: Mutex<Option<Cached>>,
}

impl ClockSource {
    pub fn new(pool: PgPool) -> Arc<Self> {
        Arc::new(Self {
            pool,
            cached: Mutex::new(None),
        })
    }

    pub async fn now(&self) -> Result<DateTime<Utc>, sqlx::Error> {
        {
            let cached = self.cached.lock().await;
            if let Some(c) = cached.as_ref() {
                if c.fetched_at.elapsed() < CACHE_TTL {
                    return Ok(c.value);
                }
            }
        }
        let row: (DateTime<Utc>,) =
            sqlx::query_as("SELECT CURRENT_TIMESTAMP AT TIME ZONE 'UTC'")
                .fetch_one(&self.pool)
                .await?;
        let mut cached = self.cached.lock().await;
        *cached = Some(Cached {
            value: row.0,
            fetched_at: Instant::now(),
        });
        Ok(row.0)
    }
}
