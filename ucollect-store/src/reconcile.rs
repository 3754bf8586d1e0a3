//! Startup reconciliation (§4.12), grounded on `client_master.py`'s
//! module-load-time transaction: before the gatekeeper accepts any
//! connection, every row of `active_plugins` is archived into
//! `plugin_history` with `active = false` and the table is truncated. This
//! runs exactly once, synchronously, so no worker can observe a stale
//! `active_plugins` row from a previous process lifetime.

use sqlx::PgPool;

use crate::schema::{ACTIVE_PLUGINS, PLUGIN_HISTORY};
use crate::txn::ReentrantTxn;

pub async fn reconcile_startup_plugin_state(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let txn = ReentrantTxn::new(pool.clone());
    let guard = txn.enter().await?;

    let archived = txn
        .with_transaction_async(|conn| async move {
            let archived = sqlx::query(&format!(
                "INSERT INTO {PLUGIN_HISTORY} (cid, name, version, hash, active, changed_at) \
                 SELECT cid, name, version, hash, false, CURRENT_TIMESTAMP AT TIME ZONE 'UTC' \
                 FROM {ACTIVE_PLUGINS}"
            ))
            .execute(&mut **conn)
            .await?
            .rows_affected();

            sqlx::query(&format!("TRUNCATE {ACTIVE_PLUGINS}"))
                .execute(&mut **conn)
                .await?;

            Ok::<u64, sqlx::Error>(archived)
        })
        .await?;

    guard.commit().await?;
    tracing::info!(archived, "reconciled startup plugin state");
    Ok(archived)
}
