//! Audit queue (§4.2): a single background consumer applies activity
//! records and ad-hoc transactional closures in submission order,
//! best-effort — a failed batch is logged and dropped, never retried
//! (persistence here is telemetry, not a correctness-critical write path).
//! Grounded on `activity.py`'s `__keep_storing` drain-then-commit loop.

use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::txn::ReentrantTxn;

type TxnClosure = Box<dyn FnOnce(&mut sqlx::PgConnection) -> BoxFuture + Send>;
type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

pub enum AuditItem {
    Activity { cid: String, activity: String },
    Txn(TxnClosure),
    /// Sentinel: cleanly terminates the consumer (mirrors `(None, "shutdown")`).
    Shutdown,
}

/// Handle used by the rest of the process to submit audit items. Cloning is
/// cheap (an `mpsc::UnboundedSender` clone); the consumer task is spawned
/// once, lazily, on first construction.
#[derive(Clone)]
pub struct AuditQueue {
    tx: mpsc::UnboundedSender<AuditItem>,
}

impl AuditQueue {
    /// Spawn the consumer task and return a handle. Lazy initialization is
    /// expressed as "construct on first use" by whichever caller needs the
    /// queue first, matching the original's module-level lazy singleton,
    /// rather than this type enforcing its own singleton-ness.
    pub fn spawn(pool: PgPool) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(consume(pool, rx));
        (Self { tx }, handle)
    }

    pub fn push_activity(&self, cid: impl Into<String>, activity: impl Into<String>) {
        let item = AuditItem::Activity {
            cid: cid.into(),
            activity: activity.into(),
        };
        if self.tx.send(item).is_err() {
            tracing::warn!("audit queue consumer is gone, dropping activity record");
        }
    }

    pub fn push_txn(
        &self,
        f: impl FnOnce(&mut sqlx::PgConnection) -> BoxFuture + Send + 'static,
    ) {
        if self.tx.send(AuditItem::Txn(Box::new(f))).is_err() {
            tracing::warn!("audit queue consumer is gone, dropping transactional closure");
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(AuditItem::Shutdown);
    }
}

async fn consume(pool: PgPool, mut rx: mpsc::UnboundedReceiver<AuditItem>) {
    let txn = ReentrantTxn::new(pool);
    loop {
        // Block for the first item of a batch, then drain everything
        // currently queued without waiting again — matches
        // `activity.py`'s `actions = __queue; __queue = []` batch swap.
        let Some(first) = rx.recv().await else {
            return;
        };
        let mut batch = vec![first];
        while let Ok(item) = rx.try_recv() {
            batch.push(item);
        }

        let mut shutting_down = false;
        let mut work = Vec::with_capacity(batch.len());
        for item in batch {
            match item {
                AuditItem::Shutdown => shutting_down = true,
                other => work.push(other),
            }
        }

        if !work.is_empty() {
            if let Err(err) = apply_batch(&txn, work).await {
                tracing::error!(error = %err, "audit batch failed, dropping batch");
            }
        }

        if shutting_down {
            tracing::info!("audit queue consumer shutting down");
            return;
        }
    }
}

async fn apply_batch(txn: &ReentrantTxn, items: Vec<AuditItem>) -> Result<(), sqlx::Error> {
    let guard = txn.enter().await?;
    let result = txn
        .with_transaction_async(|conn| async move {
            for item in items {
                match item {
                    AuditItem::Activity { cid, activity } => {
                        sqlx::query(
                            "INSERT INTO activities (cid, activity, created_at) \
                             VALUES ($1, $2, CURRENT_TIMESTAMP AT TIME ZONE 'UTC')",
                        )
                        .bind(cid)
                        .bind(activity)
                        .execute(&mut **conn)
                        .await?;
                    }
                    AuditItem::Txn(f) => {
                        f(conn).await;
                    }
                    AuditItem::Shutdown => unreachable!("filtered out before apply_batch"),
                }
            }
            Ok::<(), sqlx::Error>(())
        })
        .await;
    match result {
        Ok(()) => guard.commit().await,
        Err(err) => {
            guard.rollback().await?;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_item_variants_construct() {
        let _ = AuditItem::Activity {
            cid: "AAAA".into(),
            activity: "login".into(),
        };
        let _ = AuditItem::Shutdown;
    }
}
