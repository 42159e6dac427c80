//! Periodic pruning of expired idempotency records.

use chrono::Utc;
use rollcall_store::{AttendanceStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Delete records older than `retention`. Returns the number removed.
pub async fn sweep_once(store: &dyn AttendanceStore, retention: Duration) -> Result<usize, StoreError> {
    let retention = chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(36_500));
    let cutoff = Utc::now()
        .checked_sub_signed(retention)
        .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
    store.prune_idempotency(cutoff).await
}

pub fn spawn_sweeper(
    store: Arc<dyn AttendanceStore>,
    retention: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match sweep_once(store.as_ref(), retention).await {
                Ok(0) => tracing::debug!("idempotency sweep: nothing expired"),
                Ok(removed) => tracing::info!(removed, "expired idempotency records pruned"),
                Err(err) => tracing::warn!(error = %err, "idempotency sweep failed"),
            }
        }
    })
}
