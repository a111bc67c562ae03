use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Scheduler;
use crate::store::DocumentStore;

/// Background task that hard-deletes soft-deleted appointments once they
/// are older than `retention`.
pub async fn run_retention_sweeper(scheduler: Arc<Scheduler>, every: Duration, retention: chrono::Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let report = scheduler.sweep_expired(retention).await;
        if report.removed > 0 {
            info!("swept {} expired appointments", report.removed);
        }
    }
}

/// Rewrites the log as a snapshot once enough records have piled up.
pub async fn run_compactor(store: Arc<DocumentStore>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = store.appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact().await {
            Ok(()) => info!("compacted log after {appends} appends"),
            Err(e) => tracing::error!("compaction failed: {e}"),
        }
    }
}
