use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::store::Ledger;

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(ledger: Arc<Ledger>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        compact_if_needed(&ledger, threshold).await;
    }
}

/// One compaction check. Returns whether it compacted.
pub async fn compact_if_needed(ledger: &Ledger, threshold: u64) -> bool {
    let appends = ledger.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match ledger.compact().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL, "outcome" => "ok")
                .increment(1);
            true
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL, "outcome" => "error")
                .increment(1);
            false
        }
    }
}
