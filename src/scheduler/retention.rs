//! Retention manager for pruning old time-series rows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::broadcast;

use crate::db::{DbError, Store};

/// Local hour at which the daily prune runs, chosen to miss peak usage.
const PRUNE_HOUR: u32 = 3;

/// Deleted-row count above which a prune is followed by a VACUUM.
const RECLAIM_HIGH_WATER: usize = 10_000;

const DEFAULT_RETENTION_DAYS: u32 = 1095;

/// Manager for deleting count rows past the retention period.
///
/// Runs once daily at a fixed local hour. A prune failure is logged
/// loudly and the schedule is kept; a never-shrinking table is a slow
/// operability bug, not a reason to stop trying.
pub struct RetentionManager {
    store: Arc<Store>,
    retention_days: u32,
    running: AtomicBool,
    stop: Mutex<Option<broadcast::Sender<()>>>,
}

impl RetentionManager {
    /// A non-positive `retention_days` falls back to the default with a
    /// warning rather than pruning everything.
    pub fn new(store: Arc<Store>, retention_days: u32) -> Self {
        let retention_days = if retention_days == 0 {
            tracing::warn!(
                "RetentionManager: invalid retention of 0 days, using {}",
                DEFAULT_RETENTION_DAYS
            );
            DEFAULT_RETENTION_DAYS
        } else {
            retention_days
        };
        Self {
            store,
            retention_days,
            running: AtomicBool::new(false),
            stop: Mutex::new(None),
        }
    }

    /// Start the retention manager background task.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, mut rx) = broadcast::channel(1);
        *self.stop.lock().unwrap() = Some(tx);

        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                if !super::sleep_until_local_hour(PRUNE_HOUR, &mut rx).await {
                    break;
                }
                if let Err(e) = manager.prune() {
                    tracing::error!("RetentionManager: prune failed: {}", e);
                }
            }
        });
    }

    /// Stop the retention manager.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.stop.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    /// Delete count rows older than the retention period. A row at
    /// exactly the cutoff is kept. Reclaims storage only when the delete
    /// was large enough to be worth a VACUUM.
    pub fn prune(&self) -> Result<usize, DbError> {
        let cutoff = Utc::now().timestamp() - i64::from(self.retention_days) * 86_400;
        let deleted = self.store.delete_counts_before(cutoff)?;
        tracing::info!(
            "RetentionManager: deleted {} rows older than {} days",
            deleted,
            self.retention_days
        );
        if deleted > RECLAIM_HIGH_WATER {
            tracing::info!("RetentionManager: reclaiming storage after large prune");
            self.store.reclaim_storage()?;
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CountBucket;
    use tempfile::NamedTempFile;

    fn store() -> (Arc<Store>, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        (Arc::new(Store::new(file.path()).unwrap()), file)
    }

    fn bucket_at(time: i64) -> CountBucket {
        CountBucket {
            time,
            resolution: 60,
            acars: 1,
            total: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_prune_keeps_boundary_row() {
        let (store, _file) = store();
        let days = 30u32;
        let cutoff = Utc::now().timestamp() - i64::from(days) * 86_400;

        store.increment_count_bucket(&bucket_at(cutoff)).unwrap();
        store.increment_count_bucket(&bucket_at(cutoff - 1)).unwrap();
        store.increment_count_bucket(&bucket_at(cutoff + 60)).unwrap();

        let manager = RetentionManager::new(store.clone(), days);
        let deleted = manager.prune().unwrap();
        assert_eq!(deleted, 1);

        let rows = store.get_count_range(60, 0, i64::MAX).unwrap();
        let times: Vec<i64> = rows.iter().map(|r| r.time).collect();
        assert!(times.contains(&cutoff));
        assert!(!times.contains(&(cutoff - 1)));
    }

    #[test]
    fn test_zero_retention_falls_back_to_default() {
        let (store, _file) = store();
        let manager = RetentionManager::new(store, 0);
        assert_eq!(manager.retention_days, DEFAULT_RETENTION_DAYS);
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let (store, _file) = store();
        let manager = Arc::new(RetentionManager::new(store, 30));
        manager.start();
        manager.start();
        manager.stop();
        manager.stop();
    }
}
