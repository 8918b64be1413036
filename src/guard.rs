use crate::errors::AppError;
use crate::watcher::{CheckOutcome, CheckReason, SyncWatcher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardVerdict {
    /// Not a conflict; the caller handles the error its own way.
    Accepted,
    /// The write lost to a newer stored value and was dropped.
    Yielded { reconciled: bool },
}

/// Last-writer-loses: a write rejected as stale is never retried. The guard
/// yields to the store by invalidating the observed token and forcing a check.
#[derive(Clone)]
pub struct ConflictGuard {
    watcher: SyncWatcher,
    conflicts: Arc<AtomicU64>,
}

impl ConflictGuard {
    pub fn new(watcher: SyncWatcher) -> Self {
        Self {
            watcher,
            conflicts: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn conflicts_seen(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    pub async fn inspect(&self, subject: &str, error: &AppError) -> GuardVerdict {
        if !error.is_conflict() {
            return GuardVerdict::Accepted;
        }
        self.conflicts.fetch_add(1, Ordering::Relaxed);
        tracing::info!(subject = %subject, reason = %error.message(), "local write lost to newer store value; reconciling");

        self.watcher.invalidate();
        match self.watcher.check(CheckReason::Forced).await {
            Ok(CheckOutcome::Reconciled { .. }) => GuardVerdict::Yielded { reconciled: true },
            Ok(_) => {
                // A cycle already in flight reloads after its flush; the cleared token covers the rest.
                GuardVerdict::Yielded { reconciled: false }
            }
            Err(check_error) => {
                tracing::warn!(subject = %subject, error = %check_error, "forced reconciliation after conflict failed");
                GuardVerdict::Yielded { reconciled: false }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConflictGuard, GuardVerdict};
    use crate::errors::AppError;
    use crate::store::{SqliteStore, StoreClient};
    use crate::watcher::{CheckReason, SyncWatcher};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn conflict_forces_reconciliation_and_other_errors_pass_through() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(SqliteStore::open(&dir.path().join("guard.db")).expect("store"));
        let watcher = SyncWatcher::new(store.clone());
        let reconciles = Arc::new(AtomicUsize::new(0));
        let counter = reconciles.clone();
        watcher.set_reconciler(Arc::new(move |_reason: CheckReason| {
            let counter = counter.clone();
            let store = store.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                store.sync_token()
            })
        }));
        watcher.record_token(0);
        let guard = ConflictGuard::new(watcher.clone());

        let verdict = guard
            .inspect("n1", &AppError::Internal("disk full".to_string()))
            .await;
        assert_eq!(verdict, GuardVerdict::Accepted);
        assert_eq!(reconciles.load(Ordering::SeqCst), 0);

        let verdict = guard
            .inspect("n1", &AppError::Conflict("stale note update rejected".to_string()))
            .await;
        assert_eq!(verdict, GuardVerdict::Yielded { reconciled: true });
        assert_eq!(reconciles.load(Ordering::SeqCst), 1);
        assert_eq!(guard.conflicts_seen(), 1);
        assert_eq!(watcher.last_token(), Some(0));
    }
}
