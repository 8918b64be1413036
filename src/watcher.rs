use crate::errors::{AppError, AppResult};
use crate::store::StoreClient;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};

// Bounds the immediate re-checks after a cycle when writes keep landing.
const MAX_PASSES_PER_CYCLE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatchState {
    Idle,
    Checking,
    Reconciling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckReason {
    Tick,
    Focus,
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Unchanged { sync_token: i64 },
    Reconciled { sync_token: i64, passes: usize },
    /// Another cycle was already running; the trigger was dropped.
    Busy,
}

/// Runs one reconciliation and returns the sync token observed after the flush,
/// before the reload.
pub type ReconcileFuture = Pin<Box<dyn Future<Output = AppResult<i64>> + Send>>;
pub type Reconciler = Arc<dyn Fn(CheckReason) -> ReconcileFuture + Send + Sync>;

/// Compares the store's sync token with the last one observed and drives a
/// reconciliation when they differ or when a check is forced.
#[derive(Clone)]
pub struct SyncWatcher {
    store: Arc<dyn StoreClient>,
    state: Arc<Mutex<WatchState>>,
    busy: Arc<AtomicBool>,
    last_token: Arc<Mutex<Option<i64>>>,
    reconciler: Arc<RwLock<Option<Reconciler>>>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

struct CycleGuard<'a> {
    watcher: &'a SyncWatcher,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.watcher.set_state(WatchState::Idle);
        self.watcher.busy.store(false, Ordering::Release);
    }
}

impl SyncWatcher {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self {
            store,
            state: Arc::new(Mutex::new(WatchState::Idle)),
            busy: Arc::new(AtomicBool::new(false)),
            last_token: Arc::new(Mutex::new(None)),
            reconciler: Arc::new(RwLock::new(None)),
            ticker: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_reconciler(&self, reconciler: Reconciler) {
        if let Ok(mut writer) = self.reconciler.write() {
            *writer = Some(reconciler);
        }
    }

    pub fn state(&self) -> WatchState {
        self.state.lock().map(|state| *state).unwrap_or(WatchState::Idle)
    }

    fn set_state(&self, next: WatchState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    pub fn last_token(&self) -> Option<i64> {
        self.last_token.lock().ok().and_then(|token| *token)
    }

    pub fn record_token(&self, token: i64) {
        if let Ok(mut last) = self.last_token.lock() {
            *last = Some(token);
        }
    }

    /// Forgets the last observed token so the next check reconciles regardless.
    pub fn invalidate(&self) {
        if let Ok(mut last) = self.last_token.lock() {
            *last = None;
        }
    }

    /// Moves the observed token past a write made by this process, provided no
    /// other write landed between the last observation and that write.
    pub fn advance_past_own_write(&self, token_before: i64, token_after: i64) -> bool {
        let Ok(mut last) = self.last_token.lock() else {
            return false;
        };
        if *last == Some(token_before) {
            *last = Some(token_after);
            return true;
        }
        false
    }

    pub fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .map(|ticker| ticker.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }

    pub async fn check(&self, reason: CheckReason) -> AppResult<CheckOutcome> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(reason = ?reason, "sync check skipped; cycle already in flight");
            return Ok(CheckOutcome::Busy);
        }
        let _cycle = CycleGuard { watcher: self };

        self.set_state(WatchState::Checking);
        let token = self.fetch_token().await?;
        if reason != CheckReason::Forced && self.last_token() == Some(token) {
            return Ok(CheckOutcome::Unchanged { sync_token: token });
        }

        let reconciler = self.reconciler.read().ok().and_then(|reader| reader.clone());
        let Some(reconciler) = reconciler else {
            self.record_token(token);
            return Ok(CheckOutcome::Unchanged { sync_token: token });
        };

        self.set_state(WatchState::Reconciling);
        tracing::debug!(reason = ?reason, token, last = ?self.last_token(), "reconciling with store");
        let mut passes = 0;
        loop {
            passes += 1;
            let observed = reconciler(reason).await?;
            self.record_token(observed);

            // A write can land between the flush and the token fetch inside the cycle.
            let latest = self.fetch_token().await?;
            if latest == observed || passes >= MAX_PASSES_PER_CYCLE {
                if latest != observed {
                    tracing::warn!(observed, latest, passes, "store still changing after reconciliation; deferring to next tick");
                }
                return Ok(CheckOutcome::Reconciled {
                    sync_token: observed,
                    passes,
                });
            }
            tracing::debug!(observed, latest, "token moved during reconciliation; re-running");
        }
    }

    async fn fetch_token(&self) -> AppResult<i64> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.sync_token())
            .await
            .map_err(AppError::from)?
    }

    /// Starts the recurring check. The first tick fires after one full interval.
    pub fn start(&self, interval: Duration) {
        let Ok(mut ticker) = self.ticker.lock() else {
            return;
        };
        if ticker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let watcher = self.clone();
        *ticker = Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer.tick().await;
            loop {
                timer.tick().await;
                // Detached so stopping the ticker never cancels a cycle mid-reconcile.
                let cycle = watcher.clone();
                let handle = tokio::spawn(async move { cycle.check(CheckReason::Tick).await });
                match handle.await {
                    Ok(Ok(_)) => {}
                    Ok(Err(error)) => tracing::warn!(error = %error, "periodic sync check failed"),
                    Err(error) => tracing::warn!(error = %error, "periodic sync check task failed"),
                }
            }
        }));
    }

    pub fn stop(&self) {
        if let Ok(mut ticker) = self.ticker.lock() {
            if let Some(handle) = ticker.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CheckOutcome, CheckReason, SyncWatcher, WatchState};
    use crate::store::{SqliteStore, StoreClient};
    use crate::models::Folder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Duration;

    fn store() -> (tempfile::TempDir, Arc<SqliteStore>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open(&dir.path().join("watch.db")).expect("store");
        (dir, Arc::new(store))
    }

    fn counting_watcher(store: Arc<SqliteStore>) -> (SyncWatcher, Arc<AtomicUsize>) {
        let watcher = SyncWatcher::new(store.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        watcher.set_reconciler(Arc::new(move |_reason: CheckReason| {
            let counter = counter.clone();
            let store = store.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                store.sync_token()
            })
        }));
        (watcher, calls)
    }

    #[tokio::test]
    async fn unchanged_token_is_a_no_op_unless_forced() {
        let (_dir, store) = store();
        let (watcher, calls) = counting_watcher(store);

        let first = watcher.check(CheckReason::Tick).await.expect("first check");
        assert!(matches!(first, CheckOutcome::Reconciled { .. }));
        let second = watcher.check(CheckReason::Focus).await.expect("second check");
        assert!(matches!(second, CheckOutcome::Unchanged { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let forced = watcher.check(CheckReason::Forced).await.expect("forced");
        assert!(matches!(forced, CheckOutcome::Reconciled { passes: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(watcher.state(), WatchState::Idle);
    }

    #[tokio::test]
    async fn foreign_write_triggers_reconcile_and_invalidate_forces_one() {
        let (_dir, store) = store();
        let (watcher, calls) = counting_watcher(store.clone());
        watcher.check(CheckReason::Tick).await.expect("prime");

        store
            .create_folder(&Folder {
                id: "f1".to_string(),
                name: "External".to_string(),
                parent_id: None,
                created_at: 1,
                updated_at: 1,
            })
            .expect("external write");
        let outcome = watcher.check(CheckReason::Tick).await.expect("check");
        assert!(matches!(outcome, CheckOutcome::Reconciled { .. }));

        watcher.invalidate();
        assert_eq!(watcher.last_token(), None);
        watcher.check(CheckReason::Tick).await.expect("after invalidate");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn concurrent_trigger_reports_busy() {
        let (_dir, store) = store();
        let watcher = SyncWatcher::new(store.clone());
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
        watcher.set_reconciler(Arc::new(move |_reason: CheckReason| {
            let release_rx = release_rx.clone();
            let store = store.clone();
            Box::pin(async move {
                if let Some(rx) = release_rx.lock().await.take() {
                    let _ = rx.await;
                }
                store.sync_token()
            })
        }));

        let background = watcher.clone();
        let running = tokio::spawn(async move { background.check(CheckReason::Forced).await });
        while watcher.state() != WatchState::Reconciling {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let second = watcher.check(CheckReason::Forced).await.expect("second");
        assert_eq!(second, CheckOutcome::Busy);

        release_tx.send(()).expect("release");
        let first = running.await.expect("join").expect("first");
        assert!(matches!(first, CheckOutcome::Reconciled { .. }));
        assert_eq!(watcher.state(), WatchState::Idle);
    }

    fn writing_watcher(store: Arc<SqliteStore>, writes_left: usize) -> SyncWatcher {
        let watcher = SyncWatcher::new(store.clone());
        let remaining = Arc::new(AtomicUsize::new(writes_left));
        let written = Arc::new(AtomicUsize::new(0));
        watcher.set_reconciler(Arc::new(move |_reason: CheckReason| {
            let remaining = remaining.clone();
            let written = written.clone();
            let store = store.clone();
            Box::pin(async move {
                let observed = store.sync_token()?;
                // Lands after the token this pass reports, like a write racing the reload.
                if remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1)).is_ok() {
                    let n = written.fetch_add(1, Ordering::SeqCst);
                    store.create_folder(&Folder {
                        id: format!("race{}", n),
                        name: format!("Race {}", n),
                        parent_id: None,
                        created_at: 1,
                        updated_at: 1,
                    })?;
                }
                Ok(observed)
            })
        }));
        watcher
    }

    #[tokio::test]
    async fn write_during_reconcile_triggers_another_pass() {
        let (_dir, store) = store();
        let watcher = writing_watcher(store.clone(), 1);

        let outcome = watcher.check(CheckReason::Forced).await.expect("check");
        let token = store.sync_token().expect("token");
        assert_eq!(outcome, CheckOutcome::Reconciled { sync_token: token, passes: 2 });
        assert_eq!(watcher.last_token(), Some(token));
    }

    #[tokio::test]
    async fn persistent_churn_defers_after_max_passes() {
        let (_dir, store) = store();
        let watcher = writing_watcher(store.clone(), usize::MAX);

        let outcome = watcher.check(CheckReason::Forced).await.expect("check");
        let CheckOutcome::Reconciled { sync_token, passes } = outcome else {
            panic!("expected reconciliation, got {:?}", outcome);
        };
        assert_eq!(passes, super::MAX_PASSES_PER_CYCLE);
        assert!(sync_token < store.sync_token().expect("token"));

        // The stale observation makes the next tick reconcile again.
        let next = watcher.check(CheckReason::Tick).await.expect("next");
        assert!(matches!(next, CheckOutcome::Reconciled { .. }));
    }

    #[test]
    fn own_write_advances_only_from_matching_token() {
        let (_dir, store) = store();
        let watcher = SyncWatcher::new(store);
        watcher.record_token(4);
        assert!(!watcher.advance_past_own_write(3, 5));
        assert!(watcher.advance_past_own_write(4, 5));
        assert_eq!(watcher.last_token(), Some(5));
    }

    #[tokio::test]
    async fn start_and_stop_manage_the_ticker() {
        let (_dir, store) = store();
        let (watcher, calls) = counting_watcher(store);
        watcher.start(Duration::from_millis(20));
        assert!(watcher.is_running());
        tokio::time::sleep(Duration::from_millis(120)).await;
        watcher.stop();
        assert!(!watcher.is_running());
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }
}
