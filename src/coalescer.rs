use crate::cache::EntityCache;
use crate::errors::AppError;
use crate::guard::ConflictGuard;
use crate::models::{NoteFields, NoteUpdate, NoteWriteReceipt};
use crate::store::StoreClient;
use crate::watcher::SyncWatcher;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub note_id: String,
    pub fields: NoteFields,
    /// Stored `updated_at` the edit started from; kept from the first edit of a burst.
    pub base_updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    Committed(NoteWriteReceipt),
    /// Nothing pending, or the content matches what was last committed.
    Skipped,
    Conflict,
    Failed(String),
}

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct CoalescerState {
    pending: HashMap<String, PendingWrite>,
    timers: HashMap<String, Timer>,
    committed: HashMap<String, NoteFields>,
    generation: u64,
}

/// Debounces note edits into one store write per quiet period.
#[derive(Clone)]
pub struct WriteCoalescer {
    store: Arc<dyn StoreClient>,
    cache: Arc<RwLock<EntityCache>>,
    watcher: SyncWatcher,
    guard: ConflictGuard,
    debounce: Duration,
    state: Arc<Mutex<CoalescerState>>,
    note_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl WriteCoalescer {
    pub fn new(
        store: Arc<dyn StoreClient>,
        cache: Arc<RwLock<EntityCache>>,
        watcher: SyncWatcher,
        guard: ConflictGuard,
        debounce: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            watcher,
            guard,
            debounce,
            state: Arc::new(Mutex::new(CoalescerState::default())),
            note_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Records the latest fields for a note and restarts its quiet-period timer.
    pub fn schedule_save(&self, note_id: &str, fields: NoteFields, base_updated_at: i64) {
        let Ok(mut state) = self.state.lock() else {
            tracing::error!(note_id = %note_id, "coalescer state poisoned; edit not scheduled");
            return;
        };
        let base_updated_at = state
            .pending
            .get(note_id)
            .map(|pending| pending.base_updated_at)
            .unwrap_or(base_updated_at);
        state.pending.insert(
            note_id.to_string(),
            PendingWrite {
                note_id: note_id.to_string(),
                fields,
                base_updated_at,
            },
        );
        if let Some(previous) = state.timers.remove(note_id) {
            previous.handle.abort();
        }

        state.generation += 1;
        let generation = state.generation;
        let this = self.clone();
        let id = note_id.to_string();
        // Spawned under the state lock so the timer cannot observe the map before its entry exists.
        let handle = tokio::spawn(async move {
            tokio::time::sleep(this.debounce).await;
            if this.claim_timer(&id, generation) {
                this.persist(&id).await;
            }
        });
        state.timers.insert(note_id.to_string(), Timer { generation, handle });
    }

    fn claim_timer(&self, note_id: &str, generation: u64) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        match state.timers.get(note_id) {
            Some(timer) if timer.generation == generation => {
                state.timers.remove(note_id);
                true
            }
            _ => false,
        }
    }

    pub fn has_pending(&self, note_id: &str) -> bool {
        self.state
            .lock()
            .map(|state| state.pending.contains_key(note_id))
            .unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().map(|state| state.pending.len()).unwrap_or(0)
    }

    /// Still-unsaved edits, to be laid over a freshly reloaded cache.
    pub fn pending_overlay(&self) -> Vec<PendingWrite> {
        self.state
            .lock()
            .map(|state| state.pending.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Drops de-duplication records; after a reload they may describe content the store no longer has.
    pub fn forget_committed(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.committed.clear();
        }
    }

    /// Discards a pending edit without writing it, e.g. when its note was deleted.
    pub fn discard(&self, note_id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.pending.remove(note_id);
            state.committed.remove(note_id);
            if let Some(timer) = state.timers.remove(note_id) {
                timer.handle.abort();
            }
        }
    }

    fn note_lock(&self, note_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        match self.note_locks.lock() {
            Ok(mut locks) => locks.entry(note_id.to_string()).or_default().clone(),
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Waits for an in-flight write of this note to finish.
    pub async fn settle(&self, note_id: &str) {
        let lock = self.note_lock(note_id);
        let _serial = lock.lock().await;
    }

    /// Writes the pending edit of one note, if any. Writes for the same note are serialized.
    pub async fn persist(&self, note_id: &str) -> PersistOutcome {
        let outcome = {
            let lock = self.note_lock(note_id);
            let _serial = lock.lock().await;
            self.persist_locked(note_id).await
        };

        if outcome == PersistOutcome::Conflict {
            let error = AppError::Conflict("stale note update rejected".to_string());
            self.guard.inspect(note_id, &error).await;
        }
        outcome
    }

    async fn persist_locked(&self, note_id: &str) -> PersistOutcome {
        let (pending, committed) = match self.state.lock() {
            Ok(mut state) => (state.pending.remove(note_id), state.committed.get(note_id).cloned()),
            Err(_) => return PersistOutcome::Failed("coalescer state poisoned".to_string()),
        };
        let Some(pending) = pending else {
            return PersistOutcome::Skipped;
        };
        if let Some(committed) = &committed {
            if pending.fields.same_content(committed) {
                tracing::debug!(note_id = %note_id, "skipping write; content unchanged since last commit");
                return PersistOutcome::Skipped;
            }
        }

        let expected_updated_at = committed
            .as_ref()
            .map(|committed| committed.updated_at.max(pending.base_updated_at))
            .unwrap_or(pending.base_updated_at);
        let update = NoteUpdate {
            id: note_id.to_string(),
            title: Some(pending.fields.title.clone()),
            body: pending.fields.body.clone(),
            updated_at: pending.fields.updated_at,
            expected_updated_at: Some(expected_updated_at),
        };
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || store.update_note(&update))
            .await
            .map_err(AppError::from)
            .and_then(|result| result);

        match result {
            Ok(receipt) => {
                let body = pending
                    .fields
                    .body
                    .clone()
                    .or_else(|| committed.and_then(|committed| committed.body));
                if let Ok(mut state) = self.state.lock() {
                    state.committed.insert(
                        note_id.to_string(),
                        NoteFields {
                            title: pending.fields.title.clone(),
                            body,
                            updated_at: receipt.updated_at,
                        },
                    );
                }
                if let Ok(mut cache) = self.cache.write() {
                    cache.patch_note(note_id, |note| note.updated_at = receipt.updated_at);
                }
                self.watcher
                    .advance_past_own_write(receipt.sync_token_before, receipt.sync_token);
                tracing::debug!(note_id = %note_id, updated_at = receipt.updated_at, "note persisted");
                PersistOutcome::Committed(receipt)
            }
            Err(error) if error.is_conflict() => PersistOutcome::Conflict,
            Err(error) => {
                // Dropped; the next edit re-schedules with complete fields.
                tracing::warn!(note_id = %note_id, error = %error, "note persist failed");
                PersistOutcome::Failed(error.to_string())
            }
        }
    }

    /// Cancels every timer and persists all pending notes concurrently, returning
    /// once each write has settled. Also waits out writes already in flight.
    pub async fn flush_all(&self) -> Vec<(String, PersistOutcome)> {
        let mut note_ids: Vec<String> = match self.state.lock() {
            Ok(mut state) => {
                for (_, timer) in state.timers.drain() {
                    timer.handle.abort();
                }
                state.pending.keys().cloned().collect()
            }
            Err(_) => Vec::new(),
        };
        if let Ok(locks) = self.note_locks.lock() {
            for (note_id, lock) in locks.iter() {
                if lock.try_lock().is_err() && !note_ids.contains(note_id) {
                    note_ids.push(note_id.clone());
                }
            }
        }

        let mut writes = JoinSet::new();
        for note_id in note_ids {
            let this = self.clone();
            writes.spawn(async move {
                let outcome = this.persist(&note_id).await;
                (note_id, outcome)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = writes.join_next().await {
            match joined {
                Ok(result) => outcomes.push(result),
                Err(error) => tracing::warn!(error = %error, "flush task failed"),
            }
        }
        outcomes
    }
}
