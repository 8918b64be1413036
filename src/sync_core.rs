use crate::bridge::BridgeGateway;
use crate::cache::EntityCache;
use crate::coalescer::WriteCoalescer;
use crate::config::{self, SyncSettings};
use crate::errors::{AppError, AppResult};
use crate::guard::ConflictGuard;
use crate::models::{
    generate_id, now_ms, ChangeReason, DataChanged, Entity, Folder, FolderRecord, LoadMode, Note, NoteFields,
    NoteRecord, SearchHit, Selection, SortMode, Tag,
};
use crate::store::{SqliteStore, StoreClient};
use crate::text::{derive_preview, DEFAULT_PREVIEW_CHARS};
use crate::watcher::{CheckOutcome, CheckReason, SyncWatcher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

const CHANGE_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_SEARCH_LIMIT: i64 = 80;
const DEFAULT_TAG_COLOR: &str = "#888888";

/// Operations the UI layer issues against the core.
#[derive(Debug, Clone)]
pub enum Command {
    CreateFolder { name: String, parent_id: Option<String> },
    RenameFolder { id: String, name: String },
    MoveFolder { id: String, parent_id: Option<String> },
    DeleteFolder { id: String },
    CreateNote { folder_id: String, title: String, body: String },
    UpdateNote { id: String, title: Option<String>, body: Option<String> },
    DeleteNote { id: String },
    MoveNote { id: String, folder_id: String },
    SetPinned { id: String, pinned: bool },
    SetStarred { id: String, starred: bool },
    ReorderNotes { folder_id: String, pinned: bool, ordered_ids: Vec<String> },
    CreateTag { name: String, color: Option<String> },
    DeleteTag { id: String },
    TagNote { note_id: String, tag_id: String },
    UntagNote { note_id: String, tag_id: String },
    SelectFolder { id: Option<String> },
    SelectNote { id: Option<String> },
    SetSortMode(SortMode),
    LoadNoteBody { id: String },
    Search { query: String, limit: Option<i64> },
    Import { folders: Vec<FolderRecord>, notes: Vec<NoteRecord> },
    ExportBackup,
    Focus,
    SyncNow,
    FlushAll,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutput {
    Done,
    Created(String),
    Body(String),
    Hits(Vec<SearchHit>),
    BackupPath(PathBuf),
    Check(CheckOutcome),
}

/// Owns the cache, the coalescer and the watcher for one process.
pub struct SyncCore {
    store: Arc<dyn StoreClient>,
    cache: Arc<RwLock<EntityCache>>,
    selection: Mutex<Selection>,
    sort_mode: Mutex<SortMode>,
    coalescer: WriteCoalescer,
    watcher: SyncWatcher,
    guard: ConflictGuard,
    settings: SyncSettings,
    data_dir: PathBuf,
    changes: broadcast::Sender<DataChanged>,
}

impl SyncCore {
    pub fn new(store: Arc<dyn StoreClient>, settings: SyncSettings, data_dir: PathBuf) -> Arc<Self> {
        let cache = Arc::new(RwLock::new(EntityCache::new()));
        let watcher = SyncWatcher::new(store.clone());
        let guard = ConflictGuard::new(watcher.clone());
        let coalescer = WriteCoalescer::new(
            store.clone(),
            cache.clone(),
            watcher.clone(),
            guard.clone(),
            settings.debounce(),
        );
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        let this = Arc::new(Self {
            store,
            cache,
            selection: Mutex::new(Selection::default()),
            sort_mode: Mutex::new(SortMode::default()),
            coalescer,
            watcher,
            guard,
            settings,
            data_dir,
            changes,
        });

        let weak = Arc::downgrade(&this);
        this.watcher.set_reconciler(Arc::new(move |reason: CheckReason| {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(core) => core.reconcile(reason).await,
                    None => Err(AppError::Internal("sync core dropped during reconciliation".to_string())),
                }
            })
        }));

        this
    }

    /// Opens the canonical store under `data_dir` with settings from its config file.
    pub fn open(data_dir: &Path) -> AppResult<Arc<Self>> {
        let settings = SyncSettings::load(data_dir)?;
        let store = SqliteStore::open(&config::db_path(data_dir))?;
        Ok(Self::new(Arc::new(store), settings, data_dir.to_path_buf()))
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn watcher(&self) -> &SyncWatcher {
        &self.watcher
    }

    pub fn coalescer(&self) -> &WriteCoalescer {
        &self.coalescer
    }

    pub fn guard(&self) -> &ConflictGuard {
        &self.guard
    }

    /// Gateway to the external writer, resolved against this process's environment.
    pub fn bridge_gateway(&self) -> BridgeGateway {
        BridgeGateway::new(
            self.settings.bridge.clone().with_environment(),
            config::logs_dir(&self.data_dir),
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DataChanged> {
        self.changes.subscribe()
    }

    /// Runs `read` against the cache. The lock is released before returning.
    pub fn read_cache<R>(&self, read: impl FnOnce(&EntityCache) -> R) -> AppResult<R> {
        Ok(read(&*self.cache_read()?))
    }

    pub fn selection(&self) -> AppResult<Selection> {
        Ok(self.selection_lock()?.clone())
    }

    pub fn sort_mode(&self) -> AppResult<SortMode> {
        Ok(*self.sort_lock()?)
    }

    fn cache_read(&self) -> AppResult<RwLockReadGuard<'_, EntityCache>> {
        self.cache
            .read()
            .map_err(|_| AppError::Internal("entity cache lock poisoned".to_string()))
    }

    fn cache_write(&self) -> AppResult<RwLockWriteGuard<'_, EntityCache>> {
        self.cache
            .write()
            .map_err(|_| AppError::Internal("entity cache lock poisoned".to_string()))
    }

    fn selection_lock(&self) -> AppResult<MutexGuard<'_, Selection>> {
        self.selection
            .lock()
            .map_err(|_| AppError::Internal("selection lock poisoned".to_string()))
    }

    fn sort_lock(&self) -> AppResult<MutexGuard<'_, SortMode>> {
        self.sort_mode
            .lock()
            .map_err(|_| AppError::Internal("sort mode lock poisoned".to_string()))
    }

    fn notify(&self, reason: ChangeReason, sync_token: Option<i64>) {
        // No subscribers is fine.
        let _ = self.changes.send(DataChanged { reason, sync_token });
    }

    pub async fn execute(&self, command: Command) -> AppResult<CommandOutput> {
        match command {
            Command::CreateFolder { name, parent_id } => {
                self.create_folder(&name, parent_id.as_deref()).await.map(CommandOutput::Created)
            }
            Command::RenameFolder { id, name } => self.rename_folder(&id, &name).await.map(|_| CommandOutput::Done),
            Command::MoveFolder { id, parent_id } => {
                self.move_folder(&id, parent_id.as_deref()).await.map(|_| CommandOutput::Done)
            }
            Command::DeleteFolder { id } => self.delete_folder(&id).await.map(|_| CommandOutput::Done),
            Command::CreateNote { folder_id, title, body } => {
                self.create_note(&folder_id, &title, &body).await.map(CommandOutput::Created)
            }
            Command::UpdateNote { id, title, body } => self.update_note(&id, title, body).map(|_| CommandOutput::Done),
            Command::DeleteNote { id } => self.delete_note(&id).await.map(|_| CommandOutput::Done),
            Command::MoveNote { id, folder_id } => self.move_note(&id, &folder_id).await.map(|_| CommandOutput::Done),
            Command::SetPinned { id, pinned } => self.set_pinned(&id, pinned).await.map(|_| CommandOutput::Done),
            Command::SetStarred { id, starred } => self.set_starred(&id, starred).await.map(|_| CommandOutput::Done),
            Command::ReorderNotes {
                folder_id,
                pinned,
                ordered_ids,
            } => self
                .reorder_notes(&folder_id, pinned, &ordered_ids)
                .await
                .map(|_| CommandOutput::Done),
            Command::CreateTag { name, color } => {
                self.create_tag(&name, color.as_deref()).await.map(CommandOutput::Created)
            }
            Command::DeleteTag { id } => self.delete_tag(&id).await.map(|_| CommandOutput::Done),
            Command::TagNote { note_id, tag_id } => self.tag_note(&note_id, &tag_id).await.map(|_| CommandOutput::Done),
            Command::UntagNote { note_id, tag_id } => {
                self.untag_note(&note_id, &tag_id).await.map(|_| CommandOutput::Done)
            }
            Command::SelectFolder { id } => self.select_folder(id.as_deref()).await.map(|_| CommandOutput::Done),
            Command::SelectNote { id } => self.select_note(id.as_deref()).await.map(|_| CommandOutput::Done),
            Command::SetSortMode(mode) => {
                *self.sort_lock()? = mode;
                self.notify(ChangeReason::LocalEdit, None);
                Ok(CommandOutput::Done)
            }
            Command::LoadNoteBody { id } => self.load_note_body(&id).await.map(CommandOutput::Body),
            Command::Search { query, limit } => self.search(&query, limit).await.map(CommandOutput::Hits),
            Command::Import { folders, notes } => self.import(folders, notes).await.map(CommandOutput::Check),
            Command::ExportBackup => self.export_backup().await.map(CommandOutput::BackupPath),
            Command::Focus => self.on_focus().await.map(CommandOutput::Check),
            Command::SyncNow => self.sync_now().await.map(CommandOutput::Check),
            Command::FlushAll => {
                self.coalescer.flush_all().await;
                Ok(CommandOutput::Done)
            }
        }
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────────

    /// Loads the store into the cache, selects a starting folder and starts polling.
    pub async fn start(&self) -> AppResult<CheckOutcome> {
        let outcome = self.watcher.check(CheckReason::Forced).await?;
        {
            let cache = self.cache_read()?;
            let sort_mode = *self.sort_lock()?;
            let mut selection = self.selection_lock()?;
            if selection.folder_id.is_none() {
                selection.folder_id = cache.children_of(None).first().map(|folder| folder.id.clone());
                revalidate_selection(&cache, &mut selection, sort_mode);
            }
        }
        self.watcher.start(self.settings.poll_interval());
        Ok(outcome)
    }

    pub async fn shutdown(&self) {
        self.watcher.stop();
        let outcomes = self.coalescer.flush_all().await;
        tracing::info!(flushed = outcomes.len(), "sync core stopped");
    }

    pub async fn on_focus(&self) -> AppResult<CheckOutcome> {
        self.watcher.check(CheckReason::Focus).await
    }

    pub async fn sync_now(&self) -> AppResult<CheckOutcome> {
        self.watcher.check(CheckReason::Forced).await
    }

    // ─── Reconciliation ─────────────────────────────────────────────────────

    /// One reconciliation pass. Returns the sync token fetched after the flush.
    async fn reconcile(&self, reason: CheckReason) -> AppResult<i64> {
        // Local edits must reach the store before the reload, or they would vanish from view.
        self.coalescer.flush_all().await;

        let store = self.store.clone();
        let (token, mut snapshot) = tokio::task::spawn_blocking(move || -> AppResult<_> {
            let token = store.sync_token()?;
            let snapshot = store.snapshot(LoadMode::Metadata)?;
            Ok((token, snapshot))
        })
        .await
        .map_err(AppError::from)??;

        let active_note = self.selection_lock()?.note_id.clone();
        {
            let cache = self.cache_read()?;
            for note in &mut snapshot.notes {
                if let Some(cached) = cache.note(&note.id) {
                    if cached.updated_at == note.updated_at {
                        note.body = cached.body.clone();
                    }
                }
            }
        }
        if let Some(active_id) = active_note {
            let needs_body = snapshot
                .notes
                .iter()
                .any(|note| note.id == active_id && note.body.is_none());
            if needs_body {
                let store = self.store.clone();
                let id = active_id.clone();
                match tokio::task::spawn_blocking(move || store.note_body(&id)).await? {
                    Ok(body) => {
                        if let Some(note) = snapshot.notes.iter_mut().find(|note| note.id == active_id) {
                            note.body = Some(body);
                        }
                    }
                    Err(error) => tracing::warn!(note_id = %active_id, error = %error, "active note body reload failed"),
                }
            }
        }

        let overlay = self.coalescer.pending_overlay();
        {
            let mut cache = self.cache_write()?;
            cache.replace_all(snapshot);
            for pending in overlay {
                cache.patch_note(&pending.note_id, |note| {
                    note.title = pending.fields.title;
                    if let Some(body) = pending.fields.body {
                        note.preview = derive_preview(&body, DEFAULT_PREVIEW_CHARS);
                        note.body = Some(body);
                    }
                });
            }
            let sort_mode = *self.sort_lock()?;
            let mut selection = self.selection_lock()?;
            revalidate_selection(&cache, &mut selection, sort_mode);
        }
        self.coalescer.forget_committed();

        tracing::info!(reason = ?reason, token, "cache reconciled with store");
        self.notify(ChangeReason::Reconciled, Some(token));
        Ok(token)
    }

    /// Runs a structural store write. Failures never reject the local change: conflicts
    /// go to the guard and anything else invalidates the observed token.
    async fn write_through<F>(&self, action: &'static str, subject: &str, write: F) -> bool
    where
        F: FnOnce(&dyn StoreClient) -> AppResult<()> + Send + 'static,
    {
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || write(store.as_ref()))
            .await
            .map_err(AppError::from)
            .and_then(|result| result);
        match result {
            Ok(()) => true,
            Err(error) if error.is_conflict() => {
                self.guard.inspect(subject, &error).await;
                false
            }
            Err(error) => {
                tracing::warn!(action, subject = %subject, error = %error, "store write failed; next check will reconcile");
                self.watcher.invalidate();
                false
            }
        }
    }

    // ─── Folders ────────────────────────────────────────────────────────────

    pub async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> AppResult<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("folder name is required".to_string()));
        }
        let now = now_ms();
        let folder = Folder {
            id: generate_id(),
            name: name.to_string(),
            parent_id: parent_id.map(ToString::to_string),
            created_at: now,
            updated_at: now,
        };
        {
            let mut cache = self.cache_write()?;
            if parent_id.is_none()
                && cache
                    .children_of(None)
                    .iter()
                    .any(|root| root.name.eq_ignore_ascii_case(name))
            {
                return Err(AppError::Validation(format!("a top-level folder named '{}' already exists", name)));
            }
            cache.upsert(Entity::Folder(folder.clone()))?;
        }
        self.notify(ChangeReason::LocalEdit, None);

        let id = folder.id.clone();
        self.write_through("create_folder", &id, move |store| store.create_folder(&folder))
            .await;
        Ok(id)
    }

    pub async fn rename_folder(&self, id: &str, name: &str) -> AppResult<()> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(AppError::Validation("folder name is required".to_string()));
        }
        {
            let mut cache = self.cache_write()?;
            let mut folder = cache
                .folder(id)
                .cloned()
                .ok_or_else(|| AppError::NotFound("folder not found".to_string()))?;
            folder.name = name.clone();
            folder.updated_at = now_ms();
            cache.upsert(Entity::Folder(folder))?;
        }
        self.notify(ChangeReason::LocalEdit, None);

        let folder_id = id.to_string();
        self.write_through("rename_folder", id, move |store| store.rename_folder(&folder_id, &name))
            .await;
        Ok(())
    }

    pub async fn move_folder(&self, id: &str, parent_id: Option<&str>) -> AppResult<()> {
        {
            let mut cache = self.cache_write()?;
            let mut folder = cache
                .folder(id)
                .cloned()
                .ok_or_else(|| AppError::NotFound("folder not found".to_string()))?;
            if let Some(parent_id) = parent_id {
                if cache.folder(parent_id).is_none() {
                    return Err(AppError::Validation("target folder not found".to_string()));
                }
                if cache.is_within(parent_id, id) {
                    return Err(AppError::Validation("folder cannot be moved into its own subtree".to_string()));
                }
            }
            folder.parent_id = parent_id.map(ToString::to_string);
            folder.updated_at = now_ms();
            cache.upsert(Entity::Folder(folder))?;
        }
        self.notify(ChangeReason::LocalEdit, None);

        let folder_id = id.to_string();
        let parent = parent_id.map(ToString::to_string);
        self.write_through("move_folder", id, move |store| {
            store.move_folder(&folder_id, parent.as_deref())
        })
        .await;
        Ok(())
    }

    /// Removes the folder, its subtree and their notes in one cache mutation.
    pub async fn delete_folder(&self, id: &str) -> AppResult<()> {
        let removed = {
            let mut cache = self.cache_write()?;
            if cache.folder(id).is_none() {
                return Err(AppError::NotFound("folder not found".to_string()));
            }
            let removed = cache.remove(id);
            let mut selection = self.selection_lock()?;
            let folder_gone = selection
                .folder_id
                .as_ref()
                .is_some_and(|folder_id| removed.contains(folder_id));
            let note_gone = selection
                .note_id
                .as_ref()
                .is_some_and(|note_id| removed.contains(note_id));
            if folder_gone || note_gone {
                *selection = Selection::default();
            }
            removed
        };
        for removed_id in &removed {
            self.coalescer.discard(removed_id);
        }
        self.notify(ChangeReason::LocalEdit, None);

        let folder_id = id.to_string();
        self.write_through("delete_folder", id, move |store| store.delete_folder(&folder_id))
            .await;
        Ok(())
    }

    // ─── Notes ──────────────────────────────────────────────────────────────

    pub async fn create_note(&self, folder_id: &str, title: &str, body: &str) -> AppResult<String> {
        let now = now_ms();
        let note = Note {
            id: generate_id(),
            folder_id: folder_id.to_string(),
            title: title.to_string(),
            body: Some(body.to_string()),
            preview: derive_preview(body, DEFAULT_PREVIEW_CHARS),
            pinned: false,
            starred: false,
            sort_order: 0,
            created_at: now,
            updated_at: now,
        };
        {
            let mut cache = self.cache_write()?;
            if cache.folder(folder_id).is_none() {
                return Err(AppError::Validation("folder not found".to_string()));
            }
            cache.shift_unpinned(folder_id);
            cache.upsert(Entity::Note(note.clone()))?;
        }
        self.notify(ChangeReason::LocalEdit, None);

        let id = note.id.clone();
        self.write_through("create_note", &id, move |store| store.create_note(&note))
            .await;
        Ok(id)
    }

    /// Applies an edit to the cache at once and schedules the debounced write.
    pub fn update_note(&self, id: &str, title: Option<String>, body: Option<String>) -> AppResult<()> {
        let (fields, base_updated_at) = {
            let mut cache = self.cache_write()?;
            let base_updated_at = cache
                .note(id)
                .map(|note| note.updated_at)
                .ok_or_else(|| AppError::NotFound("note not found".to_string()))?;
            let mut fields = None;
            cache.patch_note(id, |note| {
                if let Some(title) = title {
                    note.title = title;
                }
                if let Some(body) = body {
                    note.preview = derive_preview(&body, DEFAULT_PREVIEW_CHARS);
                    note.body = Some(body);
                }
                fields = Some(NoteFields {
                    title: note.title.clone(),
                    body: note.body.clone(),
                    updated_at: now_ms(),
                });
            });
            let fields = fields.ok_or_else(|| AppError::NotFound("note not found".to_string()))?;
            (fields, base_updated_at)
        };
        self.notify(ChangeReason::LocalEdit, None);
        self.coalescer.schedule_save(id, fields, base_updated_at);
        Ok(())
    }

    pub async fn delete_note(&self, id: &str) -> AppResult<()> {
        self.coalescer.discard(id);
        self.coalescer.settle(id).await;

        let expected_updated_at = {
            let mut cache = self.cache_write()?;
            let expected = cache
                .note(id)
                .map(|note| note.updated_at)
                .ok_or_else(|| AppError::NotFound("note not found".to_string()))?;
            cache.remove(id);
            let mut selection = self.selection_lock()?;
            if selection.note_id.as_deref() == Some(id) {
                selection.note_id = None;
            }
            expected
        };
        self.notify(ChangeReason::LocalEdit, None);

        let note_id = id.to_string();
        self.write_through("delete_note", id, move |store| {
            store.delete_note(&note_id, Some(expected_updated_at))
        })
        .await;
        Ok(())
    }

    /// Moves a note to the top of its group in the target folder.
    pub async fn move_note(&self, id: &str, folder_id: &str) -> AppResult<()> {
        let updates = {
            let mut cache = self.cache_write()?;
            let mut note = cache
                .note(id)
                .cloned()
                .ok_or_else(|| AppError::NotFound("note not found".to_string()))?;
            if cache.folder(folder_id).is_none() {
                return Err(AppError::Validation("target folder not found".to_string()));
            }
            let source_folder = note.folder_id.clone();
            let pinned = note.pinned;
            note.folder_id = folder_id.to_string();
            cache.upsert(Entity::Note(note))?;

            let mut updates = cache.renumber_group(folder_id, pinned, &[id.to_string()]);
            if source_folder != folder_id {
                updates.extend(cache.renumber_group(&source_folder, pinned, &[]));
            }
            let mut selection = self.selection_lock()?;
            if selection.note_id.as_deref() == Some(id) {
                selection.folder_id = Some(folder_id.to_string());
            }
            updates
        };
        self.notify(ChangeReason::LocalEdit, None);

        let note_id = id.to_string();
        let target = folder_id.to_string();
        self.write_through("move_note", id, move |store| {
            store.move_note(&note_id, &target, 0)?;
            store.reorder_notes(&updates)
        })
        .await;
        Ok(())
    }

    /// Pinning moves the note to the top of its new group; both groups are renumbered.
    pub async fn set_pinned(&self, id: &str, pinned: bool) -> AppResult<()> {
        let updates = {
            let mut cache = self.cache_write()?;
            let folder_id = cache
                .note(id)
                .map(|note| note.folder_id.clone())
                .ok_or_else(|| AppError::NotFound("note not found".to_string()))?;
            cache.patch_note(id, |note| note.pinned = pinned);
            let mut updates = cache.renumber_group(&folder_id, pinned, &[id.to_string()]);
            updates.extend(cache.renumber_group(&folder_id, !pinned, &[]));
            updates
        };
        self.notify(ChangeReason::LocalEdit, None);

        let note_id = id.to_string();
        self.write_through("set_pinned", id, move |store| {
            store.set_note_pinned(&note_id, pinned)?;
            store.reorder_notes(&updates)
        })
        .await;
        Ok(())
    }

    pub async fn set_starred(&self, id: &str, starred: bool) -> AppResult<()> {
        if !self.cache_write()?.patch_note(id, |note| note.starred = starred) {
            return Err(AppError::NotFound("note not found".to_string()));
        }
        self.notify(ChangeReason::LocalEdit, None);

        let note_id = id.to_string();
        self.write_through("set_starred", id, move |store| store.set_note_starred(&note_id, starred))
            .await;
        Ok(())
    }

    pub async fn reorder_notes(&self, folder_id: &str, pinned: bool, ordered_ids: &[String]) -> AppResult<()> {
        let updates = {
            let mut cache = self.cache_write()?;
            if cache.folder(folder_id).is_none() {
                return Err(AppError::Validation("folder not found".to_string()));
            }
            cache.renumber_group(folder_id, pinned, ordered_ids)
        };
        self.notify(ChangeReason::LocalEdit, None);

        self.write_through("reorder_notes", folder_id, move |store| store.reorder_notes(&updates))
            .await;
        Ok(())
    }

    /// Returns the body from the cache, fetching it on first access.
    pub async fn load_note_body(&self, id: &str) -> AppResult<String> {
        let cached = self
            .cache_read()?
            .note(id)
            .map(|note| note.body.clone())
            .ok_or_else(|| AppError::NotFound("note not found".to_string()))?;
        if let Some(body) = cached {
            return Ok(body);
        }

        let store = self.store.clone();
        let note_id = id.to_string();
        let body = tokio::task::spawn_blocking(move || store.note_body(&note_id)).await??;
        let mut cache = self.cache_write()?;
        let mut resolved = body.clone();
        cache.patch_note(id, |note| match &note.body {
            // An edit landed while fetching; it wins.
            Some(current) => resolved = current.clone(),
            None => note.body = Some(body),
        });
        Ok(resolved)
    }

    // ─── Tags ───────────────────────────────────────────────────────────────

    pub async fn create_tag(&self, name: &str, color: Option<&str>) -> AppResult<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("tag name is required".to_string()));
        }
        let tag = Tag {
            id: generate_id(),
            name: name.to_string(),
            color: color.unwrap_or(DEFAULT_TAG_COLOR).to_string(),
        };
        {
            let mut cache = self.cache_write()?;
            if cache.tags().any(|existing| existing.name == tag.name) {
                return Err(AppError::Validation(format!("tag '{}' already exists", tag.name)));
            }
            cache.upsert(Entity::Tag(tag.clone()))?;
        }
        self.notify(ChangeReason::LocalEdit, None);

        let id = tag.id.clone();
        self.write_through("create_tag", &id, move |store| store.create_tag(&tag))
            .await;
        Ok(id)
    }

    pub async fn delete_tag(&self, id: &str) -> AppResult<()> {
        if self.cache_write()?.remove(id).is_empty() {
            return Err(AppError::NotFound("tag not found".to_string()));
        }
        self.notify(ChangeReason::LocalEdit, None);

        let tag_id = id.to_string();
        self.write_through("delete_tag", id, move |store| store.delete_tag(&tag_id))
            .await;
        Ok(())
    }

    pub async fn tag_note(&self, note_id: &str, tag_id: &str) -> AppResult<()> {
        self.cache_write()?.link_tag(note_id, tag_id)?;
        self.notify(ChangeReason::LocalEdit, None);

        let (note, tag) = (note_id.to_string(), tag_id.to_string());
        self.write_through("tag_note", note_id, move |store| store.tag_note(&note, &tag))
            .await;
        Ok(())
    }

    pub async fn untag_note(&self, note_id: &str, tag_id: &str) -> AppResult<()> {
        self.cache_write()?.unlink_tag(note_id, tag_id);
        self.notify(ChangeReason::LocalEdit, None);

        let (note, tag) = (note_id.to_string(), tag_id.to_string());
        self.write_through("untag_note", note_id, move |store| store.untag_note(&note, &tag))
            .await;
        Ok(())
    }

    // ─── Selection ──────────────────────────────────────────────────────────

    /// Switching folders flushes pending writes first.
    pub async fn select_folder(&self, id: Option<&str>) -> AppResult<()> {
        self.coalescer.flush_all().await;
        {
            let cache = self.cache_read()?;
            if let Some(id) = id {
                if cache.folder(id).is_none() {
                    return Err(AppError::Validation("folder not found".to_string()));
                }
            }
            let mut selection = self.selection_lock()?;
            selection.folder_id = id.map(ToString::to_string);
            selection.note_id = None;
        }
        self.notify(ChangeReason::LocalEdit, None);
        Ok(())
    }

    pub async fn select_note(&self, id: Option<&str>) -> AppResult<()> {
        self.coalescer.flush_all().await;
        {
            let cache = self.cache_read()?;
            let mut selection = self.selection_lock()?;
            match id {
                Some(id) => {
                    let note = cache
                        .note(id)
                        .ok_or_else(|| AppError::NotFound("note not found".to_string()))?;
                    selection.folder_id = Some(note.folder_id.clone());
                    selection.note_id = Some(id.to_string());
                }
                None => selection.note_id = None,
            }
        }
        if let Some(id) = id {
            self.load_note_body(id).await?;
        }
        self.notify(ChangeReason::LocalEdit, None);
        Ok(())
    }

    // ─── Search, import, export ─────────────────────────────────────────────

    pub async fn search(&self, query: &str, limit: Option<i64>) -> AppResult<Vec<SearchHit>> {
        let store = self.store.clone();
        let query = query.to_string();
        let limit = limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
        tokio::task::spawn_blocking(move || store.search_notes(&query, limit)).await?
    }

    /// Imports rows with insert-or-ignore semantics, then forces a reconciliation.
    pub async fn import(&self, folders: Vec<FolderRecord>, notes: Vec<NoteRecord>) -> AppResult<CheckOutcome> {
        let store = self.store.clone();
        let (folder_count, note_count) = (folders.len(), notes.len());
        tokio::task::spawn_blocking(move || store.import_data(&folders, &notes)).await??;
        tracing::info!(folders = folder_count, notes = note_count, "import committed");

        self.watcher.invalidate();
        let outcome = self.watcher.check(CheckReason::Forced).await?;
        self.notify(ChangeReason::Imported, self.watcher.last_token());
        Ok(outcome)
    }

    pub async fn export_backup(&self) -> AppResult<PathBuf> {
        self.coalescer.flush_all().await;
        let store = self.store.clone();
        let backups_dir = config::backups_dir(&self.data_dir);
        let path = tokio::task::spawn_blocking(move || store.export_backup(&backups_dir)).await??;
        tracing::info!(path = %path.display(), "backup exported");
        Ok(path)
    }
}

/// Keeps the selection pointing at live entities after a reload.
fn revalidate_selection(cache: &EntityCache, selection: &mut Selection, sort_mode: SortMode) {
    if let Some(folder_id) = &selection.folder_id {
        if cache.folder(folder_id).is_none() {
            selection.folder_id = cache.children_of(None).first().map(|folder| folder.id.clone());
        }
    }
    if let Some(note_id) = selection.note_id.clone() {
        match cache.note(&note_id) {
            Some(note) => selection.folder_id = Some(note.folder_id.clone()),
            None => selection.note_id = None,
        }
    }
    if selection.note_id.is_none() {
        if let Some(folder_id) = &selection.folder_id {
            selection.note_id = cache
                .notes_of(folder_id, sort_mode)
                .first()
                .map(|note| note.id.clone());
        }
    }
}
