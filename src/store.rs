use crate::db::Database;
use crate::errors::AppResult;
use crate::models::{
    Folder, FolderRecord, LoadMode, Note, NoteRecord, NoteTag, NoteUpdate, NoteWriteReceipt, SearchHit, StoreSnapshot,
    Tag,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything the core needs from the canonical store.
///
/// Calls are blocking; the core drives them through `spawn_blocking`.
pub trait StoreClient: Send + Sync {
    fn sync_token(&self) -> AppResult<i64>;

    /// Every folder, note, tag and link. Stores that can read them in one
    /// transaction should override this.
    fn snapshot(&self, mode: LoadMode) -> AppResult<StoreSnapshot> {
        Ok(StoreSnapshot {
            folders: self.list_folders()?,
            notes: self.list_notes(mode)?,
            tags: self.list_tags()?,
            note_tags: self.list_note_tags()?,
        })
    }

    fn list_folders(&self) -> AppResult<Vec<Folder>>;
    fn list_notes(&self, mode: LoadMode) -> AppResult<Vec<Note>>;
    fn list_tags(&self) -> AppResult<Vec<Tag>>;
    fn list_note_tags(&self) -> AppResult<Vec<NoteTag>>;
    fn note_body(&self, id: &str) -> AppResult<String>;

    fn create_folder(&self, folder: &Folder) -> AppResult<()>;
    fn rename_folder(&self, id: &str, name: &str) -> AppResult<()>;
    fn move_folder(&self, id: &str, parent_id: Option<&str>) -> AppResult<()>;
    fn delete_folder(&self, id: &str) -> AppResult<()>;

    fn create_note(&self, note: &Note) -> AppResult<()>;
    fn update_note(&self, update: &NoteUpdate) -> AppResult<NoteWriteReceipt>;
    fn delete_note(&self, id: &str, expected_updated_at: Option<i64>) -> AppResult<()>;
    fn move_note(&self, id: &str, folder_id: &str, sort_order: i32) -> AppResult<()>;
    fn set_note_pinned(&self, id: &str, pinned: bool) -> AppResult<()>;
    fn set_note_starred(&self, id: &str, starred: bool) -> AppResult<()>;
    fn reorder_notes(&self, updates: &[(String, i32)]) -> AppResult<()>;

    fn create_tag(&self, tag: &Tag) -> AppResult<()>;
    fn delete_tag(&self, id: &str) -> AppResult<()>;
    fn tag_note(&self, note_id: &str, tag_id: &str) -> AppResult<()>;
    fn untag_note(&self, note_id: &str, tag_id: &str) -> AppResult<()>;

    fn search_notes(&self, query: &str, limit: i64) -> AppResult<Vec<SearchHit>>;
    fn import_data(&self, folders: &[FolderRecord], notes: &[NoteRecord]) -> AppResult<()>;
    fn export_backup(&self, backups_dir: &Path) -> AppResult<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    db: Arc<Database>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> AppResult<Self> {
        Ok(Self {
            db: Arc::new(Database::new(path)?),
        })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }
}

impl StoreClient for SqliteStore {
    fn sync_token(&self) -> AppResult<i64> {
        self.db.sync_token()
    }

    fn snapshot(&self, mode: LoadMode) -> AppResult<StoreSnapshot> {
        self.db.snapshot(mode)
    }

    fn list_folders(&self) -> AppResult<Vec<Folder>> {
        self.db.list_folders()
    }

    fn list_notes(&self, mode: LoadMode) -> AppResult<Vec<Note>> {
        self.db.list_notes(mode)
    }

    fn list_tags(&self) -> AppResult<Vec<Tag>> {
        self.db.list_tags()
    }

    fn list_note_tags(&self) -> AppResult<Vec<NoteTag>> {
        self.db.list_note_tags()
    }

    fn note_body(&self, id: &str) -> AppResult<String> {
        self.db.note_body(id)
    }

    fn create_folder(&self, folder: &Folder) -> AppResult<()> {
        self.db.create_folder(folder)
    }

    fn rename_folder(&self, id: &str, name: &str) -> AppResult<()> {
        self.db.rename_folder(id, name).map(|_| ())
    }

    fn move_folder(&self, id: &str, parent_id: Option<&str>) -> AppResult<()> {
        self.db.move_folder(id, parent_id)
    }

    fn delete_folder(&self, id: &str) -> AppResult<()> {
        self.db.delete_folder(id)
    }

    fn create_note(&self, note: &Note) -> AppResult<()> {
        self.db.create_note(note)
    }

    fn update_note(&self, update: &NoteUpdate) -> AppResult<NoteWriteReceipt> {
        self.db.update_note(update)
    }

    fn delete_note(&self, id: &str, expected_updated_at: Option<i64>) -> AppResult<()> {
        self.db.delete_note(id, expected_updated_at)
    }

    fn move_note(&self, id: &str, folder_id: &str, sort_order: i32) -> AppResult<()> {
        self.db.move_note(id, folder_id, sort_order)
    }

    fn set_note_pinned(&self, id: &str, pinned: bool) -> AppResult<()> {
        self.db.set_note_pinned(id, pinned)
    }

    fn set_note_starred(&self, id: &str, starred: bool) -> AppResult<()> {
        self.db.set_note_starred(id, starred)
    }

    fn reorder_notes(&self, updates: &[(String, i32)]) -> AppResult<()> {
        self.db.reorder_notes(updates)
    }

    fn create_tag(&self, tag: &Tag) -> AppResult<()> {
        self.db.create_tag(tag)
    }

    fn delete_tag(&self, id: &str) -> AppResult<()> {
        self.db.delete_tag(id)
    }

    fn tag_note(&self, note_id: &str, tag_id: &str) -> AppResult<()> {
        self.db.tag_note(note_id, tag_id)
    }

    fn untag_note(&self, note_id: &str, tag_id: &str) -> AppResult<()> {
        self.db.untag_note(note_id, tag_id)
    }

    fn search_notes(&self, query: &str, limit: i64) -> AppResult<Vec<SearchHit>> {
        self.db.search_notes(query, limit)
    }

    fn import_data(&self, folders: &[FolderRecord], notes: &[NoteRecord]) -> AppResult<()> {
        self.db.import_data(folders, notes)
    }

    fn export_backup(&self, backups_dir: &Path) -> AppResult<PathBuf> {
        self.db.export_backup(backups_dir)
    }
}
