use crate::errors::{AppError, AppResult};
use crate::models::{
    generate_id, now_ms, BackupDocument, Folder, FolderRecord, LoadMode, Note, NoteRecord, NoteTag, NoteUpdate,
    NoteWriteReceipt, SearchHit, StoreSnapshot, Tag,
};
use crate::text::{derive_preview, DEFAULT_PREVIEW_CHARS};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const SCHEMA_VERSION: i32 = 1;
const INBOX_NAME: &str = "Inbox";
// Raw prefix fetched for previews; markdown stripping shrinks it.
const PREVIEW_SOURCE_CHARS: usize = DEFAULT_PREVIEW_CHARS * 2;
const NOTE_COLUMNS: &str = "n.id, n.folder_id, n.title, n.pinned, n.starred, n.sort_order, n.created_at, n.updated_at";

#[derive(Debug, Clone, Serialize)]
pub struct CreatedNote {
    pub id: String,
    pub folder_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NoteDetail {
    pub id: String,
    pub folder_id: String,
    pub title: String,
    pub body: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub pinned: bool,
    pub starred: bool,
    pub sort_order: i32,
    pub folder_name: String,
}

/// The canonical store shared by the long-lived app and the bridge.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version < SCHEMA_VERSION {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Short-lived writers wait briefly on WAL contention instead of failing.
    pub fn set_busy_timeout(&self, timeout: Duration) -> AppResult<()> {
        self.lock()?.busy_timeout(timeout)?;
        Ok(())
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    pub fn sync_token(&self) -> AppResult<i64> {
        let conn = self.lock()?;
        read_sync_token(&conn)
    }

    // ─── Bulk reads ─────────────────────────────────────────────────────────

    pub fn snapshot(&self, mode: LoadMode) -> AppResult<StoreSnapshot> {
        let mut conn = self.lock()?;
        // One read transaction so the four lists describe the same store state.
        let tx = conn.transaction()?;
        let snapshot = StoreSnapshot {
            folders: query_folders(&tx)?,
            notes: query_notes(&tx, mode)?,
            tags: query_tags(&tx)?,
            note_tags: query_note_tags(&tx)?,
        };
        tx.commit()?;
        Ok(snapshot)
    }

    pub fn list_folders(&self) -> AppResult<Vec<Folder>> {
        let conn = self.lock()?;
        query_folders(&conn)
    }

    pub fn list_notes(&self, mode: LoadMode) -> AppResult<Vec<Note>> {
        let conn = self.lock()?;
        query_notes(&conn, mode)
    }

    pub fn list_tags(&self) -> AppResult<Vec<Tag>> {
        let conn = self.lock()?;
        query_tags(&conn)
    }

    pub fn list_note_tags(&self) -> AppResult<Vec<NoteTag>> {
        let conn = self.lock()?;
        query_note_tags(&conn)
    }

    pub fn note_body(&self, id: &str) -> AppResult<String> {
        let conn = self.lock()?;
        conn.query_row("SELECT body FROM notes WHERE id = ?1", [id], |row| row.get(0))
            .optional()?
            .ok_or_else(|| AppError::NotFound("note not found".to_string()))
    }

    pub fn note_detail(&self, id: &str) -> AppResult<NoteDetail> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT n.id, n.folder_id, n.title, n.body, n.created_at, n.updated_at, n.pinned, n.starred,
                    n.sort_order, COALESCE(f.name, '')
             FROM notes n
             LEFT JOIN folders f ON f.id = n.folder_id
             WHERE n.id = ?1",
            [id],
            |row| {
                Ok(NoteDetail {
                    id: row.get(0)?,
                    folder_id: row.get(1)?,
                    title: row.get(2)?,
                    body: row.get(3)?,
                    created_at: row.get(4)?,
                    updated_at: row.get(5)?,
                    pinned: row.get(6)?,
                    starred: row.get(7)?,
                    sort_order: row.get(8)?,
                    folder_name: row.get(9)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| AppError::NotFound("note not found".to_string()))
    }

    // ─── Folders ────────────────────────────────────────────────────────────

    pub fn create_folder(&self, folder: &Folder) -> AppResult<()> {
        let conn = self.lock()?;
        if let Some(parent_id) = &folder.parent_id {
            ensure_folder_exists(&conn, parent_id)?;
        }
        conn.execute(
            "INSERT INTO folders (id, name, parent_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![folder.id, folder.name, folder.parent_id, folder.created_at, folder.updated_at],
        )
        .map_err(map_constraint)?;
        Ok(())
    }

    pub fn rename_folder(&self, id: &str, name: &str) -> AppResult<i64> {
        let conn = self.lock()?;
        let now = now_ms();
        let rows = conn
            .execute(
                "UPDATE folders SET name = ?1, updated_at = ?2 WHERE id = ?3",
                params![name, now, id],
            )
            .map_err(map_constraint)?;
        if rows == 0 {
            return Err(AppError::NotFound("folder not found".to_string()));
        }
        Ok(now)
    }

    pub fn move_folder(&self, id: &str, parent_id: Option<&str>) -> AppResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_folder_exists(&tx, id)?;
        if let Some(parent_id) = parent_id {
            ensure_folder_exists(&tx, parent_id)?;
            let mut cursor = Some(parent_id.to_string());
            while let Some(current) = cursor {
                if current == id {
                    return Err(AppError::Validation("folder cannot be moved into its own subtree".to_string()));
                }
                cursor = tx
                    .query_row("SELECT parent_id FROM folders WHERE id = ?1", [&current], |row| {
                        row.get::<_, Option<String>>(0)
                    })
                    .optional()?
                    .flatten();
            }
        }
        tx.execute(
            "UPDATE folders SET parent_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![parent_id, now_ms(), id],
        )
        .map_err(map_constraint)?;
        tx.commit()?;
        Ok(())
    }

    /// Child folders and every note beneath them go through ON DELETE CASCADE.
    pub fn delete_folder(&self, id: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM folders WHERE id = ?1", [id])?;
        Ok(())
    }

    pub fn ensure_inbox(&self) -> AppResult<String> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let lookup = "SELECT id FROM folders WHERE name = ?1 AND parent_id IS NULL ORDER BY created_at ASC LIMIT 1";

        let existing: Option<String> = tx.query_row(lookup, [INBOX_NAME], |row| row.get(0)).optional()?;
        if let Some(id) = existing {
            tx.commit()?;
            return Ok(id);
        }

        let created_at = now_ms();
        tx.execute(
            "INSERT OR IGNORE INTO folders (id, name, parent_id, created_at, updated_at) VALUES (?1, ?2, NULL, ?3, ?3)",
            params![generate_id(), INBOX_NAME, created_at],
        )?;
        // Another writer may have won the race between the lookup and the insert.
        let id: String = tx.query_row(lookup, [INBOX_NAME], |row| row.get(0))?;
        tx.commit()?;
        Ok(id)
    }

    // ─── Notes ──────────────────────────────────────────────────────────────

    /// Inserts a note; a new unpinned note at order 0 pushes the rest of its group down.
    pub fn create_note(&self, note: &Note) -> AppResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_folder_exists(&tx, &note.folder_id)?;
        if !note.pinned {
            tx.execute(
                "UPDATE notes SET sort_order = sort_order + 1 WHERE folder_id = ?1 AND pinned = 0 AND sort_order >= ?2",
                params![note.folder_id, note.sort_order],
            )?;
        }
        tx.execute(
            "INSERT INTO notes (id, folder_id, title, body, pinned, starred, sort_order, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                note.id,
                note.folder_id,
                note.title,
                note.body.as_deref().unwrap_or_default(),
                note.pinned,
                note.starred,
                note.sort_order,
                note.created_at,
                note.updated_at
            ],
        )
        .map_err(map_constraint)?;
        tx.commit()?;
        Ok(())
    }

    /// Creates a note for the bridge, defaulting to the inbox folder.
    pub fn create_note_in(&self, folder_id: Option<&str>, title: &str, body: &str) -> AppResult<CreatedNote> {
        let folder_id = match folder_id {
            Some(id) => id.to_string(),
            None => self.ensure_inbox()?,
        };
        let now = now_ms();
        let note = Note {
            id: generate_id(),
            folder_id: folder_id.clone(),
            title: title.to_string(),
            body: Some(body.to_string()),
            preview: String::new(),
            pinned: false,
            starred: false,
            sort_order: 0,
            created_at: now,
            updated_at: now,
        };
        self.create_note(&note)?;
        Ok(CreatedNote {
            id: note.id,
            folder_id,
            created_at: now,
            updated_at: now,
        })
    }

    /// Rejects the write with `Conflict` when the stored `updated_at` is newer than the
    /// caller's expected prior value (or, without one, newer than the new value).
    pub fn update_note(&self, update: &NoteUpdate) -> AppResult<NoteWriteReceipt> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let sync_token_before = read_sync_token(&tx)?;
        let stored = stored_updated_at(&tx, &update.id)?;
        let believed = update.expected_updated_at.unwrap_or(update.updated_at);
        if stored > believed {
            return Err(AppError::Conflict("stale note update rejected".to_string()));
        }

        let committed = update.updated_at.max(stored + 1);
        tx.execute(
            "UPDATE notes SET title = COALESCE(?1, title), body = COALESCE(?2, body), updated_at = ?3 WHERE id = ?4",
            params![update.title, update.body, committed, update.id],
        )?;
        let sync_token = read_sync_token(&tx)?;
        tx.commit()?;
        Ok(NoteWriteReceipt {
            updated_at: committed,
            sync_token_before,
            sync_token,
        })
    }

    pub fn delete_note(&self, id: &str, expected_updated_at: Option<i64>) -> AppResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stored = stored_updated_at(&tx, id)?;
        if let Some(expected) = expected_updated_at {
            if stored > expected {
                return Err(AppError::Conflict("stale note delete rejected".to_string()));
            }
        }
        tx.execute("DELETE FROM notes WHERE id = ?1", [id])?;
        tx.commit()?;
        Ok(())
    }

    pub fn move_note(&self, id: &str, folder_id: &str, sort_order: i32) -> AppResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_folder_exists(&tx, folder_id)?;
        let rows = tx.execute(
            "UPDATE notes SET folder_id = ?1, sort_order = ?2 WHERE id = ?3",
            params![folder_id, sort_order, id],
        )?;
        if rows == 0 {
            return Err(AppError::NotFound("note not found".to_string()));
        }
        tx.commit()?;
        Ok(())
    }

    pub fn set_note_pinned(&self, id: &str, pinned: bool) -> AppResult<()> {
        self.set_note_flag(id, "pinned", pinned)
    }

    pub fn set_note_starred(&self, id: &str, starred: bool) -> AppResult<()> {
        self.set_note_flag(id, "starred", starred)
    }

    fn set_note_flag(&self, id: &str, column: &'static str, value: bool) -> AppResult<()> {
        let conn = self.lock()?;
        let rows = conn.execute(&format!("UPDATE notes SET {} = ?1 WHERE id = ?2", column), params![value, id])?;
        if rows == 0 {
            return Err(AppError::NotFound("note not found".to_string()));
        }
        Ok(())
    }

    pub fn reorder_notes(&self, updates: &[(String, i32)]) -> AppResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE notes SET sort_order = ?1 WHERE id = ?2")?;
            for (id, order) in updates {
                stmt.execute(params![order, id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn search_notes(&self, query: &str, limit: i64) -> AppResult<Vec<SearchHit>> {
        let query = query.trim();
        let limit = limit.clamp(1, 200);
        let conn = self.lock()?;
        let select = "SELECT n.id, n.folder_id, n.title, substr(n.body, 1, ?2), n.updated_at, COALESCE(f.name, '')";

        if query.is_empty() {
            let sql = format!(
                "{} FROM notes n LEFT JOIN folders f ON f.id = n.folder_id ORDER BY n.updated_at DESC LIMIT ?1",
                select
            );
            let mut stmt = conn.prepare(&sql)?;
            let hits = stmt
                .query_map(params![limit, PREVIEW_SOURCE_CHARS as i64], row_to_hit)?
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(hits);
        }

        let fts_sql = format!(
            "{} FROM notes_fts nf JOIN notes n ON n.rowid = nf.rowid LEFT JOIN folders f ON f.id = n.folder_id
             WHERE notes_fts MATCH ?3 ORDER BY rank LIMIT ?1",
            select
        );
        let fts_hits = conn.prepare(&fts_sql).and_then(|mut stmt| {
            let hits = stmt
                .query_map(params![limit, PREVIEW_SOURCE_CHARS as i64, query], row_to_hit)?
                .collect::<Result<Vec<_>, _>>();
            hits
        });

        match fts_hits {
            Ok(hits) => Ok(hits),
            Err(error) => {
                // Free-form input is often not valid FTS syntax.
                tracing::debug!(query = %query, error = %error, "fts query failed; using LIKE fallback");
                let like = format!("%{}%", escape_like(query));
                let sql = format!(
                    "{} FROM notes n LEFT JOIN folders f ON f.id = n.folder_id
                     WHERE n.title LIKE ?3 ESCAPE '\\' OR n.body LIKE ?3 ESCAPE '\\'
                     ORDER BY n.updated_at DESC LIMIT ?1",
                    select
                );
                let mut stmt = conn.prepare(&sql)?;
                let hits = stmt
                    .query_map(params![limit, PREVIEW_SOURCE_CHARS as i64, like], row_to_hit)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(hits)
            }
        }
    }

    // ─── Tags ───────────────────────────────────────────────────────────────

    pub fn create_tag(&self, tag: &Tag) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tags (id, name, color) VALUES (?1, ?2, ?3)",
            params![tag.id, tag.name, tag.color],
        )
        .map_err(map_constraint)?;
        Ok(())
    }

    pub fn delete_tag(&self, id: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM tags WHERE id = ?1", [id])?;
        Ok(())
    }

    pub fn tag_note(&self, note_id: &str, tag_id: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO note_tags (note_id, tag_id) VALUES (?1, ?2)",
            params![note_id, tag_id],
        )
        .map_err(map_constraint)?;
        Ok(())
    }

    pub fn untag_note(&self, note_id: &str, tag_id: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM note_tags WHERE note_id = ?1 AND tag_id = ?2",
            params![note_id, tag_id],
        )?;
        Ok(())
    }

    // ─── Import / export ────────────────────────────────────────────────────

    pub fn import_data(&self, folders: &[FolderRecord], notes: &[NoteRecord]) -> AppResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        // Parents first so the foreign key holds regardless of input order.
        let mut pending: Vec<&FolderRecord> = folders.iter().collect();
        while !pending.is_empty() {
            let before = pending.len();
            let mut deferred = Vec::new();
            for folder in pending {
                let parent_ready = match &folder.parent_id {
                    None => true,
                    Some(parent_id) => {
                        tx.query_row("SELECT COUNT(1) FROM folders WHERE id = ?1", [parent_id], |row| {
                            row.get::<_, i64>(0)
                        })? > 0
                    }
                };
                if !parent_ready {
                    deferred.push(folder);
                    continue;
                }
                let updated_at = if folder.updated_at != 0 { folder.updated_at } else { folder.created_at };
                tx.execute(
                    "INSERT OR IGNORE INTO folders (id, name, parent_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![folder.id, folder.name, folder.parent_id, folder.created_at, updated_at],
                )?;
            }
            if deferred.len() == before {
                return Err(AppError::Validation(format!(
                    "{} imported folders reference missing parents",
                    deferred.len()
                )));
            }
            pending = deferred;
        }
        for note in notes {
            tx.execute(
                "INSERT OR IGNORE INTO notes (id, folder_id, title, body, pinned, starred, sort_order, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    note.id,
                    note.folder_id,
                    note.title,
                    note.body,
                    note.pinned,
                    note.starred,
                    note.sort_order,
                    note.created_at,
                    note.updated_at
                ],
            )
            .map_err(map_constraint)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn export_backup(&self, backups_dir: &Path) -> AppResult<PathBuf> {
        let document = {
            let conn = self.lock()?;
            let folders = query_folders(&conn)?
                .into_iter()
                .map(|folder| FolderRecord {
                    id: folder.id,
                    name: folder.name,
                    created_at: folder.created_at,
                    parent_id: folder.parent_id,
                    updated_at: folder.updated_at,
                })
                .collect();
            let notes = query_notes(&conn, LoadMode::Full)?
                .into_iter()
                .map(|note| NoteRecord {
                    id: note.id,
                    folder_id: note.folder_id,
                    title: note.title,
                    body: note.body.unwrap_or_default(),
                    created_at: note.created_at,
                    updated_at: note.updated_at,
                    pinned: note.pinned,
                    starred: note.starred,
                    sort_order: note.sort_order,
                })
                .collect();
            BackupDocument {
                version: "1.0".to_string(),
                exported_at: now_ms(),
                folders,
                notes,
            }
        };

        fs::create_dir_all(backups_dir)?;
        let filename = format!("notesync-backup-{}.json", chrono::Local::now().format("%Y%m%d-%H%M%S"));
        let file_path = backups_dir.join(filename);
        fs::write(&file_path, serde_json::to_string_pretty(&document)?)?;
        Ok(file_path)
    }
}

fn read_sync_token(conn: &Connection) -> AppResult<i64> {
    Ok(conn.query_row("SELECT token FROM sync_state WHERE id = 1", [], |row| row.get(0))?)
}

fn stored_updated_at(conn: &Connection, id: &str) -> AppResult<i64> {
    conn.query_row("SELECT updated_at FROM notes WHERE id = ?1", [id], |row| row.get(0))
        .optional()?
        .ok_or_else(|| AppError::NotFound("note not found".to_string()))
}

fn ensure_folder_exists(conn: &Connection, id: &str) -> AppResult<()> {
    let count: i64 = conn.query_row("SELECT COUNT(1) FROM folders WHERE id = ?1", [id], |row| row.get(0))?;
    if count == 0 {
        return Err(AppError::Validation("folder not found".to_string()));
    }
    Ok(())
}

fn query_folders(conn: &Connection) -> AppResult<Vec<Folder>> {
    let mut stmt = conn.prepare("SELECT id, name, parent_id, created_at, updated_at FROM folders ORDER BY created_at")?;
    let folders = stmt
        .query_map([], |row| {
            Ok(Folder {
                id: row.get(0)?,
                name: row.get(1)?,
                parent_id: row.get(2)?,
                created_at: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(folders)
}

fn query_notes(conn: &Connection, mode: LoadMode) -> AppResult<Vec<Note>> {
    let body_column = match mode {
        LoadMode::Full => "n.body".to_string(),
        LoadMode::Metadata => format!("substr(n.body, 1, {})", PREVIEW_SOURCE_CHARS),
    };
    let sql = format!("SELECT {}, {} FROM notes n", NOTE_COLUMNS, body_column);
    let mut stmt = conn.prepare(&sql)?;
    let notes = stmt
        .query_map([], |row| {
            let body_or_prefix: String = row.get(8)?;
            let preview = derive_preview(&body_or_prefix, DEFAULT_PREVIEW_CHARS);
            Ok(Note {
                id: row.get(0)?,
                folder_id: row.get(1)?,
                title: row.get(2)?,
                pinned: row.get(3)?,
                starred: row.get(4)?,
                sort_order: row.get(5)?,
                created_at: row.get(6)?,
                updated_at: row.get(7)?,
                body: match mode {
                    LoadMode::Full => Some(body_or_prefix),
                    LoadMode::Metadata => None,
                },
                preview,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(notes)
}

fn query_tags(conn: &Connection) -> AppResult<Vec<Tag>> {
    let mut stmt = conn.prepare("SELECT id, name, color FROM tags ORDER BY name")?;
    let tags = stmt
        .query_map([], |row| {
            Ok(Tag {
                id: row.get(0)?,
                name: row.get(1)?,
                color: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tags)
}

fn query_note_tags(conn: &Connection) -> AppResult<Vec<NoteTag>> {
    let mut stmt = conn.prepare("SELECT note_id, tag_id FROM note_tags")?;
    let links = stmt
        .query_map([], |row| {
            Ok(NoteTag {
                note_id: row.get(0)?,
                tag_id: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(links)
}

fn row_to_hit(row: &Row<'_>) -> rusqlite::Result<SearchHit> {
    let prefix: String = row.get(3)?;
    Ok(SearchHit {
        id: row.get(0)?,
        folder_id: row.get(1)?,
        title: row.get(2)?,
        preview: derive_preview(&prefix, DEFAULT_PREVIEW_CHARS),
        updated_at: row.get(4)?,
        folder_name: row.get(5)?,
    })
}

fn escape_like(input: &str) -> String {
    input.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn map_constraint(error: rusqlite::Error) -> AppError {
    match &error {
        rusqlite::Error::SqliteFailure(inner, _) if inner.code == rusqlite::ErrorCode::ConstraintViolation => {
            AppError::Validation(error.to_string())
        }
        _ => AppError::from(error),
    }
}

#[cfg(test)]
mod tests {
    use super::Database;
    use crate::errors::AppError;
    use crate::models::{Folder, LoadMode, Note, NoteRecord, NoteUpdate, FolderRecord, Tag};

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("test.db")).expect("db");
        (dir, db)
    }

    fn folder(id: &str, parent_id: Option<&str>) -> Folder {
        Folder {
            id: id.to_string(),
            name: format!("folder {}", id),
            parent_id: parent_id.map(ToString::to_string),
            created_at: 1,
            updated_at: 1,
        }
    }

    fn note(id: &str, folder_id: &str, updated_at: i64) -> Note {
        Note {
            id: id.to_string(),
            folder_id: folder_id.to_string(),
            title: format!("title {}", id),
            body: Some(format!("# body of {}", id)),
            preview: String::new(),
            pinned: false,
            starred: false,
            sort_order: 0,
            created_at: updated_at,
            updated_at,
        }
    }

    #[test]
    fn every_committed_write_advances_sync_token() {
        let (_dir, db) = open();
        let start = db.sync_token().expect("token");
        db.create_folder(&folder("f1", None)).expect("folder");
        let after_folder = db.sync_token().expect("token");
        assert!(after_folder > start);

        db.create_note(&note("n1", "f1", 10)).expect("note");
        let after_note = db.sync_token().expect("token");
        assert!(after_note > after_folder);

        db.set_note_starred("n1", true).expect("star");
        assert!(db.sync_token().expect("token") > after_note);
    }

    #[test]
    fn update_with_stale_expected_timestamp_is_a_conflict() {
        let (_dir, db) = open();
        db.create_folder(&folder("f1", None)).expect("folder");
        db.create_note(&note("n1", "f1", 100)).expect("note");

        let receipt = db
            .update_note(&NoteUpdate {
                id: "n1".to_string(),
                title: Some("external".to_string()),
                body: None,
                updated_at: 200,
                expected_updated_at: Some(100),
            })
            .expect("first update");
        assert_eq!(receipt.updated_at, 200);
        assert!(receipt.sync_token > receipt.sync_token_before);

        let stale = db.update_note(&NoteUpdate {
            id: "n1".to_string(),
            title: Some("local".to_string()),
            body: None,
            updated_at: 300,
            expected_updated_at: Some(100),
        });
        assert!(matches!(stale, Err(AppError::Conflict(_))));

        let detail = db.note_detail("n1").expect("detail");
        assert_eq!(detail.title, "external");
        assert_eq!(detail.body, "# body of n1");
    }

    #[test]
    fn update_of_missing_note_is_not_found() {
        let (_dir, db) = open();
        let result = db.update_note(&NoteUpdate {
            id: "missing".to_string(),
            title: None,
            body: None,
            updated_at: 1,
            expected_updated_at: None,
        });
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[test]
    fn deleting_folder_cascades_to_subtree() {
        let (_dir, db) = open();
        db.create_folder(&folder("root", None)).expect("root");
        db.create_folder(&folder("child", Some("root"))).expect("child");
        db.create_folder(&folder("grandchild", Some("child"))).expect("grandchild");
        db.create_note(&note("n1", "child", 1)).expect("n1");
        db.create_note(&note("n2", "grandchild", 1)).expect("n2");

        db.delete_folder("root").expect("delete");
        let snapshot = db.snapshot(LoadMode::Metadata).expect("snapshot");
        assert!(snapshot.folders.is_empty());
        assert!(snapshot.notes.is_empty());
    }

    #[test]
    fn move_folder_rejects_cycles() {
        let (_dir, db) = open();
        db.create_folder(&folder("a", None)).expect("a");
        db.create_folder(&folder("b", Some("a"))).expect("b");
        let result = db.move_folder("a", Some("b"));
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn ensure_inbox_is_idempotent() {
        let (_dir, db) = open();
        let first = db.ensure_inbox().expect("inbox");
        let second = db.ensure_inbox().expect("inbox again");
        assert_eq!(first, second);
        assert_eq!(db.list_folders().expect("folders").len(), 1);
    }

    #[test]
    fn new_unpinned_note_goes_first_in_its_group() {
        let (_dir, db) = open();
        let inbox = db.ensure_inbox().expect("inbox");
        let first = db.create_note_in(Some(&inbox), "first", "").expect("first");
        let second = db.create_note_in(None, "second", "").expect("second");
        assert_eq!(second.folder_id, inbox);

        let notes = db.list_notes(LoadMode::Metadata).expect("notes");
        let order_of = |id: &str| notes.iter().find(|note| note.id == id).map(|note| note.sort_order);
        assert_eq!(order_of(&second.id), Some(0));
        assert_eq!(order_of(&first.id), Some(1));
    }

    #[test]
    fn metadata_load_omits_body_but_keeps_preview() {
        let (_dir, db) = open();
        db.create_folder(&folder("f1", None)).expect("folder");
        db.create_note(&note("n1", "f1", 1)).expect("note");
        let notes = db.list_notes(LoadMode::Metadata).expect("notes");
        assert_eq!(notes[0].body, None);
        assert_eq!(notes[0].preview, "body of n1");
        assert_eq!(db.note_body("n1").expect("body"), "# body of n1");
    }

    #[test]
    fn search_falls_back_to_like_on_bad_fts_syntax() {
        let (_dir, db) = open();
        db.create_folder(&folder("f1", None)).expect("folder");
        let mut tricky = note("n1", "f1", 1);
        tricky.body = Some("price is 50% off \"today".to_string());
        db.create_note(&tricky).expect("note");

        let hits = db.search_notes("50% off \"", 10).expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].folder_name, "folder f1");

        let all = db.search_notes("", 10).expect("recent");
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn deleting_tag_removes_associations() {
        let (_dir, db) = open();
        db.create_folder(&folder("f1", None)).expect("folder");
        db.create_note(&note("n1", "f1", 1)).expect("note");
        db.create_tag(&Tag {
            id: "t1".to_string(),
            name: "work".to_string(),
            color: "#ff0000".to_string(),
        })
        .expect("tag");
        db.tag_note("n1", "t1").expect("link");
        assert_eq!(db.snapshot(LoadMode::Metadata).expect("snapshot").note_tags.len(), 1);

        db.delete_tag("t1").expect("delete tag");
        let snapshot = db.snapshot(LoadMode::Metadata).expect("snapshot");
        assert!(snapshot.tags.is_empty());
        assert!(snapshot.note_tags.is_empty());
    }

    #[test]
    fn import_orders_parents_before_children_and_export_round_trips() {
        let (dir, db) = open();
        let folders = vec![
            FolderRecord {
                id: "child".to_string(),
                name: "child".to_string(),
                created_at: 2,
                parent_id: Some("root".to_string()),
                updated_at: 0,
            },
            FolderRecord {
                id: "root".to_string(),
                name: "root".to_string(),
                created_at: 1,
                parent_id: None,
                updated_at: 0,
            },
        ];
        let notes = vec![NoteRecord {
            id: "n1".to_string(),
            folder_id: "child".to_string(),
            title: "imported".to_string(),
            body: "text".to_string(),
            created_at: 5,
            updated_at: 5,
            pinned: false,
            starred: false,
            sort_order: 0,
        }];
        db.import_data(&folders, &notes).expect("import");

        let path = db.export_backup(&dir.path().join("backups")).expect("export");
        let raw = std::fs::read_to_string(path).expect("read backup");
        let parsed: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(parsed["folders"].as_array().map(Vec::len), Some(2));
        assert_eq!(parsed["notes"][0]["body"], "text");
        assert_eq!(parsed["folders"][0]["updated_at"], 1);
    }
}
