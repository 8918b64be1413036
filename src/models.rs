use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

/// A note as held by the cache. `body` is `None` until it has been fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    pub folder_id: String,
    pub title: String,
    pub body: Option<String>,
    #[serde(default)]
    pub preview: String,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub starred: bool,
    #[serde(default)]
    pub sort_order: i32,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: String,
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteTag {
    pub note_id: String,
    pub tag_id: String,
}

#[derive(Debug, Clone)]
pub enum Entity {
    Folder(Folder),
    Note(Note),
    Tag(Tag),
}

#[derive(Debug, Clone, Copy)]
pub enum EntityRef<'a> {
    Folder(&'a Folder),
    Note(&'a Note),
    Tag(&'a Tag),
}

/// Fields the coalescer persists for a note. `body: None` leaves the stored body untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteFields {
    pub title: String,
    pub body: Option<String>,
    pub updated_at: i64,
}

impl NoteFields {
    pub fn same_content(&self, other: &NoteFields) -> bool {
        self.title == other.title && (self.body.is_none() || self.body == other.body)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteUpdate {
    pub id: String,
    pub title: Option<String>,
    pub body: Option<String>,
    pub updated_at: i64,
    pub expected_updated_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoteWriteReceipt {
    pub updated_at: i64,
    pub sync_token_before: i64,
    pub sync_token: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortMode {
    #[default]
    Manual,
    UpdatedDesc,
    CreatedDesc,
    TitleAsc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadMode {
    Full,
    Metadata,
}

/// Everything the store holds, used for bulk replacement of the cache.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub folders: Vec<Folder>,
    pub notes: Vec<Note>,
    pub tags: Vec<Tag>,
    pub note_tags: Vec<NoteTag>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub folder_id: Option<String>,
    pub note_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SearchHit {
    pub id: String,
    pub folder_id: String,
    pub title: String,
    pub preview: String,
    pub updated_at: i64,
    pub folder_name: String,
}

/// Portable folder/note rows used by import and backup export.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FolderRecord {
    pub id: String,
    pub name: String,
    pub created_at: i64,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NoteRecord {
    pub id: String,
    pub folder_id: String,
    pub title: String,
    pub body: String,
    pub created_at: i64,
    pub updated_at: i64,
    // Older exports predate these columns.
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub starred: bool,
    #[serde(default)]
    pub sort_order: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupDocument {
    pub version: String,
    pub exported_at: i64,
    pub folders: Vec<FolderRecord>,
    pub notes: Vec<NoteRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeReason {
    LocalEdit,
    Reconciled,
    Imported,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataChanged {
    pub reason: ChangeReason,
    pub sync_token: Option<i64>,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Store identifiers are ASCII alphanumeric so they are safe to pass around unquoted.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn is_safe_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric())
}
