use crate::errors::{AppError, AppResult};
use crate::models::{Entity, EntityRef, Folder, Note, NoteTag, SortMode, StoreSnapshot, Tag};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// In-memory copy of the store, keyed by id, with relation indexes.
///
/// Incremental mutations (`upsert`, `remove`, `link_tag`, `unlink_tag`) keep the
/// indexes current on their own. `rebuild_indexes` is only for bulk replacement.
#[derive(Debug, Default)]
pub struct EntityCache {
    folders: HashMap<String, Folder>,
    notes: HashMap<String, Note>,
    tags: HashMap<String, Tag>,
    children_by_parent: HashMap<Option<String>, HashSet<String>>,
    notes_by_folder: HashMap<String, HashSet<String>>,
    notes_by_tag: HashMap<String, HashSet<String>>,
    tags_by_note: HashMap<String, HashSet<String>>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut cache = Self::new();
        cache.replace_all(snapshot);
        cache
    }

    pub fn get(&self, id: &str) -> Option<EntityRef<'_>> {
        if let Some(folder) = self.folders.get(id) {
            return Some(EntityRef::Folder(folder));
        }
        if let Some(note) = self.notes.get(id) {
            return Some(EntityRef::Note(note));
        }
        self.tags.get(id).map(EntityRef::Tag)
    }

    pub fn folder(&self, id: &str) -> Option<&Folder> {
        self.folders.get(id)
    }

    pub fn note(&self, id: &str) -> Option<&Note> {
        self.notes.get(id)
    }

    pub fn tag(&self, id: &str) -> Option<&Tag> {
        self.tags.get(id)
    }

    pub fn folders(&self) -> impl Iterator<Item = &Folder> {
        self.folders.values()
    }

    pub fn notes(&self) -> impl Iterator<Item = &Note> {
        self.notes.values()
    }

    pub fn tags(&self) -> impl Iterator<Item = &Tag> {
        self.tags.values()
    }

    pub fn note_tags(&self) -> Vec<NoteTag> {
        self.tags_by_note
            .iter()
            .flat_map(|(note_id, tag_ids)| {
                tag_ids.iter().map(move |tag_id| NoteTag {
                    note_id: note_id.clone(),
                    tag_id: tag_id.clone(),
                })
            })
            .collect()
    }

    /// Inserts or replaces an entity. A note must point at a cached folder and a
    /// folder's parent must be cached, otherwise nothing changes.
    pub fn upsert(&mut self, entity: Entity) -> AppResult<()> {
        match entity {
            Entity::Folder(folder) => {
                if let Some(parent_id) = &folder.parent_id {
                    if !self.folders.contains_key(parent_id) {
                        return Err(AppError::Validation(format!("parent folder '{}' is not cached", parent_id)));
                    }
                }
                if let Some(previous) = self.folders.get(&folder.id) {
                    if previous.parent_id != folder.parent_id {
                        let old_parent = previous.parent_id.clone();
                        remove_from_index(&mut self.children_by_parent, &old_parent, &folder.id);
                    }
                }
                self.children_by_parent
                    .entry(folder.parent_id.clone())
                    .or_default()
                    .insert(folder.id.clone());
                self.notes_by_folder.entry(folder.id.clone()).or_default();
                self.folders.insert(folder.id.clone(), folder);
            }
            Entity::Note(note) => {
                if !self.folders.contains_key(&note.folder_id) {
                    return Err(AppError::Validation(format!("folder '{}' is not cached", note.folder_id)));
                }
                if let Some(previous) = self.notes.get(&note.id) {
                    if previous.folder_id != note.folder_id {
                        let old_folder = previous.folder_id.clone();
                        remove_from_index(&mut self.notes_by_folder, &old_folder, &note.id);
                    }
                }
                self.notes_by_folder
                    .entry(note.folder_id.clone())
                    .or_default()
                    .insert(note.id.clone());
                self.notes.insert(note.id.clone(), note);
            }
            Entity::Tag(tag) => {
                self.tags.insert(tag.id.clone(), tag);
            }
        }
        Ok(())
    }

    /// Removes an entity and returns every id that left the cache.
    /// Folders take their whole subtree and its notes with them.
    pub fn remove(&mut self, id: &str) -> Vec<String> {
        if self.folders.contains_key(id) {
            let mut doomed = self.descendants_of(id);
            doomed.insert(0, id.to_string());
            let mut removed = Vec::new();
            for folder_id in doomed {
                let note_ids: Vec<String> = self
                    .notes_by_folder
                    .remove(&folder_id)
                    .map(|ids| ids.into_iter().collect())
                    .unwrap_or_default();
                for note_id in note_ids {
                    self.drop_note(&note_id);
                    removed.push(note_id);
                }
                if let Some(folder) = self.folders.remove(&folder_id) {
                    remove_from_index(&mut self.children_by_parent, &folder.parent_id, &folder_id);
                }
                self.children_by_parent.remove(&Some(folder_id.clone()));
                removed.push(folder_id);
            }
            return removed;
        }

        if self.notes.contains_key(id) {
            if let Some(folder_id) = self.notes.get(id).map(|note| note.folder_id.clone()) {
                remove_from_index(&mut self.notes_by_folder, &folder_id, id);
            }
            self.drop_note(id);
            return vec![id.to_string()];
        }

        if self.tags.remove(id).is_some() {
            if let Some(note_ids) = self.notes_by_tag.remove(id) {
                for note_id in note_ids {
                    remove_from_index(&mut self.tags_by_note, &note_id, id);
                }
            }
            return vec![id.to_string()];
        }

        Vec::new()
    }

    fn drop_note(&mut self, note_id: &str) {
        self.notes.remove(note_id);
        if let Some(tag_ids) = self.tags_by_note.remove(note_id) {
            for tag_id in tag_ids {
                remove_from_index(&mut self.notes_by_tag, &tag_id, note_id);
            }
        }
    }

    pub fn link_tag(&mut self, note_id: &str, tag_id: &str) -> AppResult<()> {
        if !self.notes.contains_key(note_id) || !self.tags.contains_key(tag_id) {
            return Err(AppError::Validation("note or tag is not cached".to_string()));
        }
        self.tags_by_note
            .entry(note_id.to_string())
            .or_default()
            .insert(tag_id.to_string());
        self.notes_by_tag
            .entry(tag_id.to_string())
            .or_default()
            .insert(note_id.to_string());
        Ok(())
    }

    pub fn unlink_tag(&mut self, note_id: &str, tag_id: &str) {
        remove_from_index(&mut self.tags_by_note, &note_id.to_string(), tag_id);
        remove_from_index(&mut self.notes_by_tag, &tag_id.to_string(), note_id);
    }

    /// Recomputes every index from the entity maps. O(n); only after bulk replacement.
    pub fn rebuild_indexes(&mut self) {
        self.children_by_parent.clear();
        self.notes_by_folder.clear();

        for folder in self.folders.values() {
            self.children_by_parent
                .entry(folder.parent_id.clone())
                .or_default()
                .insert(folder.id.clone());
            self.notes_by_folder.entry(folder.id.clone()).or_default();
        }
        for note in self.notes.values() {
            self.notes_by_folder
                .entry(note.folder_id.clone())
                .or_default()
                .insert(note.id.clone());
        }

        let notes = &self.notes;
        let tags = &self.tags;
        self.tags_by_note.retain(|note_id, tag_ids| {
            tag_ids.retain(|tag_id| tags.contains_key(tag_id));
            notes.contains_key(note_id) && !tag_ids.is_empty()
        });
        self.notes_by_tag.clear();
        for (note_id, tag_ids) in &self.tags_by_note {
            for tag_id in tag_ids {
                self.notes_by_tag
                    .entry(tag_id.clone())
                    .or_default()
                    .insert(note_id.clone());
            }
        }
    }

    pub fn replace_all(&mut self, snapshot: StoreSnapshot) {
        self.folders = snapshot
            .folders
            .into_iter()
            .map(|folder| (folder.id.clone(), folder))
            .collect();
        self.notes = snapshot.notes.into_iter().map(|note| (note.id.clone(), note)).collect();
        self.tags = snapshot.tags.into_iter().map(|tag| (tag.id.clone(), tag)).collect();
        self.tags_by_note.clear();
        for link in snapshot.note_tags {
            self.tags_by_note.entry(link.note_id).or_default().insert(link.tag_id);
        }
        self.rebuild_indexes();
    }

    /// Direct children of `parent_id` (`None` for roots), by name.
    pub fn children_of(&self, parent_id: Option<&str>) -> Vec<&Folder> {
        let key = parent_id.map(ToString::to_string);
        let mut children: Vec<&Folder> = self
            .children_by_parent
            .get(&key)
            .map(|ids| ids.iter().filter_map(|id| self.folders.get(id)).collect())
            .unwrap_or_default();
        children.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        children
    }

    /// All folders below `folder_id`, parents before children.
    pub fn descendants_of(&self, folder_id: &str) -> Vec<String> {
        let mut result = Vec::new();
        let mut frontier = vec![folder_id.to_string()];
        while let Some(current) = frontier.pop() {
            if let Some(children) = self.children_by_parent.get(&Some(current)) {
                for child in children {
                    result.push(child.clone());
                    frontier.push(child.clone());
                }
            }
        }
        result
    }

    pub fn is_within(&self, folder_id: &str, ancestor_id: &str) -> bool {
        let mut cursor = Some(folder_id);
        while let Some(current) = cursor {
            if current == ancestor_id {
                return true;
            }
            cursor = self.folders.get(current).and_then(|folder| folder.parent_id.as_deref());
        }
        false
    }

    /// Notes of a folder: pinned first, then by the session's sort mode.
    pub fn notes_of(&self, folder_id: &str, sort_mode: SortMode) -> Vec<&Note> {
        let mut notes: Vec<&Note> = self
            .notes_by_folder
            .get(folder_id)
            .map(|ids| ids.iter().filter_map(|id| self.notes.get(id)).collect())
            .unwrap_or_default();
        notes.sort_by(|a, b| compare_notes(a, b, sort_mode));
        notes
    }

    pub fn notes_with_tag(&self, tag_id: &str) -> Vec<&Note> {
        let mut notes: Vec<&Note> = self
            .notes_by_tag
            .get(tag_id)
            .map(|ids| ids.iter().filter_map(|id| self.notes.get(id)).collect())
            .unwrap_or_default();
        notes.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        notes
    }

    pub fn tags_of(&self, note_id: &str) -> Vec<&Tag> {
        let mut tags: Vec<&Tag> = self
            .tags_by_note
            .get(note_id)
            .map(|ids| ids.iter().filter_map(|id| self.tags.get(id)).collect())
            .unwrap_or_default();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        tags
    }

    /// Renumbers one pinned/unpinned group of a folder contiguously from 0.
    ///
    /// `ordered_ids` come first in the given order; remaining members of the group
    /// follow in their current manual order. Ids outside the group are ignored.
    /// Returns the new `(id, sort_order)` of every member.
    pub fn renumber_group(&mut self, folder_id: &str, pinned: bool, ordered_ids: &[String]) -> Vec<(String, i32)> {
        let group: Vec<String> = self
            .notes_of(folder_id, SortMode::Manual)
            .into_iter()
            .filter(|note| note.pinned == pinned)
            .map(|note| note.id.clone())
            .collect();
        let members: HashSet<&str> = group.iter().map(String::as_str).collect();

        let mut seen = HashSet::new();
        let mut sequence = Vec::with_capacity(group.len());
        for id in ordered_ids {
            if members.contains(id.as_str()) && seen.insert(id.clone()) {
                sequence.push(id.clone());
            }
        }
        for id in group {
            if !seen.contains(&id) {
                sequence.push(id);
            }
        }

        let mut updates = Vec::with_capacity(sequence.len());
        for (index, id) in sequence.into_iter().enumerate() {
            let order = index as i32;
            if let Some(note) = self.notes.get_mut(&id) {
                note.sort_order = order;
            }
            updates.push((id, order));
        }
        updates
    }

    /// Makes room at order 0 of a folder's unpinned group.
    pub fn shift_unpinned(&mut self, folder_id: &str) {
        let Some(ids) = self.notes_by_folder.get(folder_id) else {
            return;
        };
        for id in ids {
            if let Some(note) = self.notes.get_mut(id) {
                if !note.pinned {
                    note.sort_order += 1;
                }
            }
        }
    }

    /// Updates fields that do not affect any index.
    pub fn patch_note(&mut self, id: &str, patch: impl FnOnce(&mut Note)) -> bool {
        match self.notes.get_mut(id) {
            Some(note) => {
                let folder_id = note.folder_id.clone();
                patch(&mut *note);
                note.folder_id = folder_id;
                true
            }
            None => false,
        }
    }
}

fn compare_notes(a: &Note, b: &Note, sort_mode: SortMode) -> Ordering {
    b.pinned
        .cmp(&a.pinned)
        .then_with(|| match sort_mode {
            SortMode::Manual => a
                .sort_order
                .cmp(&b.sort_order)
                .then_with(|| b.created_at.cmp(&a.created_at)),
            SortMode::UpdatedDesc => b.updated_at.cmp(&a.updated_at),
            SortMode::CreatedDesc => b.created_at.cmp(&a.created_at),
            SortMode::TitleAsc => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
        })
        .then_with(|| a.id.cmp(&b.id))
}

fn remove_from_index<K>(index: &mut HashMap<K, HashSet<String>>, key: &K, id: &str)
where
    K: std::hash::Hash + Eq,
{
    if let Some(ids) = index.get_mut(key) {
        ids.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::EntityCache;
    use crate::models::{Entity, EntityRef, Folder, Note, NoteTag, SortMode, StoreSnapshot, Tag};

    fn folder(id: &str, parent_id: Option<&str>) -> Folder {
        Folder {
            id: id.to_string(),
            name: id.to_string(),
            parent_id: parent_id.map(ToString::to_string),
            created_at: 1,
            updated_at: 1,
        }
    }

    fn note(id: &str, folder_id: &str, pinned: bool, sort_order: i32) -> Note {
        Note {
            id: id.to_string(),
            folder_id: folder_id.to_string(),
            title: id.to_string(),
            body: None,
            preview: String::new(),
            pinned,
            starred: false,
            sort_order,
            created_at: 1,
            updated_at: 1,
        }
    }

    fn ids(notes: Vec<&Note>) -> Vec<String> {
        notes.into_iter().map(|note| note.id.clone()).collect()
    }

    fn seeded() -> EntityCache {
        EntityCache::from_snapshot(StoreSnapshot {
            folders: vec![folder("f", None), folder("f1", Some("f")), folder("f2", Some("f")), folder("g", None)],
            notes: vec![
                note("a", "f", false, 0),
                note("b", "f", false, 1),
                note("c", "f", false, 2),
                note("p", "f", true, 0),
                note("x", "f1", false, 0),
                note("y", "f2", false, 0),
            ],
            tags: vec![Tag {
                id: "t".to_string(),
                name: "work".to_string(),
                color: "#000000".to_string(),
            }],
            note_tags: vec![NoteTag {
                note_id: "x".to_string(),
                tag_id: "t".to_string(),
            }],
        })
    }

    #[test]
    fn pinned_notes_sort_first_in_every_mode() {
        let cache = seeded();
        for mode in [SortMode::Manual, SortMode::UpdatedDesc, SortMode::CreatedDesc, SortMode::TitleAsc] {
            assert_eq!(cache.notes_of("f", mode)[0].id, "p");
        }
        assert_eq!(ids(cache.notes_of("f", SortMode::Manual)), vec!["p", "a", "b", "c"]);
    }

    #[test]
    fn incremental_upsert_moves_note_between_folders() {
        let mut cache = seeded();
        let mut moved = note("a", "g", false, 0);
        moved.title = "moved".to_string();
        cache.upsert(Entity::Note(moved)).expect("upsert");

        assert!(ids(cache.notes_of("f", SortMode::Manual)).iter().all(|id| id != "a"));
        assert_eq!(ids(cache.notes_of("g", SortMode::Manual)), vec!["a"]);
    }

    #[test]
    fn upsert_rejects_note_with_unknown_folder() {
        let mut cache = seeded();
        assert!(cache.upsert(Entity::Note(note("z", "missing", false, 0))).is_err());
        assert!(cache.get("z").is_none());
    }

    #[test]
    fn removing_folder_cascades_through_subtree() {
        let mut cache = seeded();
        let removed = cache.remove("f");
        for id in ["f", "f1", "f2", "a", "b", "c", "p", "x", "y"] {
            assert!(removed.iter().any(|removed_id| removed_id == id), "missing {}", id);
            assert!(cache.get(id).is_none());
        }
        assert!(cache.notes_with_tag("t").is_empty());
        assert_eq!(cache.children_of(None).len(), 1);
        assert!(matches!(cache.get("g"), Some(EntityRef::Folder(_))));
    }

    #[test]
    fn reorder_renumbers_only_the_affected_group() {
        let mut cache = seeded();
        let updates = cache.renumber_group("f", false, &["c".to_string(), "a".to_string()]);
        assert_eq!(
            updates,
            vec![("c".to_string(), 0), ("a".to_string(), 1), ("b".to_string(), 2)]
        );
        assert_eq!(ids(cache.notes_of("f", SortMode::Manual)), vec!["p", "c", "a", "b"]);
        assert_eq!(cache.note("p").map(|note| note.sort_order), Some(0));
        assert_eq!(cache.note("x").map(|note| note.sort_order), Some(0));
    }

    #[test]
    fn rebuild_matches_incremental_state() {
        let mut cache = seeded();
        cache.upsert(Entity::Folder(folder("f3", Some("g")))).expect("folder");
        cache.upsert(Entity::Note(note("n", "f3", false, 0))).expect("note");
        cache.link_tag("n", "t").expect("link");
        cache.remove("b");

        let before_children = ids_of_folders(cache.children_of(Some("g")));
        let before_tagged = ids(cache.notes_with_tag("t"));
        let before_notes = ids(cache.notes_of("f", SortMode::Manual));
        cache.rebuild_indexes();
        assert_eq!(ids_of_folders(cache.children_of(Some("g"))), before_children);
        assert_eq!(ids(cache.notes_with_tag("t")), before_tagged);
        assert_eq!(ids(cache.notes_of("f", SortMode::Manual)), before_notes);
    }

    #[test]
    fn removing_tag_clears_links() {
        let mut cache = seeded();
        cache.remove("t");
        assert!(cache.tags_of("x").is_empty());
        assert!(cache.note_tags().is_empty());
    }

    #[test]
    fn descendants_and_ancestry() {
        let cache = seeded();
        let mut descendants = cache.descendants_of("f");
        descendants.sort();
        assert_eq!(descendants, vec!["f1", "f2"]);
        assert!(cache.is_within("f1", "f"));
        assert!(!cache.is_within("g", "f"));
    }

    fn ids_of_folders(folders: Vec<&Folder>) -> Vec<String> {
        folders.into_iter().map(|folder| folder.id.clone()).collect()
    }
}
