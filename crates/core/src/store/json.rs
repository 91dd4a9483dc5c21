use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error};

use super::{BoxFuture, ItemStore, basename};
use crate::model::{
    Collection, CollectionId, CollectionUpdate, DuplicateLink, HashIndexEntry, HashKey, Item,
    ItemAttrs, ItemRef, ItemStatus, SourceId, StatusRecord, StorageLocation, now_rfc3339,
};
use crate::paths::{name_hash, write_atomic};
use crate::{Error, Result};

pub const JSON_STATE_VERSION: u32 = 1;
pub const GLOBAL_DOC_NAME: &str = ".backup_state_global.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GlobalDoc {
    version: u32,
    next_collection_id: CollectionId,
    /// collection id -> name hash (document file key)
    collections: BTreeMap<CollectionId, String>,
    hash_index: BTreeMap<String, HashIndexEntry>,
}

impl Default for GlobalDoc {
    fn default() -> Self {
        Self {
            version: JSON_STATE_VERSION,
            next_collection_id: 1,
            collections: BTreeMap::new(),
            hash_index: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CollectionDoc {
    version: u32,
    collection: Collection,
    #[serde(default)]
    items: BTreeMap<SourceId, ItemRecord>,
    #[serde(default)]
    statuses: BTreeMap<SourceId, StatusEntry>,
    #[serde(default)]
    duplicates: BTreeMap<SourceId, LinkEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ItemRecord {
    filename: Option<String>,
    local_path: Option<String>,
    remote_ref: Option<String>,
    size: u64,
    sample_fingerprint: Option<String>,
    full_fingerprint: Option<String>,
    location: StorageLocation,
    touched_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatusEntry {
    status: ItemStatus,
    reason: Option<String>,
    updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LinkEntry {
    canonical: ItemRef,
    detected_at: String,
}

#[derive(Debug, Default)]
struct JsonState {
    global: GlobalDoc,
    docs: BTreeMap<CollectionId, CollectionDoc>,
}

impl CollectionDoc {
    fn item(&self, source_id: SourceId) -> Option<Item> {
        let rec = self.items.get(&source_id)?;
        Some(Item {
            collection_id: self.collection.id,
            source_id,
            filename: rec.filename.clone(),
            local_path: rec.local_path.clone(),
            remote_ref: rec.remote_ref.clone(),
            size: rec.size,
            sample_fingerprint: rec.sample_fingerprint.clone(),
            full_fingerprint: rec.full_fingerprint.clone(),
            location: rec.location,
            status: self.statuses.get(&source_id).map(|s| s.status),
            touched_at: rec.touched_at.clone(),
        })
    }

    fn status(&self, source_id: SourceId) -> Option<StatusRecord> {
        self.statuses.get(&source_id).map(|s| StatusRecord {
            collection_id: self.collection.id,
            source_id,
            status: s.status,
            reason: s.reason.clone(),
            updated_at: s.updated_at.clone(),
        })
    }
}

/// Flat-document backend: one JSON document per collection plus one global document.
///
/// The whole state is held in memory behind one async mutex; every write replaces the
/// affected document on disk atomically before the in-memory copy is updated.
pub struct JsonItemStore {
    dir: PathBuf,
    state: Mutex<JsonState>,
}

impl JsonItemStore {
    pub fn open(dir: &Path) -> Result<Self> {
        debug!(event = "json_store.open", state_dir = %dir.display(), "json_store.open");
        std::fs::create_dir_all(dir)?;

        let global_path = dir.join(GLOBAL_DOC_NAME);
        let global: GlobalDoc = if global_path.exists() {
            read_doc(&global_path)?
        } else {
            GlobalDoc::default()
        };
        if global.version != JSON_STATE_VERSION {
            return Err(Error::integrity(format!(
                "unsupported state document version {} in {}",
                global.version,
                global_path.display()
            )));
        }

        let mut docs = BTreeMap::new();
        for (id, hash) in &global.collections {
            let path = collection_doc_path(dir, hash);
            if !path.exists() {
                return Err(Error::integrity(format!(
                    "collection {id} is registered but {} is missing",
                    path.display()
                )));
            }
            let doc: CollectionDoc = read_doc(&path)?;
            if doc.version != JSON_STATE_VERSION || doc.collection.id != *id {
                return Err(Error::integrity(format!(
                    "collection document {} does not match registry entry {id}",
                    path.display()
                )));
            }
            docs.insert(*id, doc);
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            state: Mutex::new(JsonState { global, docs }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn persist_collection(&self, doc: &CollectionDoc) -> Result<()> {
        let path = collection_doc_path(&self.dir, &doc.collection.name_hash);
        write_doc(path, doc).await
    }

    async fn persist_global(&self, global: &GlobalDoc) -> Result<()> {
        write_doc(self.dir.join(GLOBAL_DOC_NAME), global).await
    }

    async fn edit_collection<T>(
        &self,
        id: CollectionId,
        f: impl FnOnce(&mut CollectionDoc) -> Result<(T, bool)>,
    ) -> Result<T> {
        let mut state = self.state.lock().await;
        let mut doc = state
            .docs
            .get(&id)
            .cloned()
            .ok_or_else(|| unknown_collection(id))?;
        let (out, dirty) = f(&mut doc)?;
        if dirty {
            self.persist_collection(&doc).await?;
            state.docs.insert(id, doc);
        }
        Ok(out)
    }

    async fn write_status(&self, record: StatusRecord) -> Result<()> {
        self.edit_collection(record.collection_id, |doc| {
            doc.statuses.insert(
                record.source_id,
                StatusEntry {
                    status: record.status,
                    reason: record.reason,
                    updated_at: record.updated_at,
                },
            );
            Ok(((), true))
        })
        .await
    }

    async fn insert_duplicate(&self, link: DuplicateLink) -> Result<bool> {
        if link.canonical == ItemRef::new(link.collection_id, link.source_id) {
            return Err(Error::InvalidInput {
                message: format!("item {} cannot be its own canonical", link.canonical),
            });
        }
        {
            let state = self.state.lock().await;
            if !state.docs.contains_key(&link.canonical.collection_id) {
                return Err(unknown_collection(link.canonical.collection_id));
            }
        }
        self.edit_collection(link.collection_id, |doc| {
            if doc.duplicates.contains_key(&link.source_id) {
                return Ok((false, false));
            }
            doc.duplicates.insert(
                link.source_id,
                LinkEntry {
                    canonical: link.canonical,
                    detected_at: link.detected_at,
                },
            );
            Ok((true, true))
        })
        .await
    }
}

impl ItemStore for JsonItemStore {
    fn backend(&self) -> &'static str {
        "json"
    }

    fn ensure_collection<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Collection> {
        Box::pin(async move {
            let key = name_hash(name);
            let mut state = self.state.lock().await;
            if let Some(doc) = state.docs.values().find(|d| d.collection.name_hash == key) {
                return Ok(doc.collection.clone());
            }

            let now = now_rfc3339();
            let id = state.global.next_collection_id;
            let doc = CollectionDoc {
                version: JSON_STATE_VERSION,
                collection: Collection {
                    id,
                    name: name.to_string(),
                    name_hash: key.clone(),
                    started_at: now.clone(),
                    last_updated: now,
                    completed: false,
                    completed_at: None,
                    total_files: 0,
                    total_bytes: 0,
                    last_source_cursor: None,
                },
                items: BTreeMap::new(),
                statuses: BTreeMap::new(),
                duplicates: BTreeMap::new(),
            };
            let mut global = state.global.clone();
            global.next_collection_id = id + 1;
            global.collections.insert(id, key.clone());

            self.persist_collection(&doc).await?;
            self.persist_global(&global).await?;
            debug!(event = "store.collection.created", name, name_hash = %key, "store.collection.created");

            let collection = doc.collection.clone();
            state.global = global;
            state.docs.insert(id, doc);
            Ok(collection)
        })
    }

    fn get_collection<'a>(&'a self, id: CollectionId) -> BoxFuture<'a, Option<Collection>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.docs.get(&id).map(|d| d.collection.clone()))
        })
    }

    fn list_collections<'a>(&'a self) -> BoxFuture<'a, Vec<Collection>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.docs.values().map(|d| d.collection.clone()).collect())
        })
    }

    fn update_collection<'a>(
        &'a self,
        id: CollectionId,
        update: CollectionUpdate,
    ) -> BoxFuture<'a, Collection> {
        Box::pin(self.edit_collection(id, move |doc| {
            let now = now_rfc3339();
            let c = &mut doc.collection;
            c.last_updated = now.clone();
            if let Some(completed) = update.completed {
                c.completed = completed;
                c.completed_at = completed.then_some(now);
            }
            if let Some(cursor) = update.last_source_cursor {
                c.last_source_cursor = Some(cursor);
            }
            Ok((c.clone(), true))
        }))
    }

    fn upsert_item<'a>(
        &'a self,
        collection_id: CollectionId,
        source_id: SourceId,
        attrs: ItemAttrs,
    ) -> BoxFuture<'a, ItemRef> {
        Box::pin(self.edit_collection(collection_id, move |doc| {
            let now = now_rfc3339();
            let record = ItemRecord {
                filename: attrs.filename,
                local_path: attrs.local_path,
                remote_ref: attrs.remote_ref,
                size: attrs.size,
                sample_fingerprint: attrs.sample_fingerprint,
                full_fingerprint: attrs.full_fingerprint,
                location: attrs.location,
                touched_at: attrs.touched_at.unwrap_or_else(|| now.clone()),
            };
            let size = record.size;
            if doc.items.insert(source_id, record).is_none() {
                doc.collection.total_files += 1;
                doc.collection.total_bytes += size;
            }
            doc.collection.last_updated = now;
            Ok((ItemRef::new(collection_id, source_id), true))
        }))
    }

    fn get_item<'a>(
        &'a self,
        collection_id: CollectionId,
        source_id: SourceId,
    ) -> BoxFuture<'a, Option<Item>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .docs
                .get(&collection_id)
                .and_then(|d| d.item(source_id)))
        })
    }

    fn list_items<'a>(&'a self, collection_id: CollectionId) -> BoxFuture<'a, Vec<Item>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let Some(doc) = state.docs.get(&collection_id) else {
                return Ok(Vec::new());
            };
            Ok(doc.items.keys().filter_map(|sid| doc.item(*sid)).collect())
        })
    }

    fn set_status<'a>(
        &'a self,
        collection_id: CollectionId,
        source_id: SourceId,
        status: ItemStatus,
        reason: Option<&'a str>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.write_status(StatusRecord {
            collection_id,
            source_id,
            status,
            reason: reason.map(|r| r.to_string()),
            updated_at: now_rfc3339(),
        }))
    }

    fn import_status<'a>(&'a self, record: &'a StatusRecord) -> BoxFuture<'a, ()> {
        Box::pin(self.write_status(record.clone()))
    }

    fn get_status<'a>(
        &'a self,
        collection_id: CollectionId,
        source_id: SourceId,
    ) -> BoxFuture<'a, Option<StatusRecord>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .docs
                .get(&collection_id)
                .and_then(|d| d.status(source_id)))
        })
    }

    fn list_statuses<'a>(
        &'a self,
        collection_id: CollectionId,
    ) -> BoxFuture<'a, Vec<StatusRecord>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let Some(doc) = state.docs.get(&collection_id) else {
                return Ok(Vec::new());
            };
            Ok(doc
                .statuses
                .keys()
                .filter_map(|sid| doc.status(*sid))
                .collect())
        })
    }

    fn status_counts<'a>(
        &'a self,
        collection_id: CollectionId,
    ) -> BoxFuture<'a, BTreeMap<ItemStatus, u64>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let mut counts = BTreeMap::new();
            if let Some(doc) = state.docs.get(&collection_id) {
                for entry in doc.statuses.values() {
                    *counts.entry(entry.status).or_insert(0) += 1;
                }
            }
            Ok(counts)
        })
    }

    fn mark_duplicate<'a>(
        &'a self,
        collection_id: CollectionId,
        source_id: SourceId,
        canonical: ItemRef,
    ) -> BoxFuture<'a, bool> {
        Box::pin(self.insert_duplicate(DuplicateLink {
            collection_id,
            source_id,
            canonical,
            detected_at: now_rfc3339(),
        }))
    }

    fn import_duplicate<'a>(&'a self, link: &'a DuplicateLink) -> BoxFuture<'a, bool> {
        Box::pin(self.insert_duplicate(link.clone()))
    }

    fn unlink_duplicate<'a>(
        &'a self,
        collection_id: CollectionId,
        source_id: SourceId,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            {
                let state = self.state.lock().await;
                if !state.docs.contains_key(&collection_id) {
                    return Ok(false);
                }
            }
            self.edit_collection(collection_id, |doc| {
                let removed = doc.duplicates.remove(&source_id).is_some();
                Ok((removed, removed))
            })
            .await
        })
    }

    fn is_duplicate<'a>(
        &'a self,
        collection_id: CollectionId,
        source_id: SourceId,
    ) -> BoxFuture<'a, Option<ItemRef>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .docs
                .get(&collection_id)
                .and_then(|d| d.duplicates.get(&source_id))
                .map(|l| l.canonical))
        })
    }

    fn list_duplicates<'a>(
        &'a self,
        collection_id: CollectionId,
    ) -> BoxFuture<'a, Vec<DuplicateLink>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let Some(doc) = state.docs.get(&collection_id) else {
                return Ok(Vec::new());
            };
            Ok(doc
                .duplicates
                .iter()
                .map(|(sid, l)| DuplicateLink {
                    collection_id,
                    source_id: *sid,
                    canonical: l.canonical,
                    detected_at: l.detected_at.clone(),
                })
                .collect())
        })
    }

    fn update_path<'a>(&'a self, old_path: &'a str, new_path: &'a str) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            let now = now_rfc3339();
            let new_name = basename(new_path);
            let mut state = self.state.lock().await;

            let mut changed_docs = Vec::new();
            let mut changed = 0u64;
            for doc in state.docs.values() {
                if !doc
                    .items
                    .values()
                    .any(|r| r.local_path.as_deref() == Some(old_path))
                {
                    continue;
                }
                let mut doc = doc.clone();
                for rec in doc.items.values_mut() {
                    if rec.local_path.as_deref() == Some(old_path) {
                        rec.local_path = Some(new_path.to_string());
                        rec.filename = new_name.clone();
                        rec.touched_at = now.clone();
                        changed += 1;
                    }
                }
                doc.collection.last_updated = now.clone();
                changed_docs.push(doc);
            }

            for doc in changed_docs {
                self.persist_collection(&doc).await?;
                state.docs.insert(doc.collection.id, doc);
            }
            Ok(changed)
        })
    }

    fn find_items_by_path<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Vec<Item>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let mut out = Vec::new();
            for doc in state.docs.values() {
                for (sid, rec) in &doc.items {
                    if rec.local_path.as_deref() == Some(path)
                        && let Some(item) = doc.item(*sid)
                    {
                        out.push(item);
                    }
                }
            }
            Ok(out)
        })
    }

    fn register_hash<'a>(&'a self, entry: &'a HashIndexEntry) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.global.hash_index.contains_key(entry.key.as_str()) {
                return Ok(false);
            }
            let mut global = state.global.clone();
            global
                .hash_index
                .insert(entry.key.as_str().to_string(), entry.clone());
            self.persist_global(&global).await?;
            state.global = global;
            Ok(true)
        })
    }

    fn get_hash<'a>(&'a self, key: &'a HashKey) -> BoxFuture<'a, Option<HashIndexEntry>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.global.hash_index.get(key.as_str()).cloned())
        })
    }

    fn remove_hash<'a>(&'a self, key: &'a HashKey) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if !state.global.hash_index.contains_key(key.as_str()) {
                return Ok(false);
            }
            let mut global = state.global.clone();
            global.hash_index.remove(key.as_str());
            self.persist_global(&global).await?;
            state.global = global;
            Ok(true)
        })
    }

    fn list_hash_entries<'a>(&'a self) -> BoxFuture<'a, Vec<HashIndexEntry>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.global.hash_index.values().cloned().collect())
        })
    }
}

pub fn collection_doc_path(dir: &Path, name_hash: &str) -> PathBuf {
    dir.join(format!(".backup_state_{name_hash}.json"))
}

fn unknown_collection(id: CollectionId) -> Error {
    Error::InvalidInput {
        message: format!("unknown collection: {id}"),
    }
}

fn read_doc<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path).map_err(|e| {
        error!(event = "json_store.read_failed", path = %path.display(), error = %e, "json_store.read_failed");
        Error::integrity(format!("state document {} unreadable: {e}", path.display()))
    })?;
    serde_json::from_slice(&bytes).map_err(|e| {
        error!(event = "json_store.parse_failed", path = %path.display(), error = %e, "json_store.parse_failed");
        Error::integrity(format!("state document {} is corrupt: {e}", path.display()))
    })
}

/// Serializes in place, then rewrites the file on the blocking pool.
async fn write_doc<T: Serialize>(path: PathBuf, doc: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(doc)?;
    let target = path.clone();
    let written = tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
        .await
        .unwrap_or_else(|e| Err(std::io::Error::other(e)));
    written.map_err(|e| {
        error!(event = "json_store.write_failed", path = %path.display(), error = %e, "json_store.write_failed");
        Error::StateWrite { path, source: e }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn documents_use_name_hash_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonItemStore::open(dir.path()).unwrap();
        let c = store.ensure_collection("Holiday Chat").await.unwrap();

        assert!(dir.path().join(GLOBAL_DOC_NAME).exists());
        assert!(collection_doc_path(dir.path(), &name_hash("Holiday Chat")).exists());
        assert_eq!(c.name_hash, name_hash("Holiday Chat"));
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonItemStore::open(dir.path()).unwrap();
            let c = store.ensure_collection("a").await.unwrap();
            store
                .upsert_item(c.id, 5, ItemAttrs {
                    size: 9,
                    local_path: Some("/x/5_a.jpg".to_string()),
                    ..ItemAttrs::default()
                })
                .await
                .unwrap();
            store
                .set_status(c.id, 5, ItemStatus::Downloaded, None)
                .await
                .unwrap();
        }
        let store = JsonItemStore::open(dir.path()).unwrap();
        let cols = store.list_collections().await.unwrap();
        let item = store.get_item(cols[0].id, 5).await.unwrap().unwrap();
        assert_eq!(item.status, Some(ItemStatus::Downloaded));
        assert_eq!(cols[0].total_bytes, 9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_all_land_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(JsonItemStore::open(dir.path()).unwrap());
        let cid = store.ensure_collection("busy").await.unwrap().id;

        let mut tasks = tokio::task::JoinSet::new();
        for sid in 1..=24 {
            let store = store.clone();
            tasks.spawn(async move {
                store
                    .upsert_item(cid, sid, ItemAttrs {
                        size: 10,
                        local_path: Some(format!("/x/{sid}_f.jpg")),
                        ..ItemAttrs::default()
                    })
                    .await
                    .unwrap();
                store
                    .set_status(cid, sid, ItemStatus::Downloaded, None)
                    .await
                    .unwrap();
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }
        drop(store);

        let store = JsonItemStore::open(dir.path()).unwrap();
        let items = store.list_items(cid).await.unwrap();
        assert_eq!(items.len(), 24);
        assert!(items.iter().all(|i| i.status == Some(ItemStatus::Downloaded)));
        let col = store.get_collection(cid).await.unwrap().unwrap();
        assert_eq!((col.total_files, col.total_bytes), (24, 240));
    }

    #[tokio::test]
    async fn corrupt_document_is_an_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonItemStore::open(dir.path()).unwrap();
            store.ensure_collection("a").await.unwrap();
        }
        std::fs::write(collection_doc_path(dir.path(), &name_hash("a")), b"{not json").unwrap();

        let err = JsonItemStore::open(dir.path()).err().unwrap();
        assert!(matches!(err, Error::StateIntegrity { .. }));

        std::fs::write(dir.path().join(GLOBAL_DOC_NAME), b"[]").unwrap();
        let err = JsonItemStore::open(dir.path()).err().unwrap();
        assert!(matches!(err, Error::StateIntegrity { .. }));
    }
}
