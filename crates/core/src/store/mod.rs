use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use crate::Result;
use crate::config::{Backend, Settings};
use crate::model::{
    Collection, CollectionId, CollectionUpdate, DuplicateLink, HashIndexEntry, HashKey, Item,
    ItemAttrs, ItemRef, ItemStatus, SourceId, StatusRecord,
};

pub mod json;
pub mod migrate;
pub mod sqlite;

pub use json::JsonItemStore;
pub use migrate::{MigrationReport, migrate_store};
pub use sqlite::SqliteItemStore;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Durable record of collections, items, statuses, duplicate links and the global hash index.
///
/// Every write is an idempotent upsert keyed by `(collection_id, source_id)` or by hash key.
/// Collection counters only move when an item key is inserted for the first time.
pub trait ItemStore: Send + Sync {
    fn backend(&self) -> &'static str;

    fn ensure_collection<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Collection>;

    fn get_collection<'a>(&'a self, id: CollectionId) -> BoxFuture<'a, Option<Collection>>;

    fn list_collections<'a>(&'a self) -> BoxFuture<'a, Vec<Collection>>;

    /// Setting `completed = true` stamps `completed_at`; clearing it removes the stamp.
    fn update_collection<'a>(
        &'a self,
        id: CollectionId,
        update: CollectionUpdate,
    ) -> BoxFuture<'a, Collection>;

    fn upsert_item<'a>(
        &'a self,
        collection_id: CollectionId,
        source_id: SourceId,
        attrs: ItemAttrs,
    ) -> BoxFuture<'a, ItemRef>;

    fn get_item<'a>(
        &'a self,
        collection_id: CollectionId,
        source_id: SourceId,
    ) -> BoxFuture<'a, Option<Item>>;

    /// Items ordered by source id.
    fn list_items<'a>(&'a self, collection_id: CollectionId) -> BoxFuture<'a, Vec<Item>>;

    fn set_status<'a>(
        &'a self,
        collection_id: CollectionId,
        source_id: SourceId,
        status: ItemStatus,
        reason: Option<&'a str>,
    ) -> BoxFuture<'a, ()>;

    /// Like [`ItemStore::set_status`] but keeps the record's own `updated_at`.
    fn import_status<'a>(&'a self, record: &'a StatusRecord) -> BoxFuture<'a, ()>;

    fn get_status<'a>(
        &'a self,
        collection_id: CollectionId,
        source_id: SourceId,
    ) -> BoxFuture<'a, Option<StatusRecord>>;

    fn list_statuses<'a>(&'a self, collection_id: CollectionId)
    -> BoxFuture<'a, Vec<StatusRecord>>;

    fn status_counts<'a>(
        &'a self,
        collection_id: CollectionId,
    ) -> BoxFuture<'a, BTreeMap<ItemStatus, u64>>;

    /// Returns `false` when a link for this item already exists (the existing link is kept).
    fn mark_duplicate<'a>(
        &'a self,
        collection_id: CollectionId,
        source_id: SourceId,
        canonical: ItemRef,
    ) -> BoxFuture<'a, bool>;

    /// Like [`ItemStore::mark_duplicate`] but keeps the link's own `detected_at`.
    fn import_duplicate<'a>(&'a self, link: &'a DuplicateLink) -> BoxFuture<'a, bool>;

    /// Drops the link recorded for this item; returns whether one existed.
    fn unlink_duplicate<'a>(
        &'a self,
        collection_id: CollectionId,
        source_id: SourceId,
    ) -> BoxFuture<'a, bool>;

    fn is_duplicate<'a>(
        &'a self,
        collection_id: CollectionId,
        source_id: SourceId,
    ) -> BoxFuture<'a, Option<ItemRef>>;

    fn list_duplicates<'a>(
        &'a self,
        collection_id: CollectionId,
    ) -> BoxFuture<'a, Vec<DuplicateLink>>;

    /// Rewrites `local_path` (and the filename) of every item recorded at `old_path`.
    fn update_path<'a>(&'a self, old_path: &'a str, new_path: &'a str) -> BoxFuture<'a, u64>;

    fn find_items_by_path<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Vec<Item>>;

    /// First-write-wins; returns whether the entry was inserted.
    fn register_hash<'a>(&'a self, entry: &'a HashIndexEntry) -> BoxFuture<'a, bool>;

    fn get_hash<'a>(&'a self, key: &'a HashKey) -> BoxFuture<'a, Option<HashIndexEntry>>;

    fn remove_hash<'a>(&'a self, key: &'a HashKey) -> BoxFuture<'a, bool>;

    /// Entries ordered by key.
    fn list_hash_entries<'a>(&'a self) -> BoxFuture<'a, Vec<HashIndexEntry>>;
}

/// Opens the backend selected in `settings`, rooted at the backup directory.
pub async fn open_store(settings: &Settings, root: &Path) -> Result<Arc<dyn ItemStore>> {
    open_backend(settings.storage.backend, settings, root).await
}

pub async fn open_backend(
    backend: Backend,
    settings: &Settings,
    root: &Path,
) -> Result<Arc<dyn ItemStore>> {
    Ok(match backend {
        Backend::Sqlite => Arc::new(SqliteItemStore::open(&settings.db_path(root)).await?),
        Backend::Json => Arc::new(JsonItemStore::open(&settings.state_dir(root))?),
    })
}

pub(crate) fn basename(path: &str) -> Option<String> {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .map(|s| s.to_string())
}
