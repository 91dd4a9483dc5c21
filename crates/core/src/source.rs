use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::model::SourceId;
use crate::store::BoxFuture;
use crate::Error;

/// A candidate item announced by a source, before any content is fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceItem {
    pub source_id: SourceId,
    pub filename: String,
    /// Size reported by the source; 0 when unknown.
    pub declared_size: u64,
}

/// Where item content comes from.
///
/// Implementations report failures with the retry taxonomy: `TransientIo`,
/// `RateLimited`, `PermanentSource`. An empty file written by `fetch_to` is
/// treated as a corrupt result by the caller.
pub trait SourceProvider: Send + Sync {
    fn provider(&self) -> &'static str;

    /// Candidates of a collection ordered by source id.
    fn list_candidates<'a>(&'a self, collection: &'a str) -> BoxFuture<'a, Vec<SourceItem>>;

    /// Candidates for an explicit id list; unknown ids are omitted.
    fn fetch_by_ids<'a>(
        &'a self,
        collection: &'a str,
        ids: &'a [SourceId],
    ) -> BoxFuture<'a, Vec<SourceItem>>;

    /// Writes the item's content to `dest` and returns the number of bytes written.
    fn fetch_to<'a>(
        &'a self,
        collection: &'a str,
        item: &'a SourceItem,
        dest: &'a Path,
    ) -> BoxFuture<'a, u64>;
}

/// Scripted failure injected before a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Transient,
    RateLimited(u64),
    /// Writes an empty file and reports success.
    ZeroBytes,
    Permanent,
}

#[derive(Default)]
pub struct InMemorySource {
    pub fetches: AtomicUsize,
    items: Mutex<HashMap<String, BTreeMap<SourceId, (SourceItem, Vec<u8>)>>>,
    faults: Mutex<HashMap<(String, SourceId), VecDeque<Fault>>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, collection: &str, source_id: SourceId, filename: &str, bytes: &[u8]) {
        let item = SourceItem {
            source_id,
            filename: filename.to_string(),
            declared_size: bytes.len() as u64,
        };
        self.items
            .lock()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(source_id, (item, bytes.to_vec()));
    }

    /// Queues faults returned (in order) by the next fetches of this item.
    pub async fn fail_next(&self, collection: &str, source_id: SourceId, faults: &[Fault]) {
        self.faults
            .lock()
            .await
            .entry((collection.to_string(), source_id))
            .or_default()
            .extend(faults.iter().copied());
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

impl SourceProvider for InMemorySource {
    fn provider(&self) -> &'static str {
        "test.mem"
    }

    fn list_candidates<'a>(&'a self, collection: &'a str) -> BoxFuture<'a, Vec<SourceItem>> {
        Box::pin(async move {
            Ok(self
                .items
                .lock()
                .await
                .get(collection)
                .map(|m| m.values().map(|(i, _)| i.clone()).collect())
                .unwrap_or_default())
        })
    }

    fn fetch_by_ids<'a>(
        &'a self,
        collection: &'a str,
        ids: &'a [SourceId],
    ) -> BoxFuture<'a, Vec<SourceItem>> {
        Box::pin(async move {
            let items = self.items.lock().await;
            let Some(m) = items.get(collection) else {
                return Ok(Vec::new());
            };
            Ok(ids
                .iter()
                .filter_map(|id| m.get(id).map(|(i, _)| i.clone()))
                .collect())
        })
    }

    fn fetch_to<'a>(
        &'a self,
        collection: &'a str,
        item: &'a SourceItem,
        dest: &'a Path,
    ) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            tokio::task::yield_now().await;

            let fault = self
                .faults
                .lock()
                .await
                .get_mut(&(collection.to_string(), item.source_id))
                .and_then(|q| q.pop_front());

            let bytes = match fault {
                Some(Fault::Transient) => {
                    return Err(Error::TransientIo {
                        message: format!("connection reset fetching {}", item.source_id),
                    });
                }
                Some(Fault::RateLimited(seconds)) => return Err(Error::RateLimited { seconds }),
                Some(Fault::Permanent) => {
                    return Err(Error::PermanentSource {
                        message: format!("reference to {} expired", item.source_id),
                    });
                }
                Some(Fault::ZeroBytes) => Vec::new(),
                None => self
                    .items
                    .lock()
                    .await
                    .get(collection)
                    .and_then(|m| m.get(&item.source_id))
                    .map(|(_, b)| b.clone())
                    .ok_or_else(|| Error::PermanentSource {
                        message: format!("item {} not found in {collection}", item.source_id),
                    })?,
            };

            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(dest, &bytes).await?;
            Ok(bytes.len() as u64)
        })
    }
}

/// Destination of an item inside its collection directory: `<source_id>_<filename>`.
pub fn item_file_name(item: &SourceItem) -> String {
    crate::paths::sanitize_filename(&format!("{}_{}", item.source_id, item.filename))
}

pub fn collection_dir(root: &Path, collection: &str) -> PathBuf {
    root.join(crate::paths::sanitize_dirname(collection))
}
