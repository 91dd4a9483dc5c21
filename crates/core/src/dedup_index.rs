use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::Result;
use crate::model::{CollectionId, HashIndexEntry, HashKey, ItemRef};
use crate::store::ItemStore;

/// Where a fingerprint was first seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashHit {
    pub path: String,
    pub item: Option<ItemRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupDecision {
    /// The caller now owns the hash key (or already did).
    Canonical,
    Duplicate(HashHit),
}

/// Global content-addressed index over the store's hash table.
///
/// Stale entries (backing file gone) are evicted when a lookup touches them; [`DedupIndex::prune`]
/// sweeps the whole table.
pub struct DedupIndex {
    store: Arc<dyn ItemStore>,
    key_locks: Mutex<HashMap<HashKey, Arc<Mutex<()>>>>,
}

impl DedupIndex {
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        Self {
            store,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ItemStore> {
        &self.store
    }

    /// First-write-wins registration; returns whether this call inserted the entry.
    pub async fn register(
        &self,
        size: u64,
        fingerprint: &str,
        path: &str,
        item: Option<ItemRef>,
    ) -> Result<bool> {
        let key = HashKey::new(size, fingerprint);
        let lock = self.key_lock(&key).await;
        let inserted = {
            let _guard = lock.lock().await;
            self.register_locked(size, fingerprint, path, item).await?
        };
        self.release_key_lock(&key, lock).await;
        Ok(inserted)
    }

    /// Never returns an entry whose path has disappeared; such entries are removed.
    pub async fn lookup(&self, size: u64, fingerprint: &str) -> Result<Option<HashHit>> {
        let key = HashKey::new(size, fingerprint);
        let lock = self.key_lock(&key).await;
        let hit = {
            let _guard = lock.lock().await;
            self.lookup_locked(&key).await?
        };
        self.release_key_lock(&key, lock).await;
        Ok(hit)
    }

    /// Serialized lookup-then-register for one key.
    ///
    /// Of several concurrent claims for identical content exactly one gets
    /// [`DedupDecision::Canonical`]. A hit that points at the same item or path counts as
    /// canonical, so re-claiming after a resume is idempotent.
    pub async fn claim(
        &self,
        size: u64,
        fingerprint: &str,
        path: &str,
        item: Option<ItemRef>,
    ) -> Result<DedupDecision> {
        let key = HashKey::new(size, fingerprint);
        let lock = self.key_lock(&key).await;
        let decision = {
            let _guard = lock.lock().await;
            match self.lookup_locked(&key).await? {
                Some(hit) if is_same_owner(&hit, path, item) => DedupDecision::Canonical,
                Some(hit) => {
                    debug!(
                        event = "dedup.duplicate",
                        hash_key = %key,
                        path,
                        canonical_path = %hit.path,
                        "dedup.duplicate"
                    );
                    DedupDecision::Duplicate(hit)
                }
                None => {
                    self.register_locked(size, fingerprint, path, item).await?;
                    DedupDecision::Canonical
                }
            }
        };
        self.release_key_lock(&key, lock).await;
        Ok(decision)
    }

    /// Removes every entry whose first path no longer exists.
    pub async fn prune(&self) -> Result<u64> {
        let mut removed = 0u64;
        for entry in self.store.list_hash_entries().await? {
            if Path::new(&entry.first_path).exists() {
                continue;
            }
            let lock = self.key_lock(&entry.key).await;
            {
                let _guard = lock.lock().await;
                if self.store.remove_hash(&entry.key).await? {
                    removed += 1;
                }
            }
            self.release_key_lock(&entry.key, lock).await;
        }
        info!(event = "dedup.prune", removed, "dedup.prune");
        Ok(removed)
    }

    /// Registers every recorded item that has a fingerprint and an existing local file.
    pub async fn rebuild_from_items(&self, collection_id: Option<CollectionId>) -> Result<u64> {
        let collections = match collection_id {
            Some(id) => vec![id],
            None => self
                .store
                .list_collections()
                .await?
                .into_iter()
                .map(|c| c.id)
                .collect(),
        };

        let mut registered = 0u64;
        for cid in collections {
            for item in self.store.list_items(cid).await? {
                let (Some(fp), Some(path)) = (&item.sample_fingerprint, &item.local_path) else {
                    continue;
                };
                if item.size == 0 || !Path::new(path).exists() {
                    continue;
                }
                if self
                    .register(item.size, fp, path, Some(item.item_ref()))
                    .await?
                {
                    registered += 1;
                }
            }
        }
        info!(event = "dedup.rebuild", registered, "dedup.rebuild");
        Ok(registered)
    }

    async fn register_locked(
        &self,
        size: u64,
        fingerprint: &str,
        path: &str,
        item: Option<ItemRef>,
    ) -> Result<bool> {
        let entry = HashIndexEntry::new(size, fingerprint, path, item);
        let inserted = self.store.register_hash(&entry).await?;
        if inserted {
            debug!(event = "dedup.register", hash_key = %entry.key, path, "dedup.register");
        }
        Ok(inserted)
    }

    async fn lookup_locked(&self, key: &HashKey) -> Result<Option<HashHit>> {
        let Some(entry) = self.store.get_hash(key).await? else {
            return Ok(None);
        };
        if !Path::new(&entry.first_path).exists() {
            self.store.remove_hash(key).await?;
            debug!(
                event = "dedup.evict_stale",
                hash_key = %key,
                path = %entry.first_path,
                "dedup.evict_stale"
            );
            return Ok(None);
        }
        Ok(Some(HashHit {
            path: entry.first_path,
            item: entry.first_item,
        }))
    }

    async fn key_lock(&self, key: &HashKey) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        locks.entry(key.clone()).or_default().clone()
    }

    async fn release_key_lock(&self, key: &HashKey, lock: Arc<Mutex<()>>) {
        let mut locks = self.key_locks.lock().await;
        drop(lock);
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }
}

fn is_same_owner(hit: &HashHit, path: &str, item: Option<ItemRef>) -> bool {
    hit.path == path || (item.is_some() && hit.item == item)
}
