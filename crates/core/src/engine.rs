use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::consolidate::{ConsolidationReport, consolidate};
use crate::dedup_index::{DedupDecision, DedupIndex};
use crate::fingerprint::sample_fingerprint;
use crate::mirror::RemoteMirror;
use crate::model::{
    CollectionId, CollectionUpdate, ItemAttrs, ItemRef, ItemStatus, SourceId, StorageLocation,
};
use crate::paths::{
    absolute_normalized, normalize_path_str, path_to_utf8, sanitize_dirname, unique_path,
};
use crate::progress::ProgressSink;
use crate::reconcile::{ReconciliationReport, RemoteEntry, list_local, reconcile};
use crate::resume::is_intact;
use crate::retry::{RetryPolicy, run_with_retry};
use crate::scanner::{DuplicateGroup, ScanOptions, scan_for_duplicates};
use crate::source::{SourceItem, SourceProvider, collection_dir, item_file_name};
use crate::store::{ItemStore, basename, open_store};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Stored,
    Duplicate {
        canonical: Option<ItemRef>,
        canonical_path: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Fetch exactly these ids instead of listing every candidate.
    pub ids: Option<Vec<SourceId>>,
    /// Reconcile the collection directory with the store before fetching.
    pub reconcile_first: bool,
    pub cancel: Option<CancellationToken>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub collection_id: CollectionId,
    pub downloaded: u64,
    pub skipped: u64,
    pub failed: u64,
    pub duplicate: u64,
    pub missing: u64,
    pub ambiguous: u64,
    pub bytes_downloaded: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResumeReport {
    pub checked: u64,
    pub intact: u64,
    pub invalid: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Copy,
    Move,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    pub transferred: u64,
    pub bytes: u64,
    pub failed: u64,
    pub already_remote: u64,
}

enum ItemOutcome {
    Downloaded(u64),
    Duplicate(u64),
    Failed,
}

/// Shared context for every operation: store, dedup index, settings and backup root.
///
/// Cheap to clone; clones share the same store and index.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn ItemStore>,
    dedup: Arc<DedupIndex>,
    settings: Arc<Settings>,
    root: PathBuf,
}

impl Engine {
    pub fn new(store: Arc<dyn ItemStore>, settings: Settings, root: impl Into<PathBuf>) -> Self {
        Self {
            dedup: Arc::new(DedupIndex::new(store.clone())),
            store,
            settings: Arc::new(settings),
            root: root.into(),
        }
    }

    /// Opens the configured backend under `root`.
    pub async fn open(settings: Settings, root: &Path) -> Result<Self> {
        let root = absolute_normalized(root)?;
        let store = open_store(&settings, &root).await?;
        info!(
            event = "engine.open",
            root = %root.display(),
            backend = store.backend(),
            "engine.open"
        );
        Ok(Self::new(store, settings, root))
    }

    pub fn store(&self) -> &Arc<dyn ItemStore> {
        &self.store
    }

    pub fn dedup(&self) -> &DedupIndex {
        &self.dedup
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn collection_dir(&self, name: &str) -> PathBuf {
        collection_dir(&self.root, name)
    }

    /// Records a fetched file, linking it to an existing copy when its content is already known.
    ///
    /// A duplicate's file is removed; its row keeps size and fingerprint without a local path.
    pub async fn register_download(
        &self,
        collection_id: CollectionId,
        source_id: SourceId,
        path: &Path,
        size: u64,
        fingerprint: &str,
        filename: Option<&str>,
    ) -> Result<DownloadOutcome> {
        let path_str = normalize_path_str(&path_to_utf8(path)?);
        let me = ItemRef::new(collection_id, source_id);
        let filename = filename
            .map(|f| f.to_string())
            .or_else(|| basename(&path_str));

        match self
            .dedup
            .claim(size, fingerprint, &path_str, Some(me))
            .await?
        {
            DedupDecision::Canonical => {
                self.store
                    .upsert_item(
                        collection_id,
                        source_id,
                        ItemAttrs {
                            filename,
                            local_path: Some(path_str),
                            size,
                            sample_fingerprint: Some(fingerprint.to_string()),
                            location: StorageLocation::Local,
                            ..ItemAttrs::default()
                        },
                    )
                    .await?;
                self.store
                    .set_status(collection_id, source_id, ItemStatus::Downloaded, None)
                    .await?;
                if self.store.unlink_duplicate(collection_id, source_id).await? {
                    debug!(
                        event = "download.promoted",
                        collection_id,
                        source_id,
                        "download.promoted"
                    );
                }
                Ok(DownloadOutcome::Stored)
            }
            DedupDecision::Duplicate(hit) => {
                let canonical = match hit.item {
                    Some(r) => Some(r),
                    None => self
                        .store
                        .find_items_by_path(&hit.path)
                        .await?
                        .first()
                        .map(|i| i.item_ref()),
                };
                if hit.path != path_str
                    && let Err(e) = std::fs::remove_file(path)
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(
                        event = "download.duplicate_cleanup_failed",
                        path = %path.display(),
                        error = %e,
                        "download.duplicate_cleanup_failed"
                    );
                }

                self.store
                    .upsert_item(
                        collection_id,
                        source_id,
                        ItemAttrs {
                            filename,
                            local_path: None,
                            size,
                            sample_fingerprint: Some(fingerprint.to_string()),
                            location: StorageLocation::Local,
                            ..ItemAttrs::default()
                        },
                    )
                    .await?;
                let reason = format!("duplicate of {}", hit.path);
                self.store
                    .set_status(
                        collection_id,
                        source_id,
                        ItemStatus::Duplicate,
                        Some(&reason),
                    )
                    .await?;
                if let Some(c) = canonical
                    && c != me
                {
                    if self
                        .store
                        .is_duplicate(collection_id, source_id)
                        .await?
                        .is_some_and(|old| old != c)
                    {
                        self.store.unlink_duplicate(collection_id, source_id).await?;
                    }
                    self.store
                        .mark_duplicate(collection_id, source_id, c)
                        .await?;
                }
                debug!(
                    event = "download.duplicate",
                    collection_id,
                    source_id,
                    canonical_path = %hit.path,
                    "download.duplicate"
                );
                Ok(DownloadOutcome::Duplicate {
                    canonical,
                    canonical_path: hit.path,
                })
            }
        }
    }

    /// The recorded item already holding this content, if it is still on disk.
    pub async fn find_duplicate(
        &self,
        collection_id: CollectionId,
        size: u64,
        fingerprint: &str,
    ) -> Result<Option<ItemRef>> {
        let Some(hit) = self.dedup.lookup(size, fingerprint).await? else {
            return Ok(None);
        };
        let found = match hit.item {
            Some(r) => Some(r),
            None => self
                .store
                .find_items_by_path(&hit.path)
                .await?
                .first()
                .map(|i| i.item_ref()),
        };
        debug!(
            event = "dedup.find",
            collection_id,
            size,
            found = found.is_some(),
            "dedup.find"
        );
        Ok(found)
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            sample_bytes: self.settings.dedup.sample_bytes,
            full_hash: self.settings.dedup.full_hash_on_scan,
            quarantine_dir: Some(self.settings.quarantine_dir(&self.root)),
            progress_interval: self.settings.progress.min_interval(),
        }
    }

    /// Scans `root` (the backup root when `None`) for duplicate files.
    pub fn scan_for_duplicates(
        &self,
        root: Option<&Path>,
        progress: Option<&dyn ProgressSink>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<DuplicateGroup>> {
        let root = root.unwrap_or(&self.root);
        scan_for_duplicates(root, &self.scan_options(), progress, cancel)
    }

    pub async fn consolidate(&self, groups: &[DuplicateGroup]) -> Result<ConsolidationReport> {
        let quarantine = self.settings.quarantine_dir(&self.root);
        consolidate(&self.root, &quarantine, groups, &*self.store, Some(&self.dedup)).await
    }

    /// Lists `<remote_base>/<collection dir>` on the mirror.
    pub async fn remote_listing(
        &self,
        mirror: &dyn RemoteMirror,
        remote_base: &str,
        collection: &str,
    ) -> Result<Vec<RemoteEntry>> {
        mirror
            .list(&remote_join(remote_base, &sanitize_dirname(collection)))
            .await
    }

    pub async fn reconcile(
        &self,
        collection: &str,
        remote: Option<&[RemoteEntry]>,
    ) -> Result<ReconciliationReport> {
        let c = self.store.ensure_collection(collection).await?;
        let quarantine = self.settings.quarantine_dir(&self.root);
        let local = list_local(&self.collection_dir(collection), Some(&quarantine))?;
        reconcile(
            &*self.store,
            Some(&self.dedup),
            c.id,
            &local,
            remote,
            self.settings.dedup.sample_bytes,
        )
        .await
    }

    /// Marks downloaded items whose local file is gone or damaged as failed.
    pub async fn validate_resume(&self, collection_id: CollectionId) -> Result<ResumeReport> {
        let mut report = ResumeReport::default();
        for item in self.store.list_items(collection_id).await? {
            if item.status != Some(ItemStatus::Downloaded)
                || !matches!(item.location, StorageLocation::Local | StorageLocation::Both)
            {
                continue;
            }
            report.checked += 1;
            if is_intact(&item) {
                report.intact += 1;
                continue;
            }
            report.invalid += 1;
            self.store
                .set_status(
                    collection_id,
                    item.source_id,
                    ItemStatus::Failed,
                    Some("resume validation failed"),
                )
                .await?;
        }
        info!(
            event = "resume.validate",
            collection_id,
            checked = report.checked,
            invalid = report.invalid,
            "resume.validate"
        );
        Ok(report)
    }

    /// Fetches a collection through a bounded worker pool.
    ///
    /// Items already intact on disk (or linked to an intact canonical, or kept on the mirror)
    /// are skipped. Per-item failures are recorded as `failed`; store errors abort the run.
    pub async fn run_collection(
        &self,
        provider: Arc<dyn SourceProvider>,
        name: &str,
        options: RunOptions,
    ) -> Result<RunSummary> {
        let collection = self.store.ensure_collection(name).await?;
        let cid = collection.id;
        let mut summary = RunSummary {
            collection_id: cid,
            ..RunSummary::default()
        };
        info!(
            event = "run.start",
            collection_id = cid,
            name,
            provider = provider.provider(),
            "run.start"
        );

        let dir = self.collection_dir(name);
        tokio::fs::create_dir_all(&dir).await?;

        if options.reconcile_first {
            let report = self.reconcile(name, None).await?;
            summary.ambiguous = report.ambiguous;
        }

        let candidates = match &options.ids {
            Some(ids) => {
                let found = provider.fetch_by_ids(name, ids).await?;
                let offered: HashSet<SourceId> = found.iter().map(|i| i.source_id).collect();
                for id in ids.iter().filter(|id| !offered.contains(id)) {
                    summary.missing += 1;
                    if self.store.get_item(cid, *id).await?.is_some() {
                        self.store
                            .set_status(cid, *id, ItemStatus::Missing, Some("not offered by source"))
                            .await?;
                    }
                }
                found
            }
            None => provider.list_candidates(name).await?,
        };

        let cancel = options.cancel.clone().unwrap_or_default();
        let policy = RetryPolicy::from_settings(&self.settings.retry);
        let semaphore = Arc::new(Semaphore::new(self.settings.pool.concurrency.max(1) as usize));
        let mut tasks: JoinSet<Result<ItemOutcome>> = JoinSet::new();
        let mut cursor = collection.last_source_cursor;

        for item in candidates {
            if cancel.is_cancelled() {
                break;
            }
            cursor = cursor.max(Some(item.source_id));
            if self.can_skip(cid, item.source_id).await? {
                summary.skipped += 1;
                continue;
            }
            let dest = self.destination(&dir, cid, &item).await?;

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::Cancelled)?;
            let engine = self.clone();
            let provider = provider.clone();
            let name = name.to_string();
            let task_cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                engine
                    .fetch_item(&*provider, &name, cid, &item, &dest, &policy, &task_cancel)
                    .await
            });

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = absorb(&mut summary, joined) {
                    cancel.cancel();
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = absorb(&mut summary, joined) {
                cancel.cancel();
                tasks.abort_all();
                return Err(e);
            }
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.store
            .update_collection(
                cid,
                CollectionUpdate {
                    completed: Some(true),
                    last_source_cursor: cursor,
                },
            )
            .await?;

        info!(
            event = "run.finish",
            collection_id = cid,
            downloaded = summary.downloaded,
            skipped = summary.skipped,
            failed = summary.failed,
            duplicate = summary.duplicate,
            missing = summary.missing,
            ambiguous = summary.ambiguous,
            bytes = summary.bytes_downloaded,
            "run.finish"
        );
        Ok(summary)
    }

    /// Pushes the collection's local files to the mirror and records where they now live.
    pub async fn transfer_to_mirror(
        &self,
        collection: &str,
        mirror: &dyn RemoteMirror,
        remote_base: &str,
        mode: TransferMode,
    ) -> Result<TransferReport> {
        let c = self.store.ensure_collection(collection).await?;
        let dir = self.collection_dir(collection);
        let remote_dir = remote_join(remote_base, &sanitize_dirname(collection));
        let mut report = TransferReport::default();

        for item in self.store.list_items(c.id).await? {
            let Some(local) = item.local_path.as_deref() else {
                continue;
            };
            if !Path::new(local).is_file() {
                continue;
            }
            if mode == TransferMode::Copy
                && item.location == StorageLocation::Both
                && item.remote_ref.is_some()
            {
                report.already_remote += 1;
                continue;
            }
            let Ok(rel) = Path::new(local).strip_prefix(&dir) else {
                warn!(
                    event = "transfer.outside_collection",
                    path = %local,
                    "transfer.outside_collection"
                );
                report.failed += 1;
                continue;
            };
            let rel = normalize_path_str(&path_to_utf8(rel)?);
            let dst = remote_join(&remote_dir, &rel);

            let res = match mode {
                TransferMode::Copy => mirror.copy(Path::new(local), &dst).await,
                TransferMode::Move => mirror.move_to(Path::new(local), &dst).await,
            };
            if let Err(e) = res {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(
                    event = "transfer.failed",
                    collection_id = c.id,
                    source_id = item.source_id,
                    error = %e,
                    "transfer.failed"
                );
                report.failed += 1;
                continue;
            }

            let mut attrs = item.attrs();
            attrs.remote_ref = Some(rel);
            match mode {
                TransferMode::Copy => attrs.location = StorageLocation::Both,
                TransferMode::Move => {
                    attrs.location = StorageLocation::Remote;
                    attrs.local_path = None;
                }
            }
            self.store.upsert_item(c.id, item.source_id, attrs).await?;
            report.transferred += 1;
            report.bytes += item.size;
        }
        info!(
            event = "transfer.finish",
            collection_id = c.id,
            transferred = report.transferred,
            failed = report.failed,
            "transfer.finish"
        );
        Ok(report)
    }

    async fn can_skip(&self, cid: CollectionId, sid: SourceId) -> Result<bool> {
        let Some(item) = self.store.get_item(cid, sid).await? else {
            return Ok(false);
        };
        match item.status {
            Some(ItemStatus::Downloaded) => Ok(is_intact(&item)
                || (item.location == StorageLocation::Remote && item.remote_ref.is_some())),
            Some(ItemStatus::Duplicate) => {
                let Some(canonical) = self.store.is_duplicate(cid, sid).await? else {
                    return Ok(false);
                };
                Ok(self
                    .store
                    .get_item(canonical.collection_id, canonical.source_id)
                    .await?
                    .is_some_and(|c| is_intact(&c)))
            }
            _ => Ok(false),
        }
    }

    /// `<dir>/<id>_<name>`, unless an unrelated file already sits there.
    async fn destination(&self, dir: &Path, cid: CollectionId, item: &SourceItem) -> Result<PathBuf> {
        let file_name = item_file_name(item);
        let candidate = dir.join(&file_name);
        if !candidate.exists() {
            return Ok(candidate);
        }
        let ours = self
            .store
            .get_item(cid, item.source_id)
            .await?
            .and_then(|i| i.local_path)
            .is_some_and(|p| Path::new(&p) == candidate);
        if ours {
            return Ok(candidate);
        }
        Ok(unique_path(dir, &file_name))
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_item(
        &self,
        provider: &dyn SourceProvider,
        collection: &str,
        cid: CollectionId,
        item: &SourceItem,
        dest: &Path,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<ItemOutcome> {
        match self
            .download_and_register(provider, collection, cid, item, dest, policy, cancel)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(
                    event = "item.failed",
                    collection_id = cid,
                    source_id = item.source_id,
                    error = %e,
                    "item.failed"
                );
                if self.store.get_item(cid, item.source_id).await?.is_none() {
                    self.store
                        .upsert_item(
                            cid,
                            item.source_id,
                            ItemAttrs {
                                filename: Some(item.filename.clone()),
                                size: item.declared_size,
                                location: StorageLocation::Missing,
                                ..ItemAttrs::default()
                            },
                        )
                        .await?;
                }
                let reason = e.to_string();
                self.store
                    .set_status(cid, item.source_id, ItemStatus::Failed, Some(&reason))
                    .await?;
                Ok(ItemOutcome::Failed)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn download_and_register(
        &self,
        provider: &dyn SourceProvider,
        collection: &str,
        cid: CollectionId,
        item: &SourceItem,
        dest: &Path,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<ItemOutcome> {
        let label = format!("{cid}/{}", item.source_id);
        let written = run_with_retry(policy, &label, Some(cancel), move |_| async move {
            let n = provider.fetch_to(collection, item, dest).await?;
            let on_disk = tokio::fs::metadata(dest).await.map(|m| m.len()).unwrap_or(0);
            if n == 0 || on_disk == 0 {
                return Err(Error::CorruptResult {
                    path: dest.to_path_buf(),
                });
            }
            Ok(on_disk)
        })
        .await?;

        let sample_bytes = self.settings.dedup.sample_bytes;
        let path = dest.to_path_buf();
        let fingerprint = tokio::task::spawn_blocking(move || sample_fingerprint(&path, sample_bytes))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        let outcome = self
            .register_download(
                cid,
                item.source_id,
                dest,
                written,
                &fingerprint,
                Some(&item.filename),
            )
            .await?;
        Ok(match outcome {
            DownloadOutcome::Stored => ItemOutcome::Downloaded(written),
            DownloadOutcome::Duplicate { .. } => ItemOutcome::Duplicate(written),
        })
    }
}

fn absorb(
    summary: &mut RunSummary,
    joined: std::result::Result<Result<ItemOutcome>, tokio::task::JoinError>,
) -> Result<()> {
    let outcome = joined.map_err(|e| Error::Io(std::io::Error::other(e)))??;
    match outcome {
        ItemOutcome::Downloaded(bytes) => {
            summary.downloaded += 1;
            summary.bytes_downloaded += bytes;
        }
        ItemOutcome::Duplicate(_) => summary.duplicate += 1,
        ItemOutcome::Failed => summary.failed += 1,
    }
    Ok(())
}

fn remote_join(base: &str, rest: &str) -> String {
    let base = base.trim_matches('/');
    if base.is_empty() {
        normalize_path_str(rest)
    } else {
        normalize_path_str(&format!("{base}/{rest}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_join_stays_relative() {
        assert_eq!(remote_join("", "chat"), "chat");
        assert_eq!(remote_join("/backup/", "chat"), "backup/chat");
        assert_eq!(remote_join("backup", "chat/./1_a.jpg"), "backup/chat/1_a.jpg");
    }
}
