use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::dedup_index::DedupIndex;
use crate::fingerprint::{full_hash, sample_fingerprint};
use crate::model::{
    CollectionId, Item, ItemAttrs, ItemRef, ItemStatus, SourceId, StorageLocation,
};
use crate::paths::{extract_source_id, is_hidden_name, normalize_path_str, path_to_utf8};
use crate::store::{ItemStore, basename};
use crate::{Error, Result};

pub const REASON_LOCAL: &str = "available locally";
pub const REASON_REMOTE: &str = "available remotely";
pub const REASON_BOTH: &str = "available in local and remote";
pub const REASON_MISSING: &str = "not found locally or remotely";

/// A file found under the local collection directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEntry {
    pub path: String,
    pub relative_path: String,
    pub filename: String,
    pub size: u64,
}

/// One object reported by the remote mirror; `hash` is a whole-file SHA-256 when known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    pub relative_path: String,
    pub size: u64,
    #[serde(default)]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub local_only: u64,
    pub remote_only: u64,
    pub both: u64,
    pub missing_marked: u64,
    pub resolved_by_path: u64,
    pub resolved_by_basename: u64,
    pub ambiguous: u64,
    pub unresolved: u64,
    pub duplicate_ids: u64,
    pub mismatched: u64,
    pub changed: u64,
    pub hashes_registered: u64,
}

/// Recursive listing of `root`, skipping hidden entries, symlinks, empty files and `quarantine`.
///
/// A missing root yields an empty listing. Entries are ordered by relative path.
pub fn list_local(root: &Path, quarantine: Option<&Path>) -> Result<Vec<LocalEntry>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(is_hidden_name(e.file_name()) || quarantine.is_some_and(|q| e.path() == q))
        });
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(event = "reconcile.walk_error", error = %e, "reconcile.walk_error");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let size = entry.metadata()?.len();
        if size == 0 {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| Error::InvalidInput {
                message: format!("{} escaped {}", entry.path().display(), root.display()),
            })?;
        let (Ok(path), Ok(relative_path)) = (path_to_utf8(entry.path()), path_to_utf8(rel)) else {
            warn!(
                event = "reconcile.non_utf8_path",
                path = %entry.path().display(),
                "reconcile.non_utf8_path"
            );
            continue;
        };
        out.push(LocalEntry {
            path: normalize_path_str(&path),
            relative_path: normalize_path_str(&relative_path),
            filename: entry.file_name().to_string_lossy().into_owned(),
            size,
        });
    }
    out.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(out)
}

enum Resolution {
    Filename(SourceId),
    Path(SourceId),
    Basename(SourceId),
    Ambiguous(usize),
    Unresolved,
}

/// Prior paths of one side (local paths or remote refs) and their owners.
struct PathIndex {
    exact: HashMap<String, SourceId>,
    by_basename: HashMap<String, BTreeSet<SourceId>>,
}

impl PathIndex {
    fn build<'a>(paths: impl Iterator<Item = (SourceId, &'a str)>) -> Self {
        let mut exact = HashMap::new();
        let mut by_basename: HashMap<String, BTreeSet<SourceId>> = HashMap::new();
        for (id, p) in paths {
            let norm = normalize_path_str(p);
            if let Some(base) = basename(&norm) {
                by_basename.entry(base).or_default().insert(id);
            }
            exact.insert(norm, id);
        }
        Self { exact, by_basename }
    }

    fn resolve(&self, filename: &str, path: &str) -> Resolution {
        if let Some(id) = extract_source_id(filename) {
            return Resolution::Filename(id);
        }
        if let Some(id) = self.exact.get(&normalize_path_str(path)) {
            return Resolution::Path(*id);
        }
        match self.by_basename.get(filename) {
            Some(ids) if ids.len() == 1 => match ids.first() {
                Some(id) => Resolution::Basename(*id),
                None => Resolution::Unresolved,
            },
            Some(ids) => Resolution::Ambiguous(ids.len()),
            None => Resolution::Unresolved,
        }
    }
}

/// Merges the local listing, the remote listing and the stored rows of one collection.
///
/// With `remote == None` the remote side is treated as unknown: stored remote presence is kept
/// and items known only remotely are left untouched. Unchanged inputs reach a fixed point: a
/// second run writes nothing.
pub async fn reconcile(
    store: &dyn ItemStore,
    dedup: Option<&DedupIndex>,
    collection_id: CollectionId,
    local: &[LocalEntry],
    remote: Option<&[RemoteEntry]>,
    sample_bytes: u64,
) -> Result<ReconciliationReport> {
    let mut report = ReconciliationReport::default();

    let existing: BTreeMap<SourceId, Item> = store
        .list_items(collection_id)
        .await?
        .into_iter()
        .map(|i| (i.source_id, i))
        .collect();
    let statuses: HashMap<SourceId, (ItemStatus, Option<String>)> = store
        .list_statuses(collection_id)
        .await?
        .into_iter()
        .map(|s| (s.source_id, (s.status, s.reason)))
        .collect();

    let local_index = PathIndex::build(
        existing
            .values()
            .filter_map(|i| i.local_path.as_deref().map(|p| (i.source_id, p))),
    );
    let remote_index = PathIndex::build(
        existing
            .values()
            .filter_map(|i| i.remote_ref.as_deref().map(|p| (i.source_id, p))),
    );

    let mut local_by_id: BTreeMap<SourceId, &LocalEntry> = BTreeMap::new();
    let mut sorted_local: Vec<&LocalEntry> = local.iter().collect();
    sorted_local.sort_by(|a, b| a.path.cmp(&b.path));
    for entry in sorted_local {
        let resolved = local_index.resolve(&entry.filename, &entry.path);
        if let Some(id) = record_resolution(&mut report, resolved, &entry.filename, &entry.path) {
            if local_by_id.contains_key(&id) {
                report.duplicate_ids += 1;
                continue;
            }
            local_by_id.insert(id, entry);
        }
    }

    let mut remote_by_id: BTreeMap<SourceId, &RemoteEntry> = BTreeMap::new();
    if let Some(remote) = remote {
        let mut sorted_remote: Vec<&RemoteEntry> = remote.iter().collect();
        sorted_remote.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        for entry in sorted_remote {
            let resolved = remote_index.resolve(&entry.name, &entry.relative_path);
            if let Some(id) =
                record_resolution(&mut report, resolved, &entry.name, &entry.relative_path)
            {
                if remote_by_id.contains_key(&id) {
                    report.duplicate_ids += 1;
                    continue;
                }
                remote_by_id.insert(id, entry);
            }
        }
    }

    let present: BTreeSet<SourceId> = local_by_id
        .keys()
        .chain(remote_by_id.keys())
        .copied()
        .collect();

    for id in &present {
        let prior = existing.get(id);
        let local_entry = local_by_id.get(id).copied();
        let remote_entry = remote_by_id.get(id).copied();

        let kept_remote_ref = match (remote.is_none(), prior) {
            (true, Some(p)) if has_remote_presence(p) => p.remote_ref.clone(),
            _ => None,
        };
        let remote_present = remote_entry.is_some() || kept_remote_ref.is_some();

        let mut attrs = desired_attrs(prior, local_entry, remote_entry, sample_bytes);
        if remote_entry.is_none() {
            attrs.remote_ref = kept_remote_ref;
        }
        attrs.location = StorageLocation::from_presence(local_entry.is_some(), remote_present);

        if let (Some(l), Some(r)) = (local_entry, remote_entry)
            && contents_differ(&mut attrs, l, r)
        {
            report.mismatched += 1;
            warn!(
                event = "reconcile.mismatch",
                collection_id,
                source_id = id,
                local_path = %l.path,
                remote_ref = %r.relative_path,
                local_size = l.size,
                remote_size = r.size,
                "reconcile.mismatch"
            );
        }

        let reason = match attrs.location {
            StorageLocation::Both => {
                report.both += 1;
                REASON_BOTH
            }
            StorageLocation::Remote => {
                report.remote_only += 1;
                REASON_REMOTE
            }
            _ => {
                report.local_only += 1;
                REASON_LOCAL
            }
        };

        if let (Some(dedup), Some(l), Some(fp)) =
            (dedup, local_entry, attrs.sample_fingerprint.as_deref())
            && dedup
                .register(l.size, fp, &l.path, Some(ItemRef::new(collection_id, *id)))
                .await?
        {
            report.hashes_registered += 1;
        }

        let changed = write_if_changed(
            store,
            collection_id,
            *id,
            prior,
            attrs,
            statuses.get(id),
            ItemStatus::Downloaded,
            reason,
        )
        .await?;
        if changed {
            report.changed += 1;
        }
    }

    for (id, prior) in &existing {
        if present.contains(id) {
            continue;
        }
        if remote.is_none() && has_remote_presence(prior) {
            continue;
        }
        if let Some(canonical) = store.is_duplicate(collection_id, *id).await?
            && canonical_is_present(store, canonical).await?
        {
            continue;
        }

        report.missing_marked += 1;
        let attrs = ItemAttrs {
            location: StorageLocation::Missing,
            ..prior.attrs()
        };
        let changed = write_if_changed(
            store,
            collection_id,
            *id,
            Some(prior),
            attrs,
            statuses.get(id),
            ItemStatus::Missing,
            REASON_MISSING,
        )
        .await?;
        if changed {
            debug!(event = "reconcile.mark_missing", collection_id, source_id = id, "reconcile.mark_missing");
            report.changed += 1;
        }
    }

    info!(
        event = "reconcile.finish",
        collection_id,
        local_only = report.local_only,
        remote_only = report.remote_only,
        both = report.both,
        missing = report.missing_marked,
        ambiguous = report.ambiguous,
        unresolved = report.unresolved,
        changed = report.changed,
        "reconcile.finish"
    );
    Ok(report)
}

fn record_resolution(
    report: &mut ReconciliationReport,
    resolution: Resolution,
    name: &str,
    path: &str,
) -> Option<SourceId> {
    match resolution {
        Resolution::Filename(id) => Some(id),
        Resolution::Path(id) => {
            report.resolved_by_path += 1;
            Some(id)
        }
        Resolution::Basename(id) => {
            report.resolved_by_basename += 1;
            Some(id)
        }
        Resolution::Ambiguous(candidates) => {
            report.ambiguous += 1;
            let e = Error::ReconciliationAmbiguity {
                basename: name.to_string(),
                candidates,
            };
            warn!(event = "reconcile.ambiguous", path, error = %e, "reconcile.ambiguous");
            None
        }
        Resolution::Unresolved => {
            report.unresolved += 1;
            debug!(event = "reconcile.unresolved", path, "reconcile.unresolved");
            None
        }
    }
}

fn has_remote_presence(item: &Item) -> bool {
    item.remote_ref.is_some()
        && matches!(item.location, StorageLocation::Remote | StorageLocation::Both)
}

async fn canonical_is_present(store: &dyn ItemStore, canonical: ItemRef) -> Result<bool> {
    Ok(store
        .get_item(canonical.collection_id, canonical.source_id)
        .await?
        .is_some_and(|c| c.location != StorageLocation::Missing))
}

fn desired_attrs(
    prior: Option<&Item>,
    local: Option<&LocalEntry>,
    remote: Option<&RemoteEntry>,
    sample_bytes: u64,
) -> ItemAttrs {
    let size = local.map(|l| l.size).or(remote.map(|r| r.size)).unwrap_or(0);
    let filename = local
        .map(|l| l.filename.clone())
        .or(remote.map(|r| r.name.clone()));

    // Prior hashes stay valid while the same bytes are at the same place.
    let reusable = prior.filter(|p| {
        p.size == size
            && match local {
                Some(l) => p.local_path.as_deref() == Some(l.path.as_str()),
                None => true,
            }
    });

    let sample = match (local, reusable.and_then(|p| p.sample_fingerprint.clone())) {
        (_, Some(fp)) => Some(fp),
        (Some(l), None) => match sample_fingerprint(Path::new(&l.path), sample_bytes) {
            Ok(fp) => Some(fp),
            Err(e) => {
                warn!(
                    event = "reconcile.fingerprint_failed",
                    path = %l.path,
                    error = %e,
                    "reconcile.fingerprint_failed"
                );
                None
            }
        },
        (None, None) => None,
    };

    ItemAttrs {
        filename,
        local_path: local.map(|l| l.path.clone()),
        remote_ref: remote.map(|r| normalize_path_str(&r.relative_path)),
        size,
        sample_fingerprint: sample,
        full_fingerprint: reusable.and_then(|p| p.full_fingerprint.clone()),
        location: StorageLocation::Missing,
        touched_at: None,
    }
}

/// Compares both copies: by whole-file hash when the remote reports one, else by size.
fn contents_differ(attrs: &mut ItemAttrs, local: &LocalEntry, remote: &RemoteEntry) -> bool {
    let Some(remote_hash) = remote.hash.as_deref() else {
        return local.size != remote.size;
    };
    if attrs.full_fingerprint.is_none() {
        match full_hash(Path::new(&local.path)) {
            Ok(h) => attrs.full_fingerprint = Some(h),
            Err(e) => {
                warn!(
                    event = "reconcile.full_hash_failed",
                    path = %local.path,
                    error = %e,
                    "reconcile.full_hash_failed"
                );
                return local.size != remote.size;
            }
        }
    }
    attrs
        .full_fingerprint
        .as_deref()
        .is_some_and(|h| !h.eq_ignore_ascii_case(remote_hash))
}

#[allow(clippy::too_many_arguments)]
async fn write_if_changed(
    store: &dyn ItemStore,
    collection_id: CollectionId,
    source_id: SourceId,
    prior: Option<&Item>,
    attrs: ItemAttrs,
    prior_status: Option<&(ItemStatus, Option<String>)>,
    status: ItemStatus,
    reason: &str,
) -> Result<bool> {
    let mut changed = false;
    if prior.map(|p| p.attrs()).as_ref() != Some(&attrs) {
        store.upsert_item(collection_id, source_id, attrs).await?;
        changed = true;
    }
    let status_same = prior_status
        .is_some_and(|(s, r)| *s == status && r.as_deref() == Some(reason));
    if !status_same {
        store
            .set_status(collection_id, source_id, status, Some(reason))
            .await?;
        changed = true;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_prefers_filename_then_path_then_unique_basename() {
        let index = PathIndex::build(
            [
                (10, "/b/chat/holiday.jpg"),
                (11, "/b/chat/a/same.jpg"),
                (12, "/b/chat/b/same.jpg"),
                (13, "/b/chat/x/other.jpg"),
            ]
            .into_iter(),
        );

        assert!(matches!(
            index.resolve("42_holiday.jpg", "/b/chat/holiday.jpg"),
            Resolution::Filename(42)
        ));
        assert!(matches!(
            index.resolve("holiday.jpg", "/b/chat/./holiday.jpg"),
            Resolution::Path(10)
        ));
        assert!(matches!(
            index.resolve("other.jpg", "/b/chat/moved/other.jpg"),
            Resolution::Basename(13)
        ));
        assert!(matches!(
            index.resolve("same.jpg", "/b/chat/c/same.jpg"),
            Resolution::Ambiguous(2)
        ));
        assert!(matches!(
            index.resolve("new.jpg", "/b/chat/new.jpg"),
            Resolution::Unresolved
        ));
    }

    #[test]
    fn list_local_skips_hidden_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("1_a.jpg"), b"a").unwrap();
        std::fs::write(root.join("sub/2_b.jpg"), b"b").unwrap();
        std::fs::write(root.join(".3_c.jpg"), b"c").unwrap();
        std::fs::write(root.join("4_empty.jpg"), b"").unwrap();

        let entries = list_local(root, None).unwrap();
        let rels: Vec<&str> = entries.iter().map(|e| e.relative_path.as_str()).collect();
        assert_eq!(rels, vec!["1_a.jpg", "sub/2_b.jpg"]);
        assert!(list_local(&root.join("absent"), None).unwrap().is_empty());
    }

    #[test]
    fn size_only_comparison_without_remote_hash() {
        let local = LocalEntry {
            path: "/nonexistent/1_a.jpg".to_string(),
            relative_path: "1_a.jpg".to_string(),
            filename: "1_a.jpg".to_string(),
            size: 10,
        };
        let mut remote = RemoteEntry {
            name: "1_a.jpg".to_string(),
            relative_path: "1_a.jpg".to_string(),
            size: 10,
            hash: None,
        };
        let mut attrs = ItemAttrs::default();
        assert!(!contents_differ(&mut attrs, &local, &remote));
        remote.size = 11;
        assert!(contents_differ(&mut attrs, &local, &remote));
    }
}
