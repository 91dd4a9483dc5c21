use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{error, info};

use crate::Result;
use crate::dedup_index::DedupIndex;
use crate::paths::{absolute_normalized, move_file, path_to_utf8, unique_path};
use crate::scanner::DuplicateGroup;
use crate::store::ItemStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationReport {
    pub groups: u64,
    pub moved: u64,
    pub bytes_moved: u64,
    pub failed: u64,
    pub records_updated: u64,
}

/// Keeps one canonical file per group and relocates the rest under `quarantine`,
/// mirroring their path relative to `root`.
///
/// Nothing is deleted. A failed move is logged and counted; the remaining members and groups
/// are still processed. Store failures abort.
pub async fn consolidate(
    root: &Path,
    quarantine: &Path,
    groups: &[DuplicateGroup],
    store: &dyn ItemStore,
    dedup: Option<&DedupIndex>,
) -> Result<ConsolidationReport> {
    let mut report = ConsolidationReport::default();
    let root = absolute_normalized(root)?;
    let quarantine = absolute_normalized(quarantine)?;

    for group in groups {
        if group.paths.len() < 2 {
            continue;
        }
        report.groups += 1;
        let paths = group
            .paths
            .iter()
            .map(|p| absolute_normalized(Path::new(p)).and_then(|p| path_to_utf8(&p)))
            .collect::<Result<Vec<String>>>()?;
        let canonical = choose_canonical(&paths, store).await?;
        info!(
            event = "consolidate.group",
            size = group.size,
            copies = group.paths.len(),
            canonical = %canonical,
            "consolidate.group"
        );

        for member in paths.iter().filter(|p| **p != canonical) {
            let dest = match quarantine_target(&root, &quarantine, Path::new(member)) {
                Ok(dest) => dest,
                Err(e) => {
                    error!(event = "consolidate.move_failed", path = %member, error = %e, "consolidate.move_failed");
                    report.failed += 1;
                    continue;
                }
            };
            if let Err(e) = move_file(Path::new(member), &dest) {
                error!(
                    event = "consolidate.move_failed",
                    path = %member,
                    dest = %dest.display(),
                    error = %e,
                    "consolidate.move_failed"
                );
                report.failed += 1;
                continue;
            }
            report.moved += 1;
            report.bytes_moved += group.size;

            let dest_str = path_to_utf8(&dest)?;
            report.records_updated += store.update_path(member, &dest_str).await?;
        }

        if let Some(dedup) = dedup {
            let owner = store
                .find_items_by_path(&canonical)
                .await?
                .first()
                .map(|i| i.item_ref());
            dedup
                .claim(group.size, &group.fingerprint, &canonical, owner)
                .await?;
        }
    }

    info!(
        event = "consolidate.finish",
        groups = report.groups,
        moved = report.moved,
        bytes_moved = report.bytes_moved,
        failed = report.failed,
        "consolidate.finish"
    );
    Ok(report)
}

/// First path the store already references, else the lexicographically first.
async fn choose_canonical(paths: &[String], store: &dyn ItemStore) -> Result<String> {
    let mut sorted: Vec<&String> = paths.iter().collect();
    sorted.sort();
    for p in &sorted {
        if !store.find_items_by_path(p).await?.is_empty() {
            return Ok((*p).clone());
        }
    }
    Ok(sorted[0].clone())
}

fn quarantine_target(root: &Path, quarantine: &Path, member: &Path) -> std::io::Result<PathBuf> {
    let rel = member.strip_prefix(root).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} is outside {}", member.display(), root.display()),
        )
    })?;
    let target = quarantine.join(rel);
    let parent = target.parent().unwrap_or(quarantine);
    std::fs::create_dir_all(parent)?;
    if !target.exists() {
        return Ok(target);
    }
    let name = rel
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("duplicate");
    Ok(unique_path(parent, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_mirrors_relative_path_without_clobbering() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let q = root.join("duplicates");
        let member = root.join("chat/1_a.jpg");

        let first = quarantine_target(root, &q, &member).unwrap();
        assert_eq!(first, q.join("chat/1_a.jpg"));
        std::fs::write(&first, b"x").unwrap();

        let second = quarantine_target(root, &q, &member).unwrap();
        assert_eq!(second, q.join("chat/1_a_1.jpg"));

        assert!(quarantine_target(root, &q, Path::new("/elsewhere/x.jpg")).is_err());
    }
}
