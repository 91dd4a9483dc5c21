use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::fingerprint::{DEFAULT_SAMPLE_BYTES, full_hash, sample_fingerprint};
use crate::paths::{absolute_normalized, is_hidden_name, normalize_path_str, path_to_utf8, write_atomic};
use crate::progress::{ProgressSink, TaskProgress, ThrottledProgress};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub sample_bytes: u64,
    /// Confirm sample-digest groups with a whole-file hash.
    pub full_hash: bool,
    /// Subtree excluded from traversal (consolidation target).
    pub quarantine_dir: Option<PathBuf>,
    pub progress_interval: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            sample_bytes: DEFAULT_SAMPLE_BYTES,
            full_hash: true,
            quarantine_dir: None,
            progress_interval: Duration::from_millis(500),
        }
    }
}

/// Two or more files with identical size and fingerprint; paths sorted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub size: u64,
    pub fingerprint: String,
    pub full_hash: Option<String>,
    pub paths: Vec<String>,
}

impl DuplicateGroup {
    pub fn total_bytes(&self) -> u64 {
        self.size * self.paths.len() as u64
    }
}

/// Finds duplicate files under `root` with a size → sample digest → full hash funnel.
///
/// Hidden entries, symlinks, empty files and the quarantine subtree are never visited.
/// Unreadable files are logged and left out. Output order is deterministic.
pub fn scan_for_duplicates(
    root: &Path,
    options: &ScanOptions,
    progress: Option<&dyn ProgressSink>,
    cancel: Option<&CancellationToken>,
) -> Result<Vec<DuplicateGroup>> {
    if !root.is_dir() {
        return Err(Error::InvalidInput {
            message: format!("scan root is not a directory: {}", root.display()),
        });
    }
    let root = absolute_normalized(root)?;
    let quarantine = options
        .quarantine_dir
        .as_deref()
        .map(absolute_normalized)
        .transpose()?;
    let progress = ThrottledProgress::new(progress, options.progress_interval);

    let by_size = collect_sizes(&root, quarantine.as_deref(), &progress, cancel)?;
    let candidates: Vec<(u64, Vec<PathBuf>)> = by_size
        .into_iter()
        .filter(|(_, paths)| paths.len() >= 2)
        .collect();
    let total: u64 = candidates.iter().map(|(_, p)| p.len() as u64).sum();
    debug!(
        event = "scan.size_buckets",
        buckets = candidates.len(),
        files = total,
        "scan.size_buckets"
    );

    let mut done = 0u64;
    let mut sampled: Vec<(u64, String, Vec<String>)> = Vec::new();
    for (size, paths) in candidates {
        let mut by_fp: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for path in paths {
            check_cancel(cancel)?;
            done += 1;
            let Some(path_str) = utf8_or_warn(&path) else {
                continue;
            };
            match sample_fingerprint(&path, options.sample_bytes) {
                Ok(fp) => by_fp.entry(fp).or_default().push(path_str),
                Err(e) => warn!(
                    event = "scan.fingerprint_failed",
                    path = %path.display(),
                    error = %e,
                    "scan.fingerprint_failed"
                ),
            }
            progress.update(TaskProgress {
                phase: "sample".to_string(),
                files_total: Some(total),
                files_done: Some(done),
                ..TaskProgress::default()
            });
        }
        sampled.extend(
            by_fp
                .into_iter()
                .filter(|(_, p)| p.len() >= 2)
                .map(|(fp, p)| (size, fp, p)),
        );
    }
    progress.force(TaskProgress {
        phase: "sample".to_string(),
        files_total: Some(total),
        files_done: Some(done),
        groups_found: Some(sampled.len() as u64),
        ..TaskProgress::default()
    });

    let mut groups = Vec::new();
    if options.full_hash {
        let total: u64 = sampled.iter().map(|(_, _, p)| p.len() as u64).sum();
        let mut done = 0u64;
        for (size, fingerprint, paths) in sampled {
            let mut by_full: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for path in paths {
                check_cancel(cancel)?;
                done += 1;
                match full_hash(Path::new(&path)) {
                    Ok(h) => by_full.entry(h).or_default().push(path),
                    Err(e) => warn!(
                        event = "scan.full_hash_failed",
                        path = %path,
                        error = %e,
                        "scan.full_hash_failed"
                    ),
                }
                progress.update(TaskProgress {
                    phase: "full".to_string(),
                    files_total: Some(total),
                    files_done: Some(done),
                    bytes_done: Some(done * size),
                    groups_found: Some(groups.len() as u64),
                });
            }
            for (h, paths) in by_full {
                if paths.len() >= 2 {
                    groups.push(DuplicateGroup {
                        size,
                        fingerprint: fingerprint.clone(),
                        full_hash: Some(h),
                        paths,
                    });
                }
            }
        }
    } else {
        groups.extend(sampled.into_iter().map(|(size, fingerprint, paths)| DuplicateGroup {
            size,
            fingerprint,
            full_hash: None,
            paths,
        }));
    }

    for g in &mut groups {
        g.paths.sort();
    }
    groups.sort_by(|a, b| a.paths.cmp(&b.paths));

    progress.force(TaskProgress {
        phase: "done".to_string(),
        groups_found: Some(groups.len() as u64),
        ..TaskProgress::default()
    });
    info!(
        event = "scan.finish",
        root = %root.display(),
        groups = groups.len(),
        redundant_bytes = groups.iter().map(|g| g.total_bytes() - g.size).sum::<u64>(),
        "scan.finish"
    );
    Ok(groups)
}

fn collect_sizes(
    root: &Path,
    quarantine: Option<&Path>,
    progress: &ThrottledProgress<'_>,
    cancel: Option<&CancellationToken>,
) -> Result<BTreeMap<u64, Vec<PathBuf>>> {
    let mut by_size: BTreeMap<u64, Vec<PathBuf>> = BTreeMap::new();
    let mut seen = 0u64;

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(is_hidden_name(e.file_name()) || quarantine.is_some_and(|q| e.path() == q))
        });

    for entry in walker {
        check_cancel(cancel)?;
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(event = "scan.walk_error", error = %e, "scan.walk_error");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let len = match entry.metadata() {
            Ok(m) => m.len(),
            Err(e) => {
                warn!(
                    event = "scan.metadata_failed",
                    path = %entry.path().display(),
                    error = %e,
                    "scan.metadata_failed"
                );
                continue;
            }
        };
        if len == 0 {
            continue;
        }
        by_size.entry(len).or_default().push(entry.into_path());
        seen += 1;
        progress.update(TaskProgress {
            phase: "size".to_string(),
            files_done: Some(seen),
            ..TaskProgress::default()
        });
    }
    progress.force(TaskProgress {
        phase: "size".to_string(),
        files_total: Some(seen),
        files_done: Some(seen),
        ..TaskProgress::default()
    });
    Ok(by_size)
}

/// Writes the groups as a pretty JSON array of path arrays.
pub fn write_groups_json(groups: &[DuplicateGroup], path: &Path) -> Result<()> {
    let arrays: Vec<&Vec<String>> = groups.iter().map(|g| &g.paths).collect();
    let mut bytes = serde_json::to_vec_pretty(&arrays)?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)?;
    Ok(())
}

fn check_cancel(cancel: Option<&CancellationToken>) -> Result<()> {
    if let Some(cancel) = cancel
        && cancel.is_cancelled()
    {
        return Err(Error::Cancelled);
    }
    Ok(())
}

fn utf8_or_warn(path: &Path) -> Option<String> {
    match path_to_utf8(path) {
        Ok(s) => Some(normalize_path_str(&s)),
        Err(e) => {
            warn!(event = "scan.non_utf8_path", error = %e, "scan.non_utf8_path");
            None
        }
    }
}
