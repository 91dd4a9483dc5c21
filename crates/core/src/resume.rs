use std::path::Path;

use tracing::debug;

use crate::model::Item;

pub const SIZE_TOLERANCE_RATIO: f64 = 0.01;
pub const SIZE_TOLERANCE_BYTES: u64 = 1024;

/// Whether a previously recorded item can be skipped on resume.
///
/// Invalid when there is no recorded path, the file is gone, or it is empty. With a known
/// declared size the actual size must be within 1% or within 1 KiB of it.
pub fn is_intact(item: &Item) -> bool {
    let Some(path) = item.local_path.as_deref() else {
        return false;
    };
    let actual = match std::fs::metadata(Path::new(path)) {
        Ok(m) if m.is_file() => m.len(),
        _ => return false,
    };
    let ok = size_within_tolerance(item.size, actual);
    if !ok {
        debug!(
            event = "resume.size_mismatch",
            collection_id = item.collection_id,
            source_id = item.source_id,
            path,
            declared = item.size,
            actual,
            "resume.size_mismatch"
        );
    }
    ok
}

/// `declared == 0` means unknown: any non-empty file passes.
pub fn size_within_tolerance(declared: u64, actual: u64) -> bool {
    if actual == 0 {
        return false;
    }
    if declared == 0 {
        return true;
    }
    let diff = declared.abs_diff(actual);
    diff <= SIZE_TOLERANCE_BYTES || (diff as f64 / declared as f64) <= SIZE_TOLERANCE_RATIO
}
