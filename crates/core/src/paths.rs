use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::model::SourceId;
use crate::{Error, Result};

pub fn path_to_utf8(path: &Path) -> Result<String> {
    path.to_str()
        .map(|s| s.to_string())
        .ok_or_else(|| Error::NonUtf8Path {
            path: path.to_path_buf(),
        })
}

/// Lexical normalization used for path matching: drops `.` components, folds `..`,
/// and uses `/` separators.
pub fn normalize_path_str(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    let absolute = unified.starts_with('/');
    for comp in Path::new(&unified).components() {
        match comp {
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            Component::Normal(s) => parts.push(s.to_str().unwrap_or_default()),
        }
    }
    let joined = parts.join("/");
    if absolute { format!("/{joined}") } else { joined }
}

/// Absolute, lexically normalized form of `path`, resolved against the working directory.
pub fn absolute_normalized(path: &Path) -> Result<PathBuf> {
    let abs = std::path::absolute(path)?;
    Ok(PathBuf::from(normalize_path_str(&path_to_utf8(&abs)?)))
}

/// Stable short key for a collection display name.
pub fn name_hash(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    hex::encode(&digest[..4])
}

pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = replaced.trim_matches(|c| c == '.' || c == ' ');
    if trimmed.is_empty() {
        return "unnamed".to_string();
    }
    if trimmed.chars().count() <= 200 {
        return trimmed.to_string();
    }
    let path = Path::new(trimmed);
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    let keep = 200usize.saturating_sub(ext.chars().count());
    let stem: String = trimmed.chars().take(keep).collect();
    format!("{stem}{ext}")
}

pub fn sanitize_dirname(name: &str) -> String {
    let cleaned = sanitize_filename(name);
    if cleaned == "unnamed" {
        return "unnamed_collection".to_string();
    }
    cleaned.chars().take(100).collect()
}

/// Leading integer of a `<id>_<rest>.<ext>` or `<id>.<ext>` filename.
pub fn extract_source_id(filename: &str) -> Option<SourceId> {
    let stem = Path::new(filename).file_stem()?.to_str()?;
    let head = stem.split('_').next()?;
    match head.parse::<SourceId>() {
        Ok(id) if id > 0 => Some(id),
        _ => None,
    }
}

pub fn is_hidden_name(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|s| s.starts_with('.'))
}

/// First path under `dir` named `filename`, or `stem_N.ext` if taken.
pub fn unique_path(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }
    let path = Path::new(filename);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename)
        .to_string();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    let mut counter = 1u32;
    loop {
        let next = dir.join(format!("{stem}_{counter}{ext}"));
        if !next.exists() {
            return next;
        }
        counter += 1;
    }
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut tmp = path.to_path_buf();
    tmp.set_extension(format!("tmp-{}", uuid::Uuid::new_v4()));

    let mut f = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&tmp)?;
    f.write_all(bytes)?;
    f.sync_all()?;
    drop(f);

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    // Best-effort directory sync (ignored on platforms where it isn't supported).
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// `rename`, falling back to copy + remove across filesystems.
pub fn move_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices => {
            fs::copy(src, dst)?;
            fs::remove_file(src)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_normalized_folds_dot_segments() {
        let dir = tempfile::tempdir().unwrap();
        let dotted = dir.path().join(".").join("backup").join("..").join("backup");
        let expected = normalize_path_str(dir.path().join("backup").to_str().unwrap());
        let got = absolute_normalized(&dotted).unwrap();
        assert_eq!(got.to_str().unwrap(), expected);
        assert!(got.is_absolute());
        assert!(absolute_normalized(Path::new("rel/./x")).unwrap().is_absolute());
    }

    #[test]
    fn extracts_leading_source_id() {
        assert_eq!(extract_source_id("123_holiday.jpg"), Some(123));
        assert_eq!(extract_source_id("77.mp4"), Some(77));
        assert_eq!(extract_source_id("holiday.jpg"), None);
        assert_eq!(extract_source_id("0_zero.jpg"), None);
    }

    #[test]
    fn normalizes_separators_and_dots() {
        assert_eq!(normalize_path_str("a\\b/./c"), "a/b/c");
        assert_eq!(normalize_path_str("/x/y/../z"), "/x/z");
        assert_eq!(normalize_path_str("./a/"), "a");
    }

    #[test]
    fn sanitizes_names() {
        assert_eq!(sanitize_filename("a/b:c?.jpg"), "a_b_c_.jpg");
        assert_eq!(sanitize_filename(" .. "), "unnamed");
        assert_eq!(sanitize_dirname(""), "unnamed_collection");
        assert_eq!(sanitize_filename(&"x".repeat(300)).len(), 200);
    }

    #[test]
    fn name_hash_is_stable_and_short() {
        assert_eq!(name_hash("Family"), name_hash("Family"));
        assert_ne!(name_hash("Family"), name_hash("Work"));
        assert_eq!(name_hash("Family").len(), 8);
    }

    #[test]
    fn unique_path_does_not_clobber() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("a_1.jpg"), b"x").unwrap();
        assert_eq!(unique_path(dir.path(), "a.jpg"), dir.path().join("a_2.jpg"));
        assert_eq!(unique_path(dir.path(), "b.jpg"), dir.path().join("b.jpg"));
    }

    #[test]
    fn write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.json");
        write_atomic(&path, b"{}").unwrap();
        write_atomic(&path, b"{\"a\":1}").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"a\":1}");
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
