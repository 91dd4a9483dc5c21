use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::fingerprint::full_hash;
use crate::paths::{move_file, normalize_path_str, path_to_utf8};
use crate::reconcile::RemoteEntry;
use crate::store::BoxFuture;
use crate::{Error, Result};

/// Remote copy of the backup tree. Paths are `/`-separated and relative to the mirror root.
pub trait RemoteMirror: Send + Sync {
    fn provider(&self) -> &'static str;

    /// Recursive listing under `path`; `relative_path` of each entry is relative to `path`.
    /// A path that does not exist lists as empty.
    fn list<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Vec<RemoteEntry>>;

    fn copy<'a>(&'a self, src: &'a Path, dst: &'a str) -> BoxFuture<'a, ()>;

    /// Copies then removes the local source.
    fn move_to<'a>(&'a self, src: &'a Path, dst: &'a str) -> BoxFuture<'a, ()>;
}

/// Mirror backed by a local directory (a mounted remote, or a test double).
pub struct LocalDirMirror {
    root: PathBuf,
}

impl LocalDirMirror {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let norm = normalize_path_str(rel);
        let p = Path::new(&norm);
        if p.components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::InvalidInput {
                message: format!("mirror path must be relative and stay inside the mirror: {rel:?}"),
            });
        }
        Ok(self.root.join(p))
    }

    fn list_blocking(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let base = if normalize_path_str(path).is_empty() {
            self.root.clone()
        } else {
            self.resolve(path)?
        };
        if !base.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in WalkDir::new(&base).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(event = "mirror.walk_error", error = %e, "mirror.walk_error");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(&base).map_err(|_| Error::InvalidInput {
                message: format!("{} escaped {}", entry.path().display(), base.display()),
            })?;
            let hash = match full_hash(entry.path()) {
                Ok(h) => Some(h),
                Err(e) => {
                    warn!(event = "mirror.hash_failed", path = %entry.path().display(), error = %e, "mirror.hash_failed");
                    None
                }
            };
            out.push(RemoteEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                relative_path: normalize_path_str(&path_to_utf8(rel)?),
                size: entry.metadata()?.len(),
                hash,
            });
        }
        Ok(out)
    }

    fn copy_blocking(&self, src: &Path, dst: &str) -> Result<PathBuf> {
        let target = self.resolve(dst)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(src, &target)?;
        Ok(target)
    }
}

impl RemoteMirror for LocalDirMirror {
    fn provider(&self) -> &'static str {
        "local.dir"
    }

    fn list<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Vec<RemoteEntry>> {
        Box::pin(async move { self.list_blocking(path) })
    }

    fn copy<'a>(&'a self, src: &'a Path, dst: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let target = self.copy_blocking(src, dst)?;
            debug!(event = "mirror.copy", src = %src.display(), dst = %target.display(), "mirror.copy");
            Ok(())
        })
    }

    fn move_to<'a>(&'a self, src: &'a Path, dst: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let target = self.resolve(dst)?;
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            move_file(src, &target)?;
            debug!(event = "mirror.move", src = %src.display(), dst = %target.display(), "mirror.move");
            Ok(())
        })
    }
}
