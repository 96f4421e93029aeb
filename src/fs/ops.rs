//! Read/write operations on a node's root (`spec.md` §4.3, §6).
//!
//! Paths passed to every method here are relative to the node root;
//! this module is the only place that assembles an absolute path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use walkdir::WalkDir;

use crate::buildcfg::NODE_MARKER_NAME;

use super::hash::{hash_file_md5, HashError};
use super::lock::{ReadGuard, UpdateDownLock, WriteGuard};

#[derive(Debug, Error)]
pub enum FsError {
    #[error("node root {0:?} has no {marker} marker", marker = NODE_MARKER_NAME)]
    NotInitialised(PathBuf),

    #[error("node root {0:?} marker does not match node name {1:?}")]
    MarkerMismatch(PathBuf, String),

    #[error("refusing to escape node root with path {0:?}")]
    PathEscapesRoot(PathBuf),

    #[error(transparent)]
    Hash(#[from] HashError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A filesystem root belonging to one [`crate::index::Node`].
///
/// Carries an [`UpdateDownLock`] shared across every clone of the
/// same root (`spec.md` §4.3, §5): callers that obtain a `NodeRoot`
/// for the same node from the same source (see
/// `DaemonContext::node_root`) serialize scans against writers
/// through this lock rather than each getting an independent one.
#[derive(Debug, Clone)]
pub struct NodeRoot {
    root: PathBuf,
    lock: Arc<UpdateDownLock>,
}

impl NodeRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        NodeRoot { root: root.into(), lock: Arc::new(UpdateDownLock::new()) }
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// Acquire the update-down lock for a bulk scan (tree walk). Held
    /// only for the duration of the walk, not across per-file import
    /// work (`spec.md` §4.3).
    pub fn scan_guard(&self) -> ReadGuard<'_> {
        self.lock.read()
    }

    /// Acquire the update-down lock for a single-file mutation
    /// (rename-into-place, delete).
    pub fn mutate_guard(&self) -> WriteGuard<'_> {
        self.lock.write()
    }

    /// Resolve a path relative to the root, refusing anything that
    /// would escape it via `..` components.
    fn resolve(&self, relative: &Path) -> Result<PathBuf, FsError> {
        for component in relative.components() {
            if matches!(component, std::path::Component::ParentDir) {
                return Err(FsError::PathEscapesRoot(relative.to_owned()));
            }
        }
        Ok(self.root.join(relative))
    }

    pub fn exists(&self, relative: &Path) -> Result<bool, FsError> {
        Ok(self.resolve(relative)?.exists())
    }

    pub fn stat(&self, relative: &Path) -> Result<std::fs::Metadata, FsError> {
        Ok(std::fs::metadata(self.resolve(relative)?)?)
    }

    /// Streaming MD5 of the file at `relative` (`spec.md` §9).
    pub fn hash(&self, relative: &Path) -> Result<(u64, [u8; 16]), FsError> {
        Ok(hash_file_md5(&self.resolve(relative)?)?)
    }

    pub fn atomic_rename(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        let from = self.resolve(from)?;
        let to = self.resolve(to)?;
        self.mkdir_parents(&to)?;
        let _guard = self.mutate_guard();
        std::fs::rename(&from, &to)?;
        Ok(())
    }

    /// `relative` may be a file path or a directory; parents of the
    /// file path (or the directory itself) are created.
    pub fn mkdir_parents(&self, relative: &Path) -> Result<(), FsError> {
        let resolved = if relative.starts_with(&self.root) {
            relative.to_owned()
        } else {
            self.resolve(relative)?
        };
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    pub fn remove_file(&self, relative: &Path) -> Result<(), FsError> {
        let resolved = self.resolve(relative)?;
        let _guard = self.mutate_guard();
        Ok(std::fs::remove_file(resolved)?)
    }

    /// Remove now-empty parent directories of `relative`, walking
    /// upward only as far as the node root. The root itself (and
    /// therefore the `ALPENHORN_NODE` marker it holds) is never
    /// removed (`spec.md` §4.4 `delete()` contract).
    pub fn remove_empty_parents_up_to_root(&self, relative: &Path) -> Result<(), FsError> {
        let mut dir = match self.resolve(relative)?.parent() {
            Some(p) => p.to_owned(),
            None => return Ok(()),
        };

        loop {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            match std::fs::read_dir(&dir) {
                Ok(mut entries) => {
                    if entries.next().is_some() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) => return Err(e.into()),
            }
            std::fs::remove_dir(&dir)?;
            match dir.parent() {
                Some(p) => dir = p.to_owned(),
                None => break,
            }
        }
        Ok(())
    }

    pub fn bytes_available(&self) -> Result<u64, FsError> {
        let stat = nix::sys::statvfs::statvfs(&self.root).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::Other, format!("statvfs failed: {}", e))
        })?;
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }

    /// List regular files under `relative` (a directory), in sorted
    /// order, for C6's deterministic tree scan.
    pub fn list_dir(&self, relative: &Path) -> Result<Vec<PathBuf>, FsError> {
        let base = self.resolve(relative)?;
        let _guard = self.scan_guard();
        let mut out = Vec::new();
        for entry in WalkDir::new(&base).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            if entry.file_type().is_file() {
                let rel = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
                out.push(rel.to_owned());
            }
        }
        Ok(out)
    }

    /// Read and validate the `ALPENHORN_NODE` marker (`spec.md` §6).
    pub fn read_marker(&self, expected_name: &str) -> Result<(), FsError> {
        let marker_path = self.root.join(NODE_MARKER_NAME);
        let contents = std::fs::read_to_string(&marker_path)
            .map_err(|_| FsError::NotInitialised(self.root.clone()))?;
        if contents.trim_end_matches('\n') != expected_name {
            return Err(FsError::MarkerMismatch(self.root.clone(), expected_name.to_string()));
        }
        Ok(())
    }

    /// Create the `ALPENHORN_NODE` marker if absent, atomically.
    pub fn write_marker(&self, name: &str) -> Result<(), FsError> {
        let marker_path = self.root.join(NODE_MARKER_NAME);
        if marker_path.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.root)?;
        let tmp_path = self.root.join(format!(".{}.tmp", NODE_MARKER_NAME));
        std::fs::write(&tmp_path, format!("{}\n", name))?;
        std::fs::rename(&tmp_path, &marker_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let root = NodeRoot::new(tmp.path());
        root.write_marker("n1").unwrap();
        assert!(root.read_marker("n1").is_ok());
        assert!(matches!(root.read_marker("n2"), Err(FsError::MarkerMismatch(_, _))));
    }

    #[test]
    fn missing_marker_is_not_initialised() {
        let tmp = tempfile::tempdir().unwrap();
        let root = NodeRoot::new(tmp.path());
        assert!(matches!(root.read_marker("n1"), Err(FsError::NotInitialised(_))));
    }

    #[test]
    fn rejects_paths_that_escape_the_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = NodeRoot::new(tmp.path());
        let escaping = Path::new("../../etc/passwd");
        assert!(matches!(root.exists(escaping), Err(FsError::PathEscapesRoot(_))));
    }

    #[test]
    fn removes_empty_parents_but_stops_at_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = NodeRoot::new(tmp.path());
        std::fs::create_dir_all(tmp.path().join("2025/02/21")).unwrap();
        std::fs::write(tmp.path().join("2025/02/21/meta.txt"), b"x").unwrap();
        std::fs::remove_file(tmp.path().join("2025/02/21/meta.txt")).unwrap();

        root.remove_empty_parents_up_to_root(Path::new("2025/02/21/meta.txt")).unwrap();

        assert!(!tmp.path().join("2025/02/21").exists());
        assert!(!tmp.path().join("2025").exists());
        assert!(tmp.path().exists());
    }
}
