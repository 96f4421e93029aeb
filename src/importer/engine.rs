//! The import engine itself (`spec.md` §4.6).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use once_cell::sync::OnceCell;

use crate::buildcfg::NODE_MARKER_NAME;
use crate::fs::NodeRoot;
use crate::index::{CopyState, Pool as IndexPool};

use super::detect::{DetectOutcome, Detector};

/// The reserved prefix used for hidden temporary files produced by
/// transfers (`spec.md` §4.7 step 3) — never a legitimate import
/// target.
const TEMP_PREFIX: &str = ".";

#[derive(Debug, Clone, PartialEq)]
pub enum ImportOutcome {
    /// A file was registered (or already matched an existing,
    /// identical registration).
    Registered { acq_name: String, file_name: String, file_id: i64 },
    /// No detector claimed the path; this is not an error (`spec.md`
    /// §4.6 step 2).
    NotAnAcquisitionPath,
}

type HashCell = Arc<OnceCell<Result<(u64, [u8; 16]), String>>>;

/// Applies registered [`Detector`]s to paths and atomically registers
/// the resulting acquisition/file/copy rows. Owns the in-flight
/// hashing table that gives the one-hash-per-path guarantee
/// (`spec.md` §4.6 step 3, Testable Property 2).
pub struct ImportEngine {
    detectors: Vec<Box<dyn Detector>>,
    in_flight_hashes: Mutex<HashMap<PathBuf, HashCell>>,
}

impl ImportEngine {
    pub fn new(detectors: Vec<Box<dyn Detector>>) -> Self {
        ImportEngine { detectors, in_flight_hashes: Mutex::new(HashMap::new()) }
    }

    fn rejected(rel_path: &Path) -> bool {
        if rel_path.to_string_lossy().ends_with('/') {
            return true;
        }
        let base = rel_path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        base == NODE_MARKER_NAME || base.starts_with(TEMP_PREFIX)
    }

    fn hash_shared(&self, root: &NodeRoot, rel_path: &Path) -> Result<(u64, [u8; 16])> {
        let cell = {
            let mut table = self.in_flight_hashes.lock().unwrap();
            table.entry(rel_path.to_owned()).or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };

        let result = cell
            .get_or_init(|| root.hash(rel_path).map_err(|e| e.to_string()))
            .clone();

        // Only the entry that computed the value needs to clean up;
        // harmless if two threads both attempt it.
        self.in_flight_hashes.lock().unwrap().remove(rel_path);

        result.map_err(|e| anyhow::anyhow!(e))
    }

    /// Import a single path. Idempotent for the same `(node, path)`
    /// pair (`spec.md` §9 idempotency keys).
    pub async fn import_path(
        &self,
        index: &IndexPool,
        root: &NodeRoot,
        node_name: &str,
        rel_path: &Path,
        register_new: bool,
        completing_copy_request: Option<i64>,
    ) -> Result<ImportOutcome> {
        if Self::rejected(rel_path) {
            bail!("refusing to import reserved path {:?}", rel_path);
        }

        if !register_new {
            // A re-import of a path already known to the index with
            // no intent to register new content is a no-op catch-up
            // scan hit; still fine to proceed, since step 4 below is
            // itself idempotent.
        }

        let outcome = self
            .detectors
            .iter()
            .map(|d| (d, d.detect(rel_path)))
            .find(|(_, o)| !matches!(o, DetectOutcome::Decline));

        let (acq_name, _acq_type, file_name, _file_type, _extra) = match outcome {
            Some((
                _,
                DetectOutcome::Accept { acq_name, acq_type, file_name, file_type, extra },
            )) => (acq_name, acq_type, file_name, file_type, extra),
            _ => {
                log::info!("Not importing non-acquisition path {:?}", rel_path);
                return Ok(ImportOutcome::NotAnAcquisitionPath);
            }
        };

        let (size, digest) = self
            .hash_shared(root, rel_path)
            .with_context(|| format!("hashing {:?}", rel_path))?;

        index.upsert_acquisition(&acq_name).await?;
        let file = index
            .upsert_file(&acq_name, &file_name, size as i64, &digest)
            .await
            .with_context(|| format!("registering file {}/{}", acq_name, file_name))?;

        index.find_or_create_copy(file.id, node_name).await?;
        index.set_copy_state(file.id, node_name, CopyState::Healthy, size as i64).await?;

        if let Some(request_id) = completing_copy_request {
            index.complete_copy_request(request_id).await?;
        }

        log::info!("imported {}/{} on {}", acq_name, file_name, node_name);

        Ok(ImportOutcome::Registered { acq_name, file_name, file_id: file.id })
    }

    /// Walk a directory in sorted order, returning the relative paths
    /// of regular files found (`spec.md` §4.6 "Scan of a directory").
    /// Callers enqueue one import task per path and yield between
    /// batches to stay responsive.
    pub fn scan_paths(root: &NodeRoot, rel_dir: &Path) -> Result<Vec<PathBuf>> {
        root.list_dir(rel_dir).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::importer::DefaultDetector;

    #[test]
    fn rejects_the_node_marker_and_hidden_temp_names() {
        assert!(ImportEngine::rejected(Path::new("ALPENHORN_NODE")));
        assert!(ImportEngine::rejected(Path::new("2025/02/21/.meta.txt.abc123")));
        assert!(!ImportEngine::rejected(Path::new("2025/02/21/meta.txt")));
    }

    #[test]
    fn scan_paths_lists_files_under_a_tree() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("2025/02/21")).unwrap();
        std::fs::write(tmp.path().join("2025/02/21/a.txt"), b"a").unwrap();
        std::fs::write(tmp.path().join("2025/02/21/b.txt"), b"b").unwrap();

        let root = NodeRoot::new(tmp.path());
        let paths = ImportEngine::scan_paths(&root, Path::new("2025")).unwrap();
        assert_eq!(paths.len(), 2);
    }

    #[test]
    fn engine_constructs_with_default_detector() {
        let engine = ImportEngine::new(vec![Box::new(DefaultDetector)]);
        assert_eq!(engine.detectors.len(), 1);
    }
}
