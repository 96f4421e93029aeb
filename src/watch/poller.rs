//! One polling tick: list every file currently on the node's root.
//! The caller diffs this against what it has already forwarded
//! (`spec.md` §4.5 Polling class).

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::fs::NodeRoot;

pub fn poll_once(root: &NodeRoot) -> Result<Vec<PathBuf>> {
    root.list_dir(Path::new("")).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_files_present_at_tick_time() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"a").unwrap();
        let root = NodeRoot::new(tmp.path());
        let found = poll_once(&root).unwrap();
        assert_eq!(found, vec![PathBuf::from("a.txt")]);
    }
}
