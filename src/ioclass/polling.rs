//! The Polling I/O class: identical filesystem semantics to Default,
//! but tells the daemon to scan for new files on a timer instead of
//! watching for filesystem events (`spec.md` §4.4 "Polling", for
//! nodes whose mount does not deliver reliable inotify/kqueue events —
//! network filesystems being the common case).

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::fs::NodeRoot;
use crate::index::{CopyState, File, FileCopy, Pool as IndexPool};

use super::default::DefaultNodeIo;
use super::{DeleteOutcome, InitStatus, NodeIo};

pub struct PollingNodeIo {
    inner: DefaultNodeIo,
}

impl PollingNodeIo {
    pub fn new() -> Self {
        PollingNodeIo { inner: DefaultNodeIo }
    }
}

impl Default for PollingNodeIo {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeIo for PollingNodeIo {
    async fn check_init(&self, root: &NodeRoot, node_name: &str) -> Result<InitStatus> {
        self.inner.check_init(root, node_name).await
    }

    async fn available_bytes(&self, root: &NodeRoot) -> Result<u64> {
        self.inner.available_bytes(root).await
    }

    async fn check(&self, root: &NodeRoot, file: &File) -> Result<CopyState> {
        self.inner.check(root, file).await
    }

    async fn delete(&self, index: &IndexPool, root: &NodeRoot, file: &File, copy: &FileCopy) -> Result<DeleteOutcome> {
        self.inner.delete(index, root, file, copy).await
    }

    async fn tidy_up(&self, root: &NodeRoot, stale_temp_age: Duration) -> Result<usize> {
        self.inner.tidy_up(root, stale_temp_age).await
    }

    fn disables_event_watch(&self) -> bool {
        true
    }
}
