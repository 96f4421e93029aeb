//! C8 — The daemon's main loop.
//!
//! Each tick: discover this host's active nodes and groups, drain
//! their pending work into the worker pool, and let the pool's
//! threads run it. The loop itself never touches the filesystem or
//! the Index directly — it only decides what work exists and hands
//! it off (`spec.md` §4.8).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use crate::config::DaemonConfig;
use crate::fs::NodeRoot;
use crate::importer::ImportEngine;
use crate::index::{CopyState, Pool as IndexPool};
use crate::ioclass::{DefaultGroupIo, DefaultNodeIo, GroupIo, InitStatus, NodeIo, PollingNodeIo, TransportGroupIo};
use crate::metrics::Metrics;
use crate::transfer::TransferEngine;
use crate::watch::{self, DiscoveredPath};
use crate::worker::{Affinity, CancelToken, Pool as WorkerPool, PoolHandle, Task, TaskKey};

/// Bundles everything a tick needs. Built once at startup and shared
/// across the lifetime of the process.
pub struct DaemonContext {
    config: DaemonConfig,
    hostname: String,
    index: IndexPool,
    worker_pool: Option<WorkerPool>,
    worker_handle: PoolHandle,
    rt: tokio::runtime::Handle,
    importer: Arc<ImportEngine>,
    transfer: Arc<TransferEngine>,
    metrics: Metrics,
    node_io: HashMap<String, Arc<dyn NodeIo>>,
    group_io: HashMap<String, Arc<dyn GroupIo>>,
    first_tick: std::sync::atomic::AtomicBool,
    watches: std::sync::Mutex<Vec<watch::WatchHandle>>,
    /// One `NodeRoot` per node name, reused across ticks so the same
    /// `UpdateDownLock` instance actually serializes concurrent scans
    /// and writers on that root (`spec.md` §4.3, §5) instead of each
    /// caller getting an independent, unshared lock.
    node_roots: std::sync::Mutex<HashMap<String, NodeRoot>>,
}

fn default_node_io_registry() -> HashMap<String, Arc<dyn NodeIo>> {
    let mut m: HashMap<String, Arc<dyn NodeIo>> = HashMap::new();
    m.insert("default".to_string(), Arc::new(DefaultNodeIo));
    m.insert("polling".to_string(), Arc::new(PollingNodeIo::new()));
    m
}

fn default_group_io_registry() -> HashMap<String, Arc<dyn GroupIo>> {
    let mut m: HashMap<String, Arc<dyn GroupIo>> = HashMap::new();
    m.insert("default".to_string(), Arc::new(DefaultGroupIo));
    m.insert("transport".to_string(), Arc::new(TransportGroupIo));
    m
}

impl DaemonContext {
    /// Connect to the Index, load extensions, and build every
    /// registry this daemon needs. Returns an error for anything that
    /// should abort startup (`spec.md` §6 exit codes 1-4).
    pub async fn new(config: DaemonConfig, rt: tokio::runtime::Handle) -> Result<Self> {
        let hostname = config.resolve_hostname()?;

        let index = IndexPool::connect(&config.database_url, (config.worker_count as u32) * 2 + 2)
            .await
            .context("connecting to data index")?;

        let extensions = crate::extensions::load(&config.extensions)?;
        let detectors = crate::extensions::collect_detectors(&extensions);
        let importer = Arc::new(ImportEngine::new(detectors));

        let io_defaults = config.io_class_defaults("default");
        let transfer = Arc::new(TransferEngine::new(
            config.backend_kind(),
            config.bbcp_path.clone(),
            config.rsync_path.clone(),
            io_defaults.concurrent_pulls,
            io_defaults.verify_on_pull,
            Duration::from_secs(config.transfer_timeout_secs),
        ));

        let worker_pool = WorkerPool::start(config.worker_count);
        let worker_handle = worker_pool.handle();

        Ok(DaemonContext {
            config,
            hostname,
            index,
            worker_pool: Some(worker_pool),
            worker_handle,
            rt,
            importer,
            transfer,
            metrics: Metrics::new(),
            node_io: default_node_io_registry(),
            group_io: default_group_io_registry(),
            first_tick: std::sync::atomic::AtomicBool::new(true),
            watches: std::sync::Mutex::new(Vec::new()),
            node_roots: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.clone()
    }

    /// The shared `NodeRoot` for `node_name`, creating and caching
    /// one on first use. `root` is trusted to be stable for the
    /// lifetime of a given node name (a changed root implies a
    /// reactivated/reconfigured node, which gets a fresh lock).
    fn node_root(&self, node_name: &str, root: &str) -> NodeRoot {
        let mut roots = self.node_roots.lock().unwrap();
        match roots.get(node_name) {
            Some(existing) if existing.root_path() == Path::new(root) => existing.clone(),
            _ => {
                let fresh = NodeRoot::new(Path::new(root));
                roots.insert(node_name.to_string(), fresh.clone());
                fresh
            }
        }
    }

    fn node_io_for(&self, class: &str) -> Arc<dyn NodeIo> {
        self.node_io.get(class).cloned().unwrap_or_else(|| self.node_io["default"].clone())
    }

    fn group_io_for(&self, class: &str) -> Arc<dyn GroupIo> {
        self.group_io.get(class).cloned().unwrap_or_else(|| self.group_io["default"].clone())
    }

    /// Start a watch (event or polling, per the node's I/O class) for
    /// every active node this host owns, plus a catch-up scan, and
    /// feed discovered paths into the worker pool as import tasks.
    pub async fn start_watches(&self, tx: mpsc::Sender<DiscoveredPath>) -> Result<()> {
        let nodes = self.index.find_active_nodes(&self.hostname).await?;
        let mut handles = self.watches.lock().unwrap();
        for node in nodes {
            if !node.auto_import {
                continue;
            }
            let root = self.node_root(&node.name, &node.root);
            let io = self.node_io_for(&node.io_class);

            let sent = watch::catch_up_scan(root.clone(), node.name.clone(), tx.clone()).await.unwrap_or(0);
            log::info!("catch-up scan on {} found {} existing files", node.name, sent);

            let handle = if io.disables_event_watch() {
                watch::start_polling_watch(root, node.name.clone(), Duration::from_secs(30), tx.clone())
            } else {
                match watch::start_event_watch(root.clone(), node.name.clone(), tx.clone()) {
                    Ok(h) => h,
                    Err(e) => {
                        log::warn!("native watch failed for {}, falling back to polling: {:#}", node.name, e);
                        watch::start_polling_watch(root, node.name.clone(), Duration::from_secs(30), tx.clone())
                    }
                }
            };
            handles.push(handle);
        }
        Ok(())
    }

    /// Import one discovered path, submitted as a worker task
    /// serialized on its node (`spec.md` §4.2, §4.6).
    pub fn submit_discovered_import(self: &Arc<Self>, discovered: DiscoveredPath) {
        let importer = self.importer.clone();
        let index = self.index.clone();
        let node_name = discovered.node_name.clone();
        let metrics = self.metrics.clone();
        let ctx = self.clone();

        self.submit_async(
            format!("import {}/{:?}", node_name, discovered.rel_path),
            TaskKey::Node(node_name.clone()),
            Affinity::Serialized,
            async move {
                let node = match index.find_node(&node_name).await {
                    Ok(Some(n)) => n,
                    _ => return,
                };
                let root = ctx.node_root(&node_name, &node.root);
                match importer
                    .import_path(&index, &root, &node_name, &discovered.rel_path, true, None)
                    .await
                {
                    Ok(_) => metrics.inc_imported(),
                    Err(e) => log::warn!("import of {:?} on {} failed: {:#}", discovered.rel_path, node_name, e),
                }
            },
        );
    }

    fn submit_async<F>(&self, name: impl Into<String>, key: TaskKey, affinity: Affinity, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let rt = self.rt.clone();
        let name = name.into();
        self.worker_handle.submit(Task::new(name, key, affinity, Box::new(move |_cancel: CancelToken| {
            rt.block_on(fut);
            crate::worker::Outcome::Done
        })));
    }

    /// Run one tick of the update loop (`spec.md` §4.8). The first
    /// tick runs a tidy-up sweep on every node before anything else,
    /// so stale temp files from a previous crash don't interfere with
    /// fresh imports or verification (`spec.md` §9).
    pub async fn tick(&self) -> Result<()> {
        let tick_started = Instant::now();
        let nodes = self.index.find_active_nodes(&self.hostname).await?;
        let groups = self.index.find_available_groups(&self.hostname).await?;

        let is_first = self.first_tick.swap(false, std::sync::atomic::Ordering::SeqCst);

        let mut imports_enqueued = 0usize;
        let mut verifies_enqueued = 0usize;
        let mut deletes_enqueued = 0usize;
        let mut copies_enqueued = 0usize;

        for node in &nodes {
            let root = self.node_root(&node.name, &node.root);
            let io = self.node_io_for(&node.io_class);

            // `check_init` both verifies and creates the marker
            // (`spec.md` §4.4, §4.8 step 1 "schedule an init if not
            // initialised"); a freshly-created marker means this node
            // just became usable and falls through to the rest of
            // this tick rather than being skipped.
            match io.check_init(&root, &node.name).await {
                Ok(InitStatus::Initialised) => {}
                Ok(InitStatus::NotInitialised) => {
                    log::info!("node {} had no {} marker, created it", node.name, crate::buildcfg::NODE_MARKER_NAME);
                }
                Err(e) => {
                    log::warn!("node {} init check failed: {:#}", node.name, e);
                    continue;
                }
            }

            if is_first {
                match io.tidy_up(&root, Duration::from_secs(self.config.stale_temp_age_secs)).await {
                    Ok(n) if n > 0 => log::info!("tidy_up on {} removed {} stale temp files", node.name, n),
                    Ok(_) => {}
                    Err(e) => log::warn!("tidy_up on {} failed: {:#}", node.name, e),
                }
            }

            imports_enqueued += self.drain_import_requests(node).await?;
            verifies_enqueued += self.drain_verification(node, &io, &root).await?;
            deletes_enqueued += self.drain_deletions(node, &io, &root).await?;
        }

        for group in &groups {
            copies_enqueued += self.drain_copy_requests(group, &nodes).await?;
        }

        self.metrics.inc_tick();
        log::info!(
            "tick complete in {:?}: {} imports, {} verifies, {} deletes, {} copies enqueued",
            tick_started.elapsed(),
            imports_enqueued,
            verifies_enqueued,
            deletes_enqueued,
            copies_enqueued,
        );
        Ok(())
    }

    async fn drain_import_requests(&self, node: &crate::index::Node) -> Result<usize> {
        let requests = self.index.pending_import_requests(&node.name, self.config.batch_size).await?;
        let enqueued = requests.len();
        for req in requests {
            let root = self.node_root(&node.name, &node.root);
            let paths = if req.recurse {
                ImportEngine::scan_paths(&root, Path::new(&req.path))?
            } else {
                vec![Path::new(&req.path).to_owned()]
            };

            let importer = self.importer.clone();
            let index = self.index.clone();
            let node_name = node.name.clone();
            let register_new = req.register_new;
            let request_id = req.id;
            let metrics = self.metrics.clone();

            self.submit_async(
                format!("import-request {} on {}", request_id, node_name),
                TaskKey::Node(node_name.clone()),
                Affinity::Serialized,
                async move {
                    for rel_path in paths {
                        match importer.import_path(&index, &root, &node_name, &rel_path, register_new, None).await {
                            Ok(_) => metrics.inc_imported(),
                            Err(e) => log::warn!("import request {} failed on {:?}: {:#}", request_id, rel_path, e),
                        }
                    }
                    if let Err(e) = index.complete_import_request(request_id).await {
                        log::warn!("failed to mark import request {} completed: {:#}", request_id, e);
                    }
                },
            );
        }
        Ok(enqueued)
    }

    async fn drain_verification(&self, node: &crate::index::Node, io: &Arc<dyn NodeIo>, root: &NodeRoot) -> Result<usize> {
        if !node.auto_verify {
            return Ok(0);
        }
        let suspect = self.index.suspect_copies(&node.name, self.config.batch_size).await?;
        let enqueued = suspect.len();
        for copy in suspect {
            let index = self.index.clone();
            let io = io.clone();
            let root = root.clone();
            let node_name = node.name.clone();

            self.submit_async(
                format!("verify copy {} on {}", copy.file_id, node_name),
                TaskKey::Node(node_name.clone()),
                Affinity::Serialized,
                async move {
                    let file = match index.raw_file_by_id(copy.file_id).await {
                        Ok(Some(f)) => f,
                        _ => return,
                    };
                    match io.check(&root, &file).await {
                        Ok(state) => {
                            let size = if state == CopyState::Healthy { file.size_b } else { 0 };
                            let _ = index.set_copy_state(file.id, &node_name, state, size).await;
                            let _ = index.record_last_check(file.id, &node_name, chrono::Utc::now()).await;
                        }
                        Err(e) => log::warn!("check of {} on {} failed: {:#}", file.relative_path(), node_name, e),
                    }
                },
            );
        }
        Ok(enqueued)
    }

    async fn drain_deletions(&self, node: &crate::index::Node, io: &Arc<dyn NodeIo>, root: &NodeRoot) -> Result<usize> {
        let released = self.index.released_copies(&node.name, self.config.batch_size).await?;
        let enqueued = released.len();
        for copy in released {
            let index = self.index.clone();
            let io = io.clone();
            let root = root.clone();
            let node_name = node.name.clone();
            let metrics = self.metrics.clone();

            self.submit_async(
                format!("delete copy {} on {}", copy.file_id, node_name),
                TaskKey::Node(node_name.clone()),
                Affinity::Serialized,
                async move {
                    let file = match index.raw_file_by_id(copy.file_id).await {
                        Ok(Some(f)) => f,
                        _ => return,
                    };
                    match io.delete(&index, &root, &file, &copy).await {
                        Ok(crate::ioclass::DeleteOutcome::Deleted) => metrics.inc_deleted(),
                        Ok(crate::ioclass::DeleteOutcome::RefusedTooFewArchiveCopies { found }) => {
                            log::warn!(
                                "refusing to delete {} from {}: only {} archive copies remain",
                                file.relative_path(),
                                node_name,
                                found
                            );
                        }
                        Err(e) => log::warn!("delete of {} on {} failed: {:#}", file.relative_path(), node_name, e),
                    }
                },
            );
        }
        Ok(enqueued)
    }

    async fn drain_copy_requests(&self, group: &crate::index::Group, all_nodes: &[crate::index::Node]) -> Result<usize> {
        let requests = self.index.pending_copy_requests(&group.name, self.config.batch_size).await?;
        if requests.is_empty() {
            return Ok(0);
        }
        let candidates: Vec<(crate::index::Node, NodeRoot)> = all_nodes
            .iter()
            .filter(|n| n.group_name == group.name)
            .map(|n| (n.clone(), self.node_root(&n.name, &n.root)))
            .collect();

        let mut enqueued = 0usize;
        for req in requests {
            if !self.transfer.ready_for_retry(req.id) {
                continue;
            }
            enqueued += 1;

            let file = match self.index.raw_file_by_id(req.file_id).await? {
                Some(f) => f,
                None => continue,
            };
            let source_node = match self.index.find_node(&req.node_from).await? {
                Some(n) => n,
                None => {
                    log::warn!("copy request {} names unknown source node {}", req.id, req.node_from);
                    continue;
                }
            };
            let source = (source_node.clone(), self.node_root(&source_node.name, &source_node.root));

            let group_io = self.group_io_for(&group.io_class);
            let index = self.index.clone();
            let transfer = self.transfer.clone();
            let candidates = candidates.clone();
            let metrics = self.metrics.clone();
            let group_name = group.name.clone();

            self.submit_async(
                format!("pull request {} into {}", req.id, group_name),
                TaskKey::Group(group_name.clone()),
                Affinity::Parallelizable,
                async move {
                    match group_io.pull(&index, &transfer, &req, &file, &source, &candidates).await {
                        Ok(()) => metrics.inc_pulled(),
                        Err(e) => {
                            metrics.inc_pull_failure();
                            log::warn!("pull request {} into {} failed: {:#}", req.id, group_name, e);
                        }
                    }
                },
            );
        }
        Ok(enqueued)
    }

    /// Run the periodic loop until `cancel` fires.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let started = Instant::now();
                    if let Err(e) = self.tick().await {
                        log::error!("update tick failed: {:#}", e);
                    }
                    let elapsed = started.elapsed();
                    if elapsed > interval {
                        log::warn!("tick took {:?}, longer than the {:?} update interval", elapsed, interval);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("shutdown requested, exiting update loop");
                        return;
                    }
                }
            }
        }
    }

    /// Consume the context, stopping the worker pool with the
    /// configured grace period (`spec.md` §4.2, §6).
    pub fn shutdown(mut self) {
        for handle in self.watches.lock().unwrap().drain(..) {
            handle.abort();
        }
        if let Some(pool) = self.worker_pool.take() {
            pool.shutdown(Duration::from_secs(self.config.shutdown_grace_secs));
        }
    }
}
