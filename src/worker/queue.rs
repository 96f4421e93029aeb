//! The shared ready/deferred/in-progress state behind the pool.

use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::cmp::Ordering;
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use super::task::{Task, TaskKey};

struct Deferred {
    at: Instant,
    task: Task,
}

impl PartialEq for Deferred {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}
impl Eq for Deferred {}
impl PartialOrd for Deferred {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Deferred {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest deadline first.
        other.at.cmp(&self.at)
    }
}

fn affinity_key(key: &TaskKey) -> Option<String> {
    match key {
        TaskKey::Node(n) => Some(format!("node:{}", n)),
        TaskKey::Group(g) => Some(format!("group:{}", g)),
        TaskKey::None => None,
    }
}

struct Inner {
    ready: VecDeque<Task>,
    deferred: BinaryHeap<Deferred>,
    busy_keys: HashSet<String>,
    shutting_down: bool,
}

/// FIFO-fair task queue with node/group affinity and a deferred,
/// time-indexed tier for retries and backoff (`spec.md` §4.2).
pub struct Queue {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Queue {
    pub fn new() -> Self {
        Queue {
            inner: Mutex::new(Inner {
                ready: VecDeque::new(),
                deferred: BinaryHeap::new(),
                busy_keys: HashSet::new(),
                shutting_down: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn push_ready(&self, task: Task) {
        let mut inner = self.inner.lock().unwrap();
        inner.ready.push_back(task);
        self.cond.notify_all();
    }

    pub fn push_deferred(&self, task: Task, at: Instant) {
        let mut inner = self.inner.lock().unwrap();
        inner.deferred.push(Deferred { at, task });
        self.cond.notify_all();
    }

    pub fn stop_accepting(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.shutting_down = true;
        self.cond.notify_all();
    }

    /// Move any deferred tasks whose deadline has passed onto the
    /// ready queue. Call periodically (the pool's scheduler thread
    /// does this).
    pub fn promote_due(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        let mut promoted = false;
        while let Some(top) = inner.deferred.peek() {
            if top.at > now {
                break;
            }
            let entry = inner.deferred.pop().unwrap();
            inner.ready.push_back(entry.task);
            promoted = true;
        }
        if promoted {
            self.cond.notify_all();
        }
    }

    /// Take the first ready task whose affinity key is not currently
    /// busy, marking that key busy (unless the task is
    /// parallelizable). Blocks up to `timeout` for a task to become
    /// available; returns `None` on timeout or once draining with no
    /// work left.
    pub fn take_ready(&self, timeout: std::time::Duration) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(index) = inner
                .ready
                .iter()
                .position(|t| match affinity_key(&t.key) {
                    Some(ref key) if t.affinity == super::task::Affinity::Serialized => {
                        !inner.busy_keys.contains(key)
                    }
                    _ => true,
                })
            {
                let task = inner.ready.remove(index).unwrap();
                if let Some(key) = affinity_key(&task.key) {
                    if task.affinity == super::task::Affinity::Serialized {
                        inner.busy_keys.insert(key);
                    }
                }
                return Some(task);
            }

            if inner.shutting_down && inner.ready.is_empty() {
                return None;
            }

            let (guard, result) = self.cond.wait_timeout(inner, timeout).unwrap();
            inner = guard;
            if result.timed_out() {
                return None;
            }
        }
    }

    /// Release a previously-claimed affinity key after a task finishes.
    pub fn release(&self, key: &TaskKey) {
        if let Some(key) = affinity_key(key) {
            let mut inner = self.inner.lock().unwrap();
            inner.busy_keys.remove(&key);
            self.cond.notify_all();
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.ready.len() + inner.deferred.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}
