//! A single unit of work handed to the pool (`spec.md` §4.2).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Cooperative cancellation handle, polled by a task body at its own
/// suspension points. Tasks are never forcibly interrupted
/// (`spec.md` §4.2, §5).
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Node or group affinity key a task is serialized on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKey {
    Node(String),
    Group(String),
    /// No affinity; never contends with anything (e.g. a metrics tick).
    None,
}

/// Whether a task may run concurrently with other tasks on the same
/// affinity key. Everything defaults to serialized; a transfer pull
/// may explicitly run alongside verification on its destination
/// (`spec.md` §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Serialized,
    Parallelizable,
}

/// The result a task body returns: either it finished, or it asks to
/// be deferred until `at`.
pub enum Outcome {
    Done,
    Defer(Instant),
}

pub type TaskBody = Box<dyn FnOnce(CancelToken) -> Outcome + Send>;

/// A named, affinity-tagged, deferrable, cancelable task.
pub struct Task {
    pub name: String,
    pub key: TaskKey,
    pub affinity: Affinity,
    pub body: TaskBody,
}

impl Task {
    pub fn new(name: impl Into<String>, key: TaskKey, affinity: Affinity, body: TaskBody) -> Self {
        Task { name: name.into(), key, affinity, body }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("affinity", &self.affinity)
            .finish()
    }
}
