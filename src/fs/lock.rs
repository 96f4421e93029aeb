//! The update-down lock: a FIFO-fair counting reader/writer lock that
//! separates long scans (readers) from single-file mutations
//! (writers) on a node's root (`spec.md` §4.3, §5, §9).
//!
//! Multiple scans may run concurrently with each other; while any
//! scan holds the lock, writers (rename-into-place, delete) block,
//! and while a writer holds the lock, new scans block. A waiting
//! writer sets a promotion bit so readers that arrive after it queue
//! behind it, which is what keeps a steady stream of short scans from
//! starving a writer.

use std::sync::{Condvar, Mutex};

#[derive(Debug)]
struct State {
    readers: u32,
    writer: bool,
    /// Number of writers currently waiting; while nonzero, new
    /// readers must queue instead of joining existing readers.
    waiting_writers: u32,
}

/// A FIFO-fair reader/writer lock scoped to one node root.
#[derive(Debug)]
pub struct UpdateDownLock {
    state: Mutex<State>,
    cond: Condvar,
}

/// RAII guard held while a scan (reader) is in progress.
pub struct ReadGuard<'a> {
    lock: &'a UpdateDownLock,
}

/// RAII guard held while a single-file mutation (writer) is in progress.
pub struct WriteGuard<'a> {
    lock: &'a UpdateDownLock,
}

impl UpdateDownLock {
    pub fn new() -> Self {
        UpdateDownLock {
            state: Mutex::new(State { readers: 0, writer: false, waiting_writers: 0 }),
            cond: Condvar::new(),
        }
    }

    /// Acquire the lock for a bulk scan. Blocks while a writer holds
    /// the lock or while a writer is waiting (writer promotion).
    pub fn read(&self) -> ReadGuard<'_> {
        let mut state = self.state.lock().unwrap();
        while state.writer || state.waiting_writers > 0 {
            state = self.cond.wait(state).unwrap();
        }
        state.readers += 1;
        ReadGuard { lock: self }
    }

    /// Acquire the lock for a single-file mutation. Blocks while any
    /// reader or another writer holds the lock.
    pub fn write(&self) -> WriteGuard<'_> {
        let mut state = self.state.lock().unwrap();
        state.waiting_writers += 1;
        while state.writer || state.readers > 0 {
            state = self.cond.wait(state).unwrap();
        }
        state.waiting_writers -= 1;
        state.writer = true;
        WriteGuard { lock: self }
    }
}

impl Default for UpdateDownLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        state.readers -= 1;
        if state.readers == 0 {
            self.lock.cond.notify_all();
        }
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        state.writer = false;
        self.lock.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn readers_run_concurrently() {
        let lock = Arc::new(UpdateDownLock::new());
        let l1 = lock.clone();
        let l2 = lock.clone();

        let t1 = thread::spawn(move || {
            let _g = l1.read();
            thread::sleep(Duration::from_millis(50));
        });
        let t2 = thread::spawn(move || {
            let _g = l2.read();
            thread::sleep(Duration::from_millis(50));
        });

        t1.join().unwrap();
        t2.join().unwrap();
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = Arc::new(UpdateDownLock::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let write_guard = lock.write();
        let l2 = lock.clone();
        let order2 = order.clone();
        let t = thread::spawn(move || {
            let _g = l2.read();
            order2.lock().unwrap().push("read");
        });

        thread::sleep(Duration::from_millis(30));
        order.lock().unwrap().push("write");
        drop(write_guard);
        t.join().unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["write", "read"]);
    }

    #[test]
    fn waiting_writer_is_not_starved_by_new_readers() {
        let lock = Arc::new(UpdateDownLock::new());
        let long_reader = lock.read();

        let l2 = lock.clone();
        let writer_ran = Arc::new(Mutex::new(false));
        let writer_ran2 = writer_ran.clone();
        let writer = thread::spawn(move || {
            let _g = l2.write();
            *writer_ran2.lock().unwrap() = true;
        });

        // give the writer time to register as "waiting"
        thread::sleep(Duration::from_millis(30));

        let l3 = lock.clone();
        let late_reader_blocked = Arc::new(Mutex::new(true));
        let late_reader_blocked2 = late_reader_blocked.clone();
        let late_reader = thread::spawn(move || {
            let _g = l3.read();
            *late_reader_blocked2.lock().unwrap() = false;
        });

        thread::sleep(Duration::from_millis(30));
        assert!(!*writer_ran.lock().unwrap(), "writer must still be waiting");
        assert!(*late_reader_blocked.lock().unwrap(), "late reader must queue behind waiting writer");

        drop(long_reader);
        writer.join().unwrap();
        late_reader.join().unwrap();
        assert!(*writer_ran.lock().unwrap());
    }
}
