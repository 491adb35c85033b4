//! Pending-file queue between the watcher and the converter.
//!
//! A path moves through two states: *pending* (pushed, not yet popped) and
//! *in flight* (popped, not yet completed). [`FileQueue::complete`] is called
//! only after the volume built from the path was acknowledged by the remote
//! endpoint, or after the file was dropped as unconvertible. Whatever is still
//! in flight when a worker dies can be handed back with
//! [`FileQueue::recover_in_flight`].

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<PathBuf>,
    in_flight: HashSet<PathBuf>,
    total_enqueued: u64,
}

/// FIFO of file paths with acknowledgement.
#[derive(Debug, Default)]
pub struct FileQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl FileQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a path and wakes one waiting consumer.
    pub fn push(&self, path: PathBuf) {
        {
            let mut state = self.lock();
            state.pending.push_back(path);
            state.total_enqueued += 1;
        }
        self.notify.notify_one();
    }

    /// Pops without waiting.
    pub fn try_pop(&self) -> Option<PathBuf> {
        let mut state = self.lock();
        let path = state.pending.pop_front()?;
        state.in_flight.insert(path.clone());
        Some(path)
    }

    /// Pops the oldest pending path, waiting up to `timeout` for one.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<PathBuf> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(path) = self.try_pop() {
                return Some(path);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    /// Forgets an in-flight path. Returns false if it was not in flight.
    pub fn complete(&self, path: &Path) -> bool {
        self.lock().in_flight.remove(path)
    }

    /// Moves every in-flight path back to the head of the queue.
    pub fn recover_in_flight(&self) -> usize {
        let recovered = {
            let mut state = self.lock();
            let mut items: Vec<PathBuf> = state.in_flight.drain().collect();
            items.sort();
            for path in items.iter().rev() {
                state.pending.push_front(path.clone());
            }
            items.len()
        };
        if recovered > 0 {
            self.notify.notify_one();
        }
        recovered
    }

    /// Paths waiting to be popped.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Snapshot of the pending paths in pop order.
    pub fn pending_paths(&self) -> Vec<PathBuf> {
        self.lock().pending.iter().cloned().collect()
    }

    /// Paths popped but not yet completed.
    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Paths ever pushed.
    pub fn total_enqueued(&self) -> u64 {
        self.lock().total_enqueued
    }
}
