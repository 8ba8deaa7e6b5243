//! De-duplicating work queue of disruption keys.
//!
//! A key is handed to at most one worker at a time. Adding a key already
//! waiting is a no-op; adding a key being processed marks it dirty, and it
//! is queued again once the worker reports it done.
//!
//! Delayed adds keep one deadline per key, the earliest requested. An
//! immediate add cancels the pending deadline.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::model::ObjectKey;
use crate::watch::ReconcileTrigger;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    queued: BTreeSet<ObjectKey>,
    processing: BTreeSet<ObjectKey>,
    dirty: BTreeSet<ObjectKey>,
    waiting: BTreeMap<ObjectKey, Deadline>,
    next_timer: u64,
    shutting_down: bool,
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    timer: u64,
}

impl QueueState {
    fn push(&mut self, key: ObjectKey) -> bool {
        if self.queued.insert(key.clone()) {
            self.queue.push_back(key);
            return true;
        }
        false
    }

    /// Queue `key` now. Returns whether a worker should be woken.
    fn enqueue(&mut self, key: ObjectKey) -> bool {
        self.waiting.remove(&key);
        if self.processing.contains(&key) {
            self.dirty.insert(key);
            return false;
        }
        self.push(key)
    }
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, key: ObjectKey) {
        let mut state = self.state();
        if state.shutting_down {
            return;
        }
        if state.enqueue(key) {
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has elapsed.
    ///
    /// A key already waiting keeps the earlier of its two deadlines.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let at = Instant::now() + delay;
        let timer = {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            if state.waiting.get(&key).is_some_and(|d| d.at <= at) {
                return;
            }
            state.next_timer += 1;
            let timer = state.next_timer;
            state.waiting.insert(key.clone(), Deadline { at, timer });
            timer
        };

        let queue = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            if let Some(queue) = queue.upgrade() {
                queue.fire(key, timer);
            }
        });
    }

    /// Queue a delayed key, unless its deadline was replaced or cancelled.
    fn fire(&self, key: ObjectKey, timer: u64) {
        let mut state = self.state();
        if state.shutting_down || state.waiting.get(&key).map(|d| d.timer) != Some(timer) {
            return;
        }
        if state.enqueue(key) {
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Wait for the next key; `None` once the queue shuts down.
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Report a key processed, re-queueing it when it was added meanwhile.
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.remove(key) && !state.shutting_down && state.enqueue(key.clone()) {
            drop(state);
            debug!(disruption = %key, "Re-queueing key changed during processing");
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker.
    pub fn shutdown(&self) {
        let mut state = self.state();
        state.shutting_down = true;
        state.waiting.clear();
        drop(state);
        self.notify.notify_waiters();
    }

    /// Keys waiting to be processed.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    /// Keys with a pending delayed add.
    pub fn delayed(&self) -> usize {
        self.state().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReconcileTrigger for WorkQueue {
    fn trigger(&self, disruption: ObjectKey) {
        self.add(disruption);
    }
}
