//! Thread-safe priority task queue with a blocking consumer.
//!
//! Records come out ordered by `(priority, sequence)`: lower priority first,
//! then strict arrival order. Producers never wait beyond the mutex; only
//! [`TaskQueue::dequeue`] blocks.

use crate::scheduler::tasks::TaskRecord;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Heap entry ordered so the smallest `(priority, sequence)` is on top.
#[derive(Debug)]
struct Entry(TaskRecord);

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.0.order_key() == other.0.order_key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.order_key().cmp(&self.0.order_key())
    }
}

struct QueueState {
    heap: BinaryHeap<Entry>,
    next_sequence: u64,
    closed: bool,
}

/// Priority queue shared by every producer and the single worker.
pub struct TaskQueue {
    inner: Mutex<QueueState>,
    available: Condvar,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_sequence: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push_locked(&self, guard: &mut QueueState, mut record: TaskRecord) {
        record.sequence = guard.next_sequence;
        guard.next_sequence += 1;
        debug!(
            task = %record.name,
            priority = record.priority,
            sequence = record.sequence,
            "task enqueued"
        );
        guard.heap.push(Entry(record));
        self.available.notify_one();
    }

    /// Insert unless the queue already holds `max_size` records.
    ///
    /// Returns `false` when rejected (or when the queue is closed).
    pub fn enqueue_bounded(&self, record: TaskRecord, max_size: usize) -> bool {
        let mut guard = self.lock();
        if guard.closed {
            return false;
        }
        if guard.heap.len() >= max_size {
            debug!(task = %record.name, max_size, "queue full, task rejected");
            return false;
        }
        self.push_locked(&mut guard, record);
        true
    }

    /// Insert regardless of size. Dropped with a warning only after [`close`](Self::close).
    pub fn enqueue_unbounded(&self, record: TaskRecord) {
        let mut guard = self.lock();
        if guard.closed {
            warn!(task = %record.name, "queue closed, task dropped");
            return;
        }
        self.push_locked(&mut guard, record);
    }

    /// Block until a record is available and return the smallest one.
    ///
    /// Returns `None` once the queue is closed; records still pending at
    /// that point are never delivered.
    pub fn dequeue(&self) -> Option<TaskRecord> {
        let mut guard = self.lock();
        loop {
            if guard.closed {
                return None;
            }
            if let Some(Entry(record)) = guard.heap.pop() {
                return Some(record);
            }
            guard = self
                .available
                .wait(guard)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Pop without blocking.
    pub fn try_dequeue(&self) -> Option<TaskRecord> {
        let mut guard = self.lock();
        if guard.closed {
            return None;
        }
        guard.heap.pop().map(|Entry(record)| record)
    }

    /// Pending records in dequeue order.
    pub fn snapshot(&self) -> Vec<TaskRecord> {
        let guard = self.lock();
        let mut records: Vec<TaskRecord> = guard.heap.iter().map(|e| e.0.clone()).collect();
        records.sort_by_key(TaskRecord::order_key);
        records
    }

    /// Remove every pending record whose name starts with `prefix`.
    pub fn purge_by_prefix(&self, prefix: &str) -> usize {
        let mut guard = self.lock();
        let before = guard.heap.len();
        guard.heap.retain(|entry| !entry.0.name.starts_with(prefix));
        let removed = before - guard.heap.len();
        if removed > 0 {
            debug!(prefix, removed, "purged queued tasks");
        }
        removed
    }

    /// Whether any pending record's name starts with `prefix`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.lock()
            .heap
            .iter()
            .any(|entry| entry.0.name.starts_with(prefix))
    }

    /// Sum of `total_items` over pending records.
    pub fn total_items(&self) -> u64 {
        self.lock()
            .heap
            .iter()
            .map(|entry| u64::from(entry.0.total_items))
            .sum()
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    /// Refuse further records, drop pending ones and wake every blocked
    /// consumer. Returns the number of records dropped.
    pub fn close(&self) -> usize {
        let mut guard = self.lock();
        guard.closed = true;
        let dropped = guard.heap.len();
        guard.heap.clear();
        if dropped > 0 {
            warn!(dropped, "queue closed with pending tasks");
        }
        self.available.notify_all();
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
