//! Task heaps.
//!
//! `BinaryHeap` is a max-heap, so entries compare in reverse: the smallest
//! key is the one popped first.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::marker::PhantomData;

use chrono::{DateTime, Utc};

use stockview_core::TaskId;

use super::types::QueuedTask;

/// Pop order of a [`TaskHeap`].
pub(crate) trait HeapOrder {
    type Key: Ord + Clone + fmt::Debug;

    fn key(task: &QueuedTask) -> Self::Key;
}

/// Priority first, then FIFO by creation time.
#[derive(Debug)]
pub(crate) struct ByPriority;

impl HeapOrder for ByPriority {
    type Key = (u8, DateTime<Utc>, u64);

    fn key(task: &QueuedTask) -> Self::Key {
        (task.priority.rank(), task.created_at, task.seq)
    }
}

/// Earliest `scheduled_at` first.
#[derive(Debug)]
pub(crate) struct BySchedule;

impl HeapOrder for BySchedule {
    type Key = (DateTime<Utc>, u64);

    fn key(task: &QueuedTask) -> Self::Key {
        (task.scheduled_at.unwrap_or(task.created_at), task.seq)
    }
}

#[derive(Debug)]
struct Entry<K> {
    key: K,
    task: QueuedTask,
}

impl<K: Ord> PartialEq for Entry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<K: Ord> Eq for Entry<K> {}

impl<K: Ord> PartialOrd for Entry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord> Ord for Entry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.key.cmp(&self.key)
    }
}

#[derive(Debug)]
pub(crate) struct TaskHeap<O: HeapOrder> {
    heap: BinaryHeap<Entry<O::Key>>,
    _order: PhantomData<O>,
}

impl<O: HeapOrder> Default for TaskHeap<O> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            _order: PhantomData,
        }
    }
}

impl<O: HeapOrder> TaskHeap<O> {
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn push(&mut self, task: QueuedTask) {
        self.heap.push(Entry {
            key: O::key(&task),
            task,
        });
    }

    pub fn pop(&mut self) -> Option<QueuedTask> {
        self.heap.pop().map(|e| e.task)
    }

    pub fn peek_key(&self) -> Option<O::Key> {
        self.heap.peek().map(|e| e.key.clone())
    }

    pub fn find(&self, id: TaskId) -> Option<&QueuedTask> {
        self.heap.iter().map(|e| &e.task).find(|t| t.id == id)
    }

    /// Remove one task by id and restore the heap order.
    pub fn remove(&mut self, id: TaskId) -> Option<QueuedTask> {
        let mut entries = std::mem::take(&mut self.heap).into_vec();
        let removed = entries
            .iter()
            .position(|e| e.task.id == id)
            .map(|pos| entries.swap_remove(pos).task);
        self.heap = BinaryHeap::from(entries);
        removed
    }
}

impl TaskHeap<BySchedule> {
    /// Pop every task whose `scheduled_at` is at or before `now`.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<QueuedTask> {
        let mut due = Vec::new();
        while self.peek_key().is_some_and(|(at, _)| at <= now) {
            if let Some(task) = self.pop() {
                due.push(task);
            }
        }
        due
    }
}
