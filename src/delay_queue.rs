use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use uuid::Uuid;

use crate::entry::Entry;

/// Heap element: ordered by `(not_before, seq)` so the earliest scheduled
/// entry is at the head, with FIFO tie-breaking.
struct DelayedItem<I, O> {
    not_before_ms: i64,
    seq: u64,
    enqueued_at_ms: i64,
    entry: Arc<Entry<I, O>>,
}

impl<I, O> PartialEq for DelayedItem<I, O> {
    fn eq(&self, other: &Self) -> bool {
        self.not_before_ms == other.not_before_ms && self.seq == other.seq
    }
}

impl<I, O> Eq for DelayedItem<I, O> {}

impl<I, O> PartialOrd for DelayedItem<I, O> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<I, O> Ord for DelayedItem<I, O> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the std max-heap behaves as a min-heap.
        (other.not_before_ms, other.seq).cmp(&(self.not_before_ms, self.seq))
    }
}

/// Snapshot of a queue's head, handed to the drainer for a decision step.
pub(crate) struct DelayedHead<I, O> {
    pub entry: Arc<Entry<I, O>>,
    pub not_before_ms: i64,
    pub enqueued_at_ms: i64,
}

/// One time-ordered queue. A single drainer consumes it; any task may
/// insert. Inserts wake the drainer so a new earliest entry shortens the
/// current sleep.
pub struct DelayQueue<I, O> {
    heap: Mutex<BinaryHeap<DelayedItem<I, O>>>,
    pub(crate) changed: Notify,
}

impl<I, O> DelayQueue<I, O> {
    fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            changed: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, entry: Arc<Entry<I, O>>, seq: u64, now_ms: i64) {
        let item = DelayedItem {
            not_before_ms: entry.not_before_ms(),
            seq,
            enqueued_at_ms: now_ms,
            entry,
        };
        self.heap.lock().unwrap().push(item);
        self.changed.notify_one();
    }

    pub(crate) fn peek_head(&self) -> Option<DelayedHead<I, O>> {
        let heap = self.heap.lock().unwrap();
        heap.peek().map(|item| DelayedHead {
            entry: Arc::clone(&item.entry),
            not_before_ms: item.not_before_ms,
            enqueued_at_ms: item.enqueued_at_ms,
        })
    }

    /// Remove the head iff it is still the entry observed at peek time; an
    /// earlier entry may have been inserted while the drainer deliberated.
    pub(crate) fn pop_if_head(&self, id: Uuid) -> Option<Arc<Entry<I, O>>> {
        let mut heap = self.heap.lock().unwrap();
        if heap.peek().map(|item| item.entry.id()) == Some(id) {
            heap.pop().map(|item| item.entry)
        } else {
            None
        }
    }

    /// Drain everything; used at shutdown to cancel whatever is left.
    pub(crate) fn drain(&self) -> Vec<Arc<Entry<I, O>>> {
        let mut heap = self.heap.lock().unwrap();
        std::mem::take(&mut *heap)
            .into_iter()
            .map(|item| item.entry)
            .collect()
    }
}

/// Fixed-size array of delay queues. Routing picks the least-loaded queue
/// (lowest index on ties); each queue has exactly one drainer.
pub struct DelayQueuePool<I, O> {
    queues: Vec<Arc<DelayQueue<I, O>>>,
    seq: AtomicU64,
}

impl<I, O> DelayQueuePool<I, O> {
    pub fn new(count: usize) -> Arc<Self> {
        assert!(count >= 1, "at least one delay queue is required");
        Arc::new(Self {
            queues: (0..count).map(|_| Arc::new(DelayQueue::new())).collect(),
            seq: AtomicU64::new(0),
        })
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub(crate) fn queue(&self, idx: usize) -> &Arc<DelayQueue<I, O>> {
        &self.queues[idx]
    }

    /// Insert an entry, scheduled at its current `not_before`. Returns the
    /// chosen queue index.
    pub fn push(&self, entry: Arc<Entry<I, O>>, now_ms: i64) -> usize {
        let idx = self
            .queues
            .iter()
            .enumerate()
            .min_by_key(|(_, q)| q.len())
            .map(|(i, _)| i)
            .unwrap_or(0);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.queues[idx].push(entry, seq, now_ms);
        idx
    }

    pub fn depths(&self) -> Vec<usize> {
        self.queues.iter().map(|q| q.len()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn entry(not_before_ms: i64) -> Arc<Entry<String, String>> {
        Entry::new(
            format!("at {not_before_ms}"),
            0,
            not_before_ms,
            1_000_000,
            &CancellationToken::new(),
        )
    }

    #[test]
    fn head_is_the_earliest_entry() {
        let pool: Arc<DelayQueuePool<String, String>> = DelayQueuePool::new(1);
        pool.push(entry(300), 0);
        pool.push(entry(100), 0);
        pool.push(entry(200), 0);

        let queue = pool.queue(0);
        for expected in [100, 200, 300] {
            let head = queue.peek_head().expect("head present");
            assert_eq!(head.not_before_ms, expected);
            assert!(queue.pop_if_head(head.entry.id()).is_some());
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn equal_schedule_times_keep_fifo_order() {
        let pool: Arc<DelayQueuePool<String, String>> = DelayQueuePool::new(1);
        let first = entry(50);
        let second = entry(50);
        let first_id = first.id();
        pool.push(first, 0);
        pool.push(second, 0);

        let head = pool.queue(0).peek_head().expect("head present");
        assert_eq!(head.entry.id(), first_id);
    }

    #[test]
    fn routing_prefers_the_least_loaded_queue() {
        let pool: Arc<DelayQueuePool<String, String>> = DelayQueuePool::new(2);
        let a = pool.push(entry(10), 0);
        let b = pool.push(entry(20), 0);
        assert_ne!(a, b, "second insert goes to the empty queue");
        assert_eq!(pool.depths(), vec![1, 1]);
    }

    #[test]
    fn pop_if_head_refuses_a_superseded_head() {
        let pool: Arc<DelayQueuePool<String, String>> = DelayQueuePool::new(1);
        let late = entry(500);
        let late_id = late.id();
        pool.push(late, 0);
        pool.push(entry(100), 0);

        assert!(pool.queue(0).pop_if_head(late_id).is_none());
        assert_eq!(pool.queue(0).len(), 2);
    }

    #[test]
    fn drain_empties_the_queue() {
        let pool: Arc<DelayQueuePool<String, String>> = DelayQueuePool::new(1);
        pool.push(entry(1), 0);
        pool.push(entry(2), 0);
        assert_eq!(pool.queue(0).drain().len(), 2);
        assert!(pool.queue(0).is_empty());
    }
}
