//! Array-backed binary max-heap for queued jobs.
//!
//! Ordering at pop time: priority (descending), then earlier deadline
//! (items with a deadline outrank items without), then arrival order.
//! The heap is not a stable structure, so arrival order is carried as an
//! explicit sequence number rather than inferred from position.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scheduling class for queued jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// One unit of queued work. Created at enqueue time; `attempts` is
/// advanced only by the queue's own processing loop.
#[derive(Debug, Clone)]
pub struct QueueItem<T> {
    pub id: String,
    pub payload: T,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Per-attempt processing budget.
    pub timeout: Duration,
    /// Items popped after this instant are dropped without processing.
    pub deadline: Option<Instant>,
    /// Arrival order tiebreaker, assigned by the owning queue.
    pub(crate) seq: u64,
}

impl<T> QueueItem<T> {
    /// True when `a` should be dispatched before `b`.
    fn outranks(a: &Self, b: &Self) -> bool {
        if a.priority != b.priority {
            return a.priority > b.priority;
        }
        match (a.deadline, b.deadline) {
            (Some(left), Some(right)) if left != right => left < right,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            _ => a.seq < b.seq,
        }
    }
}

/// Max-heap over [`QueueItem`]s, backed by a plain vector.
#[derive(Debug)]
pub struct PriorityHeap<T> {
    items: Vec<QueueItem<T>>,
}

impl<T> PriorityHeap<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, item: QueueItem<T>) {
        self.items.push(item);
        self.sift_up(self.items.len() - 1);
    }

    pub fn pop(&mut self) -> Option<QueueItem<T>> {
        if self.items.is_empty() {
            return None;
        }
        let last = self.items.len() - 1;
        self.items.swap(0, last);
        let top = self.items.pop();
        if !self.items.is_empty() {
            self.sift_down(0);
        }
        top
    }

    pub fn peek(&self) -> Option<&QueueItem<T>> {
        self.items.first()
    }

    /// Remove and return every queued item, in no particular order.
    pub fn drain(&mut self) -> Vec<QueueItem<T>> {
        std::mem::take(&mut self.items)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if QueueItem::outranks(&self.items[index], &self.items[parent]) {
                self.items.swap(index, parent);
                index = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.items.len();
        loop {
            let left = 2 * index + 1;
            let right = 2 * index + 2;
            let mut best = index;

            if left < len && QueueItem::outranks(&self.items[left], &self.items[best]) {
                best = left;
            }
            if right < len && QueueItem::outranks(&self.items[right], &self.items[best]) {
                best = right;
            }
            if best == index {
                break;
            }
            self.items.swap(index, best);
            index = best;
        }
    }
}

impl<T> Default for PriorityHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(priority: Priority, seq: u64) -> QueueItem<&'static str> {
        QueueItem {
            id: format!("item-{seq}"),
            payload: "payload",
            priority,
            created_at: Utc::now(),
            attempts: 0,
            max_attempts: 3,
            timeout: Duration::from_secs(30),
            deadline: None,
            seq,
        }
    }

    #[test]
    fn pops_by_priority() {
        let mut heap = PriorityHeap::new();
        heap.push(item(Priority::Low, 0));
        heap.push(item(Priority::Critical, 1));
        heap.push(item(Priority::Normal, 2));

        let order: Vec<Priority> = std::iter::from_fn(|| heap.pop().map(|i| i.priority)).collect();
        assert_eq!(order, vec![Priority::Critical, Priority::Normal, Priority::Low]);
    }

    #[test]
    fn fifo_within_equal_priority() {
        let mut heap = PriorityHeap::new();
        for seq in 0..5 {
            heap.push(item(Priority::Normal, seq));
        }

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|i| i.seq)).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn earlier_deadline_outranks_within_priority() {
        let now = Instant::now();
        let mut late = item(Priority::Normal, 0);
        late.deadline = Some(now + Duration::from_secs(60));
        let mut soon = item(Priority::Normal, 1);
        soon.deadline = Some(now + Duration::from_secs(5));
        let none = item(Priority::Normal, 2);

        let mut heap = PriorityHeap::new();
        heap.push(none);
        heap.push(late);
        heap.push(soon);

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|i| i.seq)).collect();
        // Deadlined items first (soonest deadline wins), undated last.
        assert_eq!(order, vec![1, 0, 2]);
    }

    #[test]
    fn priority_beats_deadline() {
        let now = Instant::now();
        let mut normal_soon = item(Priority::Normal, 0);
        normal_soon.deadline = Some(now + Duration::from_millis(1));
        let high = item(Priority::High, 1);

        let mut heap = PriorityHeap::new();
        heap.push(normal_soon);
        heap.push(high);

        assert_eq!(heap.pop().unwrap().seq, 1);
        assert_eq!(heap.pop().unwrap().seq, 0);
    }

    #[test]
    fn drain_empties_the_heap() {
        let mut heap = PriorityHeap::new();
        heap.push(item(Priority::Low, 0));
        heap.push(item(Priority::High, 1));

        let drained = heap.drain();
        assert_eq!(drained.len(), 2);
        assert!(heap.is_empty());
        assert!(heap.pop().is_none());
    }
}
