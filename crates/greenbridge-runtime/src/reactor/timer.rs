//! BinaryHeap timer queue for the event loop
//!
//! # Complexity
//!
//! - Insert: O(log n)
//! - Cancel: O(1) (lazy, the heap slot is skipped when it surfaces)
//! - Pop expired: O(k log n) for k expired timers
//!
//! Callbacks live in a side table keyed by handle. Cancelling removes the
//! callback immediately, so whatever it captured is released right away;
//! the stale heap slot is discarded once it reaches the top.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use super::Callback;

/// Handle to a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub(crate) u64);

/// Min-heap slot: earliest deadline first, insertion order on ties
#[derive(Debug, PartialEq, Eq)]
struct HeapSlot {
    deadline: Instant,
    handle: TimerHandle,
}

impl PartialOrd for HeapSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        match other.deadline.cmp(&self.deadline) {
            Ordering::Equal => other.handle.cmp(&self.handle),
            ord => ord,
        }
    }
}

/// Timer statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerStats {
    pub active: usize,
    pub total_inserted: u64,
    pub total_fired: u64,
    pub total_cancelled: u64,
}

pub(crate) struct TimerHeap {
    heap: BinaryHeap<HeapSlot>,
    callbacks: HashMap<TimerHandle, Callback>,
    next_handle: u64,
    total_inserted: u64,
    total_fired: u64,
    total_cancelled: u64,
}

impl TimerHeap {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            callbacks: HashMap::with_capacity(capacity),
            next_handle: 1,
            total_inserted: 0,
            total_fired: 0,
            total_cancelled: 0,
        }
    }

    pub(crate) fn insert(&mut self, deadline: Instant, callback: Callback) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        self.heap.push(HeapSlot { deadline, handle });
        self.callbacks.insert(handle, callback);
        self.total_inserted += 1;
        handle
    }

    /// Returns false if the timer already fired or was cancelled
    pub(crate) fn cancel(&mut self, handle: TimerHandle) -> bool {
        let removed = self.callbacks.remove(&handle).is_some();
        if removed {
            self.total_cancelled += 1;
        }
        if self.callbacks.is_empty() {
            self.heap.clear();
        }
        removed
    }

    /// Remove and return every timer due at `now`, in deadline order
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Vec<Callback> {
        let mut expired = Vec::new();
        while let Some(slot) = self.heap.peek() {
            if slot.deadline > now {
                break;
            }
            let handle = slot.handle;
            self.heap.pop();
            if let Some(cb) = self.callbacks.remove(&handle) {
                self.total_fired += 1;
                expired.push(cb);
            }
        }
        expired
    }

    /// Earliest live deadline; drops cancelled slots from the top
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(slot) = self.heap.peek() {
            if self.callbacks.contains_key(&slot.handle) {
                return Some(slot.deadline);
            }
            self.heap.pop();
        }
        None
    }

    pub(crate) fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub(crate) fn stats(&self) -> TimerStats {
        TimerStats {
            active: self.callbacks.len(),
            total_inserted: self.total_inserted,
            total_fired: self.total_fired,
            total_cancelled: self.total_cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    fn recorder(log: &Rc<RefCell<Vec<u32>>>, n: u32) -> Callback {
        let log = log.clone();
        Box::new(move || log.borrow_mut().push(n))
    }

    #[test]
    fn test_pop_in_deadline_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut timers = TimerHeap::with_capacity(8);
        let now = Instant::now();

        timers.insert(now + Duration::from_millis(30), recorder(&log, 3));
        timers.insert(now + Duration::from_millis(10), recorder(&log, 1));
        timers.insert(now + Duration::from_millis(20), recorder(&log, 2));
        timers.insert(now + Duration::from_secs(60), recorder(&log, 99));

        for cb in timers.pop_expired(now + Duration::from_millis(30)) {
            cb();
        }
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_equal_deadlines_fire_in_insertion_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut timers = TimerHeap::with_capacity(8);
        let at = Instant::now();
        for n in 0..5 {
            timers.insert(at, recorder(&log, n));
        }
        for cb in timers.pop_expired(at) {
            cb();
        }
        assert_eq!(*log.borrow(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_cancel_is_lazy_but_releases_callback() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut timers = TimerHeap::with_capacity(8);
        let now = Instant::now();

        let early = timers.insert(now + Duration::from_millis(1), recorder(&log, 1));
        timers.insert(now + Duration::from_millis(5), recorder(&log, 2));

        // Callback (and its captured Rc) dropped at cancel time
        assert_eq!(Rc::strong_count(&log), 3);
        assert!(timers.cancel(early));
        assert_eq!(Rc::strong_count(&log), 2);
        assert!(!timers.cancel(early));

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(5)));
        assert!(timers.pop_expired(now + Duration::from_millis(10)).len() == 1);
        assert!(timers.is_empty());

        let stats = timers.stats();
        assert_eq!(stats.total_inserted, 2);
        assert_eq!(stats.total_fired, 1);
        assert_eq!(stats.total_cancelled, 1);
    }
}
