// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timer heap with lazy deletion.
//!
//! Min-heap keyed by due time. Cancelling flips a tombstone flag and
//! adjusts the live count; the tombstoned entry is physically removed
//! only when it surfaces at the top. `len()` always reports the live
//! count.

use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Why a timer target is being fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FireReason {
    /// The due time arrived.
    Elapsed,
    /// The hub is stopping; deliver Stop instead of the payload.
    Stopped,
}

/// A scheduled action. Fired at most once, with the reason telling it
/// whether to resume normally or unwind with Stop.
pub(crate) trait TimerTarget {
    fn fire(self: Box<Self>, reason: FireReason);
}

/// Cancellation handle for one heap entry. Cancel goes through
/// [`TimerHeap::cancel`] so the live count stays consistent.
pub(crate) struct TimerHandle {
    live: Rc<Cell<bool>>,
}

struct Entry {
    due: Instant,
    seq: u64,
    live: Rc<Cell<bool>>,
    target: Box<dyn TimerTarget>,
}

// BinaryHeap is a max-heap; reverse the ordering to pop earliest-due
// first. Ties break by insertion sequence.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Entry {}

/// The hub's scheduled-item store.
pub(crate) struct TimerHeap {
    queue: BinaryHeap<Entry>,
    count: usize,
    next_seq: u64,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            count: 0,
            next_seq: 0,
        }
    }

    /// Schedule `target` to fire at `due`.
    pub fn add(&mut self, due: Instant, target: Box<dyn TimerTarget>) -> TimerHandle {
        let live = Rc::new(Cell::new(true));
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Entry {
            due,
            seq,
            live: live.clone(),
            target,
        });
        self.count += 1;
        TimerHandle { live }
    }

    /// Lazily cancel an entry. A no-op if it already fired or was
    /// already cancelled, so losing the race against the deadline is
    /// harmless.
    pub fn cancel(&mut self, handle: &TimerHandle) {
        if handle.live.replace(false) {
            self.count -= 1;
        }
    }

    /// Live entry count, independent of pending tombstones.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Drop tombstoned entries sitting at the top.
    fn prune(&mut self) {
        while let Some(top) = self.queue.peek() {
            if top.live.get() {
                break;
            }
            self.queue.pop();
        }
    }

    /// Time until the earliest live entry is due; zero if overdue,
    /// `None` if the heap is empty.
    pub fn next_timeout(&mut self, now: Instant) -> Option<Duration> {
        self.prune();
        let top = self.queue.peek()?;
        Some(top.due.saturating_duration_since(now))
    }

    /// Pop the earliest live entry if its due time has arrived.
    pub fn pop_due(&mut self, now: Instant) -> Option<Box<dyn TimerTarget>> {
        self.prune();
        if self.queue.peek()?.due > now {
            return None;
        }
        let entry = self.queue.pop()?;
        entry.live.set(false);
        self.count -= 1;
        Some(entry.target)
    }

    /// Remove and return every live entry in heap order. Used by hub
    /// shutdown to deliver Stop to each target.
    pub fn drain(&mut self) -> Vec<Box<dyn TimerTarget>> {
        let mut targets = Vec::with_capacity(self.count);
        while let Some(entry) = self.queue.pop() {
            if entry.live.replace(false) {
                self.count -= 1;
                targets.push(entry.target);
            }
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Mark {
        hits: Rc<std::cell::RefCell<Vec<(u32, FireReason)>>>,
        id: u32,
    }

    impl TimerTarget for Mark {
        fn fire(self: Box<Self>, reason: FireReason) {
            self.hits.borrow_mut().push((self.id, reason));
        }
    }

    fn mark(hits: &Rc<std::cell::RefCell<Vec<(u32, FireReason)>>>, id: u32) -> Box<Mark> {
        Box::new(Mark {
            hits: hits.clone(),
            id,
        })
    }

    #[test]
    fn pops_in_due_order() {
        let hits = Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        heap.add(now + Duration::from_millis(30), mark(&hits, 3));
        heap.add(now + Duration::from_millis(10), mark(&hits, 1));
        heap.add(now + Duration::from_millis(20), mark(&hits, 2));

        let later = now + Duration::from_millis(100);
        while let Some(target) = heap.pop_due(later) {
            target.fire(FireReason::Elapsed);
        }
        let ids: Vec<u32> = hits.borrow().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(heap.is_empty());
    }

    #[test]
    fn not_due_not_popped() {
        let hits = Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        heap.add(now + Duration::from_secs(60), mark(&hits, 1));
        assert!(heap.pop_due(now).is_none());
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn cancel_is_lazy_but_counted() {
        let hits = Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        let h = heap.add(now + Duration::from_millis(1), mark(&hits, 1));
        heap.add(now + Duration::from_millis(2), mark(&hits, 2));
        heap.cancel(&h);
        assert_eq!(heap.len(), 1);
        // Cancelling twice changes nothing.
        heap.cancel(&h);
        assert_eq!(heap.len(), 1);

        let later = now + Duration::from_millis(10);
        while let Some(target) = heap.pop_due(later) {
            target.fire(FireReason::Elapsed);
        }
        let ids: Vec<u32> = hits.borrow().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn cancel_after_fire_is_noop() {
        let hits = Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        let h = heap.add(now, mark(&hits, 1));
        heap.pop_due(now).unwrap().fire(FireReason::Elapsed);
        assert!(heap.is_empty());
        heap.cancel(&h);
        assert!(heap.is_empty());
    }

    #[test]
    fn next_timeout_clamps_to_zero() {
        let hits = Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        heap.add(now, mark(&hits, 1));
        assert_eq!(
            heap.next_timeout(now + Duration::from_millis(5)),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn next_timeout_skips_tombstones() {
        let hits = Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        let h = heap.add(now + Duration::from_millis(1), mark(&hits, 1));
        heap.add(now + Duration::from_millis(50), mark(&hits, 2));
        heap.cancel(&h);
        assert_eq!(
            heap.next_timeout(now),
            Some(Duration::from_millis(50))
        );
    }

    #[test]
    fn drain_fires_live_entries_with_stop() {
        let hits = Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        heap.add(now + Duration::from_secs(5), mark(&hits, 1));
        let h = heap.add(now + Duration::from_secs(6), mark(&hits, 2));
        heap.cancel(&h);
        for target in heap.drain() {
            target.fire(FireReason::Stopped);
        }
        assert!(heap.is_empty());
        assert_eq!(&*hits.borrow(), &[(1, FireReason::Stopped)]);
    }
}
