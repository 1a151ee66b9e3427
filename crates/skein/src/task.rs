// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task representation: the table of suspended futures, the ready
//! deque, and the waker that links them.
//!
//! Tasks are stackless: each is a boxed future polled by the hub loop.
//! A waker carries only the task id and a handle to the ready deque, so
//! waking never touches the (single-threaded) task table itself.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Wake, Waker};

pub(crate) type TaskId = u64;

/// Futures here are not `Send`: the whole runtime lives on one thread.
pub(crate) type LocalFuture = Pin<Box<dyn Future<Output = ()>>>;

/// FIFO of task ids due to be polled. Mutex-protected because `Waker`
/// must be `Send + Sync`, but in practice only the hub thread touches
/// it; the lock is never contended.
pub(crate) struct ReadyQueue {
    woken: Mutex<VecDeque<TaskId>>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            woken: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, id: TaskId) {
        self.woken.lock().unwrap().push_back(id);
    }

    /// Take everything queued so far. Ids pushed while the batch runs
    /// land in the next batch — this is the per-tick snapshot that
    /// keeps self-readying tasks from starving everyone else.
    pub fn take_batch(&self) -> VecDeque<TaskId> {
        std::mem::take(&mut *self.woken.lock().unwrap())
    }

    pub fn is_empty(&self) -> bool {
        self.woken.lock().unwrap().is_empty()
    }
}

struct TaskWaker {
    id: TaskId,
    ready: Arc<ReadyQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ready.push(self.id);
    }
}

/// Build the waker handed to a task's poll.
pub(crate) fn waker_for(id: TaskId, ready: &Arc<ReadyQueue>) -> Waker {
    Waker::from(Arc::new(TaskWaker {
        id,
        ready: ready.clone(),
    }))
}

/// The hub's task table. A slot is empty while its future is out being
/// polled, so user code running inside the poll can spawn and wake
/// freely without re-entrant borrows.
pub(crate) struct TaskTable {
    slots: HashMap<TaskId, Option<LocalFuture>>,
    next_id: TaskId,
}

impl TaskTable {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn insert(&mut self, future: LocalFuture) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        self.slots.insert(id, Some(future));
        id
    }

    /// Borrow a task's future out of the table. Returns `None` for
    /// dead ids (stale wakes) or futures currently being polled.
    pub fn take_future(&mut self, id: TaskId) -> Option<LocalFuture> {
        self.slots.get_mut(&id)?.take()
    }

    /// Return a still-pending future to its slot.
    pub fn restore(&mut self, id: TaskId, future: LocalFuture) {
        if let Some(slot) = self.slots.get_mut(&id) {
            *slot = Some(future);
        }
    }

    pub fn remove(&mut self, id: TaskId) {
        self.slots.remove(&id);
    }

    /// Drop every task. Run on loop exit so futures holding hub
    /// handles don't keep the hub core alive in a reference cycle.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_queue_is_fifo() {
        let q = ReadyQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        let batch = q.take_batch();
        assert_eq!(batch, VecDeque::from(vec![1, 2, 3]));
        assert!(q.is_empty());
    }

    #[test]
    fn batch_snapshot_excludes_later_pushes() {
        let q = ReadyQueue::new();
        q.push(1);
        let batch = q.take_batch();
        q.push(2);
        assert_eq!(batch, VecDeque::from(vec![1]));
        assert_eq!(q.take_batch(), VecDeque::from(vec![2]));
    }

    #[test]
    fn waker_pushes_its_id() {
        let ready = Arc::new(ReadyQueue::new());
        let waker = waker_for(7, &ready);
        waker.wake_by_ref();
        waker.wake();
        assert_eq!(ready.take_batch(), VecDeque::from(vec![7, 7]));
    }

    #[test]
    fn table_take_and_restore() {
        let mut table = TaskTable::new();
        let id = table.insert(Box::pin(std::future::ready(())));
        let fut = table.take_future(id).unwrap();
        // Slot exists but is empty while the future is out.
        assert!(table.take_future(id).is_none());
        table.restore(id, fut);
        assert!(table.take_future(id).is_some());
    }

    #[test]
    fn stale_ids_are_ignored() {
        let mut table = TaskTable::new();
        let id = table.insert(Box::pin(std::future::ready(())));
        table.remove(id);
        assert!(table.take_future(id).is_none());
        table.restore(id, Box::pin(std::future::ready(())));
        assert!(table.take_future(id).is_none());
    }
}
