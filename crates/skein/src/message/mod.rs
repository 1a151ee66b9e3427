// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Message endpoints: the universal sender/receiver rendezvous.
//!
//! Every primitive (pipe, dealer, router, queue, channel, state) is a
//! pair of [`Sender`] / [`Recver`] handles over a shared middle. The
//! middle decides what a send or recv does when it cannot complete
//! immediately; the futures here do the parking, waking, deadline and
//! cancellation plumbing once, for all of them.
//!
//! Components:
//! - `exchange` — rendezvous + bounded buffer (pipe/dealer/router/queue/channel)
//! - `state`    — latched cell (writers never block)
//! - `broadcast` — non-blocking fan-out over subscriber senders

pub(crate) mod broadcast;
pub(crate) mod exchange;
pub(crate) mod state;

pub use broadcast::Broadcast;

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::error::Halt;
use crate::hub::HubCore;
use crate::timer::{FireReason, TimerHandle, TimerTarget};

/// Both ends of a freshly built primitive.
pub type Pair<T> = (Sender<T>, Recver<T>);

/// Outcome of a non-parking send attempt.
pub(crate) enum TrySend<T> {
    /// Delivered or buffered.
    Done,
    /// No capacity and no parked recver; the caller must park.
    Full(T),
    /// The primitive cannot accept values any more.
    Halted(Halt, T),
}

/// Outcome of a non-parking recv attempt.
pub(crate) enum TryRecv<T> {
    Value(T),
    /// Nothing available; the caller must park.
    Empty,
    Halted(Halt),
}

/// A sender parked inside a middle. The middle takes `value` on
/// delivery and fills `result`; the future reads `result` on its next
/// poll.
pub(crate) struct SendWaiter<T> {
    pub value: Option<T>,
    pub result: Option<Result<(), Halt>>,
    pub waker: Option<Waker>,
}

impl<T> SendWaiter<T> {
    fn new(value: T, waker: Waker) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            value: Some(value),
            result: None,
            waker: Some(waker),
        }))
    }

    pub(crate) fn complete(&mut self, result: Result<(), Halt>) {
        self.result = Some(result);
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

/// A recver parked inside a middle (or waiting on a deadline).
pub(crate) struct RecvWaiter<T> {
    pub slot: Option<Result<T, Halt>>,
    pub waker: Option<Waker>,
}

impl<T> RecvWaiter<T> {
    fn new(waker: Waker) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            slot: None,
            waker: Some(waker),
        }))
    }

    pub(crate) fn complete(&mut self, result: Result<T, Halt>) {
        self.slot = Some(result);
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

/// What a primitive must provide for the shared endpoint machinery.
///
/// All methods are synchronous state transitions; parking and waking
/// happen through the waiter cells.
pub(crate) trait Middle<T> {
    fn try_send(&self, v: T) -> TrySend<T>;
    fn park_sender(&self, waiter: Rc<RefCell<SendWaiter<T>>>);
    fn unpark_sender(&self, waiter: &Rc<RefCell<SendWaiter<T>>>);
    fn try_recv(&self) -> TryRecv<T>;
    fn park_recver(&self, waiter: Rc<RefCell<RecvWaiter<T>>>);
    fn unpark_recver(&self, waiter: &Rc<RefCell<RecvWaiter<T>>>);
    /// Close the sending half. `reason` is what parked and future
    /// recvers observe (`Abandoned` for an ordinary close, `Stop` when
    /// the hub shuts a registration down).
    fn close_send_half(&self, reason: Halt);
    fn close_recv_half(&self);
    /// True iff a recver is parked right now (a send would complete
    /// without buffering or parking).
    fn sender_ready(&self) -> bool;
}

struct SendGuard<T> {
    mid: Rc<dyn Middle<T>>,
}

impl<T> Drop for SendGuard<T> {
    fn drop(&mut self) {
        self.mid.close_send_half(Halt::Abandoned);
    }
}

struct RecvGuard<T> {
    mid: Rc<dyn Middle<T>>,
}

impl<T> Drop for RecvGuard<T> {
    fn drop(&mut self) {
        self.mid.close_recv_half();
    }
}

/// The sending end of a primitive. Clones share the same middle;
/// dropping the last clone closes this half.
pub struct Sender<T> {
    mid: Rc<dyn Middle<T>>,
    guard: Rc<SendGuard<T>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            mid: self.mid.clone(),
            guard: self.guard.clone(),
        }
    }
}

/// The receiving end of a primitive. Clones share the same middle;
/// dropping the last clone closes this half.
pub struct Recver<T> {
    core: Weak<HubCore>,
    mid: Rc<dyn Middle<T>>,
    guard: Rc<RecvGuard<T>>,
}

impl<T> Clone for Recver<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            mid: self.mid.clone(),
            guard: self.guard.clone(),
        }
    }
}

/// Wrap a middle into its endpoint pair.
pub(crate) fn pair_from<T>(core: Weak<HubCore>, mid: Rc<dyn Middle<T>>) -> Pair<T> {
    let sender = Sender {
        mid: mid.clone(),
        guard: Rc::new(SendGuard { mid: mid.clone() }),
    };
    let recver = Recver {
        core,
        mid: mid.clone(),
        guard: Rc::new(RecvGuard { mid }),
    };
    (sender, recver)
}

impl<T> Sender<T> {
    /// Send `v`, suspending until a counterparty (or buffer slot)
    /// takes it.
    pub fn send(&self, v: T) -> SendFuture<T> {
        SendFuture {
            mid: self.mid.clone(),
            value: Some(v),
            waiter: None,
        }
    }

    /// Deliver `v` only if it would complete right now; otherwise give
    /// it back. Used by the event dispatcher and broadcast, which must
    /// never block.
    pub(crate) fn try_send(&self, v: T) -> TrySend<T> {
        self.mid.try_send(v)
    }

    /// Is a recver parked, so that a send would complete immediately?
    pub fn ready(&self) -> bool {
        self.mid.sender_ready()
    }

    /// Close the sending half for every clone. Parked and future
    /// recvs observe `Abandoned` once drained.
    pub fn close(&self) {
        self.mid.close_send_half(Halt::Abandoned);
    }

    /// Close delivering `reason` to the recv side instead of
    /// `Abandoned`. The hub uses this to push `Stop` through fd
    /// registrations.
    pub(crate) fn close_with(&self, reason: Halt) {
        self.mid.close_send_half(reason);
    }
}

impl<T: 'static> Recver<T> {
    /// Receive the next value, suspending until one arrives.
    pub fn recv(&self) -> RecvFuture<T> {
        RecvFuture {
            core: self.core.clone(),
            mid: self.mid.clone(),
            deadline: None,
            timer: None,
            waiter: None,
        }
    }

    /// Like [`recv`](Self::recv), but fail with `Halt::Timeout` if no
    /// value arrives within `ms` milliseconds.
    pub fn recv_timeout(&self, ms: u64) -> RecvFuture<T> {
        RecvFuture {
            core: self.core.clone(),
            mid: self.mid.clone(),
            deadline: Some(Duration::from_millis(ms)),
            timer: None,
            waiter: None,
        }
    }

    /// Close the receiving half for every clone. Parked and future
    /// sends observe `Abandoned`; buffered values are discarded.
    pub fn close(&self) {
        self.mid.close_recv_half();
    }

    /// Forward everything from this recver into `next`'s sender on a
    /// spawned task, returning `next`'s recver. Closure propagates both
    /// ways: upstream EOF closes downstream, a closed downstream closes
    /// this recver.
    pub fn pipe(self, next: Pair<T>) -> Recver<T> {
        let (tx, rx) = next;
        self.pipe_into(tx);
        rx
    }

    /// Forward everything from this recver into an existing sender
    /// (e.g. one returned by `Hub::consumer`).
    pub fn pipe_into(self, tx: Sender<T>) {
        let core = self
            .core
            .upgrade()
            .expect("hub dropped before pipe composition");
        HubCore::spawn_boxed(
            &core,
            Box::pin(async move {
                loop {
                    match self.recv().await {
                        Ok(v) => {
                            if tx.send(v).await.is_err() {
                                self.close();
                                break;
                            }
                        }
                        Err(_) => {
                            tx.close();
                            break;
                        }
                    }
                }
            }),
        );
    }
}

/// In-flight send. Parks in the middle's wait-list on first poll if it
/// cannot complete; dropping it mid-flight removes the parked entry.
pub struct SendFuture<T> {
    mid: Rc<dyn Middle<T>>,
    value: Option<T>,
    waiter: Option<Rc<RefCell<SendWaiter<T>>>>,
}

// The value is only ever moved out whole; nothing is pinned through it.
impl<T> Unpin for SendFuture<T> {}

impl<T> Future for SendFuture<T> {
    type Output = Result<(), Halt>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(waiter) = this.waiter.clone() {
            let mut w = waiter.borrow_mut();
            if let Some(result) = w.result.take() {
                drop(w);
                this.waiter = None;
                return Poll::Ready(result);
            }
            w.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let v = match this.value.take() {
            Some(v) => v,
            None => return Poll::Pending, // polled after completion
        };
        match this.mid.try_send(v) {
            TrySend::Done => Poll::Ready(Ok(())),
            TrySend::Halted(halt, _) => Poll::Ready(Err(halt)),
            TrySend::Full(v) => {
                let waiter = SendWaiter::new(v, cx.waker().clone());
                this.mid.park_sender(waiter.clone());
                this.waiter = Some(waiter);
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for SendFuture<T> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            self.mid.unpark_sender(&waiter);
        }
    }
}

/// In-flight recv, optionally with a deadline. The deadline is armed
/// when the future first parks; completing first makes the timer a
/// lazy-cancelled tombstone, and a late fire is a no-op.
pub struct RecvFuture<T> {
    core: Weak<HubCore>,
    mid: Rc<dyn Middle<T>>,
    deadline: Option<Duration>,
    timer: Option<TimerHandle>,
    waiter: Option<Rc<RefCell<RecvWaiter<T>>>>,
}

impl<T> Unpin for RecvFuture<T> {}

struct DeadlineTarget<T> {
    waiter: Rc<RefCell<RecvWaiter<T>>>,
}

impl<T> TimerTarget for DeadlineTarget<T> {
    fn fire(self: Box<Self>, reason: FireReason) {
        let mut w = self.waiter.borrow_mut();
        if w.slot.is_none() {
            let halt = match reason {
                FireReason::Elapsed => Halt::Timeout,
                FireReason::Stopped => Halt::Stop,
            };
            w.complete(Err(halt));
        }
    }
}

impl<T: 'static> Future for RecvFuture<T> {
    type Output = Result<T, Halt>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(waiter) = this.waiter.clone() {
            let mut w = waiter.borrow_mut();
            if let Some(result) = w.slot.take() {
                drop(w);
                // A timeout leaves the waiter parked in the middle;
                // completion by the middle makes this a no-op.
                this.mid.unpark_recver(&waiter);
                this.waiter = None;
                if let (Some(timer), Some(core)) = (this.timer.take(), this.core.upgrade()) {
                    core.cancel_timer(&timer);
                }
                return Poll::Ready(result);
            }
            w.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        match this.mid.try_recv() {
            TryRecv::Value(v) => Poll::Ready(Ok(v)),
            TryRecv::Halted(halt) => Poll::Ready(Err(halt)),
            TryRecv::Empty => {
                let waiter = RecvWaiter::new(cx.waker().clone());
                this.mid.park_recver(waiter.clone());
                if let Some(delay) = this.deadline.take() {
                    match this.core.upgrade() {
                        Some(core) => {
                            let target = Box::new(DeadlineTarget {
                                waiter: waiter.clone(),
                            });
                            this.timer = Some(core.add_timer(Instant::now() + delay, target));
                        }
                        // Hub already gone: nothing can ever complete
                        // this recv, report shutdown.
                        None => {
                            this.mid.unpark_recver(&waiter);
                            return Poll::Ready(Err(Halt::Stop));
                        }
                    }
                }
                this.waiter = Some(waiter);
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for RecvFuture<T> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            self.mid.unpark_recver(&waiter);
        }
        if let (Some(timer), Some(core)) = (self.timer.take(), self.core.upgrade()) {
            core.cancel_timer(&timer);
        }
    }
}
