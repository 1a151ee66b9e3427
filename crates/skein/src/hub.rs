// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The hub: scheduler, timer heap and poll registration behind one
//! facade.
//!
//! A hub is a self-contained world of cooperating tasks. It is
//! explicit — every primitive is built from a hub handle and bound to
//! it — which keeps tests honest: two hubs cannot affect each other.
//!
//! `run` pumps ticks until the root future finishes or the hub runs
//! dry. A tick runs the ready snapshot, waits for fd readiness no
//! longer than the earliest timer allows, fires due timers, and
//! dispatches fd events to their registered senders.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::error::Halt;
use crate::message::broadcast::Broadcast;
use crate::message::exchange::Exchange;
use crate::message::state::Latch;
use crate::message::{pair_from, Pair, Recver, Sender};
use crate::poller::{Event, Mask, Poller};
use crate::task::{waker_for, LocalFuture, ReadyQueue, TaskTable};
use crate::timer::{FireReason, TimerHandle, TimerHeap, TimerTarget};

pub(crate) struct HubCore {
    tasks: RefCell<TaskTable>,
    ready: Arc<ReadyQueue>,
    timers: RefCell<TimerHeap>,
    poller: Poller,
    registered: RefCell<HashMap<RawFd, HashMap<Mask, Sender<bool>>>>,
    /// Latched true when the pump runs dry; `stop()` waits on it.
    stopped: Pair<bool>,
    running: Cell<bool>,
    /// Set by the root task's wrapper; tells the pump not to block on
    /// I/O once the answer `run` is waiting for exists.
    root_done: Cell<bool>,
}

impl HubCore {
    /// Insert a task and queue it for the next tick.
    pub(crate) fn spawn_boxed(core: &Rc<Self>, future: LocalFuture) {
        let id = core.tasks.borrow_mut().insert(future);
        core.ready.push(id);
    }

    pub(crate) fn add_timer(
        &self,
        due: Instant,
        target: Box<dyn TimerTarget>,
    ) -> TimerHandle {
        self.timers.borrow_mut().add(due, target)
    }

    pub(crate) fn cancel_timer(&self, handle: &TimerHandle) {
        self.timers.borrow_mut().cancel(handle);
    }
}

/// Handle to a hub. Clones share the same scheduler; the handle is
/// cheap to pass into tasks.
#[derive(Clone)]
pub struct Hub {
    core: Rc<HubCore>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        let core = Rc::new_cyclic(|weak: &Weak<HubCore>| HubCore {
            tasks: RefCell::new(TaskTable::new()),
            ready: Arc::new(ReadyQueue::new()),
            timers: RefCell::new(TimerHeap::new()),
            poller: Poller::new().expect("failed to create epoll poller"),
            registered: RefCell::new(HashMap::new()),
            stopped: pair_from(weak.clone(), Latch::new(None)),
            running: Cell::new(false),
            root_done: Cell::new(false),
        });
        Self { core }
    }

    fn weak(&self) -> Weak<HubCore> {
        Rc::downgrade(&self.core)
    }

    // ----- primitive constructors -------------------------------------

    /// 1:1 unbuffered rendezvous.
    pub fn pipe<T: 'static>(&self) -> Pair<T> {
        pair_from(self.weak(), Exchange::new(0))
    }

    /// N senders converging on one recver; parked senders are served
    /// round-robin. Clone the sender end.
    pub fn dealer<T: 'static>(&self) -> Pair<T> {
        pair_from(self.weak(), Exchange::new(0))
    }

    /// One sender fanning out to N recvers, first-come. Clone the
    /// recver end.
    pub fn router<T: 'static>(&self) -> Pair<T> {
        pair_from(self.weak(), Exchange::new(0))
    }

    /// Bounded buffer of `size` between one sender and one recver;
    /// sends block only when the buffer is full.
    pub fn queue<T: 'static>(&self, size: usize) -> Pair<T> {
        pair_from(self.weak(), Exchange::new(size))
    }

    /// M:N channel, go-style: clone both ends freely; `size` 0 is a
    /// pure rendezvous.
    pub fn channel<T: 'static>(&self, size: usize) -> Pair<T> {
        pair_from(self.weak(), Exchange::new(size))
    }

    /// Fan-out with the drop policy of [`Broadcast`].
    pub fn broadcast<T: Clone + 'static>(&self) -> Broadcast<T> {
        Broadcast::new(self.weak())
    }

    /// Latched cell: recv returns the current value or blocks until
    /// the first send; writers never block.
    pub fn state<T: Clone + 'static>(&self, initial: impl Into<Option<T>>) -> Pair<T> {
        pair_from(self.weak(), Latch::new(initial.into()))
    }

    // ----- convenience spawners ---------------------------------------

    /// Spawn `f` with the sender end of a fresh pipe; return the
    /// recver:
    ///
    /// ```ignore
    /// let recver = hub.producer(|tx| async move {
    ///     let mut i = 0;
    ///     loop {
    ///         i += 1;
    ///         if tx.send(i).await.is_err() {
    ///             break;
    ///         }
    ///     }
    /// });
    /// ```
    pub fn producer<T, F, Fut>(&self, f: F) -> Recver<T>
    where
        T: 'static,
        F: FnOnce(Sender<T>) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        let (tx, rx) = self.pipe();
        self.spawn(f(tx));
        rx
    }

    /// Spawn a forwarder that reads until Halt and calls `f` per item;
    /// return the sender feeding it.
    pub fn consumer<T, F>(&self, f: F) -> Sender<T>
    where
        T: 'static,
        F: FnMut(T) + 'static,
    {
        let (tx, rx) = self.pipe();
        let mut f = f;
        self.spawn(async move {
            while let Ok(v) = rx.recv().await {
                f(v);
            }
        });
        tx
    }

    /// A recver that yields a clone of `item` every `ms` milliseconds.
    /// Sends rendezvous, so a slow recver throttles the pulse rather
    /// than piling items up.
    pub fn pulse<T: Clone + 'static>(&self, ms: u64, item: T) -> Recver<T> {
        let hub = self.clone();
        self.producer(move |tx| async move {
            loop {
                if hub.sleep(ms).await.is_err() {
                    break;
                }
                if tx.send(item.clone()).await.is_err() {
                    break;
                }
            }
            tx.close();
        })
    }

    /// A handle that runs `f` once per trigger, in task context.
    pub fn trigger<F>(&self, f: F) -> Trigger
    where
        F: FnMut() + 'static,
    {
        let (tx, rx) = self.pipe::<bool>();
        let mut f = f;
        self.spawn(async move {
            while rx.recv().await.is_ok() {
                f();
            }
        });
        Trigger { tx }
    }

    /// Serialize access to `f`: all `call`s funnel through one worker
    /// task, each awaiting its own reply.
    pub fn serialize<A, R, F>(&self, f: F) -> Serialized<A, R>
    where
        A: 'static,
        R: 'static,
        F: FnMut(A) -> R + 'static,
    {
        let (tx, rx) = self.channel::<(A, Sender<R>)>(0);
        let mut f = f;
        self.spawn(async move {
            while let Ok((a, reply)) = rx.recv().await {
                let _ = reply.send(f(a)).await;
            }
        });
        Serialized {
            hub: self.clone(),
            tx,
        }
    }

    // ----- scheduling -------------------------------------------------

    /// Spawn a task. Tasks start in spawn order, on the tick after the
    /// current one.
    pub fn spawn<F: Future<Output = ()> + 'static>(&self, f: F) {
        HubCore::spawn_boxed(&self.core, Box::pin(f));
    }

    /// Spawn a task `ms` milliseconds from now. The task is owned by
    /// the timer heap until then; `stop()` drops it unstarted.
    pub fn spawn_later<F: Future<Output = ()> + 'static>(&self, ms: u64, f: F) {
        let due = Instant::now() + Duration::from_millis(ms);
        self.core.add_timer(
            due,
            Box::new(SpawnTarget {
                core: self.weak(),
                future: RefCell::new(Some(Box::pin(f))),
            }),
        );
    }

    /// Suspend the current task for `ms` milliseconds. Fails with
    /// `Halt::Stop` if the hub shuts down first.
    pub fn sleep(&self, ms: u64) -> SleepFuture {
        SleepFuture {
            core: self.weak(),
            delay: Some(Duration::from_millis(ms)),
            state: Rc::new(RefCell::new(SleepState {
                done: None,
                waker: None,
            })),
        }
    }

    /// Give every other ready task a turn before continuing.
    pub fn yield_now(&self) -> YieldFuture {
        YieldFuture { yielded: false }
    }

    // ----- fd registration --------------------------------------------

    /// Watch `fd` for the given masks. Each mask gets its own pipe; a
    /// readiness event sends `true` on it iff a recv is parked there
    /// (otherwise the event is dropped — epoll is level-triggered and
    /// will report it again). An error event closes every sender for
    /// the fd. Registering an fd that is already watched replaces its
    /// mask set and closes the previous senders. One hub per fd.
    pub fn register(&self, fd: RawFd, masks: &[Mask]) -> io::Result<Vec<Recver<bool>>> {
        if self.core.registered.borrow().contains_key(&fd) {
            self.core.poller.modify(fd, masks)?;
        } else {
            self.core.poller.register(fd, masks)?;
        }
        let mut senders = HashMap::new();
        let mut recvers = Vec::with_capacity(masks.len());
        for &mask in masks {
            let (tx, rx) = pair_from(self.weak(), Exchange::new(0));
            senders.insert(mask, tx);
            recvers.push(rx);
        }
        let displaced = self.core.registered.borrow_mut().insert(fd, senders);
        if let Some(displaced) = displaced {
            for tx in displaced.into_values() {
                tx.close();
            }
        }
        Ok(recvers)
    }

    /// Drop the registration for `fd` and close its senders; parked
    /// recvs observe Abandoned.
    pub fn unregister(&self, fd: RawFd) {
        let senders = self.core.registered.borrow_mut().remove(&fd);
        if let Some(senders) = senders {
            let _ = self.core.poller.unregister(fd);
            for tx in senders.into_values() {
                tx.close();
            }
        }
    }

    // ----- shutdown ---------------------------------------------------

    /// A recver on the stopped latch: completes once the pump has run
    /// dry.
    pub fn stopped(&self) -> Recver<bool> {
        self.core.stopped.1.clone()
    }

    /// Orderly shutdown: close every fd registration with Stop,
    /// deliver Stop to every scheduled timer target (pending delayed
    /// spawns die unstarted), then wait for the pump to run dry.
    pub async fn stop(&self) {
        // One tick of grace, as a courtesy to just-spawned tasks.
        let _ = self.sleep(1).await;

        let fds: Vec<RawFd> = self.core.registered.borrow().keys().copied().collect();
        for fd in fds {
            let senders = self.core.registered.borrow_mut().remove(&fd);
            if let Some(senders) = senders {
                let _ = self.core.poller.unregister(fd);
                for tx in senders.into_values() {
                    tx.close_with(Halt::Stop);
                }
            }
        }

        let targets = self.core.timers.borrow_mut().drain();
        for target in targets {
            target.fire(FireReason::Stopped);
        }

        let _ = self.stopped().recv().await;
    }

    /// Block SIGINT and SIGTERM, route them through a signalfd
    /// registered with this hub, and `stop()` on the first one.
    pub async fn stop_on_term(&self) {
        let fd = unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGINT);
            libc::sigaddset(&mut set, libc::SIGTERM);
            libc::sigprocmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
            libc::signalfd(-1, &set, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC)
        };
        if fd < 0 {
            log::warn!("signalfd failed: {}", io::Error::last_os_error());
            return;
        }
        match self.register(fd, &[Mask::Readable]) {
            Ok(mut recvers) => {
                let _ = recvers.remove(0).recv().await;
                self.unregister(fd);
            }
            Err(err) => log::warn!("failed to register signalfd: {}", err),
        }
        unsafe {
            libc::close(fd);
        }
        self.stop().await;
    }

    // ----- the loop ---------------------------------------------------

    /// Drive the hub until `root` completes or the hub runs dry
    /// (deadlock or `stop()`), whichever comes first. Returns the
    /// root's output, or `Err(Halt::Stop)` if the hub died under it.
    ///
    /// # Panics
    ///
    /// Panics when called re-entrantly from inside a running hub.
    pub fn run<T, F>(&self, root: F) -> Result<T, Halt>
    where
        T: 'static,
        F: Future<Output = T> + 'static,
    {
        assert!(
            !self.core.running.replace(true),
            "Hub::run is not re-entrant"
        );
        self.core.root_done.set(false);
        let result: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));
        {
            let slot = result.clone();
            let hub = self.clone();
            self.spawn(async move {
                *slot.borrow_mut() = Some(root.await);
                hub.core.root_done.set(true);
            });
        }

        while result.borrow().is_none() {
            if !self.pump() {
                break;
            }
        }

        if result.borrow().is_none() {
            // Ran dry: reveal the stopped latch and let its waiters
            // (e.g. a task inside `stop()`) take their final turns.
            log::debug!("hub ran dry, latching stopped");
            let _ = self.core.stopped.0.try_send(true);
            while self.run_batch() {}
        }

        // Dropping the remaining tasks breaks hub→task→hub reference
        // cycles and removes their wait-list entries.
        self.core.tasks.borrow_mut().clear();
        self.core.running.set(false);
        let out = result.borrow_mut().take();
        out.ok_or(Halt::Stop)
    }

    /// One tick. False when there is nothing left that could ever run.
    fn pump(&self) -> bool {
        let idle = self.core.ready.is_empty()
            && self.core.timers.borrow().is_empty()
            && self.core.registered.borrow().is_empty();
        if idle {
            return false;
        }

        self.run_batch();

        // The answer `run` wants exists; don't block on I/O it will
        // never look at.
        if self.core.root_done.get() {
            return true;
        }

        // Never wait while runnable work is queued; never wait past
        // the earliest timer; otherwise let the poll block.
        let timeout = if self.core.ready.is_empty() {
            self.core.timers.borrow_mut().next_timeout(Instant::now())
        } else {
            Some(Duration::ZERO)
        };

        let events = if self.core.registered.borrow().is_empty() {
            if let Some(wait) = timeout {
                if !wait.is_zero() {
                    std::thread::sleep(wait);
                }
            }
            Vec::new()
        } else {
            match self.core.poller.poll(timeout) {
                Ok(events) => events,
                Err(err) => {
                    log::warn!("poll failed: {}", err);
                    Vec::new()
                }
            }
        };

        let now = Instant::now();
        loop {
            let target = self.core.timers.borrow_mut().pop_due(now);
            match target {
                Some(target) => target.fire(FireReason::Elapsed),
                None => break,
            }
        }

        if !events.is_empty() {
            let hub = self.clone();
            self.spawn(async move { hub.dispatch(events) });
        }

        true
    }

    /// Poll every task in the current ready snapshot once. Returns
    /// whether anything ran.
    fn run_batch(&self) -> bool {
        let batch = self.core.ready.take_batch();
        if batch.is_empty() {
            return false;
        }
        for id in batch {
            self.run_task(id);
        }
        true
    }

    fn run_task(&self, id: u64) {
        // Stale wakes against finished tasks land here and are ignored.
        let future = self.core.tasks.borrow_mut().take_future(id);
        let Some(mut future) = future else { return };

        let waker: Waker = waker_for(id, &self.core.ready);
        let mut cx = Context::from_waker(&waker);
        match catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
            Ok(Poll::Ready(())) => self.core.tasks.borrow_mut().remove(id),
            Ok(Poll::Pending) => self.core.tasks.borrow_mut().restore(id, future),
            Err(payload) => {
                self.core.tasks.borrow_mut().remove(id);
                let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                log::warn!("panic leaked back to the hub loop: {}", msg);
            }
        }
    }

    /// Route poll events to their registration senders. Runs as its
    /// own task, one tick after the poll that produced the events.
    fn dispatch(&self, events: Vec<Event>) {
        for event in events {
            match event {
                Event::Error(fd) => {
                    let senders = self.core.registered.borrow_mut().remove(&fd);
                    if let Some(senders) = senders {
                        let _ = self.core.poller.unregister(fd);
                        for tx in senders.into_values() {
                            tx.close();
                        }
                    }
                }
                Event::Ready(fd, mask) => {
                    let tx = self
                        .core
                        .registered
                        .borrow()
                        .get(&fd)
                        .and_then(|senders| senders.get(&mask))
                        .cloned();
                    if let Some(tx) = tx {
                        // Delivered iff a recv is parked; otherwise the
                        // level-triggered poll will report it again.
                        let _ = tx.try_send(true);
                    }
                }
            }
        }
    }
}

/// Sending handle returned by [`Hub::trigger`].
pub struct Trigger {
    tx: Sender<bool>,
}

impl Trigger {
    /// Fire the trigger's callback once.
    pub async fn trigger(&self) -> Result<(), Halt> {
        self.tx.send(true).await
    }

    pub fn close(&self) {
        self.tx.close();
    }
}

/// Call handle returned by [`Hub::serialize`].
pub struct Serialized<A, R> {
    hub: Hub,
    tx: Sender<(A, Sender<R>)>,
}

impl<A: 'static, R: 'static> Serialized<A, R> {
    /// Run the serialized function on `a`; concurrent callers queue up
    /// behind one another.
    pub async fn call(&self, a: A) -> Result<R, Halt> {
        let (reply_tx, reply_rx) = self.hub.pipe::<R>();
        self.tx.send((a, reply_tx)).await?;
        reply_rx.recv().await
    }
}

// ----- timer targets --------------------------------------------------

struct SpawnTarget {
    core: Weak<HubCore>,
    future: RefCell<Option<LocalFuture>>,
}

impl TimerTarget for SpawnTarget {
    fn fire(self: Box<Self>, reason: FireReason) {
        if reason == FireReason::Elapsed {
            if let (Some(core), Some(future)) = (self.core.upgrade(), self.future.take()) {
                HubCore::spawn_boxed(&core, future);
            }
        }
        // Stopped: the unstarted task dies with the timer entry.
    }
}

struct SleepState {
    done: Option<Result<(), Halt>>,
    waker: Option<Waker>,
}

struct SleepTarget {
    state: Rc<RefCell<SleepState>>,
}

impl TimerTarget for SleepTarget {
    fn fire(self: Box<Self>, reason: FireReason) {
        let mut state = self.state.borrow_mut();
        state.done = Some(match reason {
            FireReason::Elapsed => Ok(()),
            FireReason::Stopped => Err(Halt::Stop),
        });
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }
}

/// In-flight [`Hub::sleep`].
pub struct SleepFuture {
    core: Weak<HubCore>,
    delay: Option<Duration>,
    state: Rc<RefCell<SleepState>>,
}

impl Future for SleepFuture {
    type Output = Result<(), Halt>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(delay) = this.delay.take() {
            let Some(core) = this.core.upgrade() else {
                return Poll::Ready(Err(Halt::Stop));
            };
            this.state.borrow_mut().waker = Some(cx.waker().clone());
            core.add_timer(
                Instant::now() + delay,
                Box::new(SleepTarget {
                    state: this.state.clone(),
                }),
            );
            return Poll::Pending;
        }
        let mut state = this.state.borrow_mut();
        match state.done.take() {
            Some(result) => Poll::Ready(result),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// In-flight [`Hub::yield_now`].
pub struct YieldFuture {
    yielded: bool,
}

impl Future for YieldFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.yielded {
            Poll::Ready(())
        } else {
            this.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
