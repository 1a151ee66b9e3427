// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fan-out with a drop policy: a send reaches every subscriber whose
//! recver is parked right now, and is silently dropped for the rest —
//! slow subscribers never delay fast ones.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use super::{pair_from, Recver, Sender, TrySend};
use crate::hub::HubCore;
use crate::message::exchange::Exchange;

struct Inner<T> {
    core: Weak<HubCore>,
    subs: RefCell<Vec<Sender<T>>>,
    closed: Cell<bool>,
}

/// Fan-out handle. Cloneable; all clones share the subscriber set.
pub struct Broadcast<T: Clone> {
    inner: Rc<Inner<T>>,
}

impl<T: Clone> Clone for Broadcast<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static> Broadcast<T> {
    pub(crate) fn new(core: Weak<HubCore>) -> Self {
        Self {
            inner: Rc::new(Inner {
                core,
                subs: RefCell::new(Vec::new()),
                closed: Cell::new(false),
            }),
        }
    }

    /// Add a subscriber; returns the recver it will be served on.
    pub fn subscribe(&self) -> Recver<T> {
        let (tx, rx) = pair_from(self.inner.core.clone(), Exchange::new(0));
        self.inner.subs.borrow_mut().push(tx);
        rx
    }

    /// Deliver `v` to every subscriber currently parked in a recv;
    /// the rest miss it. Never blocks. Subscribers whose recver
    /// closed are dropped from the set.
    pub fn send(&self, v: T) {
        self.inner.subs.borrow_mut().retain(|tx| {
            match tx.try_send(v.clone()) {
                // Delivered, or dropped because nobody was parked.
                TrySend::Done | TrySend::Full(_) => true,
                TrySend::Halted(..) => false,
            }
        });
    }

    /// Close every subscriber's sender; their recvs observe Abandoned.
    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        for tx in self.inner.subs.borrow_mut().drain(..) {
            tx.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll, Wake, Waker};

    struct NoopWake;

    impl Wake for NoopWake {
        fn wake(self: Arc<Self>) {}
    }

    fn poll_once<F: Future + Unpin>(fut: &mut F, waker: &Waker) -> Poll<F::Output> {
        let mut cx = Context::from_waker(waker);
        Pin::new(fut).poll(&mut cx)
    }

    #[test]
    fn delivers_only_to_parked_subscribers() {
        let b: Broadcast<i32> = Broadcast::new(Weak::new());
        let waker = Waker::from(Arc::new(NoopWake));

        let r1 = b.subscribe();
        let r2 = b.subscribe();

        let mut recv1 = r1.recv();
        assert!(poll_once(&mut recv1, &waker).is_pending());
        // r2 is not parked: it misses this send.
        b.send(1);
        assert_eq!(poll_once(&mut recv1, &waker), Poll::Ready(Ok(1)));

        let mut recv2 = r2.recv();
        assert!(poll_once(&mut recv2, &waker).is_pending());
        b.send(2);
        assert_eq!(poll_once(&mut recv2, &waker), Poll::Ready(Ok(2)));
        // r1 was not parked for the second send and missed it.
        let mut recv1_again = r1.recv();
        assert!(poll_once(&mut recv1_again, &waker).is_pending());
    }

    #[test]
    fn closed_subscriber_is_pruned() {
        let b: Broadcast<i32> = Broadcast::new(Weak::new());
        let r1 = b.subscribe();
        let _r2 = b.subscribe();
        drop(r1);
        b.send(1);
        assert_eq!(b.inner.subs.borrow().len(), 1);
    }

    #[test]
    fn close_abandons_subscribers() {
        let b: Broadcast<i32> = Broadcast::new(Weak::new());
        let waker = Waker::from(Arc::new(NoopWake));
        let r = b.subscribe();
        let mut recv = r.recv();
        assert!(poll_once(&mut recv, &waker).is_pending());
        b.close();
        assert_eq!(
            poll_once(&mut recv, &waker),
            Poll::Ready(Err(crate::error::Halt::Abandoned))
        );
    }
}
