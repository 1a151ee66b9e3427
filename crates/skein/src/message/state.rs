// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Latched cell: at most one current value, writers never block.
//!
//! `send` stores the value and releases every parked recver with a
//! clone; the value persists, so later recvs return immediately. The
//! hub's own stopped latch is one of these.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use super::{Middle, RecvWaiter, SendWaiter, TryRecv, TrySend};
use crate::error::Halt;

struct Inner<T> {
    value: Option<T>,
    recvers: VecDeque<Rc<RefCell<RecvWaiter<T>>>>,
    send_closed: Option<Halt>,
    recv_closed: bool,
}

pub(crate) struct Latch<T: Clone> {
    inner: RefCell<Inner<T>>,
}

impl<T: Clone> Latch<T> {
    pub fn new(initial: Option<T>) -> Rc<Self> {
        Rc::new(Self {
            inner: RefCell::new(Inner {
                value: initial,
                recvers: VecDeque::new(),
                send_closed: None,
                recv_closed: false,
            }),
        })
    }
}

impl<T: Clone> Middle<T> for Latch<T> {
    fn try_send(&self, v: T) -> TrySend<T> {
        let mut x = self.inner.borrow_mut();
        if x.send_closed.is_some() {
            return TrySend::Halted(Halt::Closed, v);
        }
        if x.recv_closed {
            return TrySend::Halted(Halt::Abandoned, v);
        }
        for waiter in x.recvers.drain(..).collect::<Vec<_>>() {
            let mut w = waiter.borrow_mut();
            if w.slot.is_none() {
                w.complete(Ok(v.clone()));
            }
        }
        x.value = Some(v);
        TrySend::Done
    }

    fn park_sender(&self, _waiter: Rc<RefCell<SendWaiter<T>>>) {
        unreachable!("latch sends never park");
    }

    fn unpark_sender(&self, _waiter: &Rc<RefCell<SendWaiter<T>>>) {}

    fn try_recv(&self) -> TryRecv<T> {
        let x = self.inner.borrow();
        if x.recv_closed {
            return TryRecv::Halted(Halt::Closed);
        }
        if let Some(v) = &x.value {
            return TryRecv::Value(v.clone());
        }
        if let Some(reason) = x.send_closed {
            return TryRecv::Halted(reason);
        }
        TryRecv::Empty
    }

    fn park_recver(&self, waiter: Rc<RefCell<RecvWaiter<T>>>) {
        self.inner.borrow_mut().recvers.push_back(waiter);
    }

    fn unpark_recver(&self, waiter: &Rc<RefCell<RecvWaiter<T>>>) {
        self.inner
            .borrow_mut()
            .recvers
            .retain(|w| !Rc::ptr_eq(w, waiter));
    }

    fn close_send_half(&self, reason: Halt) {
        let mut x = self.inner.borrow_mut();
        if x.send_closed.is_some() {
            return;
        }
        x.send_closed = Some(reason);
        // Recvers only park while the value is unset; once set they
        // complete immediately, so draining here skips nothing.
        if x.value.is_none() {
            for waiter in x.recvers.drain(..).collect::<Vec<_>>() {
                let mut w = waiter.borrow_mut();
                if w.slot.is_none() {
                    w.complete(Err(reason));
                }
            }
        }
    }

    fn close_recv_half(&self) {
        let mut x = self.inner.borrow_mut();
        if x.recv_closed {
            return;
        }
        x.recv_closed = true;
        for waiter in x.recvers.drain(..).collect::<Vec<_>>() {
            let mut w = waiter.borrow_mut();
            if w.slot.is_none() {
                w.complete(Err(Halt::Closed));
            }
        }
    }

    fn sender_ready(&self) -> bool {
        self.inner
            .borrow()
            .recvers
            .iter()
            .any(|w| w.borrow().slot.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{pair_from, Pair};
    use std::future::Future;
    use std::pin::Pin;
    use std::rc::Weak;
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

    fn latch_pair(initial: Option<i32>) -> Pair<i32> {
        pair_from(Weak::new(), Latch::new(initial))
    }

    #[test]
    fn recv_blocks_until_first_send() {
        let (tx, rx) = latch_pair(None);
        let waker = Waker::from(Arc::new(NoopWake));

        let mut recv = rx.recv();
        assert!(poll_once(&mut recv, &waker).is_pending());

        assert_eq!(poll_once(&mut tx.send(3), &waker), Poll::Ready(Ok(())));
        assert_eq!(poll_once(&mut recv, &waker), Poll::Ready(Ok(3)));
    }

    #[test]
    fn value_persists_for_later_recvs() {
        let (tx, rx) = latch_pair(None);
        let waker = Waker::from(Arc::new(NoopWake));
        assert_eq!(poll_once(&mut tx.send(3), &waker), Poll::Ready(Ok(())));
        assert_eq!(poll_once(&mut rx.recv(), &waker), Poll::Ready(Ok(3)));
        assert_eq!(poll_once(&mut rx.recv(), &waker), Poll::Ready(Ok(3)));
    }

    #[test]
    fn send_overwrites() {
        let (tx, rx) = latch_pair(Some(1));
        let waker = Waker::from(Arc::new(NoopWake));
        assert_eq!(poll_once(&mut rx.recv(), &waker), Poll::Ready(Ok(1)));
        assert_eq!(poll_once(&mut tx.send(2), &waker), Poll::Ready(Ok(())));
        assert_eq!(poll_once(&mut rx.recv(), &waker), Poll::Ready(Ok(2)));
    }

    #[test]
    fn send_never_blocks_without_recvers() {
        let (tx, _rx) = latch_pair(None);
        let waker = Waker::from(Arc::new(NoopWake));
        for i in 0..10 {
            assert_eq!(poll_once(&mut tx.send(i), &waker), Poll::Ready(Ok(())));
        }
    }

    #[test]
    fn wakes_every_parked_recver() {
        let (tx, rx) = latch_pair(None);
        let waker = Waker::from(Arc::new(NoopWake));
        let mut r1 = rx.recv();
        let mut r2 = rx.recv();
        assert!(poll_once(&mut r1, &waker).is_pending());
        assert!(poll_once(&mut r2, &waker).is_pending());
        assert_eq!(poll_once(&mut tx.send(9), &waker), Poll::Ready(Ok(())));
        assert_eq!(poll_once(&mut r1, &waker), Poll::Ready(Ok(9)));
        assert_eq!(poll_once(&mut r2, &waker), Poll::Ready(Ok(9)));
    }

    #[test]
    fn close_before_value_abandons_recvers() {
        let (tx, rx) = latch_pair(None);
        let waker = Waker::from(Arc::new(NoopWake));
        let mut recv = rx.recv();
        assert!(poll_once(&mut recv, &waker).is_pending());
        tx.close();
        assert_eq!(
            poll_once(&mut recv, &waker),
            Poll::Ready(Err(Halt::Abandoned))
        );
    }

    #[test]
    fn close_after_value_still_reveals_it() {
        let (tx, rx) = latch_pair(None);
        let waker = Waker::from(Arc::new(NoopWake));
        assert_eq!(poll_once(&mut tx.send(4), &waker), Poll::Ready(Ok(())));
        tx.close();
        assert_eq!(poll_once(&mut rx.recv(), &waker), Poll::Ready(Ok(4)));
    }
}
