// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The rendezvous core shared by pipe, dealer, router, queue and
//! channel.
//!
//! One structure covers all five: FIFO wait-lists of parked senders and
//! recvers plus an optional bounded buffer. Capacity 0 is the pure
//! rendezvous (pipe/dealer/router); capacity n is the buffered queue.
//! Which ends get cloned decides the fan shape — the core itself does
//! not care.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use super::{Middle, RecvWaiter, SendWaiter, TryRecv, TrySend};
use crate::error::Halt;

struct Inner<T> {
    cap: usize,
    buf: VecDeque<T>,
    senders: VecDeque<Rc<RefCell<SendWaiter<T>>>>,
    recvers: VecDeque<Rc<RefCell<RecvWaiter<T>>>>,
    /// Set when the send half closes; the reason future recvs observe
    /// once the buffer is drained.
    send_closed: Option<Halt>,
    recv_closed: bool,
}

impl<T> Inner<T> {
    /// Hand a value to the first parked recver still waiting for one.
    /// Recvers completed by a deadline linger in the queue until their
    /// future unparks them; those are skipped, not delivered to.
    fn deliver(&mut self, v: T) -> Result<(), T> {
        while let Some(waiter) = self.recvers.pop_front() {
            let mut w = waiter.borrow_mut();
            if w.slot.is_some() {
                continue;
            }
            w.complete(Ok(v));
            return Ok(());
        }
        // Nobody live; put the value back in the caller's hands.
        Err(v)
    }

    /// Move a parked sender's value into the buffer after a pop freed
    /// a slot, keeping send-order FIFO.
    fn refill(&mut self) {
        while let Some(waiter) = self.senders.pop_front() {
            let mut w = waiter.borrow_mut();
            if w.result.is_some() {
                continue;
            }
            let v = w.value.take().expect("parked sender without value");
            w.complete(Ok(()));
            self.buf.push_back(v);
            return;
        }
    }
}

pub(crate) struct Exchange<T> {
    inner: RefCell<Inner<T>>,
}

impl<T> Exchange<T> {
    pub fn new(cap: usize) -> Rc<Self> {
        Rc::new(Self {
            inner: RefCell::new(Inner {
                cap,
                buf: VecDeque::new(),
                senders: VecDeque::new(),
                recvers: VecDeque::new(),
                send_closed: None,
                recv_closed: false,
            }),
        })
    }
}

impl<T> Middle<T> for Exchange<T> {
    fn try_send(&self, v: T) -> TrySend<T> {
        let mut x = self.inner.borrow_mut();
        if x.send_closed.is_some() {
            return TrySend::Halted(Halt::Closed, v);
        }
        if x.recv_closed {
            return TrySend::Halted(Halt::Abandoned, v);
        }
        // Direct handoff only when no buffered values precede this one.
        let v = if x.buf.is_empty() {
            match x.deliver(v) {
                Ok(()) => return TrySend::Done,
                Err(v) => v,
            }
        } else {
            v
        };
        if x.buf.len() < x.cap {
            x.buf.push_back(v);
            return TrySend::Done;
        }
        TrySend::Full(v)
    }

    fn park_sender(&self, waiter: Rc<RefCell<SendWaiter<T>>>) {
        self.inner.borrow_mut().senders.push_back(waiter);
    }

    fn unpark_sender(&self, waiter: &Rc<RefCell<SendWaiter<T>>>) {
        self.inner
            .borrow_mut()
            .senders
            .retain(|w| !Rc::ptr_eq(w, waiter));
    }

    fn try_recv(&self) -> TryRecv<T> {
        let mut x = self.inner.borrow_mut();
        if x.recv_closed {
            return TryRecv::Halted(Halt::Closed);
        }
        if let Some(v) = x.buf.pop_front() {
            x.refill();
            return TryRecv::Value(v);
        }
        while let Some(waiter) = x.senders.pop_front() {
            let mut w = waiter.borrow_mut();
            if w.result.is_some() {
                continue;
            }
            let v = w.value.take().expect("parked sender without value");
            w.complete(Ok(()));
            return TryRecv::Value(v);
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
        // Parked recvers can only exist with an empty buffer, so
        // nothing is skipped by failing them now.
        for waiter in x.recvers.drain(..).collect::<Vec<_>>() {
            let mut w = waiter.borrow_mut();
            if w.slot.is_none() {
                w.complete(Err(reason));
            }
        }
        for waiter in x.senders.drain(..).collect::<Vec<_>>() {
            let mut w = waiter.borrow_mut();
            if w.result.is_none() {
                w.complete(Err(Halt::Closed));
            }
        }
    }

    fn close_recv_half(&self) {
        let mut x = self.inner.borrow_mut();
        if x.recv_closed {
            return;
        }
        x.recv_closed = true;
        x.buf.clear();
        for waiter in x.senders.drain(..).collect::<Vec<_>>() {
            let mut w = waiter.borrow_mut();
            if w.result.is_none() {
                w.complete(Err(Halt::Abandoned));
            }
        }
        for waiter in x.recvers.drain(..).collect::<Vec<_>>() {
            let mut w = waiter.borrow_mut();
            if w.slot.is_none() {
                w.complete(Err(Halt::Closed));
            }
        }
    }

    fn sender_ready(&self) -> bool {
        let x = self.inner.borrow();
        x.buf.is_empty()
            && x.recvers
                .iter()
                .any(|w| w.borrow().slot.is_none())
    }
}
