// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! skein: a single-threaded cooperative concurrency runtime.
//!
//! A [`Hub`] pumps lightweight tasks (stackless futures), a timer heap
//! and an epoll binding from one loop. Message primitives — pipe,
//! dealer, router, queue, channel, broadcast, state — are all pairs of
//! [`Sender`]/[`Recver`] endpoints over a common rendezvous, and every
//! suspending operation reports failure as a [`Halt`].
//!
//! The hub is explicit: primitives are built from a hub handle and
//! bound to it, and independent hubs cannot affect each other.
//!
//! ```ignore
//! let hub = Hub::new();
//! let (tx, rx) = hub.pipe::<i32>();
//! let out = hub.run({
//!     let hub = hub.clone();
//!     async move {
//!         hub.spawn(async move { tx.send(1).await.unwrap() });
//!         rx.recv().await.unwrap()
//!     }
//! });
//! assert_eq!(out.unwrap(), 1);
//! ```
//!
//! Components:
//! - `hub`     — scheduler loop, timers, fd registration, spawners
//! - `message` — endpoint pairs and their middles
//! - `poller`  — epoll readiness binding
//! - `error`   — the Halt taxonomy
//! - `task`    — task table, ready deque, wakers
//! - `timer`   — lazy-deletion timer heap

pub mod error;
pub mod hub;
pub mod message;
pub mod poller;
mod task;
mod timer;

pub use error::Halt;
pub use hub::{Hub, Serialized, SleepFuture, Trigger, YieldFuture};
pub use message::{Broadcast, Pair, Recver, RecvFuture, SendFuture, Sender};
pub use poller::Mask;
