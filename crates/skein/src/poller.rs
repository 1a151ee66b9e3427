// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! epoll binding: the readiness multiplexer behind `Hub::register`.
//!
//! Level-triggered. Readiness and error conditions come back as
//! separate events; EINTR during the wait is retried transparently so
//! callers never see it.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Readiness interest for one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mask {
    Readable,
    Writable,
}

impl Mask {
    fn to_epoll_events(self) -> u32 {
        match self {
            Mask::Readable => libc::EPOLLIN as u32,
            Mask::Writable => libc::EPOLLOUT as u32,
        }
    }
}

/// One readiness notification out of [`Poller::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    /// The fd is ready for the given mask.
    Ready(RawFd, Mask),
    /// EPOLLERR or EPOLLHUP: the fd is dead for our purposes.
    Error(RawFd),
}

/// Thin epoll wrapper. One instance per hub; fds must not be shared
/// between hubs.
pub(crate) struct Poller {
    epoll_fd: RawFd,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epoll_fd })
    }

    fn combined(masks: &[Mask]) -> u32 {
        masks
            .iter()
            .fold(0u32, |acc, mask| acc | mask.to_epoll_events())
    }

    /// Start watching `fd` for the union of `masks`.
    pub fn register(&self, fd: RawFd, masks: &[Mask]) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, masks)
    }

    /// Change the interest set of an already-watched `fd`.
    pub fn modify(&self, fd: RawFd, masks: &[Mask]) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, masks)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, masks: &[Mask]) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: Self::combined(masks),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Stop watching `fd`. ENOENT / EBADF are tolerated: the fd may
    /// already be closed by its owner.
    pub fn unregister(&self, fd: RawFd) -> io::Result<()> {
        let ret =
            unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT)
                && err.raw_os_error() != Some(libc::EBADF)
            {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Wait up to `timeout` for events; `None` blocks indefinitely.
    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<Vec<Event>> {
        const MAX_EVENTS: usize = 64;
        let mut events: [libc::epoll_event; MAX_EVENTS] =
            [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        // Round up so a 0.4ms timeout doesn't become a busy loop.
        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(d) => d
                .as_millis()
                .max(if d.is_zero() { 0 } else { 1 })
                .min(libc::c_int::MAX as u128) as libc::c_int,
        };

        let n = loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    events.as_mut_ptr(),
                    MAX_EVENTS as libc::c_int,
                    timeout_ms,
                )
            };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
            // EINTR: retry.
        };

        let mut out = Vec::with_capacity(n);
        for ev in &events[..n] {
            let fd = ev.u64 as RawFd;
            let bits = ev.events;
            if bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                out.push(Event::Error(fd));
                continue;
            }
            if bits & libc::EPOLLIN as u32 != 0 {
                out.push(Event::Ready(fd, Mask::Readable));
            }
            if bits & libc::EPOLLOUT as u32 != 0 {
                out.push(Event::Ready(fd, Mask::Writable));
            }
        }
        Ok(out)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os_pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn readable_after_write() {
        let poller = Poller::new().unwrap();
        let (read_fd, write_fd) = os_pipe();
        poller.register(read_fd, &[Mask::Readable]).unwrap();

        assert!(poller.poll(Some(Duration::ZERO)).unwrap().is_empty());

        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
        }
        let events = poller.poll(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(events, vec![Event::Ready(read_fd, Mask::Readable)]);

        poller.unregister(read_fd).unwrap();
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn hangup_reports_error_event() {
        let poller = Poller::new().unwrap();
        let (read_fd, write_fd) = os_pipe();
        poller.register(read_fd, &[Mask::Readable]).unwrap();

        unsafe {
            libc::close(write_fd);
        }
        let events = poller.poll(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(events, vec![Event::Error(read_fd)]);

        poller.unregister(read_fd).unwrap();
        unsafe {
            libc::close(read_fd);
        }
    }

    #[test]
    fn modify_changes_interest() {
        let poller = Poller::new().unwrap();
        let (read_fd, write_fd) = os_pipe();
        poller.register(read_fd, &[Mask::Readable]).unwrap();
        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
        }

        // A pipe read end is never writable, so switching the interest
        // away from readable silences the pending data.
        poller.modify(read_fd, &[Mask::Writable]).unwrap();
        assert!(poller.poll(Some(Duration::from_millis(10))).unwrap().is_empty());

        poller.modify(read_fd, &[Mask::Readable]).unwrap();
        let events = poller.poll(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(events, vec![Event::Ready(read_fd, Mask::Readable)]);

        poller.unregister(read_fd).unwrap();
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn unregister_closed_fd_is_tolerated() {
        let poller = Poller::new().unwrap();
        let (read_fd, write_fd) = os_pipe();
        poller.register(read_fd, &[Mask::Readable]).unwrap();
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
        poller.unregister(read_fd).unwrap();
    }
}
