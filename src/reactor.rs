//! The scheduler/reactor boundary (spec §1: "out of scope... the daemon's
//! top-level scheduler/reactor"). The real tapdisk-style daemon owns one
//! reactor shared by every driver it runs; this crate only needs to
//! register/unregister readiness interest on a connection's fd and be
//! told when it fires. [`Reactor`] is that boundary; [`PollReactor`] is a
//! small reference implementation (poll(2)-based, matching the bounded
//! wait `handshake` already uses) so this crate builds, runs, and is
//! testable standalone — not a production event loop.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// What a driver's connection wants the reactor to watch for on its fd.
pub trait Reactor {
    fn register_readable(&mut self, fd: RawFd);
    fn unregister_readable(&mut self, fd: RawFd);
    fn register_writable(&mut self, fd: RawFd);
    fn unregister_writable(&mut self, fd: RawFd);
}

/// One fd becoming ready, returned by [`PollReactor::wait`].
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct Interest {
    read: bool,
    write: bool,
}

/// A minimal single-threaded `poll(2)` reactor: exactly the "process-wide
/// reactor invokes registered callbacks when FDs become readable/writable"
/// model from spec §5, with callback dispatch left to the caller's loop
/// (see `src/bin/nbd-harness.rs`) rather than stored as closures here.
pub struct PollReactor {
    interest: HashMap<RawFd, Interest>,
}

impl Default for PollReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl PollReactor {
    pub fn new() -> Self {
        Self {
            interest: HashMap::new(),
        }
    }

    /// Block up to `timeout` (or indefinitely if `None`) for any
    /// registered fd to become ready, then return which ones were and
    /// how. A signal interruption returns an empty event list rather than
    /// an error, matching the `EINTR`-is-retried convention used
    /// elsewhere in this crate (spec §4.2, §4.4).
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<Vec<Event>> {
        let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(self.interest.len());
        for (&fd, interest) in self.interest.iter() {
            if !interest.read && !interest.write {
                continue;
            }
            let mut events = 0;
            if interest.read {
                events |= libc::POLLIN;
            }
            if interest.write {
                events |= libc::POLLOUT;
            }
            pollfds.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            });
        }
        if pollfds.is_empty() {
            return Ok(Vec::new());
        }

        let timeout_ms = timeout
            .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);
        let n = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        Ok(pollfds
            .into_iter()
            .filter(|pfd| pfd.revents != 0)
            .map(|pfd| Event {
                fd: pfd.fd,
                readable: pfd.revents & libc::POLLIN != 0,
                writable: pfd.revents & libc::POLLOUT != 0,
            })
            .collect())
    }
}

impl Reactor for PollReactor {
    fn register_readable(&mut self, fd: RawFd) {
        self.interest.entry(fd).or_default().read = true;
    }

    fn unregister_readable(&mut self, fd: RawFd) {
        if let Some(interest) = self.interest.get_mut(&fd) {
            interest.read = false;
        }
    }

    fn register_writable(&mut self, fd: RawFd) {
        self.interest.entry(fd).or_default().write = true;
    }

    fn unregister_writable(&mut self, fd: RawFd) {
        if let Some(interest) = self.interest.get_mut(&fd) {
            interest.write = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn wait_reports_readable_fd() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut reactor = PollReactor::new();
        reactor.register_readable(a.as_raw_fd());

        b.write_all(b"hi").unwrap();
        let events = reactor.wait(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, a.as_raw_fd());
        assert!(events[0].readable);
    }

    #[test]
    fn unregistering_stops_reporting() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut reactor = PollReactor::new();
        reactor.register_readable(a.as_raw_fd());
        reactor.unregister_readable(a.as_raw_fd());

        b.write_all(b"hi").unwrap();
        let events = reactor.wait(Some(Duration::from_millis(50))).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn wait_times_out_with_no_interest() {
        let reactor = PollReactor::new();
        let events = reactor.wait(Some(Duration::from_millis(10))).unwrap();
        assert!(events.is_empty());
    }
}
