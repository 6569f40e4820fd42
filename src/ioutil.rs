//! Partial, non-blocking `send`/`recv` helper (spec §4.2).
//!
//! Mirrors `tdnbd_write_some`/`tdnbd_read_some` in the original tapdisk
//! driver, but follows the spec's text rather than the original's loop:
//! each call attempts **one** non-blocking transfer and reports how much
//! is left, so a single readiness event never turns into an unbounded
//! busy loop inside the callback (the reactor will simply invoke us again
//! next time the fd is ready). `EINTR` is retried transparently since it
//! isn't really progress or backpressure, just a signal interruption.

use std::io::{self, Read, Write};

/// Progress of a single partial-I/O attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The whole buffer (from `so_far` to `len`) has been transferred.
    Done,
    /// Transient: this many bytes are still left to transfer.
    Remaining(usize),
}

fn premature_close() -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "server closed connection prematurely",
    )
}

/// Advance `so_far` by writing as much of `buf[*so_far..]` as a single
/// non-blocking `write` will take.
pub fn send_some<W: Write>(w: &mut W, buf: &[u8], so_far: &mut usize) -> io::Result<Progress> {
    debug_assert!(*so_far <= buf.len());
    loop {
        if *so_far == buf.len() {
            return Ok(Progress::Done);
        }
        match w.write(&buf[*so_far..]) {
            Ok(0) => return Err(premature_close()),
            Ok(n) => {
                *so_far += n;
                return Ok(if *so_far == buf.len() {
                    Progress::Done
                } else {
                    Progress::Remaining(buf.len() - *so_far)
                });
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(Progress::Remaining(buf.len() - *so_far))
            }
            Err(e) => return Err(e),
        }
    }
}

/// Advance `so_far` by reading as much of `buf[*so_far..]` as a single
/// non-blocking `read` will yield.
pub fn recv_some<R: Read>(r: &mut R, buf: &mut [u8], so_far: &mut usize) -> io::Result<Progress> {
    debug_assert!(*so_far <= buf.len());
    loop {
        if *so_far == buf.len() {
            return Ok(Progress::Done);
        }
        match r.read(&mut buf[*so_far..]) {
            Ok(0) => return Err(premature_close()),
            Ok(n) => {
                *so_far += n;
                return Ok(if *so_far == buf.len() {
                    Progress::Done
                } else {
                    Progress::Remaining(buf.len() - *so_far)
                });
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(Progress::Remaining(buf.len() - *so_far))
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// An in-memory stream that can be told to block after N bytes, to
    /// exercise the partial/boundary paths without a real socket.
    struct Chunked {
        data: VecDeque<u8>,
        allow: usize,
    }

    impl Read for Chunked {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.allow == 0 {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "would block"));
            }
            let n = buf.len().min(self.allow).min(self.data.len());
            if n == 0 && !buf.is_empty() && self.data.is_empty() {
                return Ok(0);
            }
            for slot in buf.iter_mut().take(n) {
                *slot = self.data.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    #[test]
    fn recv_some_reports_remaining_then_done() {
        let mut src = Chunked {
            data: VecDeque::from(vec![1, 2, 3, 4]),
            allow: 2,
        };
        let mut buf = [0u8; 4];
        let mut so_far = 0;
        assert_eq!(
            recv_some(&mut src, &mut buf, &mut so_far).unwrap(),
            Progress::Remaining(2)
        );
        assert_eq!(so_far, 2);
        src.allow = 2;
        assert_eq!(recv_some(&mut src, &mut buf, &mut so_far).unwrap(), Progress::Done);
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn recv_some_would_block_keeps_cursor() {
        let mut src = Chunked {
            data: VecDeque::from(vec![9, 9]),
            allow: 0,
        };
        let mut buf = [0u8; 2];
        let mut so_far = 0;
        assert_eq!(
            recv_some(&mut src, &mut buf, &mut so_far).unwrap(),
            Progress::Remaining(2)
        );
        assert_eq!(so_far, 0);
    }

    #[test]
    fn recv_some_zero_byte_read_is_hard_error() {
        let mut src = Chunked {
            data: VecDeque::new(),
            allow: 10,
        };
        let mut buf = [0u8; 4];
        let mut so_far = 0;
        let err = recv_some(&mut src, &mut buf, &mut so_far).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn send_some_drains_a_vec_sink() {
        let mut sink = Vec::new();
        let data = [1u8, 2, 3];
        let mut so_far = 0;
        assert_eq!(
            send_some(&mut sink, &data, &mut so_far).unwrap(),
            Progress::Done
        );
        assert_eq!(sink, vec![1, 2, 3]);
    }
}
