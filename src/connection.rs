//! Writer engine, reader engine, and full shutdown (spec §4.6, §4.7, §4.8)
//! layered over a [`Pool`](crate::pool::Pool) and a non-blocking socket.
//!
//! `Connection` is the single owner of everything involved in one NBD
//! session; nothing here is shared across threads (spec §5, §9:
//! "single-threaded reactor ownership"). `on_writable`/`on_readable` are
//! meant to be invoked by whatever external scheduler owns the fd's
//! readiness registration (spec §1 names this an external collaborator;
//! [`crate::reactor`] provides a reference one).

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use log::{debug, warn};

use crate::errno;
use crate::handshake::ExportInfo;
use crate::ioutil::{self, Progress};
use crate::pool::Pool;
use crate::proto::{Cmd, ReplyHeader, REPLY_HEADER_LEN};
use crate::request::UpperRequest;

/// Connection lifecycle (spec §4.9 state table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closed {
    Open,
    SendingDisc,
    Disabled,
}

/// Outcome of [`Connection::enqueue`] (spec §4.5).
pub enum EnqueueOutcome {
    /// Accepted onto `pending`.
    Accepted,
    /// Pool exhausted; the request was *not* completed, so the caller
    /// gets it back to retry or dispose of (spec §4.5: "without side
    /// effect").
    Busy(UpperRequest),
    /// The connection is disabled; the request was completed with
    /// `-ETIMEDOUT` already (spec §4.5, §7).
    Disabled,
}

impl EnqueueOutcome {
    /// The driver-facade-visible status code (spec §4.5, §6).
    pub fn code(&self) -> i32 {
        match self {
            EnqueueOutcome::Accepted => errno::SUCCESS,
            EnqueueOutcome::Busy(_) => errno::ebusy(),
            EnqueueOutcome::Disabled => errno::etimedout(),
        }
    }
}

struct ReplyAssembly {
    buf: [u8; REPLY_HEADER_LEN],
    so_far: usize,
    matched: Option<usize>,
}

impl ReplyAssembly {
    fn new() -> Self {
        Self {
            buf: [0; REPLY_HEADER_LEN],
            so_far: 0,
            matched: None,
        }
    }
}

pub struct Connection<IO> {
    io: IO,
    pool: Pool,
    closed: Closed,
    reply: ReplyAssembly,
    export: ExportInfo,
}

impl<IO: io::Read + io::Write + AsRawFd> Connection<IO> {
    pub fn new(io: IO, pool_capacity: usize, export: ExportInfo) -> Self {
        Self {
            io,
            pool: Pool::new(pool_capacity),
            closed: Closed::Open,
            reply: ReplyAssembly::new(),
            export,
        }
    }

    pub fn export(&self) -> ExportInfo {
        self.export
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.io.as_raw_fd()
    }

    /// Consume the connection and hand back the underlying transport, e.g.
    /// so `driver::close` can stash its descriptor in the fd-receiver
    /// registry instead of letting `Drop` close it (spec §4.9).
    pub fn into_io(self) -> IO {
        self.io
    }

    /// Flip the transport's blocking mode. Used by `driver::close` to
    /// switch back to blocking before synchronously flushing the final
    /// `DISC` (spec §4.9: "flip the socket back to blocking").
    pub fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        set_fd_nonblocking(self.io.as_raw_fd(), nonblocking)
    }

    pub fn is_disabled(&self) -> bool {
        self.closed == Closed::Disabled
    }

    pub fn free_count(&self) -> usize {
        self.pool.free_count()
    }

    /// Invariant (spec §8 property 3): true iff `pending` is non-empty,
    /// checked only outside the writer callback body.
    pub fn wants_write(&self) -> bool {
        !self.is_disabled() && !self.pool.pending_is_empty()
    }

    pub fn wants_read(&self) -> bool {
        !self.is_disabled()
    }

    /// Submit a request (spec §4.5).
    pub fn enqueue(&mut self, cmd: Cmd, offset: u64, upper: UpperRequest) -> EnqueueOutcome {
        if self.is_disabled() {
            upper.complete(errno::etimedout());
            return EnqueueOutcome::Disabled;
        }
        match self.pool.allocate(cmd, offset, upper, false) {
            Ok(_) => EnqueueOutcome::Accepted,
            Err(upper) => EnqueueOutcome::Busy(upper),
        }
    }

    /// Queue a `DISC` and flip the connection into the draining state
    /// (spec §4.9 `close`, state table "Open → Sending-DISC").
    pub fn enqueue_disc(&mut self) {
        if self.is_disabled() || self.closed == Closed::SendingDisc {
            return;
        }
        let upper = UpperRequest::new(Vec::new(), |_, _| {});
        if self.pool.allocate(Cmd::DISC, 0, upper, false).is_ok() {
            self.closed = Closed::SendingDisc;
        }
    }

    /// Writer engine (spec §4.6).
    pub fn on_writable(&mut self) -> io::Result<()> {
        loop {
            let idx = match self.pool.pending_front() {
                Some(idx) => idx,
                None => break,
            };

            let header_result = {
                let slot = self.pool.slot_mut(idx);
                ioutil::send_some(&mut self.io, &slot.header_buf, &mut slot.header_so_far)
            };
            let header_done = match self.disable_on_io_error(header_result) {
                Some(progress) => matches!(progress, Progress::Done),
                None => return Ok(()),
            };
            if !header_done {
                return Ok(());
            }

            let cmd = self.pool.slot(idx).cmd;
            if cmd == Cmd::WRITE {
                let body_result = {
                    let slot = self.pool.slot_mut(idx);
                    let upper = slot.upper.as_ref().expect("pending WRITE slot always holds a request");
                    ioutil::send_some(&mut self.io, &upper.buf, &mut slot.body_so_far)
                };
                let progress = match self.disable_on_io_error(body_result) {
                    Some(progress) => progress,
                    None => return Ok(()),
                };
                if !matches!(progress, Progress::Done) {
                    return Ok(());
                }
            }

            self.pool.pop_pending_front();
            if cmd == Cmd::DISC {
                self.pool.release(idx);
            } else {
                self.pool.push_sent(idx);
            }
        }

        if self.closed == Closed::SendingDisc {
            debug!(target: "nbd", "DISC fully sent, disabling connection");
            self.disable(errno::SUCCESS);
        }
        Ok(())
    }

    /// Reader engine (spec §4.7). Processes as many complete replies as
    /// are immediately available, stopping at the first partial read.
    pub fn on_readable(&mut self) -> io::Result<()> {
        loop {
            if self.reply.matched.is_none() {
                let result = ioutil::recv_some(&mut self.io, &mut self.reply.buf, &mut self.reply.so_far);
                let progress = match self.disable_on_io_error(result) {
                    Some(progress) => progress,
                    None => return Ok(()),
                };
                if !matches!(progress, Progress::Done) {
                    return Ok(());
                }

                let header = match ReplyHeader::from_bytes(&self.reply.buf) {
                    Ok(h) => h,
                    Err(e) => {
                        warn!(target: "nbd", "malformed reply header: {e}");
                        self.disable(errno::eio());
                        return Ok(());
                    }
                };

                if header.error != 0 {
                    warn!(target: "nbd", "server reported error {} on reply", header.error);
                    self.disable(errno::eio());
                    return Ok(());
                }

                let idx = match self.pool.find_in_sent(&header.handle) {
                    Some(idx) => idx,
                    None => {
                        warn!(target: "nbd", "reply for unknown handle {:?}", header.handle);
                        self.disable(errno::eio());
                        return Ok(());
                    }
                };
                self.reply.matched = Some(idx);
            }

            let idx = self.reply.matched.expect("just matched above");
            let cmd = self.pool.slot(idx).cmd;
            let mut shutdown_pending = false;

            match cmd {
                Cmd::READ => {
                    let result = {
                        let slot = self.pool.slot_mut(idx);
                        let upper = slot.upper.as_mut().expect("matched READ slot holds a request");
                        ioutil::recv_some(&mut self.io, &mut upper.buf, &mut slot.body_so_far)
                    };
                    let progress = match self.disable_on_io_error(result) {
                        Some(progress) => progress,
                        None => return Ok(()),
                    };
                    if !matches!(progress, Progress::Done) {
                        return Ok(());
                    }
                    self.complete_matched(idx, errno::SUCCESS);
                }
                Cmd::WRITE => {
                    self.complete_matched(idx, errno::SUCCESS);
                }
                other => {
                    warn!(target: "nbd", "reply for unsupported request type {other:?}");
                    shutdown_pending = true;
                }
            }

            self.pool.remove_from_sent(idx);
            self.pool.release(idx);
            self.reply.so_far = 0;
            self.reply.matched = None;

            if shutdown_pending {
                // Deferred per spec §4.7 step 5 / §9's resolved open
                // question: recycle the slot first, then shut down, so
                // the request we just retired is not double-completed.
                self.disable(errno::eio());
                return Ok(());
            }
        }
    }

    fn complete_matched(&mut self, idx: usize, code: i32) {
        if let Some(upper) = self.pool.slot_mut(idx).upper.take() {
            upper.complete(code);
        }
    }

    /// Any `send`/`recv` error other than transient would-block is fatal
    /// (spec §7): a hard error or a premature close must disable the
    /// connection and complete every outstanding request with `EIO`,
    /// never bubble past the writer/reader callback. Returns `Some` with
    /// the progress to keep going, or `None` once disabled (caller
    /// returns `Ok(())`).
    fn disable_on_io_error(&mut self, result: io::Result<Progress>) -> Option<Progress> {
        match result {
            Ok(progress) => Some(progress),
            Err(e) => {
                warn!(target: "nbd", "hard i/o error on nbd socket, disabling connection: {e}");
                self.disable(errno::eio());
                None
            }
        }
    }

    /// Full shutdown (spec §4.8): complete every outstanding request with
    /// `code`, then refuse all future traffic.
    pub fn disable(&mut self, code: i32) {
        self.pool.complete_all(code);
        self.closed = Closed::Disabled;
    }
}

fn set_fd_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if libc::fcntl(fd, libc::F_SETFL, flags) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::ExportInfo;
    use crate::proto::{ReplyHeader, REQUEST_HEADER_LEN};
    use std::cell::RefCell;
    use std::io::Read;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    fn export() -> ExportInfo {
        ExportInfo {
            size_sectors: 4096,
            sector_size: 512,
        }
    }

    fn completion() -> (Rc<RefCell<Vec<(i32, Vec<u8>)>>>, impl FnOnce(i32, Vec<u8>)) {
        let results = Rc::new(RefCell::new(Vec::new()));
        let sink = results.clone();
        (results, move |code, buf| sink.borrow_mut().push((code, buf)))
    }

    /// spec §8 scenario 3: an 8-sector read completes and the slot returns
    /// to free.
    #[test]
    fn read_round_trip_completes_and_frees_slot() {
        let (client, mut server) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        client.set_nonblocking(true).unwrap();
        let mut conn = Connection::new(client, 4, export());

        let (results, on_complete) = completion();
        let upper = UpperRequest::new(vec![0; 4096], on_complete);
        assert!(matches!(conn.enqueue(Cmd::READ, 0, upper), EnqueueOutcome::Accepted));
        assert_eq!(conn.free_count(), 3);

        conn.on_writable().unwrap();

        let mut header = [0u8; REQUEST_HEADER_LEN];
        server.read_exact(&mut header).unwrap();

        let reply = ReplyHeader {
            error: 0,
            handle: *b"td00000\0",
        };
        use std::io::Write;
        server.write_all(&reply.to_bytes()).unwrap();
        server.write_all(&[0xAB; 4096]).unwrap();

        conn.on_readable().unwrap();

        assert_eq!(conn.free_count(), 4);
        let results = results.borrow();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, errno::SUCCESS);
        assert_eq!(results[0].1, vec![0xAB; 4096]);
    }

    /// spec §8 scenario 5: the (N+1)th enqueue is rejected without side
    /// effect once the pool is exhausted.
    #[test]
    fn back_pressure_returns_ebusy_without_touching_free_list() {
        let (client, _server) = UnixStream::pair().unwrap();
        client.set_nonblocking(true).unwrap();
        let mut conn = Connection::new(client, 2, export());

        for _ in 0..2 {
            let upper = UpperRequest::new(vec![0; 512], |_, _| {});
            assert!(matches!(conn.enqueue(Cmd::READ, 0, upper), EnqueueOutcome::Accepted));
        }
        assert_eq!(conn.free_count(), 0);

        let upper = UpperRequest::new(vec![0; 512], |_, _| {});
        match conn.enqueue(Cmd::READ, 0, upper) {
            EnqueueOutcome::Busy(_) => {}
            _ => panic!("expected Busy"),
        }
        assert_eq!(conn.free_count(), 0);
    }

    /// spec §8 scenario 6: a reply with `error != 0` disables the
    /// connection and completes every outstanding request with `EIO`;
    /// subsequent enqueues fail fast with `-ETIMEDOUT`.
    #[test]
    fn fatal_reply_error_disables_and_completes_everyone() {
        let (client, mut server) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        client.set_nonblocking(true).unwrap();
        let mut conn = Connection::new(client, 4, export());

        let (results_a, cb_a) = completion();
        let (results_b, cb_b) = completion();
        let (results_c, cb_c) = completion();

        conn.enqueue(Cmd::READ, 0, UpperRequest::new(vec![0; 512], cb_a));
        conn.enqueue(Cmd::READ, 512, UpperRequest::new(vec![0; 512], cb_b));
        conn.on_writable().unwrap();
        // Third request stays on `pending` (never sent before shutdown).
        conn.enqueue(Cmd::READ, 1024, UpperRequest::new(vec![0; 512], cb_c));

        use std::io::Write;
        let mut header = [0u8; REQUEST_HEADER_LEN];
        server.read_exact(&mut header).unwrap();
        server.read_exact(&mut header).unwrap();
        let reply = ReplyHeader {
            error: 1,
            handle: *b"td00000\0",
        };
        server.write_all(&reply.to_bytes()).unwrap();

        conn.on_readable().unwrap();

        assert!(conn.is_disabled());
        for results in [&results_a, &results_b, &results_c] {
            assert_eq!(results.borrow().len(), 1);
            assert_eq!(results.borrow()[0].0, errno::eio());
        }

        let (results_d, cb_d) = completion();
        match conn.enqueue(Cmd::READ, 0, UpperRequest::new(vec![0; 512], cb_d)) {
            EnqueueOutcome::Disabled => {}
            _ => panic!("expected Disabled"),
        }
        assert_eq!(results_d.borrow()[0].0, errno::etimedout());
    }

    /// spec §7: a hard transport error — here, the peer closing mid-body —
    /// must disable the connection and complete every outstanding request
    /// with `EIO`, exactly like the reply-error path above, instead of
    /// bubbling the `io::Error` out of `on_readable`.
    #[test]
    fn premature_close_mid_body_disables_and_completes_everyone() {
        let (client, mut server) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        client.set_nonblocking(true).unwrap();
        let mut conn = Connection::new(client, 4, export());

        let (results_a, cb_a) = completion();
        let (results_b, cb_b) = completion();

        conn.enqueue(Cmd::READ, 0, UpperRequest::new(vec![0; 4096], cb_a));
        conn.enqueue(Cmd::READ, 4096, UpperRequest::new(vec![0; 512], cb_b));
        conn.on_writable().unwrap();

        let mut header = [0u8; REQUEST_HEADER_LEN];
        server.read_exact(&mut header).unwrap();
        server.read_exact(&mut header).unwrap();

        let reply = ReplyHeader {
            error: 0,
            handle: *b"td00000\0",
        };
        use std::io::Write;
        server.write_all(&reply.to_bytes()).unwrap();
        // Half the promised body, then the peer goes away.
        server.write_all(&[0x7au8; 2048]).unwrap();
        drop(server);

        // First call drains the header and whatever body bytes were
        // already buffered; still partial, so no disable yet.
        conn.on_readable().unwrap();
        assert!(!conn.is_disabled());

        // Second call finds the peer gone while still wanting body
        // bytes: a hard error, not a clean `Progress::Done`.
        conn.on_readable().unwrap();

        assert!(conn.is_disabled());
        for results in [&results_a, &results_b] {
            assert_eq!(results.borrow().len(), 1);
            assert_eq!(results.borrow()[0].0, errno::eio());
        }
    }
}
