//! The driver facade (spec §4.9): `open`/`close`/`queue_read`/`queue_write`/
//! `get_parent_id`/`validate_parent`, the contract the surrounding disk
//! stack consumes. Everything upstream of this module (`proto`, `ioutil`,
//! `handshake`, `pool`, `connection`) is plumbing; this is where a name
//! string becomes a live, non-blocking NBD session.

use std::fs;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream;

use bitflags::bitflags;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use log::{info, warn};

use crate::connection::{Connection, EnqueueOutcome};
use crate::errno;
use crate::fdreceiver;
use crate::handshake;
use crate::proto::Cmd;
use crate::request::UpperRequest;

/// Default export name sent with `NBD_OPT_EXPORT_NAME` (spec §4.4 step 2,
/// §6): this driver only ever speaks to a server's single default export.
pub const DEFAULT_EXPORT_NAME: &str = "";

/// Bound on in-flight requests per connection (spec §9: "N is bounded
/// (default ≤ 32)"), matching the original's `TAPDISK_DATA_REQUESTS`.
pub const DEFAULT_POOL_CAPACITY: usize = 32;

bitflags! {
    /// Open-time flags (spec §4.9, §3 "open flags").
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Read requests are forwarded up the stack instead of enqueued
        /// over NBD; writes are still enqueued (spec §4.9, §2 item 8).
        const TD_OPEN_SECONDARY = 1 << 0;
        /// Open the export read-only. Not enforced at the wire level by
        /// this driver (no `WRITE` is ever refused locally); kept so
        /// callers can record intent the way the original flag does.
        const TD_OPEN_RDONLY = 1 << 1;
    }
}

/// One of TCP, UNIX-domain, or a descriptor retrieved from the fd-receiver
/// registry (spec §6 name grammar). All three expose `Read + Write +
/// AsRawFd`, which is all `Connection` needs.
enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read(buf),
            Transport::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.write(buf),
            Transport::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.flush(),
            Transport::Unix(s) => s.flush(),
        }
    }
}

impl AsRawFd for Transport {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Transport::Tcp(s) => s.as_raw_fd(),
            Transport::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl IntoRawFd for Transport {
    fn into_raw_fd(self) -> RawFd {
        match self {
            Transport::Tcp(s) => s.into_raw_fd(),
            Transport::Unix(s) => s.into_raw_fd(),
        }
    }
}

/// How `open`'s `name` argument was classified (spec §6 name grammar).
enum Target {
    UnixSocket(String),
    Tcp(SocketAddrV4),
    FdReceiver(String),
}

/// Parse the `<unix-socket-path> | <ipv4>:<port> | <fd-receiver-id>`
/// grammar (spec §4.9, §6). A path that exists and is a socket wins first;
/// otherwise an `ip:port` shape; otherwise it's an fd-receiver id.
fn classify(name: &str) -> Target {
    if let Ok(meta) = fs::metadata(name) {
        if meta.file_type().is_socket() {
            return Target::UnixSocket(name.to_string());
        }
    }
    if let Some((host, port)) = name.rsplit_once(':') {
        if let (Ok(addr), Ok(port)) = (host.parse::<Ipv4Addr>(), port.parse::<u16>()) {
            return Target::Tcp(SocketAddrV4::new(addr, port));
        }
    }
    Target::FdReceiver(name.to_string())
}

/// The client driver's live state for one export (spec §3 "Connection
/// state"). Owns exactly one [`Connection`]; nothing here is `Clone` or
/// shared across threads (spec §5, §9).
pub struct NbdDriver {
    conn: Option<Connection<Transport>>,
    flags: OpenFlags,
    /// Set when `open` retrieved its fd from the registry, so `close` can
    /// stash it back under the same id (spec §4.9, §9).
    registry_id: Option<String>,
    /// Export info populated by `open`, read by the block layer (spec §6:
    /// "populates sector size and export size in sectors").
    pub sector_size: u64,
    pub size_sectors: u64,
}

impl Default for NbdDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl NbdDriver {
    pub fn new() -> Self {
        Self {
            conn: None,
            flags: OpenFlags::empty(),
            registry_id: None,
            sector_size: 0,
            size_sectors: 0,
        }
    }

    /// spec §4.9 `open`: returns `0` on success, `-1` on failure.
    pub fn open(&mut self, name: &str, flags: OpenFlags) -> i32 {
        match self.open_inner(name, flags) {
            Ok(()) => 0,
            Err(e) => {
                warn!(target: "nbd", "open({name:?}) failed: {e:#}");
                -1
            }
        }
    }

    fn open_inner(&mut self, name: &str, flags: OpenFlags) -> Result<()> {
        info!(target: "nbd", "opening nbd export {name:?} (flags={flags:?})");

        let (mut transport, registry_id) = match classify(name) {
            Target::UnixSocket(path) => {
                let sock = UnixStream::connect(&path)
                    .wrap_err_with(|| format!("connecting to unix socket {path:?}"))?;
                (Transport::Unix(sock), None)
            }
            Target::Tcp(addr) => {
                let sock = TcpStream::connect(addr)
                    .wrap_err_with(|| format!("connecting to {addr}"))?;
                sock.set_nodelay(true).wrap_err("setting TCP_NODELAY")?;
                (Transport::Tcp(sock), None)
            }
            Target::FdReceiver(id) => {
                let fd = fdreceiver::retrieve(&id)
                    .wrap_err_with(|| format!("retrieving passed fd {id:?}"))?;
                let sock = unsafe { UnixStream::from_raw_fd(fd) };
                (Transport::Unix(sock), Some(id))
            }
        };

        let export = handshake::negotiate(&mut transport, DEFAULT_EXPORT_NAME)
            .wrap_err("nbd handshake failed")?;

        self.sector_size = export.sector_size;
        self.size_sectors = export.size_sectors;
        self.flags = flags;
        self.registry_id = registry_id;
        self.conn = Some(Connection::new(transport, DEFAULT_POOL_CAPACITY, export));

        if flags.contains(OpenFlags::TD_OPEN_SECONDARY) {
            info!(target: "nbd", "opening in secondary mode: read requests will be forwarded");
        }

        Ok(())
    }

    /// spec §4.9 `close`. Always returns `0`.
    pub fn close(&mut self) -> i32 {
        if let Err(e) = self.close_inner() {
            warn!(target: "nbd", "error while closing nbd connection: {e:#}");
        }
        0
    }

    fn close_inner(&mut self) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        if !conn.is_disabled() {
            info!(target: "nbd", "sending disconnect request");
            conn.enqueue_disc();
            conn.set_nonblocking(false)
                .wrap_err("switching socket to blocking mode")?;
            conn.on_writable().wrap_err("flushing final DISC")?;
        }

        let transport = conn.into_io();
        match self.registry_id.take() {
            Some(id) => {
                info!(target: "nbd", "stashing fd back under {id:?}");
                fdreceiver::stash(transport.into_raw_fd(), &id);
            }
            None => drop(transport),
        }
        Ok(())
    }

    /// `true` once `open` has succeeded and `close` hasn't run yet.
    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    pub fn as_raw_fd(&self) -> Option<RawFd> {
        self.conn.as_ref().map(|c| c.as_raw_fd())
    }

    /// Free slots remaining in the request pool, or `None` before `open`.
    pub fn free_count(&self) -> Option<usize> {
        self.conn.as_ref().map(Connection::free_count)
    }

    pub fn wants_write(&self) -> bool {
        self.conn.as_ref().is_some_and(Connection::wants_write)
    }

    pub fn wants_read(&self) -> bool {
        self.conn.as_ref().is_some_and(Connection::wants_read)
    }

    pub fn on_writable(&mut self) -> io::Result<()> {
        match self.conn.as_mut() {
            Some(conn) => conn.on_writable(),
            None => Ok(()),
        }
    }

    pub fn on_readable(&mut self) -> io::Result<()> {
        match self.conn.as_mut() {
            Some(conn) => conn.on_readable(),
            None => Ok(()),
        }
    }

    /// spec §4.9 `queue_read`: `offset = sector * sector_size`, `length =
    /// count * sector_size`. In secondary mode the read bypasses NBD
    /// entirely and is handed to `forward` instead (spec §2 item 8).
    pub fn queue_read(
        &mut self,
        sector: u64,
        count: u32,
        upper: UpperRequest,
        forward: impl FnOnce(UpperRequest),
    ) -> i32 {
        if self.flags.contains(OpenFlags::TD_OPEN_SECONDARY) {
            forward(upper);
            return errno::SUCCESS;
        }
        self.enqueue(Cmd::READ, sector, count, upper)
    }

    /// spec §4.9 `queue_write`.
    pub fn queue_write(&mut self, sector: u64, count: u32, upper: UpperRequest) -> i32 {
        self.enqueue(Cmd::WRITE, sector, count, upper)
    }

    fn enqueue(&mut self, cmd: Cmd, sector: u64, count: u32, upper: UpperRequest) -> i32 {
        let Some(conn) = self.conn.as_mut() else {
            upper.complete(errno::etimedout());
            return errno::etimedout();
        };
        let offset = sector * self.sector_size;
        let expected_len = count as u64 * self.sector_size;
        debug_assert_eq!(upper.buf.len() as u64, expected_len);
        match conn.enqueue(cmd, offset, upper) {
            EnqueueOutcome::Accepted => errno::SUCCESS,
            outcome => outcome.code(),
        }
    }

    /// spec §4.9 `get_parent_id`: this driver never has a parent image.
    pub fn get_parent_id(&self) -> Option<&'static str> {
        None
    }

    /// spec §4.9 `validate_parent`: always rejects.
    pub fn validate_parent(&self, _candidate: &str) -> bool {
        false
    }
}
