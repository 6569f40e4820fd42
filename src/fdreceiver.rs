//! Process-wide registry for file descriptors handed in out-of-band by
//! another process (spec §4.3, §9).
//!
//! A small control socket (`start`) accepts connections on which a peer
//! sends one `SCM_RIGHTS` ancillary message carrying a descriptor plus an
//! id string identifying it; `stash` records it; later, `driver::open`
//! calls `retrieve` by the same id to claim the descriptor for a new
//! connection (spec §4.9, the `<fd-receiver-id>` name grammar).
//!
//! The registry itself is bounded and global: at most [`MAX_ENTRIES`]
//! descriptors are held at once, and there is exactly one instance per
//! process, matching spec §3/§9 ("we'll only ever have one nbdclient fd
//! receiver per tapdisk process").

use std::io;
use std::os::unix::io::RawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};

use log::{error, info, warn};

/// At most this many descriptors may be stashed at once (spec §3, §5).
pub const MAX_ENTRIES: usize = 10;
/// Longest id string a slot will store (spec §3: "≤ 39 chars").
pub const MAX_ID_LEN: usize = 39;

#[derive(Default)]
struct Slot {
    id: Option<String>,
    fd: Option<RawFd>,
}

struct Table {
    slots: Mutex<[Slot; MAX_ENTRIES]>,
}

fn table() -> &'static Table {
    static TABLE: OnceLock<Table> = OnceLock::new();
    TABLE.get_or_init(|| Table {
        slots: Mutex::new(std::array::from_fn(|_| Slot::default())),
    })
}

fn truncate_id(id: &str) -> String {
    if id.len() <= MAX_ID_LEN {
        id.to_string()
    } else {
        warn!(target: "nbd", "fd-receiver id {id:?} longer than {MAX_ID_LEN} chars, truncating");
        id.chars().take(MAX_ID_LEN).collect()
    }
}

/// Stash `fd` under `id`. If `id` already names a held descriptor, the old
/// one is closed and replaced (spec §4.3: "replacing and closing the
/// previous fd"). If no slot is free and `id` is not already present, the
/// new `fd` is closed and an error logged (spec §5: "overflow closes the
/// newest").
pub fn stash(fd: RawFd, id: &str) {
    let id = truncate_id(id);
    let mut slots = table().slots.lock().unwrap();

    // Look for an existing slot with this id, or else an empty slot.
    let mut target = None;
    for (i, slot) in slots.iter().enumerate() {
        if slot.id.as_deref() == Some(id.as_str()) {
            target = Some(i);
            break;
        }
    }
    if target.is_none() {
        target = slots.iter().position(|slot| slot.fd.is_none());
    }

    match target {
        Some(i) => {
            if let Some(old_fd) = slots[i].fd.take() {
                unsafe {
                    libc::close(old_fd);
                }
            }
            slots[i].id = Some(id);
            slots[i].fd = Some(fd);
        }
        None => {
            error!(target: "nbd", "fd-receiver table full ({MAX_ENTRIES} entries); dropping fd for {id:?}");
            unsafe {
                libc::close(fd);
            }
        }
    }
}

/// Retrieve the descriptor stashed under `id`. Destructive: a second call
/// with the same id fails (spec §4.3).
pub fn retrieve(id: &str) -> io::Result<RawFd> {
    let mut slots = table().slots.lock().unwrap();
    for slot in slots.iter_mut() {
        if slot.id.as_deref() == Some(id) {
            if let Some(fd) = slot.fd.take() {
                slot.id = None;
                return Ok(fd);
            }
        }
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("no fd stashed under {id:?}"),
    ))
}

#[cfg(test)]
fn held_count() -> usize {
    table()
        .slots
        .lock()
        .unwrap()
        .iter()
        .filter(|s| s.fd.is_some())
        .count()
}

/// Receive one message with an attached `SCM_RIGHTS` descriptor plus a
/// plain-bytes id payload. Returns `(fd, id)`.
fn recv_with_fd(stream: &UnixStream) -> io::Result<(RawFd, String)> {
    use std::os::unix::io::AsRawFd;

    let sock_fd = stream.as_raw_fd();
    let mut data_buf = vec![0u8; MAX_ID_LEN + 1];
    let fd_size = std::mem::size_of::<libc::c_int>();
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: data_buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: data_buf.len(),
    };
    let mut msg = libc::msghdr {
        msg_name: std::ptr::null_mut(),
        msg_namelen: 0,
        msg_iov: &mut iov,
        msg_iovlen: 1,
        msg_control: cmsg_buf.as_mut_ptr() as *mut libc::c_void,
        msg_controllen: cmsg_buf.len() as _,
        msg_flags: 0,
    };

    let n = unsafe { libc::recvmsg(sock_fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    data_buf.truncate(n as usize);
    let id = String::from_utf8_lossy(&data_buf).trim_matches('\0').to_string();

    let mut fd = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data_ptr = libc::CMSG_DATA(cmsg) as *const libc::c_int;
                fd = Some(std::ptr::read_unaligned(data_ptr));
                break;
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    match fd {
        Some(fd) => Ok((fd, id)),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "message carried no SCM_RIGHTS fd",
        )),
    }
}

/// Send `data` plus an attached descriptor over `stream`. Exposed so
/// another process (or a test) can exercise the receiving half above.
pub fn send_with_fd(stream: &UnixStream, data: &[u8], fd: RawFd) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let sock_fd = stream.as_raw_fd();
    let fd_size = std::mem::size_of::<libc::c_int>();
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    let mut msg = libc::msghdr {
        msg_name: std::ptr::null_mut(),
        msg_namelen: 0,
        msg_iov: &mut iov,
        msg_iovlen: 1,
        msg_control: cmsg_buf.as_mut_ptr() as *mut libc::c_void,
        msg_controllen: cmsg_space as _,
        msg_flags: 0,
    };

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_size as u32) as _;
        let data_ptr = libc::CMSG_DATA(cmsg) as *mut libc::c_int;
        std::ptr::write_unaligned(data_ptr, fd);
    }

    let n = unsafe { libc::sendmsg(sock_fd, &msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Handle to a running fd-receiver control socket, returned by [`start`].
pub struct Service {
    path: PathBuf,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// Start listening on a UNIX control socket at `path`, stashing every
/// descriptor a peer sends us (spec §6, §9: `start(path, upcall)`). Every
/// accepted connection is expected to send exactly one `SCM_RIGHTS`
/// message and then close.
pub fn start(path: impl AsRef<Path>) -> io::Result<Service> {
    let path = path.as_ref().to_path_buf();
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    let running = Arc::new(AtomicBool::new(true));
    let running_thread = running.clone();

    let handle = thread::spawn(move || {
        for conn in listener.incoming() {
            if !running_thread.load(Ordering::SeqCst) {
                break;
            }
            let conn = match conn {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(target: "nbd", "fd-receiver accept failed: {e}");
                    continue;
                }
            };
            match recv_with_fd(&conn) {
                Ok((fd, id)) => {
                    info!(target: "nbd", "fd-receiver stashed fd for {id:?}");
                    stash(fd, &id);
                }
                Err(e) => warn!(target: "nbd", "fd-receiver recvmsg failed: {e}"),
            }
        }
    });

    Ok(Service {
        path,
        running,
        handle: Some(handle),
    })
}

impl Service {
    /// Stop accepting new connections and remove the control socket (spec
    /// §9: `stop()`).
    pub fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        // Wake the blocking accept() loop with a dummy connection.
        let _ = UnixStream::connect(&self.path);
        let _ = std::fs::remove_file(&self.path);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn stash_then_retrieve_round_trips() {
        let (a, b) = UnixStream::pair().unwrap();
        use std::os::unix::io::{AsRawFd, IntoRawFd};
        let fd = a.into_raw_fd();
        stash(fd, "test-basic");
        let got = retrieve("test-basic").unwrap();
        assert_eq!(got, fd);
        unsafe { libc::close(got) };
        drop(b);
    }

    #[test]
    #[serial]
    fn retrieve_is_destructive() {
        use std::os::unix::io::IntoRawFd;
        let (a, b) = UnixStream::pair().unwrap();
        stash(a.into_raw_fd(), "test-once");
        let fd = retrieve("test-once").unwrap();
        assert!(retrieve("test-once").is_err());
        unsafe { libc::close(fd) };
        drop(b);
    }

    #[test]
    #[serial]
    fn stash_replaces_same_id_and_closes_old() {
        use std::os::unix::io::IntoRawFd;
        let (a, _ka) = UnixStream::pair().unwrap();
        let (b, _kb) = UnixStream::pair().unwrap();
        stash(a.into_raw_fd(), "test-replace");
        let before = held_count();
        stash(b.into_raw_fd(), "test-replace");
        assert_eq!(held_count(), before, "replacing should not grow the table");
        let got = retrieve("test-replace").unwrap();
        unsafe { libc::close(got) };
    }

    /// Round-trips a real descriptor through [`start`]'s control socket
    /// using [`send_with_fd`]: another process's half of the handoff
    /// (spec §4.3, §6 "the upcall receives `(fd, id_string)`").
    #[test]
    #[serial]
    fn send_with_fd_round_trips_through_control_socket() {
        use std::io::{Read, Write};
        use std::os::unix::io::{FromRawFd, IntoRawFd};
        use std::time::Duration;

        let path = std::env::temp_dir().join(format!("nbd-fdreceiver-test-{}.sock", std::process::id()));
        let service = start(&path).expect("start fd-receiver control socket");

        let (payload_tx, mut payload_rx) = UnixStream::pair().unwrap();
        let control = UnixStream::connect(&path).expect("connect to control socket");
        send_with_fd(&control, b"test-send-with-fd", payload_tx.into_raw_fd())
            .expect("send descriptor over control socket");
        drop(control);

        let mut fd = None;
        for _ in 0..200 {
            if let Ok(f) = retrieve("test-send-with-fd") {
                fd = Some(f);
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let fd = fd.expect("fd was stashed under the id sent with it");

        let mut received = unsafe { UnixStream::from_raw_fd(fd) };
        payload_rx.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        received.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        service.stop();
    }
}
