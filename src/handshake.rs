//! Initial magic exchange and old-/new-style negotiation (spec §4.4).
//!
//! Runs on a still-blocking socket, bounding every read with a poll-based
//! wait (mirrors `tdnbd_wait_recv`'s `select` loop in the original driver)
//! so a dead or hung server can't stall the daemon forever. Once the
//! export size and sector count are known the socket is flipped to
//! non-blocking and handed to the event-driven phase (`connection`).

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use color_eyre::eyre::{bail, ensure, Context, Result};

use crate::proto::{self, ClientHandshakeFlags, HandshakeFlags, Opt, OptType, ProtocolError};

/// Upper bound on a single handshake read (spec §4.4, §5, §9).
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// What the handshake learns about the export (spec §3, §4.4 step 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportInfo {
    pub size_sectors: u64,
    pub sector_size: u64,
}

/// Run the handshake to completion and leave `io` in non-blocking mode.
pub fn negotiate<IO: Read + Write + AsRawFd>(io: &mut IO, export_name: &str) -> Result<ExportInfo> {
    let mut magic = [0u8; 8];
    read_bounded(io, &mut magic).wrap_err("reading opening magic")?;
    let magic = u64::from_be_bytes(magic);
    ensure!(
        magic == proto::MAGIC,
        ProtocolError::new(format!("bad opening magic {magic:#x}"))
    );

    let mut second = [0u8; 8];
    read_bounded(io, &mut second).wrap_err("reading second handshake magic")?;
    let second = u64::from_be_bytes(second);

    let info = if second == proto::OLD_VERSION {
        old_style(io).wrap_err("old-style handshake")?
    } else if second == proto::IHAVEOPT {
        new_style(io, export_name).wrap_err("new-style handshake")?
    } else {
        bail!(ProtocolError::new(format!(
            "unrecognized second handshake magic {second:#x}"
        )));
    };

    set_nonblocking(io.as_raw_fd(), true).wrap_err("setting socket non-blocking")?;
    Ok(info)
}

fn old_style<IO: Read + AsRawFd>(io: &mut IO) -> Result<ExportInfo> {
    let mut size_buf = [0u8; 8];
    read_bounded(io, &mut size_buf)?;
    let size_bytes = u64::from_be_bytes(size_buf);

    let mut flags_buf = [0u8; 4];
    read_bounded(io, &mut flags_buf)?;
    let _flags = u32::from_be_bytes(flags_buf);

    // 124 bytes of reserved padding; tolerate short reads same as any
    // other handshake read.
    let mut padding = [0u8; 124];
    read_bounded(io, &mut padding)?;

    Ok(ExportInfo {
        size_sectors: size_bytes >> proto::SECTOR_SHIFT,
        sector_size: proto::DEFAULT_SECTOR_SIZE,
    })
}

fn new_style<IO: Read + Write + AsRawFd>(io: &mut IO, export_name: &str) -> Result<ExportInfo> {
    let mut flags_buf = [0u8; 2];
    read_bounded(io, &mut flags_buf)?;
    let server_flags = HandshakeFlags::from_bits_truncate(u16::from_be_bytes(flags_buf));
    ensure!(
        server_flags.contains(HandshakeFlags::FIXED_NEWSTYLE),
        ProtocolError::new("server does not support fixed newstyle negotiation")
    );

    let client_flags = ClientHandshakeFlags::C_FIXED_NEWSTYLE | ClientHandshakeFlags::C_NO_ZEROES;
    io.write_u32::<BE>(client_flags.bits())
        .wrap_err("writing client handshake flags")?;
    io.flush()?;

    Opt {
        typ: OptType::EXPORT_NAME,
        data: export_name.as_bytes().to_vec(),
    }
    .put(&mut *io)
    .wrap_err("sending EXPORT_NAME option")?;

    // NO_ZEROES was requested, so the reply is exactly size + transmit
    // flags with no trailing zero padding (spec §4.1, §4.4 step 2).
    let mut reply = [0u8; 10];
    read_bounded(io, &mut reply)?;
    let mut r = &reply[..];
    let size_bytes = r.read_u64::<BE>().unwrap();
    let _transmit_flags = r.read_u16::<BE>().unwrap();

    Ok(ExportInfo {
        size_sectors: size_bytes >> proto::SECTOR_SHIFT,
        sector_size: proto::DEFAULT_SECTOR_SIZE,
    })
}

/// Read exactly `buf.len()` bytes, bounding every individual wait for
/// readability at [`READ_TIMEOUT`] (spec §4.4, §9: "bounded select-based
/// wait ... fail closed").
fn read_bounded<IO: Read + AsRawFd>(io: &mut IO, buf: &mut [u8]) -> io::Result<()> {
    let fd = io.as_raw_fd();
    let mut filled = 0;
    while filled < buf.len() {
        wait_readable(fd, READ_TIMEOUT)?;
        match io.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed connection during handshake",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<()> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    loop {
        let n = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "handshake read timed out",
            ));
        }
        return Ok(());
    }
}

fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
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
    use std::os::unix::net::UnixStream;
    use std::thread;

    #[test]
    fn old_style_handshake_computes_sectors() {
        let (mut client, mut server) = UnixStream::pair().unwrap();
        let server_thread = thread::spawn(move || {
            server.write_all(&proto::MAGIC.to_be_bytes()).unwrap();
            server.write_all(&proto::OLD_VERSION.to_be_bytes()).unwrap();
            server.write_all(&0x200000u64.to_be_bytes()).unwrap();
            server.write_all(&1u32.to_be_bytes()).unwrap();
            server.write_all(&[0u8; 124]).unwrap();
        });
        let info = negotiate(&mut client, "default").unwrap();
        assert_eq!(info.size_sectors, 4096);
        assert_eq!(info.sector_size, 512);
        server_thread.join().unwrap();
    }

    #[test]
    fn new_style_handshake_sends_export_name_and_reads_size() {
        let (mut client, mut server) = UnixStream::pair().unwrap();
        let server_thread = thread::spawn(move || {
            server.write_all(&proto::MAGIC.to_be_bytes()).unwrap();
            server.write_all(&proto::IHAVEOPT.to_be_bytes()).unwrap();
            server.write_all(&1u16.to_be_bytes()).unwrap();

            let mut client_flags = [0u8; 4];
            server.read_exact(&mut client_flags).unwrap();
            assert_eq!(u32::from_be_bytes(client_flags), 0x3);

            let mut opt_header = [0u8; 16];
            server.read_exact(&mut opt_header).unwrap();
            let magic = u64::from_be_bytes(opt_header[0..8].try_into().unwrap());
            assert_eq!(magic, proto::IHAVEOPT);
            let opt_len = u32::from_be_bytes(opt_header[12..16].try_into().unwrap());
            let mut name = vec![0u8; opt_len as usize];
            server.read_exact(&mut name).unwrap();
            assert_eq!(name, b"default");

            server.write_all(&0x200000u64.to_be_bytes()).unwrap();
            server.write_all(&1u16.to_be_bytes()).unwrap();
        });
        let info = negotiate(&mut client, "default").unwrap();
        assert_eq!(info.size_sectors, 4096);
        server_thread.join().unwrap();
    }

    #[test]
    fn rejects_bad_opening_magic() {
        let (mut client, mut server) = UnixStream::pair().unwrap();
        let server_thread = thread::spawn(move || {
            server.write_all(&[0u8; 8]).unwrap();
        });
        assert!(negotiate(&mut client, "default").is_err());
        server_thread.join().unwrap();
    }
}
