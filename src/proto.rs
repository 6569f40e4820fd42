//! NBD wire protocol: magics, option/request/reply framing, and flag
//! bitfields, in network byte order.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md> for
//! the protocol description. This module only implements the subset the
//! client driver needs: the fixed newstyle handshake (with `NO_ZEROES`),
//! `NBD_OPT_EXPORT_NAME`, and the `READ`/`WRITE`/`DISC` transmission
//! commands.
#![allow(clippy::upper_case_acronyms)]
#![allow(non_camel_case_types)]

use std::error::Error;
use std::fmt;
use std::io::{self, prelude::*};

use bitflags::bitflags;
use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Fixed 512-byte sector size (spec §4.4, §6): the driver never negotiates
/// a different block size.
pub const DEFAULT_SECTOR_SIZE: u64 = 512;
/// `size_sectors = size_bytes >> SECTOR_SHIFT`.
pub const SECTOR_SHIFT: u32 = 9;

pub const MAGIC: u64 = 0x4e42444d41474943; // b"NBDMAGIC"
pub const OLD_VERSION: u64 = 0x00420281861253;
pub const IHAVEOPT: u64 = 0x49484156454F5054; // b"IHAVEOPT"

pub const REQUEST_MAGIC: u32 = 0x25609513;
pub const SIMPLE_REPLY_MAGIC: u32 = 0x67446698;

#[derive(Debug, Clone)]
pub struct ProtocolError(pub String);

impl ProtocolError {
    pub fn new<S: Into<String>>(s: S) -> Self {
        ProtocolError(s.into())
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "nbd protocol error: {}", self.0)
    }
}

impl Error for ProtocolError {}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandshakeFlags: u16 {
        const FIXED_NEWSTYLE = 0b01;
        const NO_ZEROES = 0b10;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClientHandshakeFlags: u32 {
        const C_FIXED_NEWSTYLE = 0b01;
        const C_NO_ZEROES = 0b10;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransmitFlags: u16 {
        const HAS_FLAGS = 1 << 0;
        const READ_ONLY = 1 << 1;
        const SEND_FLUSH = 1 << 2;
        const SEND_FUA = 1 << 3;
        const ROTATIONAL = 1 << 4;
        const SEND_TRIM = 1 << 5;
        const SEND_WRITE_ZEROES = 1 << 6;
        const SEND_DF = 1 << 7;
        const CAN_MULTI_CONN = 1 << 8;
        const SEND_RESIZE = 1 << 9;
        const SEND_CACHE = 1 << 10;
        const SEND_FAST_ZERO = 1 << 11;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CmdFlags: u16 {
        const FUA = 1 << 0;
        const NO_HOLE = 1 << 1;
        const DF = 1 << 2;
        const REQ_ONE = 1 << 3;
        const FAST_ZERO = 1 << 4;
    }
}

/// Option codes a server may be sent or may reply about. The client in
/// this driver only ever sends `EXPORT_NAME`; the others are kept so the
/// wire constants match a real server's vocabulary.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum OptType {
    EXPORT_NAME = 1,
    ABORT = 2,
    LIST = 3,
    PEEK_EXPORT = 4,
    STARTTLS = 5,
    INFO = 6,
    GO = 7,
}

#[derive(Debug, Clone)]
pub struct Opt {
    pub typ: OptType,
    pub data: Vec<u8>,
}

impl Opt {
    /// Write this option to the stream in the `IHAVEOPT` framing.
    pub fn put<IO: Write>(&self, mut stream: IO) -> io::Result<()> {
        stream.write_u64::<BE>(IHAVEOPT)?;
        stream.write_u32::<BE>(self.typ.into())?;
        stream.write_u32::<BE>(self.data.len() as u32)?;
        stream.write_all(&self.data)?;
        stream.flush()
    }
}

/// Commands understood in the transmission phase. The driver only issues
/// `READ`, `WRITE`, and `DISC` (spec §6); the rest exist so `Cmd` can
/// round-trip any reply header a future extension might produce.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum Cmd {
    READ = 0,
    WRITE = 1,
    DISC = 2,
    FLUSH = 3,
    TRIM = 4,
    CACHE = 5,
    WRITE_ZEROES = 6,
    BLOCK_STATUS = 7,
    RESIZE = 8,
}

/// Size in bytes of a request header on the wire (spec §4.1).
pub const REQUEST_HEADER_LEN: usize = 4 + 4 + 8 + 8 + 4;
/// Size in bytes of a simple reply header on the wire (spec §4.1).
pub const REPLY_HEADER_LEN: usize = 4 + 4 + 8;

/// A decoded request header. The driver only ever builds these itself
/// (it is the client), so there is no `get`; `ReplyHeader` is the
/// counterpart we parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub typ: Cmd,
    pub handle: [u8; 8],
    pub offset: u64,
    pub len: u32,
}

impl RequestHeader {
    pub fn new(typ: Cmd, handle: [u8; 8], offset: u64, len: u32) -> Self {
        Self {
            typ,
            handle,
            offset,
            len,
        }
    }

    /// Serialize into wire byte order. Used to fill a request slot's
    /// header buffer once, up front, so the partial-I/O helper only ever
    /// deals with raw bytes afterwards.
    pub fn to_bytes(self) -> [u8; REQUEST_HEADER_LEN] {
        let mut buf = [0u8; REQUEST_HEADER_LEN];
        {
            let mut w: &mut [u8] = &mut buf;
            w.write_u32::<BE>(REQUEST_MAGIC).unwrap();
            w.write_u32::<BE>(self.typ.into()).unwrap();
            w.write_all(&self.handle).unwrap();
            w.write_u64::<BE>(self.offset).unwrap();
            w.write_u32::<BE>(self.len).unwrap();
        }
        buf
    }

    /// Parse wire bytes back into a header. Only used by tests to check
    /// the round-trip property (spec §8 property 6); the driver itself
    /// never reads request headers.
    pub fn from_bytes(buf: &[u8; REQUEST_HEADER_LEN]) -> Result<Self, ProtocolError> {
        let mut r = &buf[..];
        let magic = r.read_u32::<BE>().unwrap();
        if magic != REQUEST_MAGIC {
            return Err(ProtocolError::new(format!("wrong request magic {magic:#x}")));
        }
        let typ = r.read_u32::<BE>().unwrap();
        let typ =
            Cmd::try_from(typ).map_err(|_| ProtocolError::new(format!("unexpected command {typ}")))?;
        let mut handle = [0u8; 8];
        r.read_exact(&mut handle).unwrap();
        let offset = r.read_u64::<BE>().unwrap();
        let len = r.read_u32::<BE>().unwrap();
        Ok(Self {
            typ,
            handle,
            offset,
            len,
        })
    }
}

/// A decoded simple reply header (spec §4.1). Error codes on the wire are
/// a 32-bit value; 0 means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub error: u32,
    pub handle: [u8; 8],
}

impl ReplyHeader {
    pub fn from_bytes(buf: &[u8; REPLY_HEADER_LEN]) -> Result<Self, ProtocolError> {
        let mut r = &buf[..];
        let magic = r.read_u32::<BE>().unwrap();
        if magic != SIMPLE_REPLY_MAGIC {
            return Err(ProtocolError::new(format!("wrong reply magic {magic:#x}")));
        }
        let error = r.read_u32::<BE>().unwrap();
        let mut handle = [0u8; 8];
        r.read_exact(&mut handle).unwrap();
        Ok(Self { error, handle })
    }

    #[cfg(test)]
    pub fn to_bytes(self) -> [u8; REPLY_HEADER_LEN] {
        let mut buf = [0u8; REPLY_HEADER_LEN];
        let mut w: &mut [u8] = &mut buf;
        w.write_u32::<BE>(SIMPLE_REPLY_MAGIC).unwrap();
        w.write_u32::<BE>(self.error).unwrap();
        w.write_all(&self.handle).unwrap();
        buf
    }
}
