//! Single-threaded, event-loop NBD client driver.
//!
//! This crate implements the client half of the Network Block Device wire
//! protocol and the request-pipelining machinery a tapdisk-style block I/O
//! daemon needs to drive it: a fixed pool of request slots threaded onto
//! free/pending/sent queues, a readiness-driven writer and reader, a
//! blocking-but-bounded handshake, and a small process-wide registry for
//! descriptors handed in by another process. [`driver`] is the facade the
//! surrounding disk stack is expected to call; everything else is the
//! machinery behind it.
//!
//! Out of scope (see the original driver's design notes): the daemon's
//! reactor/scheduler itself ([`reactor`] only provides a reference
//! implementation so this crate builds and tests standalone), TLS,
//! structured replies, multi-connection NBD, and the NBD *server* side of
//! the protocol.

pub mod connection;
pub mod driver;
pub mod errno;
pub mod fdreceiver;
pub mod handshake;
pub mod ioutil;
pub mod pool;
pub mod proto;
pub mod reactor;
pub mod request;

pub use connection::Connection;
pub use driver::{NbdDriver, OpenFlags};
pub use request::UpperRequest;
