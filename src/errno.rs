//! Errno-style status codes shared by `pool`, `connection`, and `driver`
//! (spec §6: "negative errno-style code"; §7 taxonomy).
//!
//! Steady-state driver operations report `i32` codes rather than
//! `color_eyre::Result` (reserved for setup/handshake), since allocating a
//! backtrace-carrying error on every reply is wasted work on a path the
//! upper block layer expects to be cheap. We re-export `nix::errno::Errno`
//! for its platform-correct numeric values instead of hand-rolling them.

pub use nix::errno::Errno;

/// Success sentinel for the driver-facade and enqueue contracts (spec §6).
pub const SUCCESS: i32 = 0;

/// `enqueue` on a disabled connection, and the disable-time negative
/// completion code for requests still queued locally at the moment of
/// disable. Kept negative per spec §7 ("post-shutdown ... -ETIMEDOUT").
pub fn etimedout() -> i32 {
    -(Errno::ETIMEDOUT as i32)
}

/// Pool exhaustion (spec §4.5, §7).
pub fn ebusy() -> i32 {
    -(Errno::EBUSY as i32)
}

/// The fatal-shutdown completion code (spec §4.8, §7, §8 scenario 6).
/// Deliberately positive, matching the original driver's inconsistent
/// sign convention for this one path (see DESIGN.md, Open Question 2).
pub fn eio() -> i32 {
    Errno::EIO as i32
}
