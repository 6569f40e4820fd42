//! The opaque upper-layer request (spec §1, §3): "opaque except for
//! buffer/length/sector fields and a completion function." We model it as
//! an owned buffer plus a completion closure rather than a trait object,
//! since there is exactly one concrete shape the driver ever deals with
//! and no second implementation is expected to exist.

/// A request handed down from the block layer. `buf` is filled by a READ
/// reply or drained by a WRITE; `on_complete` is invoked exactly once,
/// with a `0`-or-negative-errno result code and the buffer handed back.
pub struct UpperRequest {
    pub buf: Vec<u8>,
    on_complete: Box<dyn FnOnce(i32, Vec<u8>)>,
}

impl UpperRequest {
    pub fn new(buf: Vec<u8>, on_complete: impl FnOnce(i32, Vec<u8>) + 'static) -> Self {
        Self {
            buf,
            on_complete: Box::new(on_complete),
        }
    }

    /// Complete the request exactly once. Consumes `self` so a second
    /// completion is a compile-time impossibility rather than a runtime
    /// bug (spec §8 property 5: "completed exactly once").
    pub fn complete(self, result: i32) {
        (self.on_complete)(result, self.buf)
    }
}

impl std::fmt::Debug for UpperRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpperRequest")
            .field("buf_len", &self.buf.len())
            .finish()
    }
}
