//! Fixed-size request-slot pool and its three queues (spec §3, §4.5, §9).
//!
//! The original driver links slots into `free`/`pending`/`sent` with
//! intrusive next/prev pointers inside each slot. A safe Rust arena keeps
//! the same shape without unsafe linkage: a fixed `Vec<Slot>` is the
//! arena, and each queue is a `VecDeque<usize>` of indices into it. No
//! slot is ever allocated or freed once the pool is built; only indices
//! move between the three deques.

use std::collections::VecDeque;

use crate::proto::{Cmd, RequestHeader, REQUEST_HEADER_LEN};
use crate::request::UpperRequest;

/// One request's worth of framing state (spec §3 "Request slot").
pub struct Slot {
    pub upper: Option<UpperRequest>,
    pub cmd: Cmd,
    pub handle: [u8; 8],
    pub header_buf: [u8; REQUEST_HEADER_LEN],
    pub header_so_far: usize,
    pub body_so_far: usize,
    /// Preserved per spec §3/§9 ("currently unused by live code but must
    /// be preserved on the slot") for a future synthetic/internal request
    /// that carries no upper-layer completion.
    pub fake: bool,
}

impl Slot {
    fn empty() -> Self {
        Self {
            upper: None,
            cmd: Cmd::READ,
            handle: [0; 8],
            header_buf: [0; REQUEST_HEADER_LEN],
            header_so_far: 0,
            body_so_far: 0,
            fake: false,
        }
    }

    /// Bytes of the request body still to send (WRITE) or receive (READ).
    pub fn body_len(&self) -> usize {
        self.upper.as_ref().map_or(0, |u| u.buf.len())
    }

    pub fn body_remaining(&self) -> bool {
        self.body_so_far < self.body_len()
    }

    pub fn header_remaining(&self) -> bool {
        self.header_so_far < self.header_buf.len()
    }
}

/// The pool: a fixed arena plus the free/pending/sent index queues.
pub struct Pool {
    slots: Vec<Slot>,
    free: VecDeque<usize>,
    pending: VecDeque<usize>,
    sent: VecDeque<usize>,
    next_id: u32,
}

impl Pool {
    /// Build a pool of `capacity` slots, all initially on `free` (spec
    /// §3 "Lifecycle": "Request slots are allocated from `free`...").
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Slot::empty()).collect();
        let free = (0..capacity).collect();
        Self {
            slots,
            free,
            pending: VecDeque::new(),
            sent: VecDeque::new(),
            next_id: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn pending_is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn slot(&self, idx: usize) -> &Slot {
        &self.slots[idx]
    }

    pub fn slot_mut(&mut self, idx: usize) -> &mut Slot {
        &mut self.slots[idx]
    }

    /// 8-byte wire handle `"td" + 5 hex digits + NUL`, matching the
    /// original's `snprintf(handle, 8, "td%05x", id % 0xffff)` exactly
    /// (spec §12).
    fn next_handle(&mut self) -> [u8; 8] {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let text = format!("td{:05x}", id % 0xffff);
        let mut handle = [0u8; 8];
        let bytes = text.as_bytes();
        handle[..bytes.len()].copy_from_slice(bytes);
        handle
    }

    /// Pop a free slot, fill its header, and append it to `pending` (spec
    /// §4.5). On exhaustion, returns `upper` back to the caller untouched
    /// (no completion, no allocation — spec: "without side effect").
    pub fn allocate(
        &mut self,
        cmd: Cmd,
        offset: u64,
        upper: UpperRequest,
        fake: bool,
    ) -> Result<usize, UpperRequest> {
        let idx = match self.free.pop_front() {
            Some(idx) => idx,
            None => return Err(upper),
        };
        let handle = self.next_handle();
        let len = upper.buf.len() as u32;
        let header = RequestHeader::new(cmd, handle, offset, len);

        let slot = &mut self.slots[idx];
        slot.cmd = cmd;
        slot.handle = handle;
        slot.header_buf = header.to_bytes();
        slot.header_so_far = 0;
        slot.body_so_far = 0;
        slot.upper = Some(upper);
        slot.fake = fake;

        self.pending.push_back(idx);
        Ok(idx)
    }

    pub fn pending_front(&self) -> Option<usize> {
        self.pending.front().copied()
    }

    pub fn pop_pending_front(&mut self) -> Option<usize> {
        self.pending.pop_front()
    }

    pub fn push_sent(&mut self, idx: usize) {
        self.sent.push_back(idx);
    }

    /// O(N) scan over `sent` by handle (spec §4.7, §9: bounded N, linear
    /// scan acceptable).
    pub fn find_in_sent(&self, handle: &[u8; 8]) -> Option<usize> {
        self.sent.iter().copied().find(|&i| &self.slots[i].handle == handle)
    }

    pub fn remove_from_sent(&mut self, idx: usize) {
        if let Some(pos) = self.sent.iter().position(|&i| i == idx) {
            self.sent.remove(pos);
        }
    }

    /// Return a slot to `free`, resetting its transient state (spec §4.6
    /// step 3, §4.7 step 5).
    pub fn release(&mut self, idx: usize) {
        self.slots[idx] = Slot::empty();
        self.free.push_back(idx);
    }

    /// Complete every request on `pending` then `sent`, in that order, and
    /// drop them from the queues without returning them to `free` — spec
    /// §4.8: "leave the slot in place (no further traffic will occur)".
    pub fn complete_all(&mut self, code: i32) {
        for idx in self.pending.drain(..).collect::<Vec<_>>() {
            if let Some(upper) = self.slots[idx].upper.take() {
                upper.complete(code);
            }
        }
        for idx in self.sent.drain(..).collect::<Vec<_>>() {
            if let Some(upper) = self.slots[idx].upper.take() {
                upper.complete(code);
            }
        }
    }

    #[cfg(test)]
    pub fn sent_len(&self) -> usize {
        self.sent.len()
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn req() -> UpperRequest {
        UpperRequest::new(vec![0; 512], |_, _| {})
    }

    #[test]
    fn invariant_queue_lengths_sum_to_capacity() {
        let mut pool = Pool::new(4);
        pool.allocate(Cmd::READ, 0, req(), false).unwrap();
        pool.allocate(Cmd::READ, 512, req(), false).unwrap();
        assert_eq!(
            pool.free_count() + pool.pending_len() + pool.sent_len(),
            pool.capacity()
        );
    }

    /// spec §3 pending invariant: "A slot on `pending` has `header.so_far
    /// < header.len` OR (type=WRITE AND `body.so_far < body.len`)." A
    /// WRITE slot must keep `body_remaining()` true until its body drains,
    /// even after its header is fully sent.
    #[test]
    fn write_slot_needs_header_or_body_done_before_leaving_pending() {
        let mut pool = Pool::new(1);
        let idx = pool.allocate(Cmd::WRITE, 0, req(), false).unwrap();
        assert!(pool.slot(idx).header_remaining());

        let header_len = pool.slot(idx).header_buf.len();
        pool.slot_mut(idx).header_so_far = header_len;
        assert!(!pool.slot(idx).header_remaining());
        assert!(pool.slot(idx).body_remaining());

        let body_len = pool.slot(idx).body_len();
        pool.slot_mut(idx).body_so_far = body_len;
        assert!(!pool.slot(idx).body_remaining());
    }

    #[test]
    fn allocate_fails_when_exhausted() {
        let mut pool = Pool::new(1);
        assert!(pool.allocate(Cmd::READ, 0, req(), false).is_ok());
        assert!(pool.allocate(Cmd::READ, 0, req(), false).is_err());
    }

    #[test]
    fn handles_are_unique_within_sent() {
        let mut pool = Pool::new(4);
        for i in 0..4 {
            let idx = pool.allocate(Cmd::READ, i * 512, req(), false).unwrap();
            pool.pop_pending_front();
            pool.push_sent(idx);
        }
        let mut seen = std::collections::HashSet::new();
        for idx in 0..4 {
            assert!(seen.insert(pool.slot(idx).handle));
        }
    }

    #[test]
    fn release_clears_and_returns_to_free() {
        let mut pool = Pool::new(2);
        let idx = pool.allocate(Cmd::WRITE, 0, req(), false).unwrap();
        pool.pop_pending_front();
        pool.push_sent(idx);
        pool.remove_from_sent(idx);
        pool.release(idx);
        assert_eq!(pool.free_count(), 2);
        assert!(pool.slot(idx).upper.is_none());
    }

    #[test]
    fn complete_all_completes_pending_then_sent_exactly_once() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut pool = Pool::new(3);

        let o1 = order.clone();
        let idx_sent = pool
            .allocate(Cmd::READ, 0, UpperRequest::new(vec![], move |code, _| o1.borrow_mut().push(("sent", code))), false)
            .unwrap();
        pool.pop_pending_front();
        pool.push_sent(idx_sent);

        let o2 = order.clone();
        pool.allocate(Cmd::WRITE, 512, UpperRequest::new(vec![], move |code, _| o2.borrow_mut().push(("pending", code))), false)
            .unwrap();

        pool.complete_all(-5);
        assert_eq!(
            *order.borrow(),
            vec![("pending", -5), ("sent", -5)]
        );
        assert_eq!(pool.pending_len(), 0);
        assert_eq!(pool.sent_len(), 0);
    }
}
