use std::ptr;
use std::sync::atomic::{fence, Ordering};

use tracing::{trace, warn};

use super::core::layout::{unpack_state, Ring};
use super::errors::{Result, ShmemLibError};

/// Consumer half of the ring protocol.
///
/// Reads are validated seqlock style: the slot's state word is loaded
/// before the copy and compared again after it, so a slot overwritten by
/// a wrapping writer is discarded instead of returned torn.
pub struct MessageReader {
    ring: Ring,
    popped: u64,
    skipped: u64,
}

impl MessageReader {
    pub(crate) fn new(ring: Ring) -> MessageReader {
        MessageReader {
            ring,
            popped: 0,
            skipped: 0,
        }
    }

    pub fn popped(&self) -> u64 {
        self.popped
    }

    /// Slots found stale or overwritten and skipped.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Moves past a slot that does not hold the expected element.
    ///
    /// Only counted when this reader is the one that advances past it; if
    /// the writer got there first the element was an ordinary drop.
    fn skip_corrupt(&mut self, read_seq: u64, state: u64, reason: &'static str) {
        let (ready, found) = unpack_state(state);
        let advanced = self
            .ring
            .header()
            .read_seq
            .compare_exchange(read_seq, read_seq + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if advanced {
            self.skipped += 1;
            warn!(
                expected = read_seq,
                found, ready, reason, "skipping corrupt slot"
            );
        } else {
            trace!(expected = read_seq, reason, "slot evicted by the writer");
        }
    }

    /// Copies the oldest unread element into `buf`.
    ///
    /// Returns `Ok(Some(len))` with the payload in `buf[..len]`, or
    /// `Ok(None)` if the queue is empty. `buf` must hold at least
    /// `element_size` bytes. Never blocks.
    pub fn try_pop(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        let element_size = self.ring.layout().element_size;
        if buf.len() < element_size {
            return Err(ShmemLibError::BufferTooSmall {
                needed: element_size,
                available: buf.len(),
            });
        }
        let ring = self.ring;
        let header = ring.header();
        loop {
            let read_seq = header.read_seq.load(Ordering::Acquire);
            let write_seq = header.write_seq.load(Ordering::Acquire);
            if read_seq >= write_seq {
                return Ok(None);
            }

            let slot = ring.slot(read_seq);
            let before = slot.state.load(Ordering::Acquire);
            let (ready, seq) = unpack_state(before);
            if !ready || seq != read_seq {
                self.skip_corrupt(read_seq, before, "stale sequence id");
                continue;
            }
            let len = slot.len.load(Ordering::Relaxed) as usize;
            if len > element_size {
                self.skip_corrupt(read_seq, before, "length out of range");
                continue;
            }
            unsafe {
                ptr::copy_nonoverlapping(ring.payload_ptr(read_seq), buf.as_mut_ptr(), len);
            }
            fence(Ordering::Acquire);
            let after = slot.state.load(Ordering::Relaxed);
            if after != before {
                self.skip_corrupt(read_seq, after, "overwritten during copy");
                continue;
            }

            match header.read_seq.compare_exchange(
                read_seq,
                read_seq + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.popped += 1;
                    return Ok(Some(len));
                }
                // The writer evicted this element while we copied it; it
                // counts as dropped, not delivered.
                Err(_) => continue,
            }
        }
    }
}
