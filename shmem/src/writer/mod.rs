use std::ptr;
use std::sync::atomic::{fence, Ordering};

use tracing::trace;

use super::core::layout::{pack_state, Ring};
use super::errors::{Result, ShmemLibError};

/// Producer half of the ring protocol.
///
/// Only one `MessageWriter` may push into a segment at a time: it is the
/// sole writer of `write_seq` and of slot contents. `read_seq` is shared
/// with the reader and only ever moved forward by compare-and-swap.
pub struct MessageWriter {
    ring: Ring,
    pushed: u64,
    dropped: u64,
}

impl MessageWriter {
    pub(crate) fn new(ring: Ring) -> MessageWriter {
        MessageWriter {
            ring,
            pushed: 0,
            dropped: 0,
        }
    }

    pub fn pushed(&self) -> u64 {
        self.pushed
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Evicts the oldest unread element if the ring is full.
    ///
    /// Returns `true` if an element was evicted.
    #[inline]
    fn make_room(&self, write_seq: u64) -> bool {
        let header = self.ring.header();
        let capacity = self.ring.layout().max_elements as u64;
        let mut read_seq = header.read_seq.load(Ordering::Acquire);
        loop {
            if write_seq - read_seq < capacity {
                return false;
            }
            match header.read_seq.compare_exchange(
                read_seq,
                read_seq + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                // The reader consumed something meanwhile.
                Err(current) => read_seq = current,
            }
        }
    }

    /// Copies `message` into the next slot.
    ///
    /// Returns `Ok(true)` if nothing was dropped and `Ok(false)` if the
    /// oldest unread element was discarded to make room. Never blocks.
    pub fn push(&mut self, message: &[u8]) -> Result<bool> {
        let element_size = self.ring.layout().element_size;
        if message.len() > element_size {
            return Err(ShmemLibError::PayloadTooLarge {
                len: message.len(),
                element_size,
            });
        }
        let header = self.ring.header();
        let seq = header.write_seq.load(Ordering::Relaxed);
        let dropped = self.make_room(seq);

        let slot = self.ring.slot(seq);
        slot.state.store(pack_state(false, seq), Ordering::Relaxed);
        // Readers must see the cleared flag before any payload byte changes.
        fence(Ordering::Release);
        unsafe {
            ptr::copy_nonoverlapping(message.as_ptr(), self.ring.payload_ptr(seq), message.len());
        }
        slot.len.store(message.len() as u32, Ordering::Relaxed);
        slot.state.store(pack_state(true, seq), Ordering::Release);
        header.write_seq.store(seq + 1, Ordering::Release);

        self.pushed += 1;
        if dropped {
            self.dropped += 1;
            trace!(seq, evicted = seq - self.ring.layout().max_elements as u64, "queue full, dropped oldest");
        }
        Ok(!dropped)
    }
}
