use std::fmt;

use tracing::{debug, warn};

use crate::core::layout::{Layout, Ring};
use crate::core::{Segment, ShmemConfig};
use crate::errors::{Result, ShmemLibError};
use crate::reader::MessageReader;
use crate::writer::MessageWriter;

/// Per-handle counters. Nothing here is shared with the other process.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Successful pushes, with or without a drop.
    pub pushed: u64,
    /// Pushes that evicted the oldest unread element.
    pub dropped: u64,
    /// Elements delivered by `try_pop`/`pop_vec`.
    pub popped: u64,
    /// Slots found stale or overwritten and skipped by this handle.
    pub skipped: u64,
}

/// A process-local handle on a named shared-memory queue.
///
/// The queue is a bounded single-producer/single-consumer FIFO with a
/// drop-oldest policy: `push` never blocks and reports whether an
/// unread element had to be evicted, `try_pop` never blocks and
/// reports an empty queue as `Ok(None)`.
///
/// Every handle exposes both sides, but a queue supports exactly one
/// pushing handle and one popping handle at a time: by convention the
/// handle returned by [`SMQueue::create`] pushes and the ones returned by
/// [`SMQueue::open`] pop. A second concurrent pusher or popper corrupts
/// the sequence counters.
///
/// Dropping or closing a handle unmaps it; only [`SMQueue::destroy`]
/// removes the segment. Once a segment is destroyed, every handle still
/// mapping it fails `push`/`try_pop` with
/// [`ShmemLibError::SegmentUnavailable`].
pub struct SMQueue {
    writer: MessageWriter,
    reader: MessageReader,
    ring: Ring,
    segment: Segment,
}

// The mapping is valid at the same address from any thread of the
// process, and every operation that touches it takes `&mut self`.
unsafe impl Send for SMQueue {}

impl SMQueue {
    fn from_parts(segment: Segment, ring: Ring) -> SMQueue {
        SMQueue {
            writer: MessageWriter::new(ring),
            reader: MessageReader::new(ring),
            ring,
            segment,
        }
    }

    /// Creates a new queue. Fails with `AlreadyExists` if the name is taken.
    pub fn create(name: &str, max_elements: usize, element_size: usize) -> Result<SMQueue> {
        let layout = Layout::new(max_elements, element_size)?;
        let (segment, ring) = Segment::create(name, layout)?;
        Ok(SMQueue::from_parts(segment, ring))
    }

    pub fn create_from(cfg: &ShmemConfig) -> Result<SMQueue> {
        let layout = cfg.validate()?;
        let (segment, ring) = Segment::create(&cfg.name, layout)?;
        Ok(SMQueue::from_parts(segment, ring))
    }

    /// Opens an existing queue; capacity comes from its header.
    pub fn open(name: &str) -> Result<SMQueue> {
        let (segment, ring) = Segment::open(name)?;
        Ok(SMQueue::from_parts(segment, ring))
    }

    /// Unlinks the named queue. Destroying a missing queue succeeds.
    pub fn destroy(name: &str) -> Result<()> {
        Segment::destroy(name)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.ring.is_destroyed() {
            warn!(name = self.segment.name(), "queue segment was destroyed");
            return Err(ShmemLibError::SegmentUnavailable {
                name: self.segment.name().to_string(),
            });
        }
        Ok(())
    }

    /// Pushes one payload of at most `element_size` bytes.
    ///
    /// Returns `Ok(true)` if no element was dropped, `Ok(false)` if the
    /// oldest unread element was discarded to make room.
    ///
    /// Only one handle per queue may push. Pushing from a second handle,
    /// in this process or another, races on `write_seq` and the slots.
    pub fn push(&mut self, payload: &[u8]) -> Result<bool> {
        self.ensure_available()?;
        self.writer.push(payload)
    }

    /// Copies the oldest unread element into `buf` (which must hold
    /// `element_size` bytes) and returns its length, or `None` if empty.
    ///
    /// Only one handle per queue may pop at a time.
    pub fn try_pop(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        self.ensure_available()?;
        self.reader.try_pop(buf)
    }

    /// Like [`SMQueue::try_pop`] but returns an owned copy.
    pub fn pop_vec(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; self.element_size()];
        Ok(self.try_pop(&mut buf)?.map(|len| {
            buf.truncate(len);
            buf
        }))
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    pub fn element_size(&self) -> usize {
        self.ring.layout().element_size
    }

    pub fn max_elements(&self) -> usize {
        self.ring.layout().max_elements
    }

    /// Unread elements at the moment of the call.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_destroyed(&self) -> bool {
        self.ring.is_destroyed()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.writer.pushed(),
            dropped: self.writer.dropped(),
            popped: self.reader.popped(),
            skipped: self.reader.skipped(),
        }
    }

    /// Unmaps this handle. The segment stays alive for other processes.
    pub fn close(self) {
        debug!(name = self.name(), stats = ?self.stats(), "closing queue handle");
    }
}

impl fmt::Debug for SMQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SMQueue")
            .field("name", &self.name())
            .field("max_elements", &self.max_elements())
            .field("element_size", &self.element_size())
            .field("len", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}
