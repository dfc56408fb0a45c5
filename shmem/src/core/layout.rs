use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::errors::{Result, ShmemLibError};

/// "SMQUEUE1", read as a little-endian u64.
pub(crate) const MAGIC: u64 = u64::from_le_bytes(*b"SMQUEUE1");
pub(crate) const LAYOUT_VERSION: u32 = 1;

pub(crate) const SLOT_ALIGN: usize = 64;

const READY_BIT: u64 = 63;
const READY_MASK: u64 = 1 << READY_BIT;

/// Control block at offset 0 of every segment.
///
/// The immutable fields are written before `magic` is published with
/// release ordering; an opener must observe `magic` first.
#[repr(C)]
pub(crate) struct QueueHeader {
    pub magic: AtomicU64,
    pub version: u32,
    pub destroyed: AtomicU32,
    pub element_size: u64,
    pub max_elements: u64,
    pub slot_stride: u64,
    pub write_seq: CachePadded<AtomicU64>,
    pub read_seq: CachePadded<AtomicU64>,
}

/// Bookkeeping in front of each slot's payload bytes.
///
/// `state` packs the ready flag and the sequence id:
///
/// ```text
/// [ ready (1 bit, MSB) | sequence_id (63 bits) ]
/// ```
#[repr(C)]
pub(crate) struct SlotHeader {
    pub state: AtomicU64,
    pub len: AtomicU32,
    _pad: u32,
}

pub(crate) const HEADER_SIZE: usize = align_up(mem::size_of::<QueueHeader>(), SLOT_ALIGN);
pub(crate) const SLOT_HEADER_SIZE: usize = mem::size_of::<SlotHeader>();

#[inline]
const fn align_up(x: usize, a: usize) -> usize {
    (x + a - 1) & !(a - 1)
}

#[inline(always)]
pub(crate) fn pack_state(ready: bool, seq: u64) -> u64 {
    debug_assert!(seq < READY_MASK);
    seq | ((ready as u64) << READY_BIT)
}

#[inline(always)]
pub(crate) fn unpack_state(v: u64) -> (bool, u64) {
    (v & READY_MASK != 0, v & !READY_MASK)
}

/// Sizes derived from `(max_elements, element_size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub element_size: usize,
    pub max_elements: usize,
    pub slot_stride: usize,
    pub total_size: usize,
}

impl Layout {
    pub fn new(max_elements: usize, element_size: usize) -> Result<Layout> {
        let invalid = |reason| ShmemLibError::InvalidCapacity {
            max_elements,
            element_size,
            reason,
        };
        if max_elements == 0 {
            return Err(invalid("max_elements must be greater than zero"));
        }
        if element_size == 0 {
            return Err(invalid("element_size must be greater than zero"));
        }
        if element_size > u32::MAX as usize {
            return Err(invalid("element_size does not fit the 32-bit length field"));
        }
        let slot_stride = SLOT_HEADER_SIZE
            .checked_add(element_size)
            .and_then(|s| s.checked_add(SLOT_ALIGN - 1))
            .map(|s| s & !(SLOT_ALIGN - 1))
            .ok_or_else(|| invalid("slot size overflows"))?;
        let total_size = slot_stride
            .checked_mul(max_elements)
            .and_then(|s| s.checked_add(HEADER_SIZE))
            .ok_or_else(|| invalid("queue size too large, would overflow"))?;
        Ok(Layout {
            element_size,
            max_elements,
            slot_stride,
            total_size,
        })
    }
}

/// Raw view over a mapped segment: the header plus the slot array.
///
/// A `Ring` does not own the memory; whoever builds one must keep the
/// mapping alive for as long as the view is used.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ring {
    base: NonNull<u8>,
    layout: Layout,
}

impl Ring {
    /// Writes a fresh header and empty slots, then publishes the magic.
    ///
    /// `magic` and `destroyed` are left as found: a new object is
    /// zero-filled, and a `destroy` racing this call may already have set
    /// the flag.
    ///
    /// # Safety
    ///
    /// `base` must point to at least `layout.total_size` writable bytes
    /// aligned to `SLOT_ALIGN` and zero-filled. Only a racing `destroy` may
    /// touch it concurrently.
    pub unsafe fn init(base: NonNull<u8>, layout: Layout) -> Ring {
        let header = base.as_ptr().cast::<QueueHeader>();
        ptr::addr_of_mut!((*header).version).write(LAYOUT_VERSION);
        ptr::addr_of_mut!((*header).element_size).write(layout.element_size as u64);
        ptr::addr_of_mut!((*header).max_elements).write(layout.max_elements as u64);
        ptr::addr_of_mut!((*header).slot_stride).write(layout.slot_stride as u64);
        ptr::addr_of_mut!((*header).write_seq).write(CachePadded::new(AtomicU64::new(0)));
        ptr::addr_of_mut!((*header).read_seq).write(CachePadded::new(AtomicU64::new(0)));
        let ring = Ring { base, layout };
        for i in 0..layout.max_elements {
            let slot = ring.slot_ptr(i as u64).cast::<SlotHeader>();
            ptr::write(
                slot,
                SlotHeader {
                    state: AtomicU64::new(pack_state(false, 0)),
                    len: AtomicU32::new(0),
                    _pad: 0,
                },
            );
        }
        (*header).magic.store(MAGIC, Ordering::Release);
        ring
    }

    /// Reads and validates the header of an existing segment.
    ///
    /// # Safety
    ///
    /// `base` must point to `mapped_len` readable bytes aligned to
    /// `SLOT_ALIGN`.
    pub unsafe fn attach(name: &str, base: NonNull<u8>, mapped_len: usize) -> Result<Ring> {
        let incompatible = |reason: String| ShmemLibError::IncompatibleLayout {
            name: name.to_string(),
            reason,
        };
        if mapped_len < HEADER_SIZE {
            // The creator has not sized the object yet.
            return Err(ShmemLibError::NotFound {
                name: name.to_string(),
            });
        }
        let header = &*base.as_ptr().cast::<QueueHeader>();
        match header.magic.load(Ordering::Acquire) {
            0 => {
                return Err(ShmemLibError::NotFound {
                    name: name.to_string(),
                })
            }
            MAGIC => {}
            other => return Err(incompatible(format!("bad magic {:#018x}", other))),
        }
        if header.version != LAYOUT_VERSION {
            return Err(incompatible(format!(
                "version {} (expected {})",
                header.version, LAYOUT_VERSION
            )));
        }
        let layout = Layout::new(header.max_elements as usize, header.element_size as usize)
            .map_err(|e| incompatible(e.to_string()))?;
        if layout.slot_stride as u64 != header.slot_stride {
            return Err(incompatible(format!(
                "slot stride {} (expected {})",
                header.slot_stride, layout.slot_stride
            )));
        }
        if layout.total_size > mapped_len {
            return Err(incompatible(format!(
                "segment holds {} bytes, header declares {}",
                mapped_len, layout.total_size
            )));
        }
        Ok(Ring { base, layout })
    }

    #[inline(always)]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    #[inline(always)]
    pub fn header(&self) -> &QueueHeader {
        unsafe { &*self.base.as_ptr().cast::<QueueHeader>() }
    }

    #[inline(always)]
    fn slot_ptr(&self, seq: u64) -> *mut u8 {
        let index = (seq % self.layout.max_elements as u64) as usize;
        unsafe {
            self.base
                .as_ptr()
                .add(HEADER_SIZE + index * self.layout.slot_stride)
        }
    }

    /// Slot holding sequence number `seq`.
    #[inline(always)]
    pub fn slot(&self, seq: u64) -> &SlotHeader {
        unsafe { &*self.slot_ptr(seq).cast::<SlotHeader>() }
    }

    /// First payload byte of the slot holding `seq`; valid for
    /// `element_size` bytes.
    #[inline(always)]
    pub fn payload_ptr(&self, seq: u64) -> *mut u8 {
        unsafe { self.slot_ptr(seq).add(SLOT_HEADER_SIZE) }
    }

    /// Unread elements at the moment of the call.
    pub fn len(&self) -> usize {
        let header = self.header();
        let read = header.read_seq.load(Ordering::Acquire);
        let write = header.write_seq.load(Ordering::Acquire);
        write.saturating_sub(read) as usize
    }

    pub fn is_destroyed(&self) -> bool {
        self.header().destroyed.load(Ordering::Acquire) != 0
    }

    /// Sets the destroyed flag on a mapping whose header may still be
    /// under construction.
    ///
    /// Returns `false` when the mapping is too short to hold a header or
    /// carries a foreign magic, in which case nothing is written.
    ///
    /// # Safety
    ///
    /// `base` must point to `mapped_len` writable bytes aligned to
    /// `SLOT_ALIGN`.
    pub unsafe fn flag_destroyed(base: NonNull<u8>, mapped_len: usize) -> bool {
        if mapped_len < HEADER_SIZE {
            return false;
        }
        let header = &*base.as_ptr().cast::<QueueHeader>();
        match header.magic.load(Ordering::Acquire) {
            0 | MAGIC => {
                header.destroyed.store(1, Ordering::Release);
                true
            }
            _ => false,
        }
    }
}

/// Heap-backed ring for exercising the protocol without a segment.
#[cfg(test)]
pub(crate) struct HeapRing {
    _backing: Vec<CachePadded<[u8; SLOT_ALIGN]>>,
    pub ring: Ring,
}

#[cfg(test)]
impl HeapRing {
    pub fn new(max_elements: usize, element_size: usize) -> HeapRing {
        let heap = HeapRing::unpublished(max_elements, element_size);
        unsafe { Ring::init(heap.ring.base, heap.ring.layout) };
        heap
    }

    /// Zeroed backing sized for the layout, header not written yet.
    pub fn unpublished(max_elements: usize, element_size: usize) -> HeapRing {
        let layout = Layout::new(max_elements, element_size).unwrap();
        let chunks = layout.total_size / SLOT_ALIGN + 1;
        let mut backing = vec![CachePadded::new([0u8; SLOT_ALIGN]); chunks];
        let base = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap();
        HeapRing {
            _backing: backing,
            ring: Ring { base, layout },
        }
    }
}
