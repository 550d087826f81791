//! Binary layout of a shared-memory queue segment.
//!
//! # Memory Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                       SegmentHeader                            │
//! │  magic (atomic) │ version │ slot_count │ elem_size │ elem_align│
//! │  ring_offset    │ total_size                                   │
//! ├──────────── padding up to align_of::<RingBuffer> ──────────────┤
//! │                     RingBuffer<T, N>                           │
//! │  ┌──────────────────────────┐                                  │
//! │  │ head: AtomicU64 (padded) │  one cache line (or two)         │
//! │  ├──────────────────────────┤                                  │
//! │  │ tail: AtomicU64 (padded) │  one cache line (or two)         │
//! │  ├──────────────────────────┤                                  │
//! │  │ slots[0..N]: T           │                                  │
//! │  └──────────────────────────┘                                  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Two implementations sharing a segment must agree on every header field.
//! The `magic` field doubles as the "initialized" flag: the creator writes it
//! last with `Release`, so an opener that reads it with `Acquire` also sees a
//! fully constructed ring.

use crate::error::LayoutError;
use crate::ring::RingBuffer;
use bytemuck::Pod;
use std::mem::{align_of, size_of};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

/// ASCII "NAUTSPSC" read as a big-endian u64.
pub const SEGMENT_MAGIC: u64 = u64::from_be_bytes(*b"NAUTSPSC");

/// Bump on any incompatible change to the header or ring layout.
pub const SEGMENT_VERSION: u64 = 1;

/// Header at offset 0 of every queue segment.
#[repr(C)]
pub struct SegmentHeader {
    /// `SEGMENT_MAGIC` once the segment is ready, 0 before.
    pub magic: AtomicU64,
    pub version: u64,
    /// Ring slots (`N`), a power of two.
    pub slot_count: u64,
    pub elem_size: u64,
    pub elem_align: u64,
    /// Byte offset of the `RingBuffer` from the start of the segment.
    pub ring_offset: u64,
    /// Bytes the creator sized the segment to.
    pub total_size: u64,
}

impl SegmentHeader {
    /// Writes an unpublished header (magic = 0) describing `RingBuffer<T, N>`.
    ///
    /// # Safety
    /// `dst` must be valid for writes of a `SegmentHeader` and 8-byte aligned.
    pub(crate) unsafe fn init<T: Pod, const N: usize>(dst: *mut SegmentHeader) {
        // SAFETY: guaranteed by the caller.
        unsafe {
            ptr::write(
                dst,
                SegmentHeader {
                    magic: AtomicU64::new(0),
                    version: SEGMENT_VERSION,
                    slot_count: N as u64,
                    elem_size: size_of::<T>() as u64,
                    elem_align: align_of::<T>() as u64,
                    ring_offset: ring_offset::<T, N>() as u64,
                    total_size: bytes_for_ring::<T, N>() as u64,
                },
            );
        }
    }

    /// Marks the segment as fully constructed.
    pub(crate) fn publish(&self) {
        self.magic.store(SEGMENT_MAGIC, Ordering::Release);
    }

    /// Checks that this header describes a `RingBuffer<T, N>` that fits in
    /// `mapped_len` bytes.
    pub fn validate<T: Pod, const N: usize>(&self, mapped_len: usize) -> Result<(), LayoutError> {
        let magic = self.magic.load(Ordering::Acquire);
        if magic != SEGMENT_MAGIC {
            return Err(LayoutError::BadMagic { found: magic });
        }
        if self.version != SEGMENT_VERSION {
            return Err(LayoutError::VersionMismatch {
                found: self.version,
                expected: SEGMENT_VERSION,
            });
        }
        if self.slot_count != N as u64 {
            return Err(LayoutError::SlotCountMismatch {
                found: self.slot_count,
                expected: N as u64,
            });
        }
        if self.elem_size != size_of::<T>() as u64 || self.elem_align != align_of::<T>() as u64 {
            return Err(LayoutError::ElementMismatch {
                found_size: self.elem_size,
                found_align: self.elem_align,
                expected_size: size_of::<T>() as u64,
                expected_align: align_of::<T>() as u64,
            });
        }
        if self.ring_offset != ring_offset::<T, N>() as u64 {
            return Err(LayoutError::OffsetMismatch {
                found: self.ring_offset,
                expected: ring_offset::<T, N>() as u64,
            });
        }

        let required = bytes_for_ring::<T, N>() as u64;
        if (mapped_len as u64) < required || self.total_size < required {
            return Err(LayoutError::Truncated {
                mapped: mapped_len as u64,
                required,
            });
        }
        Ok(())
    }
}

/// Offset of the ring: header size rounded up to the ring's alignment.
pub fn ring_offset<T: Pod, const N: usize>() -> usize {
    size_of::<SegmentHeader>().next_multiple_of(align_of::<RingBuffer<T, N>>())
}

/// Total bytes of a segment holding one `RingBuffer<T, N>`.
///
/// ```
/// use nautilus_icc::{RingBuffer, bytes_for_ring};
///
/// let bytes = bytes_for_ring::<u64, 1024>();
/// let ring = size_of::<RingBuffer<u64, 1024>>();
/// assert!(bytes > ring && bytes - ring < 4096);
/// ```
pub fn bytes_for_ring<T: Pod, const N: usize>() -> usize {
    ring_offset::<T, N>() + size_of::<RingBuffer<T, N>>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nautilus_state::{STATE_QUEUE_SLOTS, State};

    fn header_for<T: Pod, const N: usize>() -> Box<SegmentHeader> {
        let mut h = Box::new(SegmentHeader {
            magic: AtomicU64::new(0xdead),
            version: 0,
            slot_count: 0,
            elem_size: 0,
            elem_align: 0,
            ring_offset: 0,
            total_size: 0,
        });
        unsafe { SegmentHeader::init::<T, N>(&mut *h) };
        h
    }

    #[test]
    fn magic_spells_name() {
        assert_eq!(&SEGMENT_MAGIC.to_be_bytes(), b"NAUTSPSC");
    }

    #[test]
    fn state_segment_size() {
        let bytes = bytes_for_ring::<State, STATE_QUEUE_SLOTS>();
        let slots = STATE_QUEUE_SLOTS * size_of::<State>();
        assert!(bytes > slots);
        // header plus two padded indices stay well under a page
        assert!(bytes - slots < 4096, "overhead {}", bytes - slots);
        let align = align_of::<RingBuffer<State, STATE_QUEUE_SLOTS>>();
        assert_eq!(ring_offset::<State, STATE_QUEUE_SLOTS>() % align, 0);
    }

    #[test]
    fn unpublished_header_is_rejected() {
        let h = header_for::<State, 8>();
        assert_eq!(
            h.validate::<State, 8>(bytes_for_ring::<State, 8>()),
            Err(LayoutError::BadMagic { found: 0 })
        );
        h.publish();
        assert_eq!(h.validate::<State, 8>(bytes_for_ring::<State, 8>()), Ok(()));
    }

    #[test]
    fn mismatches_are_reported() {
        let h = header_for::<State, 8>();
        h.publish();
        let len = bytes_for_ring::<State, 8>();

        assert!(matches!(
            h.validate::<State, 16>(len),
            Err(LayoutError::SlotCountMismatch { found: 8, expected: 16 })
        ));
        assert!(matches!(
            h.validate::<[f64; 6], 8>(len),
            Err(LayoutError::ElementMismatch { found_size: 96, expected_size: 48, .. })
        ));
        assert!(matches!(
            h.validate::<State, 8>(len - 1),
            Err(LayoutError::Truncated { .. })
        ));
    }

    #[test]
    fn version_bump_is_rejected() {
        let mut h = header_for::<u64, 8>();
        h.publish();
        h.version = SEGMENT_VERSION + 1;
        assert!(matches!(
            h.validate::<u64, 8>(bytes_for_ring::<u64, 8>()),
            Err(LayoutError::VersionMismatch { .. })
        ));
    }
}
