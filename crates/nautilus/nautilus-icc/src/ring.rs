//! Bounded single-producer, single-consumer (SPSC) ring buffer.
//!
//! The ring is a data-only structure: it can live on the stack, on the heap,
//! or be constructed in place inside a shared-memory segment (see
//! [`crate::ShmTransport`]). The indexing and ordering algorithm is the same
//! in every case.
//!
//! # Design
//! - `N` slots, `N` a power of two, indices kept modulo `N` with a bitmask.
//! - One slot is always left free: `head == tail` means empty and
//!   `head + 1 == tail` (mod `N`) means full, so only `N - 1` items fit.
//! - `head` and `tail` sit in separate cache-line-padded regions so the
//!   producer and consumer cores never invalidate each other's line just by
//!   advancing their own index.
//!
//! # Memory Ordering
//! - Producer writes the slot, then publishes `head` with `Release`.
//!   The consumer loads `head` with `Acquire` and therefore sees the payload.
//! - Consumer copies the slot out, then publishes `tail` with `Release`.
//!   The producer loads `tail` with `Acquire` before reusing that slot.
//!
//! # Roles
//! Exactly one producer and one consumer. In-process this is enforced by the
//! API: [`RingBuffer::push`]/[`RingBuffer::pop`] need `&mut self`, and
//! [`RingBuffer::split`] hands out one non-`Clone` [`Producer`] and one
//! non-`Clone` [`Consumer`]. Two processes each pushing into the same shared
//! segment cannot be detected and is undefined behaviour.
//!
//! # Capacity
//! A capacity that is not a power of two (or is smaller than 2) is rejected at
//! compile time:
//!
//! ```compile_fail
//! use nautilus_icc::RingBuffer;
//! let _ring = RingBuffer::<u64, 6>::new();
//! ```
//!
//! ```
//! use nautilus_icc::RingBuffer;
//! let mut ring = RingBuffer::<u64, 8>::new();
//! assert!(ring.push(10));
//! assert_eq!(ring.pop(), Some(10));
//! assert_eq!(ring.pop(), None);
//! ```

use bytemuck::Pod;
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Fixed-capacity lock-free SPSC queue of plain-old-data values.
///
/// # Type Parameters
/// - `T`: element type. `Pod` guarantees a fixed layout with no pointers or
///   owned resources, so a raw byte copy is always a valid value, even when
///   read back by a process that does not share the writer's address space.
/// - `N`: number of slots. Must be a power of two, at least 2.
///
/// # Representation
/// `#[repr(C)]`: padded `head`, padded `tail`, then the slots. This placement
/// is part of the shared-memory wire contract.
#[repr(C)]
pub struct RingBuffer<T: Pod, const N: usize> {
    /// Next slot the producer writes. Only the producer stores to it.
    head: CachePadded<AtomicU64>,
    /// Next slot the consumer reads. Only the consumer stores to it.
    tail: CachePadded<AtomicU64>,
    slots: [UnsafeCell<MaybeUninit<T>>; N],
}

// SAFETY: slots are only touched through the producer/consumer protocol
// below; all shared-reference methods are atomic loads.
unsafe impl<T: Pod + Send, const N: usize> Sync for RingBuffer<T, N> {}

impl<T: Pod, const N: usize> RingBuffer<T, N> {
    /// Evaluated once per instantiation; a bad `N` is a compile error.
    pub(crate) const VALID_CAPACITY: () = assert!(
        N >= 2 && N.is_power_of_two(),
        "RingBuffer slot count must be a power of two and at least 2"
    );

    /// `index = seq & MASK` replaces `seq % N`.
    const MASK: u64 = (N as u64).wrapping_sub(1);

    /// Total number of slots, including the one that is always kept free.
    pub const SLOTS: usize = N;

    /// Creates an empty ring.
    pub fn new() -> Self {
        let () = Self::VALID_CAPACITY;
        Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            slots: std::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
        }
    }

    /// Initializes an empty ring in place, leaving the slot memory untouched.
    ///
    /// # Safety
    /// `dst` must be valid for writes of `size_of::<Self>()` bytes, suitably
    /// aligned, and not accessed by anyone else until this returns.
    pub(crate) unsafe fn init_in_place(dst: *mut Self) {
        let () = Self::VALID_CAPACITY;
        // SAFETY: guaranteed by the caller; slots are MaybeUninit and need no init.
        unsafe {
            ptr::addr_of_mut!((*dst).head).write(CachePadded::new(AtomicU64::new(0)));
            ptr::addr_of_mut!((*dst).tail).write(CachePadded::new(AtomicU64::new(0)));
        }
    }

    /// Pushes `item` if there is room.
    ///
    /// Returns `false` (and leaves the ring untouched) when the ring is full.
    #[inline]
    pub fn push(&mut self, item: T) -> bool {
        // SAFETY: `&mut self` makes us the only producer.
        unsafe { self.push_unchecked(item) }
    }

    /// Pops the oldest item, or `None` if the ring is empty.
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        // SAFETY: `&mut self` makes us the only consumer.
        unsafe { self.pop_unchecked() }
    }

    /// Splits the ring into its producer and consumer halves.
    ///
    /// The exclusive borrow guarantees these are the only two handles for as
    /// long as they live. Each half is `Send`, so it can move to its own
    /// thread (e.g. with [`std::thread::scope`]).
    pub fn split(&mut self) -> (Producer<'_, T, N>, Consumer<'_, T, N>) {
        let ring: &Self = self;
        (Producer { ring }, Consumer { ring })
    }

    /// Producer side of the protocol.
    ///
    /// # Protocol Steps
    /// 1. Load own `head` (Relaxed: only we store it)
    /// 2. Load `tail` with Acquire; if `head + 1 == tail` the ring is full
    /// 3. Write the payload into slot `head`
    /// 4. Store `head + 1` with Release, publishing the payload
    ///
    /// # Safety
    /// The caller must be the only thread/process calling this on this ring.
    #[inline]
    pub(crate) unsafe fn push_unchecked(&self, item: T) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let next = head.wrapping_add(1) & Self::MASK;
        if next == self.tail.load(Ordering::Acquire) {
            return false;
        }

        let idx = (head & Self::MASK) as usize;
        // SAFETY: the consumer never reads slot `head` until it observes the
        // Release store below, and we are the only producer.
        unsafe { (*self.slots[idx].get()).write(item) };

        self.head.store(next, Ordering::Release);
        true
    }

    /// Consumer side of the protocol.
    ///
    /// # Protocol Steps
    /// 1. Load own `tail` (Relaxed: only we store it)
    /// 2. Load `head` with Acquire; if equal to `tail` the ring is empty
    /// 3. Copy the payload out of slot `tail`
    /// 4. Store `tail + 1` with Release, handing the slot back to the producer
    ///
    /// # Safety
    /// The caller must be the only thread/process calling this on this ring.
    #[inline]
    pub(crate) unsafe fn pop_unchecked(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }

        let idx = (tail & Self::MASK) as usize;
        // SAFETY: the Acquire load of `head` synchronized with the producer's
        // Release, so slot `tail` is fully written and the producer won't
        // touch it until it sees our Release store below.
        let item = unsafe { (*self.slots[idx].get()).assume_init_read() };

        self.tail.store(tail.wrapping_add(1) & Self::MASK, Ordering::Release);
        Some(item)
    }

    /// Number of items currently queued.
    ///
    /// Exact when called by the producer or consumer between their own
    /// operations; otherwise a snapshot that may already be stale.
    #[inline]
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (head.wrapping_sub(tail) & Self::MASK) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Maximum number of items the ring can hold: `N - 1`.
    #[inline]
    pub const fn capacity(&self) -> usize {
        N - 1
    }
}

impl<T: Pod, const N: usize> Default for RingBuffer<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Pod, const N: usize> std::fmt::Debug for RingBuffer<T, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("slots", &N)
            .field("len", &self.len())
            .finish()
    }
}

/// The single write handle of a ring. Not `Clone`.
pub struct Producer<'a, T: Pod, const N: usize> {
    ring: &'a RingBuffer<T, N>,
}

/// The single read handle of a ring. Not `Clone`.
pub struct Consumer<'a, T: Pod, const N: usize> {
    ring: &'a RingBuffer<T, N>,
}

impl<'a, T: Pod, const N: usize> Producer<'a, T, N> {
    /// Wraps a ring whose producer role the caller owns.
    ///
    /// # Safety
    /// No other producer may exist for `ring` while this one is alive.
    pub(crate) unsafe fn new_unchecked(ring: &'a RingBuffer<T, N>) -> Self {
        Self { ring }
    }

    /// Non-blocking push; `false` means the ring was full and nothing changed.
    #[inline]
    pub fn push(&mut self, item: T) -> bool {
        // SAFETY: a Producer is the unique producer handle.
        unsafe { self.ring.push_unchecked(item) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

impl<'a, T: Pod, const N: usize> Consumer<'a, T, N> {
    /// Wraps a ring whose consumer role the caller owns.
    ///
    /// # Safety
    /// No other consumer may exist for `ring` while this one is alive.
    pub(crate) unsafe fn new_unchecked(ring: &'a RingBuffer<T, N>) -> Self {
        Self { ring }
    }

    /// Non-blocking pop; `None` means the ring was empty.
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        // SAFETY: a Consumer is the unique consumer handle.
        unsafe { self.ring.pop_unchecked() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}
