//! Shared-memory transport: one [`RingBuffer`] per named OS segment.
//!
//! # Lifecycle
//!
//! ```text
//!   absent ──create──▶ live ──cleanup──▶ absent
//!                       │ ▲
//!                       └─┘ open (another mapping, same state)
//! ```
//!
//! - `create` on a live name is rejected with [`ShmError::AlreadyExists`].
//!   Call `cleanup` first to replace a stale segment.
//! - Dropping a [`SharedQueue`] (or the transport) only releases this
//!   process's mapping. The OS object stays until someone calls
//!   [`ShmTransport::cleanup`]; forgetting to do so leaks it.
//! - The transport is only consulted at setup and teardown. `push`/`pop` go
//!   straight to the mapped ring.

use crate::error::{LayoutError, ShmError};
use crate::registry::SegmentRegistry;
use crate::ring::{Consumer, Producer, RingBuffer};
use crate::shm_layout::{SegmentHeader, bytes_for_ring, ring_offset};
use bytemuck::Pod;
use nautilus_shm::ShmSegment;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Creates, opens and removes shared queue segments, and owns the
/// process-local registry that keeps their mappings alive.
#[derive(Debug, Default)]
pub struct ShmTransport {
    registry: SegmentRegistry,
}

/// Handle to a ring living in a shared segment.
///
/// Not `Clone`: within a process each handle is a single producer/consumer
/// pair. Another process (or another `open` in this one) gets its own handle
/// to the same ring; running two producers or two consumers against one
/// segment is undefined behaviour.
pub struct SharedQueue<T: Pod, const N: usize> {
    segment: Arc<ShmSegment>,
    ring: NonNull<RingBuffer<T, N>>,
    _pd: PhantomData<T>,
}

// SAFETY: the handle owns a reference to the mapping; the ring inside is Sync
// for `T: Send`, and mutation goes through `&mut self`.
unsafe impl<T: Pod + Send, const N: usize> Send for SharedQueue<T, N> {}

impl ShmTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &SegmentRegistry {
        &self.registry
    }

    /// Creates segment `name`, constructs an empty `RingBuffer<T, N>` in it
    /// and returns a handle.
    ///
    /// # Errors
    /// - [`ShmError::AlreadyExists`] if `name` is live
    /// - [`ShmError::InvalidName`] for empty names or names containing `/`
    /// - [`ShmError::Os`] if the OS cannot allocate or map the region
    pub fn create<T: Pod, const N: usize>(&self, name: &str) -> Result<SharedQueue<T, N>, ShmError> {
        let bytes = bytes_for_ring::<T, N>();
        let segment = ShmSegment::create(name, bytes).map_err(|e| {
            warn!(segment = name, error = %e, "failed to create shared queue");
            ShmError::from_io(name, e)
        })?;

        let base = segment.as_ptr();
        // SAFETY: we just created the segment with O_EXCL and sized it for the
        // header plus ring; nobody can have validated it yet because the magic
        // is only published below. The mapping is page aligned.
        let header = unsafe {
            let header = base as *mut SegmentHeader;
            SegmentHeader::init::<T, N>(header);
            RingBuffer::<T, N>::init_in_place(base.add(ring_offset::<T, N>()) as *mut RingBuffer<T, N>);
            &*header
        };
        header.publish();

        let queue = self.attach::<T, N>(segment);
        info!(
            segment = name,
            bytes,
            slots = N,
            elem_size = size_of::<T>(),
            "created shared queue"
        );
        Ok(queue)
    }

    /// Maps existing segment `name` and returns a handle to the ring inside.
    ///
    /// # Errors
    /// - [`ShmError::NotFound`] if no segment `name` exists
    /// - [`ShmError::Layout`] if the segment does not hold a published
    ///   `RingBuffer<T, N>` (wrong type, wrong slot count, or its creator
    ///   has not finished sizing or constructing it; the last two are worth
    ///   retrying)
    /// - [`ShmError::Os`] for other mapping failures
    pub fn open<T: Pod, const N: usize>(&self, name: &str) -> Result<SharedQueue<T, N>, ShmError> {
        let segment = ShmSegment::open(name).map_err(|e| match e.kind() {
            // Created but not sized yet: same retryable class as an unpublished header.
            std::io::ErrorKind::UnexpectedEof => ShmError::Layout {
                name: name.to_string(),
                source: LayoutError::Truncated {
                    mapped: 0,
                    required: bytes_for_ring::<T, N>() as u64,
                },
            },
            _ => ShmError::from_io(name, e),
        })?;

        let header_fits = segment.len() >= size_of::<SegmentHeader>();
        let validated = if header_fits {
            // SAFETY: the mapping is page aligned and large enough for a header.
            let header = unsafe { &*(segment.as_ptr() as *const SegmentHeader) };
            header.validate::<T, N>(segment.len())
        } else {
            Err(LayoutError::Truncated {
                mapped: segment.len() as u64,
                required: bytes_for_ring::<T, N>() as u64,
            })
        };
        if let Err(source) = validated {
            warn!(segment = name, error = %source, "rejected shared queue layout");
            return Err(ShmError::Layout {
                name: name.to_string(),
                source,
            });
        }

        let queue = self.attach::<T, N>(segment);
        info!(segment = name, "opened shared queue");
        Ok(queue)
    }

    /// Forgets this process's registry entry for `name`. The OS object and
    /// any outstanding handles are unaffected.
    pub fn close(&self, name: &str) -> bool {
        let removed = self.registry.remove(name);
        debug!(segment = name, removed, "closed shared queue mapping");
        removed
    }

    /// Forgets the registry entry and removes `name` from the OS namespace.
    ///
    /// Returns `Ok(false)` if there was no OS object to remove. Mappings made
    /// before this call stay valid but orphaned; later `open(name)` calls
    /// fail with [`ShmError::NotFound`].
    pub fn cleanup(&self, name: &str) -> Result<bool, ShmError> {
        self.registry.remove(name);
        match ShmSegment::unlink(name) {
            Ok(()) => {
                info!(segment = name, "removed shared queue");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(segment = name, "cleanup found no shared queue");
                Ok(false)
            }
            Err(e) => {
                warn!(segment = name, error = %e, "failed to remove shared queue");
                Err(ShmError::from_io(name, e))
            }
        }
    }

    fn attach<T: Pod, const N: usize>(&self, segment: ShmSegment) -> SharedQueue<T, N> {
        let () = RingBuffer::<T, N>::VALID_CAPACITY;
        let segment = Arc::new(segment);
        if self.registry.insert(segment.clone()).is_some() {
            debug!(segment = segment.name(), "replaced registered mapping");
        }

        // SAFETY: offset validated (or written) against this exact `T`/`N`,
        // and the base of a mapping is never null.
        let ring = unsafe {
            NonNull::new_unchecked(segment.as_ptr().add(ring_offset::<T, N>()) as *mut RingBuffer<T, N>)
        };
        SharedQueue {
            segment,
            ring,
            _pd: PhantomData,
        }
    }
}

impl<T: Pod, const N: usize> SharedQueue<T, N> {
    #[inline(always)]
    fn ring(&self) -> &RingBuffer<T, N> {
        // SAFETY: `segment` keeps the mapping alive for as long as `self`.
        unsafe { self.ring.as_ref() }
    }

    /// Non-blocking push; `false` means the ring was full and nothing changed.
    #[inline]
    pub fn push(&mut self, item: T) -> bool {
        // SAFETY: `&mut self` on a non-Clone handle makes us this process's
        // only producer for this handle.
        unsafe { self.ring().push_unchecked(item) }
    }

    /// Non-blocking pop; `None` means the ring was empty.
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        // SAFETY: as for `push`, on the consumer side.
        unsafe { self.ring().pop_unchecked() }
    }

    /// Splits the handle into producer and consumer halves for two threads.
    pub fn split(&mut self) -> (Producer<'_, T, N>, Consumer<'_, T, N>) {
        let ring = self.ring();
        // SAFETY: the exclusive borrow of the handle rules out any other
        // push/pop through it while the halves live.
        unsafe { (Producer::new_unchecked(ring), Consumer::new_unchecked(ring)) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ring().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ring().is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.ring().is_full()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring().capacity()
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// True once this handle's name no longer refers to its segment: the
    /// name was removed, or removed and created again by someone else.
    ///
    /// Only stats the name; nothing is mapped or registered.
    pub fn is_orphaned(&self) -> Result<bool, ShmError> {
        let current = ShmSegment::lookup(self.name()).map_err(|e| ShmError::from_io(self.name(), e))?;
        Ok(current != Some(self.segment.id()))
    }
}

impl<T: Pod, const N: usize> std::fmt::Debug for SharedQueue<T, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedQueue")
            .field("name", &self.name())
            .field("slots", &N)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nautilus_state::State;

    fn test_name(label: &str) -> String {
        format!("nq_{label}_{}", std::process::id())
    }

    fn sample_state(x: f64) -> State {
        State::new([x, 2.0, 3.0], [0.1, 0.2, 0.3], [0.0, 5.0, 90.0], [0.0, 0.0, 0.1])
    }

    #[test]
    fn create_then_open_share_one_ring() {
        let t = ShmTransport::new();
        let name = test_name("share");
        let mut a = t.create::<State, 16>(&name).expect("create");
        let mut b = t.open::<State, 16>(&name).expect("open");

        let x = sample_state(1.5);
        assert!(a.push(x));
        assert_eq!(b.len(), 1);
        let got = b.pop().expect("state");
        assert_eq!(got.as_bytes(), x.as_bytes());

        let mut y = got;
        y.position[0] = 10.0;
        assert!(b.push(y));
        assert_eq!(a.pop(), Some(y));
        assert_eq!(a.pop(), None);

        assert!(t.cleanup(&name).expect("cleanup"));
    }

    #[test]
    fn shared_ring_holds_slots_minus_one() {
        let t = ShmTransport::new();
        let name = test_name("full");
        let mut q = t.create::<u64, 8>(&name).expect("create");
        assert_eq!(q.capacity(), 7);
        for i in 0..7 {
            assert!(q.push(i));
        }
        assert!(q.is_full());
        assert!(!q.push(99));
        for i in 0..7 {
            assert_eq!(q.pop(), Some(i));
        }
        assert!(q.is_empty());
        t.cleanup(&name).expect("cleanup");
    }

    #[test]
    fn create_on_live_name_is_rejected() {
        let t = ShmTransport::new();
        let name = test_name("dup");
        let _q = t.create::<u64, 8>(&name).expect("create");
        let err = t.create::<u64, 8>(&name).unwrap_err();
        assert!(matches!(err, ShmError::AlreadyExists { .. }), "{err:?}");
        t.cleanup(&name).expect("cleanup");
    }

    #[test]
    fn open_missing_is_not_found() {
        let t = ShmTransport::new();
        let err = t.open::<u64, 8>(&test_name("missing")).unwrap_err();
        assert!(matches!(err, ShmError::NotFound { .. }), "{err:?}");
    }

    #[test]
    fn cleanup_orphans_mapping_and_frees_name() {
        let t = ShmTransport::new();
        let name = test_name("orphan");
        let mut q = t.create::<u64, 8>(&name).expect("create");
        assert!(t.registry().contains(&name));

        assert!(t.cleanup(&name).expect("cleanup"));
        assert!(!t.registry().contains(&name));
        assert!(matches!(t.open::<u64, 8>(&name), Err(ShmError::NotFound { .. })));
        assert!(!t.cleanup(&name).expect("second cleanup"));

        // the orphaned view still works
        assert!(q.push(3));
        assert_eq!(q.pop(), Some(3));

        // and the name is reusable
        let _fresh = t.create::<u64, 8>(&name).expect("recreate");
        t.cleanup(&name).expect("cleanup");
    }

    #[test]
    fn registry_keeps_mapping_after_handle_drop() {
        let t = ShmTransport::new();
        let name = test_name("keep");
        {
            let mut q = t.create::<u64, 8>(&name).expect("create");
            assert!(q.push(11));
        }
        assert!(t.registry().contains(&name));
        assert!(t.close(&name));
        assert!(!t.close(&name));

        // closing is local: the segment and its contents survive
        let mut q = t.open::<u64, 8>(&name).expect("reopen");
        assert_eq!(q.pop(), Some(11));
        t.cleanup(&name).expect("cleanup");
    }

    #[test]
    fn open_with_wrong_shape_is_rejected() {
        let t = ShmTransport::new();
        let name = test_name("shape");
        let _q = t.create::<State, 16>(&name).expect("create");

        match t.open::<State, 32>(&name) {
            Err(ShmError::Layout { source, .. }) => {
                assert!(matches!(source, LayoutError::SlotCountMismatch { .. }))
            }
            other => panic!("unexpected {other:?}"),
        }
        match t.open::<u64, 16>(&name) {
            Err(ShmError::Layout { source, .. }) => {
                assert!(matches!(source, LayoutError::ElementMismatch { .. }))
            }
            other => panic!("unexpected {other:?}"),
        }
        t.cleanup(&name).expect("cleanup");
    }

    #[test]
    fn foreign_segment_is_rejected() {
        let t = ShmTransport::new();
        let name = test_name("foreign");
        // a zero-filled segment that nobody initialized as a queue
        let raw = ShmSegment::create(&name, 4096).expect("raw segment");
        let err = t.open::<u64, 8>(&name).unwrap_err();
        assert!(
            matches!(err, ShmError::Layout { source: LayoutError::BadMagic { found: 0 }, .. }),
            "{err:?}"
        );
        drop(raw);
        ShmSegment::unlink(&name).expect("unlink");
    }

    #[test]
    fn unsized_segment_is_retryable_layout_error() {
        let t = ShmTransport::new();
        let name = test_name("unsized");
        // what a creator has made between shm_open and sizing the object
        let os = std::ffi::CString::new(format!("/{name}")).expect("name");
        let fd = unsafe { libc::shm_open(os.as_ptr(), libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, 0o600) };
        assert!(fd >= 0, "raw shm_open failed");
        unsafe { libc::close(fd) };

        match t.open::<State, 1024>(&name) {
            Err(ShmError::Layout { source, .. }) => assert_eq!(
                source,
                LayoutError::Truncated {
                    mapped: 0,
                    required: bytes_for_ring::<State, 1024>() as u64,
                }
            ),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!t.registry().contains(&name));
        assert!(t.cleanup(&name).expect("cleanup"));
    }

    #[test]
    fn orphaned_after_cleanup_or_recreate() {
        let t = ShmTransport::new();
        let name = test_name("orphaned");
        let old = t.create::<u64, 8>(&name).expect("create");
        let reader = t.open::<u64, 8>(&name).expect("open");
        assert!(!old.is_orphaned().expect("check"));
        assert!(!reader.is_orphaned().expect("check"));

        t.cleanup(&name).expect("cleanup");
        assert!(reader.is_orphaned().expect("check"));

        // a restarted producer reusing the name does not revive old handles
        let fresh = t.create::<u64, 8>(&name).expect("recreate");
        assert!(reader.is_orphaned().expect("check"));
        assert!(old.is_orphaned().expect("check"));
        assert!(!fresh.is_orphaned().expect("check"));
        t.cleanup(&name).expect("cleanup");
    }

    #[test]
    fn invalid_name() {
        let t = ShmTransport::new();
        assert!(matches!(
            t.create::<u64, 8>("bad/name"),
            Err(ShmError::InvalidName { .. })
        ));
    }

    #[test]
    fn split_shared_handle_across_threads() {
        const COUNT: u64 = 20_000;
        let t = ShmTransport::new();
        let name = test_name("split");
        let mut q = t.create::<u64, 64>(&name).expect("create");
        let (mut tx, mut rx) = q.split();

        std::thread::scope(|s| {
            s.spawn(move || {
                for i in 0..COUNT {
                    while !tx.push(i) {
                        std::hint::spin_loop();
                    }
                }
            });
            let mut expected = 0;
            while expected < COUNT {
                if let Some(v) = rx.pop() {
                    assert_eq!(v, expected);
                    expected += 1;
                }
            }
        });
        t.cleanup(&name).expect("cleanup");
    }
}
