//! Lock-free SPSC queues for fixed-size records, in-process or across
//! processes through a named shared-memory segment.
//!
//! - [`RingBuffer`]: the queue itself, usable on the stack or heap.
//! - [`ShmTransport`]: places one `RingBuffer` in a named OS segment
//!   (`create` / `open` / `close` / `cleanup`) and hands out [`SharedQueue`]s.

mod error;
mod registry;
mod ring;
mod shm_layout;
mod transport;

pub use error::{LayoutError, ShmError};
pub use registry::SegmentRegistry;
pub use ring::{Consumer, Producer, RingBuffer};
pub use shm_layout::{SEGMENT_MAGIC, SEGMENT_VERSION, SegmentHeader, bytes_for_ring};
pub use transport::{SharedQueue, ShmTransport};
