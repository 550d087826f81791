pub mod state;
pub use state::{State, Vec3};

/// Number of ring slots in the state bus segment. One slot is always kept
/// free, so the bus holds at most `STATE_QUEUE_SLOTS - 1` states.
pub const STATE_QUEUE_SLOTS: usize = 1024;

/// Segment name used by the helm and relay processes unless configured otherwise.
pub const STATE_SEGMENT_NAME: &str = "nautilus_state";
