//! Process-local table of live segment mappings, keyed by segment name.
//!
//! The registry keeps a mapping alive after the handle that created or opened
//! it is dropped, until the owner calls `close` or `cleanup` on the
//! transport. It is never shared across processes.

use nautilus_shm::ShmSegment;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct SegmentRegistry {
    entries: Mutex<HashMap<String, Arc<ShmSegment>>>,
}

impl SegmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `segment` under its name, returning the mapping it replaced.
    pub(crate) fn insert(&self, segment: Arc<ShmSegment>) -> Option<Arc<ShmSegment>> {
        self.entries.lock().insert(segment.name().to_string(), segment)
    }

    /// Drops this registry's reference to `name`. Handles still holding the
    /// mapping keep it alive; the OS object is untouched.
    pub fn remove(&self, name: &str) -> bool {
        self.entries.lock().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.lock().keys().cloned().collect();
        names.sort();
        names
    }
}
