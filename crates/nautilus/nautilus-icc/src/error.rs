use std::io;

/// Failures of segment lifecycle operations (`create` / `open` / `cleanup`).
///
/// `push` and `pop` never fail; full and empty are ordinary outcomes.
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("shared segment '{name}' already exists")]
    AlreadyExists { name: String },

    #[error("shared segment '{name}' does not exist")]
    NotFound { name: String },

    #[error("invalid shared segment name '{name}'")]
    InvalidName { name: String },

    #[error("os error on shared segment '{name}'")]
    Os {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("shared segment '{name}' does not hold a compatible queue")]
    Layout {
        name: String,
        #[source]
        source: LayoutError,
    },
}

impl ShmError {
    /// Classify an OS error from `shm_open` / `shm_unlink` / `mmap`.
    pub(crate) fn from_io(name: &str, source: io::Error) -> Self {
        let name = name.to_string();
        match source.kind() {
            io::ErrorKind::AlreadyExists => ShmError::AlreadyExists { name },
            io::ErrorKind::NotFound => ShmError::NotFound { name },
            io::ErrorKind::InvalidInput => ShmError::InvalidName { name },
            _ => ShmError::Os { name, source },
        }
    }
}

/// Reasons a mapped segment header is rejected on `open`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("bad magic {found:#018x} (segment missing or not yet initialized)")]
    BadMagic { found: u64 },

    #[error("layout version {found}, expected {expected}")]
    VersionMismatch { found: u64, expected: u64 },

    #[error("segment has {found} slots, expected {expected}")]
    SlotCountMismatch { found: u64, expected: u64 },

    #[error("element is {found_size} bytes / align {found_align}, expected {expected_size} / {expected_align}")]
    ElementMismatch {
        found_size: u64,
        found_align: u64,
        expected_size: u64,
        expected_align: u64,
    },

    #[error("ring at offset {found}, expected {expected}")]
    OffsetMismatch { found: u64, expected: u64 },

    #[error("mapping is {mapped} bytes, layout needs {required}")]
    Truncated { mapped: u64, required: u64 },
}
