//! Named POSIX shared-memory segments mapped read-write with `memmap2`.
//!
//! A segment lives in the OS namespace under `/<name>` until it is unlinked.
//! Mapping and unmapping are per-process: dropping a [`ShmSegment`] only
//! releases this process's view, it never removes the named object.

#[cfg(not(unix))]
compile_error!("nautilus-shm only supports Unix-like operating systems.");

use memmap2::{MmapMut, MmapOptions};
use std::{
    ffi::CString,
    fs::File,
    io,
    os::{fd::FromRawFd, unix::fs::MetadataExt},
    ptr::NonNull,
};

/// Longest name accepted, not counting the leading `/` added for the OS.
pub const MAX_NAME_LEN: usize = 255;

/// Which OS object a name pointed at when it was mapped.
///
/// Removing a name and creating it again yields a different id, so a mapping
/// can tell whether its name still refers to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SegmentId {
    pub dev: u64,
    pub ino: u64,
}

impl SegmentId {
    fn of(file: &File) -> io::Result<Self> {
        let meta = file.metadata()?;
        Ok(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }
}

pub struct ShmSegment {
    name: String,
    id: SegmentId,
    _file: File,
    mmap: MmapMut,
    base: NonNull<u8>,
}

// The mapping is process-wide memory; concurrent access to its contents is
// coordinated by whatever lives inside it.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create a new named segment of `size_bytes` and map it read-write.
    ///
    /// Fails with `ErrorKind::AlreadyExists` if a segment with this name is
    /// already present. The new region is zero-filled by the OS.
    pub fn create(name: &str, size_bytes: usize) -> io::Result<Self> {
        let os_name = os_name(name)?;
        let file = shm_open(&os_name, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR)?;

        // From here on the name exists; don't leave a half-built object behind.
        match Self::size_and_map(file, size_bytes) {
            Ok((file, mmap)) => Self::from_parts(name, file, mmap),
            Err(e) => {
                let _ = shm_unlink(&os_name);
                Err(e)
            }
        }
    }

    /// Open an existing named segment and map all of it read-write.
    ///
    /// A segment whose creator has not sized it yet fails with
    /// `ErrorKind::UnexpectedEof`; retrying later may succeed.
    pub fn open(name: &str) -> io::Result<Self> {
        let os_name = os_name(name)?;
        let file = shm_open(&os_name, libc::O_RDWR)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "shared segment has not been sized yet",
            ));
        }

        let mmap = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Self::from_parts(name, file, mmap)
    }

    /// Id of the object currently registered under `name`, without mapping it.
    ///
    /// `Ok(None)` if there is no such name.
    pub fn lookup(name: &str) -> io::Result<Option<SegmentId>> {
        match shm_open(&os_name(name)?, libc::O_RDONLY) {
            Ok(file) => SegmentId::of(&file).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Remove `name` from the OS namespace. Existing mappings stay valid.
    pub fn unlink(name: &str) -> io::Result<()> {
        shm_unlink(&os_name(name)?)
    }

    fn size_and_map(file: File, size_bytes: usize) -> io::Result<(File, MmapMut)> {
        file.set_len(size_bytes as u64)?;
        let mmap = unsafe { MmapOptions::new().len(size_bytes).map_mut(&file)? };
        Ok((file, mmap))
    }

    fn from_parts(name: &str, file: File, mut mmap: MmapMut) -> io::Result<Self> {
        let base = NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| io::Error::other("mmap returned a null base"))?;
        Ok(Self {
            name: name.to_string(),
            id: SegmentId::of(&file)?,
            _file: file,
            mmap,
            base,
        })
    }

    /// Raw pointer to the start of the mapped region.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }
}

impl std::fmt::Debug for ShmSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmSegment")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("len", &self.len())
            .finish()
    }
}

/// Validate a segment name and turn it into the `/name` form `shm_open` expects.
fn os_name(name: &str) -> io::Result<CString> {
    let invalid = |why: &str| io::Error::new(io::ErrorKind::InvalidInput, format!("{why}: {name:?}"));

    if name.is_empty() {
        return Err(invalid("empty segment name"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("segment name too long"));
    }
    if name.contains('/') {
        return Err(invalid("segment name must not contain '/'"));
    }
    CString::new(format!("/{name}")).map_err(|_| invalid("segment name contains NUL"))
}

fn shm_open(os_name: &CString, flags: libc::c_int) -> io::Result<File> {
    let fd = unsafe { libc::shm_open(os_name.as_ptr(), flags, 0o600) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a freshly opened descriptor that nothing else owns.
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn shm_unlink(os_name: &CString) -> io::Result<()> {
    if unsafe { libc::shm_unlink(os_name.as_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_name(label: &str) -> String {
        format!("nshm_{label}_{}", std::process::id())
    }

    #[test]
    fn create_open_share_bytes() {
        let name = test_name("share");
        let a = ShmSegment::create(&name, 4096).expect("create");
        let b = ShmSegment::open(&name).expect("open");
        assert_eq!(b.len(), 4096);

        unsafe {
            a.as_ptr().add(100).write(0xAB);
            assert_eq!(b.as_ptr().add(100).read(), 0xAB);
            // fresh segments are zeroed
            assert_eq!(b.as_ptr().add(101).read(), 0);
        }

        ShmSegment::unlink(&name).expect("unlink");
    }

    #[test]
    fn create_twice_is_rejected() {
        let name = test_name("dup");
        let _a = ShmSegment::create(&name, 4096).expect("create");
        let err = ShmSegment::create(&name, 4096).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        ShmSegment::unlink(&name).expect("unlink");
    }

    #[test]
    fn open_after_unlink_fails_but_mapping_survives() {
        let name = test_name("orphan");
        let a = ShmSegment::create(&name, 4096).expect("create");
        ShmSegment::unlink(&name).expect("unlink");

        let err = ShmSegment::open(&name).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        // orphaned view is still usable
        unsafe {
            a.as_ptr().write(7);
            assert_eq!(a.as_ptr().read(), 7);
        }
        assert_eq!(
            ShmSegment::unlink(&name).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[test]
    fn unsized_segment_is_not_ready() {
        let name = test_name("unsized");
        let os = os_name(&name).expect("name");
        drop(shm_open(&os, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR).expect("raw create"));

        let err = ShmSegment::open(&name).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        ShmSegment::unlink(&name).expect("unlink");
    }

    #[test]
    fn lookup_tracks_name_identity() {
        let name = test_name("ident");
        assert_eq!(ShmSegment::lookup(&name).expect("lookup"), None);

        let first = ShmSegment::create(&name, 4096).expect("create");
        assert_eq!(ShmSegment::lookup(&name).expect("lookup"), Some(first.id()));
        let again = ShmSegment::open(&name).expect("open");
        assert_eq!(again.id(), first.id());

        // keep `first` mapped so the object cannot be freed and its inode reused
        ShmSegment::unlink(&name).expect("unlink");
        assert_eq!(ShmSegment::lookup(&name).expect("lookup"), None);
        let second = ShmSegment::create(&name, 4096).expect("recreate");
        assert_ne!(second.id(), first.id());
        assert_eq!(ShmSegment::lookup(&name).expect("lookup"), Some(second.id()));

        ShmSegment::unlink(&name).expect("unlink");
    }

    #[test]
    fn bad_names_are_invalid_input() {
        for name in ["", "a/b", "nul\0byte"] {
            let err = ShmSegment::open(name).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "{name:?}");
        }
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert_eq!(
            ShmSegment::create(&long, 64).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }
}
