// POSIX shared memory primitives for the queue segment
// Uses shm_open + ftruncate + mmap(MAP_SHARED) so unrelated processes can map one object by name

use std::ffi::{CStr, CString};
use std::fmt::Debug;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};

use tracing::debug;

/// Permission bits for newly created queue objects (owner read/write).
const SHM_MODE: libc::mode_t = 0o600;

/// Shared memory backend trait for mapped regions
pub trait SharedMemoryBackend: Send + Sync + Debug {
    /// Get a pointer to the mapped memory region
    fn as_ptr(&self) -> *mut u8;

    /// Get the size of the mapped region in bytes
    fn size(&self) -> usize;

    /// Get the underlying file descriptor
    fn raw_handle(&self) -> RawHandle;
}

/// Platform-specific handle type
#[derive(Debug, Clone, Copy)]
pub enum RawHandle {
    /// Unix file descriptor (Linux)
    Fd(i32),
}

/// Atomically create `name`, failing if it already exists.
///
/// Returns `Ok(None)` when another process owns the name (`EEXIST`).
pub fn shm_create_exclusive(name: &CStr) -> io::Result<Option<OwnedFd>> {
    let fd = unsafe {
        libc::shm_open(
            name.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            SHM_MODE,
        )
    };
    if fd < 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EEXIST) => Ok(None),
            _ => Err(err),
        };
    }
    Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) }))
}

/// Open an existing object read/write.
///
/// Returns `Ok(None)` when the name does not exist (`ENOENT`).
pub fn shm_open_existing(name: &CStr) -> io::Result<Option<OwnedFd>> {
    let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDWR, SHM_MODE) };
    if fd < 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::ENOENT) => Ok(None),
            _ => Err(err),
        };
    }
    Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) }))
}

/// Remove `name` from the shared memory namespace.
///
/// Existing mappings stay valid until they are unmapped.
pub fn shm_unlink(name: &CStr) -> io::Result<()> {
    if unsafe { libc::shm_unlink(name.as_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Size the backing object. Only the creator calls this.
pub fn resize(fd: &OwnedFd, size: usize) -> io::Result<()> {
    let len = libc::off_t::try_from(size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "segment size exceeds off_t"))?;
    if unsafe { libc::ftruncate(fd.as_raw_fd(), len) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Current size of the backing object in bytes.
pub fn object_size(fd: &OwnedFd) -> io::Result<usize> {
    let mut stat = MaybeUninit::<libc::stat>::uninit();
    if unsafe { libc::fstat(fd.as_raw_fd(), stat.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let stat = unsafe { stat.assume_init() };
    Ok(stat.st_size as usize)
}

/// Unlinks a freshly created name on drop unless disarmed.
///
/// Held by the creator between `shm_create_exclusive` and a fully
/// initialized header, so a failed setup never leaves a half-built object
/// behind in the namespace.
pub struct UnlinkGuard {
    name: CString,
    armed: bool,
}

impl UnlinkGuard {
    pub fn new(name: &CStr) -> Self {
        Self {
            name: name.to_owned(),
            armed: true,
        }
    }

    /// Keep the object: setup succeeded.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for UnlinkGuard {
    fn drop(&mut self) {
        if self.armed {
            debug!(name = ?self.name, "removing partially created segment");
            let _ = shm_unlink(&self.name);
        }
    }
}

/// A shared mapping of a POSIX shared memory object.
///
/// Dropping it unmaps the region and closes the descriptor; the object
/// itself stays in the namespace.
#[derive(Debug)]
pub struct PosixSharedMemory {
    ptr: NonNull<u8>,
    size: usize,
    fd: OwnedFd,
}

// The mapping is plain memory; synchronization of its contents is the caller's job.
unsafe impl Send for PosixSharedMemory {}
unsafe impl Sync for PosixSharedMemory {}

impl PosixSharedMemory {
    /// Map `size` bytes of `fd` read/write with `MAP_SHARED`.
    ///
    /// Takes ownership of the descriptor; on failure it is closed.
    pub fn map(fd: OwnedFd, size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty segment",
            ));
        }

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Self { ptr, size, fd })
    }
}

impl Drop for PosixSharedMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
        // fd closes when the OwnedFd drops
    }
}

impl SharedMemoryBackend for PosixSharedMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn size(&self) -> usize {
        self.size
    }

    fn raw_handle(&self) -> RawHandle {
        RawHandle::Fd(self.fd.as_raw_fd())
    }
}
