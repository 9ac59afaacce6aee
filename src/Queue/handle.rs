use std::ffi::{CStr, CString};
use std::fmt;
use std::os::fd::OwnedFd;

use tracing::{debug, info};

use super::builder::{c_name_of, normalize_name, QueueConfig};
use super::Buffer::layout::QUEUE_MAGIC;
use super::Buffer::{QueueHeader, RingBuffer, RingIndices};
use super::retry::poll_until;
use crate::error::{Result, ShmemqError};
use crate::Core::SharedMemory::{self as shm, PosixSharedMemory, SharedMemoryBackend, UnlinkGuard};

/// Upper bound on create/open rounds when another process keeps unlinking the name.
const MAX_OPEN_ATTEMPTS: u32 = 64;

/// A process-local handle to a queue living in named shared memory.
///
/// The handle owns its mapping and descriptor; the segment itself is shared
/// with every other process that attached to the same name. All operations
/// take `&self` and are serialized by the lock inside the segment, so one
/// handle may be shared between threads.
pub struct ShmemQueue {
    ring: RingBuffer,
    shm: PosixSharedMemory,
    config: QueueConfig,
    c_name: CString,
    created: bool,
}

impl ShmemQueue {
    /// Create the queue `name`, or attach to it if it already exists.
    ///
    /// The first caller for a name sizes and initializes the segment; later
    /// callers wait for that to finish and check that `capacity` and
    /// `element_size` match what the creator used.
    ///
    /// If a creator dies before publishing the header, the name stays
    /// claimed and every later caller fails with
    /// [`ShmemqError::AttachTimeout`]. Remove it with [`ShmemQueue::unlink`]
    /// and create the queue again.
    pub fn create_or_attach(name: &str, capacity: usize, element_size: usize) -> Result<Self> {
        Self::create_or_attach_with(&QueueConfig::new(name, capacity, element_size)?)
    }

    /// Same as [`ShmemQueue::create_or_attach`] with a prepared config.
    pub fn create_or_attach_with(config: &QueueConfig) -> Result<Self> {
        let c_name = config.c_name()?;
        let name = config.name();

        let (fd, creator) = open_or_create(&c_name, name)?;
        let created = creator.is_some();

        let shm = if created {
            let size = config.segment_size();
            shm::resize(&fd, size).map_err(|e| ShmemqError::posix("ftruncate", name, e))?;
            PosixSharedMemory::map(fd, size).map_err(|e| ShmemqError::posix("mmap", name, e))?
        } else {
            let size = wait_for_size(&fd, config)?;
            if size < QueueHeader::data_offset() {
                return Err(ShmemqError::SegmentTooSmall {
                    name: name.to_string(),
                    expected: QueueHeader::data_offset(),
                    actual: size,
                });
            }
            PosixSharedMemory::map(fd, size).map_err(|e| ShmemqError::posix("mmap", name, e))?
        };

        let header = shm.as_ptr() as *mut QueueHeader;
        match creator {
            Some(guard) => {
                unsafe {
                    QueueHeader::init_in_place(header, config.capacity(), config.element_size())
                }
                .map_err(ShmemqError::Lock)?;
                guard.disarm();
            }
            None => {
                wait_until_ready(unsafe { &*header }, config)?;
                verify_geometry(unsafe { &*header }, config, shm.size())?;
            }
        }

        let ring = unsafe { RingBuffer::new(header, shm.as_ptr().add(QueueHeader::data_offset())) };
        info!(
            name,
            created,
            capacity = config.capacity(),
            element_size = config.element_size(),
            "initialized queue"
        );

        Ok(Self {
            ring,
            shm,
            config: config.clone(),
            c_name,
            created,
        })
    }

    /// Enqueue one element without blocking.
    ///
    /// Returns false if `element.len()` differs from the element size or the
    /// queue is full; nothing is changed in either case.
    #[inline]
    pub fn try_enqueue(&self, element: &[u8]) -> bool {
        self.ring.try_enqueue(element)
    }

    /// Dequeue the oldest element into `out` without blocking.
    ///
    /// Returns false if `out.len()` differs from the element size or the
    /// queue is empty; nothing is changed in either case.
    #[inline]
    pub fn try_dequeue(&self, out: &mut [u8]) -> bool {
        self.ring.try_dequeue(out)
    }

    /// Dequeue the oldest element into a new buffer.
    pub fn try_dequeue_vec(&self) -> Option<Vec<u8>> {
        let mut out = vec![0u8; self.element_size()];
        self.try_dequeue(&mut out).then_some(out)
    }

    /// Unmap the segment and close the descriptor; with `unlink`, also
    /// remove the name so the next `create_or_attach` starts from empty.
    ///
    /// Local resources are released even if the unlink fails.
    pub fn destroy(self, unlink: bool) -> Result<()> {
        let c_name = self.c_name.clone();
        let name = self.config.name().to_string();
        drop(self);

        if unlink {
            debug!(name = %name, "unlinking queue");
            shm::shm_unlink(&c_name).map_err(|e| ShmemqError::posix("shm_unlink", &name, e))?;
        }
        Ok(())
    }

    /// Remove `name` from the namespace without a handle.
    ///
    /// Returns false if no such object existed. Processes that still have it
    /// mapped keep working on the old segment.
    pub fn unlink(name: &str) -> Result<bool> {
        let config_name = normalize_name(name)?;
        let c_name = c_name_of(&config_name)?;
        match shm::shm_unlink(&c_name) {
            Ok(()) => Ok(true),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(false),
            Err(e) => Err(ShmemqError::posix("shm_unlink", &config_name, e)),
        }
    }

    /// Normalized object name.
    pub fn name(&self) -> &str {
        self.config.name()
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity()
    }

    pub fn element_size(&self) -> usize {
        self.config.element_size()
    }

    /// capacity * element_size, in bytes.
    pub fn max_size(&self) -> usize {
        self.config.max_size()
    }

    /// Whether this handle created (and initialized) the segment.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Elements queued at the time of the call.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    /// Snapshot of the shared read/write counters.
    pub fn indices(&self) -> Option<RingIndices> {
        self.ring.indices()
    }

    pub(crate) fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    pub(crate) fn segment(&self) -> &PosixSharedMemory {
        &self.shm
    }
}

impl fmt::Debug for ShmemQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_shmem_queue(self, f)
    }
}

/// Exclusive create, falling back to open; retried while the name flickers.
///
/// The creator gets an [`UnlinkGuard`] that removes the object again if
/// setup fails before the header is published.
fn open_or_create(c_name: &CStr, name: &str) -> Result<(OwnedFd, Option<UnlinkGuard>)> {
    for attempt in 1..=MAX_OPEN_ATTEMPTS {
        let created = shm::shm_create_exclusive(c_name)
            .map_err(|e| ShmemqError::posix("shm_open(O_CREAT|O_EXCL)", name, e))?;
        if let Some(fd) = created {
            return Ok((fd, Some(UnlinkGuard::new(c_name))));
        }

        let existing = shm::shm_open_existing(c_name)
            .map_err(|e| ShmemqError::posix("shm_open", name, e))?;
        if let Some(fd) = existing {
            return Ok((fd, None));
        }

        debug!(name, attempt, "queue unlinked between create and open, retrying");
    }

    Err(ShmemqError::RetriesExhausted {
        name: name.to_string(),
        attempts: MAX_OPEN_ATTEMPTS,
    })
}

/// An attacher may open the object before the creator has sized it.
fn wait_for_size(fd: &OwnedFd, config: &QueueConfig) -> Result<usize> {
    let name = config.name();
    let size = poll_until(config.attach_timeout(), || -> Result<Option<usize>> {
        let size = shm::object_size(fd).map_err(|e| ShmemqError::posix("fstat", name, e))?;
        Ok((size > 0).then_some(size))
    })?;
    size.ok_or_else(|| ShmemqError::AttachTimeout {
        name: name.to_string(),
        waited: config.attach_timeout(),
    })
}

fn wait_until_ready(header: &QueueHeader, config: &QueueConfig) -> Result<()> {
    let ready = poll_until(config.attach_timeout(), || {
        Ok::<_, ShmemqError>(header.is_ready().then_some(()))
    })?;
    ready.ok_or_else(|| ShmemqError::AttachTimeout {
        name: config.name().to_string(),
        waited: config.attach_timeout(),
    })
}

fn verify_geometry(header: &QueueHeader, config: &QueueConfig, mapped: usize) -> Result<()> {
    let name = config.name();
    if header.magic != QUEUE_MAGIC {
        return Err(ShmemqError::BadMagic {
            name: name.to_string(),
            found: header.magic,
        });
    }
    if header.capacity != config.capacity() as u64
        || header.element_size != config.element_size() as u64
    {
        return Err(ShmemqError::GeometryMismatch {
            name: name.to_string(),
            expected_capacity: config.capacity(),
            expected_element_size: config.element_size(),
            found_capacity: header.capacity,
            found_element_size: header.element_size,
        });
    }
    if mapped < config.segment_size() {
        return Err(ShmemqError::SegmentTooSmall {
            name: name.to_string(),
            expected: config.segment_size(),
            actual: mapped,
        });
    }
    Ok(())
}
