use std::io;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::Core::mutex::ProcessMutex;

/// Tag identifying a segment written by this crate ("SHMQ").
pub const QUEUE_MAGIC: u32 = 0x5348_4D51;

/// `ready` value published by the creator once the header is usable.
pub const HEADER_READY: u32 = 1;

/// The two byte indices of the ring, each in `[0, 2 * max_size)`.
/// Only touched while the header lock is held.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RingIndices {
    /// Next byte to consume.
    pub read_index: u64,
    /// Next byte to produce.
    pub write_index: u64,
}

/// The header at offset 0 of every queue segment.
///
/// The payload array starts right after it, at [`QueueHeader::data_offset`].
/// Geometry and magic are written by the creator before `ready` is
/// published and never change afterwards.
#[repr(C, align(64))]
pub struct QueueHeader {
    /// Lock plus the indices it protects.
    pub ring: ProcessMutex<RingIndices>,

    /// [`QUEUE_MAGIC`] once initialized.
    pub magic: u32,

    /// 0 while the creator is still initializing, [`HEADER_READY`] afterwards.
    pub ready: AtomicU32,

    /// Byte size of one element.
    pub element_size: u64,

    /// Number of elements the ring holds.
    pub capacity: u64,
}

impl QueueHeader {
    /// Offset of the payload array from the start of the segment.
    #[inline]
    pub const fn data_offset() -> usize {
        size_of::<QueueHeader>()
    }

    /// Total mapping size for a queue, or `None` on overflow.
    ///
    /// Twice the payload size must also fit the `u64` ring indices.
    pub fn segment_size(capacity: usize, element_size: usize) -> Option<usize> {
        let payload = capacity.checked_mul(element_size)?;
        u64::try_from(payload).ok()?.checked_mul(2)?;
        payload.checked_add(Self::data_offset())
    }

    /// Initialize a freshly created (zero-filled) header and publish it.
    ///
    /// This should ONLY be called by the creator process.
    ///
    /// # Safety
    /// `this` must point to writable shared memory of at least
    /// `segment_size(capacity, element_size)` bytes that no other process
    /// is using yet.
    pub unsafe fn init_in_place(
        this: *mut QueueHeader,
        capacity: usize,
        element_size: usize,
    ) -> io::Result<()> {
        ProcessMutex::init_in_place(ptr::addr_of_mut!((*this).ring), RingIndices::default())?;
        ptr::addr_of_mut!((*this).magic).write(QUEUE_MAGIC);
        ptr::addr_of_mut!((*this).element_size).write(element_size as u64);
        ptr::addr_of_mut!((*this).capacity).write(capacity as u64);

        // Publish last: attachers read nothing above until they see this.
        (*this).ready.store(HEADER_READY, Ordering::Release);
        Ok(())
    }

    /// Whether the creator has finished [`QueueHeader::init_in_place`].
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) == HEADER_READY
    }
}
