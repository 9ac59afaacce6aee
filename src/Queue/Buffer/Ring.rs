// Fixed-slot ring over the payload array of a queue segment
//
// Both indices are byte offsets kept modulo 2 * max_size, so "full" and
// "empty" stay distinguishable and no counter ever overflows. Enqueue only
// stores write_index and dequeue only stores read_index: a lock holder that
// dies mid-operation leaves either the old or the new value, never a mix.

use std::ptr;

use tracing::{error, warn};

use super::layout::{QueueHeader, RingIndices};
use crate::Core::mutex::ProcessMutexGuard;

impl RingIndices {
    /// Bytes currently queued.
    #[inline]
    pub fn used(&self, max_size: u64) -> u64 {
        if self.write_index >= self.read_index {
            self.write_index - self.read_index
        } else {
            2 * max_size - (self.read_index - self.write_index)
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read_index == self.write_index
    }

    #[inline]
    pub fn is_full(&self, max_size: u64) -> bool {
        self.used(max_size) >= max_size
    }

    /// Whether both indices lie in `[0, 2 * max_size)` and at most
    /// `max_size` bytes are queued.
    pub fn is_consistent(&self, max_size: u64) -> bool {
        let span = 2 * max_size;
        self.read_index < span && self.write_index < span && self.used(max_size) <= max_size
    }

    /// Position of `index` inside the payload array.
    #[inline]
    pub fn slot_offset(index: u64, max_size: u64) -> u64 {
        if index >= max_size {
            index - max_size
        } else {
            index
        }
    }

    /// `index + step`, wrapped into `[0, 2 * max_size)`.
    #[inline]
    pub fn advance(index: u64, step: u64, max_size: u64) -> u64 {
        let room = 2 * max_size - step;
        if index >= room {
            index - room
        } else {
            index + step
        }
    }
}

/// A view of the ring inside a mapped queue segment.
///
/// This struct is NOT stored in shared memory. It is a transient view that holds
/// pointers to the shared header and payload array, plus the geometry read
/// from the header when the view was made.
pub struct RingBuffer {
    /// Pointer to the segment header.
    pub(crate) header: *const QueueHeader,

    /// Pointer to the first payload byte.
    pub(crate) data: *mut u8,

    /// Bytes per element.
    pub(crate) element_size: usize,

    /// capacity * element_size.
    pub(crate) max_size: u64,
}

unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Create a ring view over an initialized header.
    ///
    /// # Safety
    /// `header` must point to a header that `QueueHeader::init_in_place` has
    /// completed on, followed by at least `capacity * element_size` payload
    /// bytes at `data`, and both must outlive the view.
    pub unsafe fn new(header: *const QueueHeader, data: *mut u8) -> Self {
        let element_size = (*header).element_size as usize;
        let capacity = (*header).capacity;
        Self {
            header,
            data,
            element_size,
            max_size: capacity * element_size as u64,
        }
    }

    #[inline]
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        (self.max_size / self.element_size as u64) as usize
    }

    #[inline]
    fn header(&self) -> &QueueHeader {
        unsafe { &*self.header }
    }

    /// Take the header lock.
    ///
    /// After a lock owner death the indices are checked before use; if they
    /// are out of range the ring is reset to empty. Lock failures are logged
    /// and reported as `None`, which callers turn into `false`.
    fn lock_indices(&self) -> Option<ProcessMutexGuard<'_, RingIndices>> {
        let mut guard = match self.header().ring.lock() {
            Ok(guard) => guard,
            Err(e) => {
                error!(error = %e, "failed to lock queue header");
                return None;
            }
        };

        if guard.was_recovered() {
            if guard.is_consistent(self.max_size) {
                warn!(
                    read_index = guard.read_index,
                    write_index = guard.write_index,
                    "ring indices intact after lock owner death"
                );
            } else {
                error!(
                    read_index = guard.read_index,
                    write_index = guard.write_index,
                    max_size = self.max_size,
                    "ring indices corrupt after lock owner death, discarding queued elements"
                );
                *guard = RingIndices::default();
            }
        }
        Some(guard)
    }

    /// Copy `element` into the next free slot.
    /// Returns false if the length is wrong or the ring is full.
    pub fn try_enqueue(&self, element: &[u8]) -> bool {
        if element.len() != self.element_size {
            return false;
        }

        let Some(mut indices) = self.lock_indices() else {
            return false;
        };
        if indices.is_full(self.max_size) {
            return false;
        }

        let offset = RingIndices::slot_offset(indices.write_index, self.max_size) as usize;
        unsafe {
            ptr::copy_nonoverlapping(element.as_ptr(), self.data.add(offset), self.element_size);
        }
        indices.write_index =
            RingIndices::advance(indices.write_index, self.element_size as u64, self.max_size);
        true
    }

    /// Copy the oldest element into `out` and free its slot.
    /// Returns false if the length is wrong or the ring is empty.
    pub fn try_dequeue(&self, out: &mut [u8]) -> bool {
        if out.len() != self.element_size {
            return false;
        }

        let Some(mut indices) = self.lock_indices() else {
            return false;
        };
        if indices.is_empty() {
            return false;
        }

        let offset = RingIndices::slot_offset(indices.read_index, self.max_size) as usize;
        unsafe {
            ptr::copy_nonoverlapping(self.data.add(offset), out.as_mut_ptr(), self.element_size);
        }
        indices.read_index =
            RingIndices::advance(indices.read_index, self.element_size as u64, self.max_size);
        true
    }

    /// Snapshot of the indices, taken under the lock.
    pub fn indices(&self) -> Option<RingIndices> {
        self.lock_indices().map(|guard| *guard)
    }

    /// Number of queued elements right now.
    pub fn len(&self) -> usize {
        self.indices()
            .map(|i| (i.used(self.max_size) / self.element_size as u64) as usize)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.indices().map(|i| i.is_empty()).unwrap_or(true)
    }

    pub fn is_full(&self) -> bool {
        self.indices()
            .map(|i| i.is_full(self.max_size))
            .unwrap_or(false)
    }
}
