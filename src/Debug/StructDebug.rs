use std::fmt;

use crate::Core::SharedMemory::SharedMemoryBackend;
use crate::Queue::Buffer::RingBuffer;
use crate::Queue::ShmemQueue;

/// Debug function for ShmemQueue
///
/// Shows the queue geometry and mapping without taking the shared lock,
/// so formatting never blocks on another process.
pub fn debug_shmem_queue(queue: &ShmemQueue, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ShmemQueue")
        .field("name", &queue.name())
        .field("capacity", &queue.capacity())
        .field("element_size", &queue.element_size())
        .field("created", &queue.created())
        .field("mapping", &format_args!("{:p}", queue.segment().as_ptr()))
        .field("mapping_size", &queue.segment().size())
        .field("handle", &queue.segment().raw_handle())
        .field("ring", queue.ring())
        .finish()
}

/// Debug function for RingBuffer
///
/// Safely displays the buffer's memory location without dereferencing
pub fn debug_ring_buffer(buffer: &RingBuffer, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RingBuffer")
        .field("header", &format_args!("0x{:x}", buffer.header as usize))
        .field("data", &format_args!("0x{:x}", buffer.data as usize))
        .field("max_size", &buffer.max_size)
        .finish_non_exhaustive()
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        debug_ring_buffer(self, f)
    }
}
