// Module naming follows project convention (Core = OS primitives, Queue = the shared ring)
#[cfg(not(target_os = "linux"))]
compile_error!("shmemq needs POSIX shared memory and robust pthread mutexes (Linux only)");

pub mod error;
pub mod ffi;

#[allow(non_snake_case)]
pub mod Core {
    pub mod SharedMemory;
    pub mod mutex;
    pub use mutex::{ProcessMutex, ProcessMutexGuard};
    pub use SharedMemory::{PosixSharedMemory, RawHandle, SharedMemoryBackend};
}

#[allow(non_snake_case)]
pub mod Queue {
    pub mod Buffer {
        pub mod Ring;
        pub mod layout;
        pub use layout::{QueueHeader, RingIndices}; // re-export for stable path
        pub use Ring::RingBuffer;
    }
    pub mod builder;
    pub mod handle;
    pub mod retry;
    pub use builder::{QueueBuilder, QueueConfig};
    pub use handle::ShmemQueue;
}

#[allow(non_snake_case)]
mod Debug {
    pub mod StructDebug;
}

pub use error::{Result, ShmemqError};
pub use Queue::{QueueBuilder, QueueConfig, ShmemQueue};
