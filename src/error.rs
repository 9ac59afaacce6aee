use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result alias for queue setup and teardown.
pub type Result<T> = std::result::Result<T, ShmemqError>;

/// Everything that can go wrong while creating, attaching to or tearing down a queue.
///
/// Full and empty are not errors; the ring operations report them as `false`.
#[derive(Debug, Error)]
pub enum ShmemqError {
    /// The name is not usable as a POSIX shared memory object name.
    #[error("invalid queue name `{name}`: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// Capacity or element size is zero, or the segment size overflows.
    #[error("invalid queue configuration: {0}")]
    InvalidConfig(String),

    /// `shm_open`, `ftruncate`, `mmap`, `shm_unlink`, ... failed.
    #[error("{op} failed for `{name}`: {source}")]
    Posix {
        op: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },

    /// The segment exists but its creator never published the header.
    #[error("timed out after {waited:?} waiting for `{name}` to be initialized by its creator")]
    AttachTimeout { name: String, waited: Duration },

    /// The existing object is smaller than the header, or than the queue it claims to hold.
    #[error("shared memory `{name}` is {actual} bytes, the queue needs at least {expected}")]
    SegmentTooSmall {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// The existing object was not written by this crate.
    #[error("shared memory `{name}` is not a queue (magic {found:#010x})")]
    BadMagic { name: String, found: u32 },

    /// The creator used a different capacity or element size.
    #[error(
        "queue `{name}` holds {found_capacity} x {found_element_size}-byte elements, \
         caller expects {expected_capacity} x {expected_element_size}"
    )]
    GeometryMismatch {
        name: String,
        expected_capacity: usize,
        expected_element_size: usize,
        found_capacity: u64,
        found_element_size: u64,
    },

    /// Exclusive create and open kept racing with another process unlinking the name.
    #[error("gave up opening `{name}` after {attempts} create/open attempts")]
    RetriesExhausted { name: String, attempts: u32 },

    /// The process-shared mutex could not be initialized or acquired.
    #[error("process-shared mutex failed: {0}")]
    Lock(#[source] io::Error),
}

impl ShmemqError {
    pub(crate) fn posix(op: &'static str, name: &str, source: io::Error) -> Self {
        ShmemqError::Posix {
            op,
            name: name.to_string(),
            source,
        }
    }
}

impl From<ShmemqError> for io::Error {
    fn from(err: ShmemqError) -> Self {
        let kind = match &err {
            ShmemqError::InvalidName { .. } | ShmemqError::InvalidConfig(_) => {
                io::ErrorKind::InvalidInput
            }
            ShmemqError::Posix { source, .. } => source.kind(),
            ShmemqError::AttachTimeout { .. } => io::ErrorKind::TimedOut,
            ShmemqError::SegmentTooSmall { .. }
            | ShmemqError::BadMagic { .. }
            | ShmemqError::GeometryMismatch { .. } => io::ErrorKind::InvalidData,
            ShmemqError::RetriesExhausted { .. } | ShmemqError::Lock(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
