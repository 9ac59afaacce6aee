use std::ffi::CString;
use std::time::Duration;

use super::handle::ShmemQueue;
use crate::error::{Result, ShmemqError};
use crate::Queue::Buffer::QueueHeader;

/// Longest POSIX shared memory name accepted (without the leading slash).
const NAME_MAX: usize = 255;

/// Validated parameters for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    name: String,
    capacity: usize,
    element_size: usize,
    attach_timeout: Duration,
}

impl QueueConfig {
    /// Validate and normalize the queue parameters.
    ///
    /// A name without a leading `/` gets one; `"bench_q"` and `"/bench_q"`
    /// refer to the same object.
    pub fn new(name: &str, capacity: usize, element_size: usize) -> Result<Self> {
        let name = normalize_name(name)?;
        if capacity == 0 {
            return Err(ShmemqError::InvalidConfig("capacity must be greater than zero".into()));
        }
        if element_size == 0 {
            return Err(ShmemqError::InvalidConfig(
                "element size must be greater than zero".into(),
            ));
        }
        if QueueHeader::segment_size(capacity, element_size).is_none() {
            return Err(ShmemqError::InvalidConfig(format!(
                "{capacity} elements of {element_size} bytes overflow the address space"
            )));
        }

        Ok(Self {
            name,
            capacity,
            element_size,
            attach_timeout: QueueBuilder::DEFAULT_ATTACH_TIMEOUT,
        })
    }

    pub fn with_attach_timeout(mut self, timeout: Duration) -> Self {
        self.attach_timeout = timeout;
        self
    }

    /// Normalized object name, always starting with `/`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn attach_timeout(&self) -> Duration {
        self.attach_timeout
    }

    /// capacity * element_size, in bytes.
    pub fn max_size(&self) -> usize {
        self.capacity * self.element_size
    }

    /// Header plus payload, in bytes.
    pub fn segment_size(&self) -> usize {
        self.max_size() + QueueHeader::data_offset()
    }

    pub(crate) fn c_name(&self) -> Result<CString> {
        c_name_of(&self.name)
    }
}

/// C string form of an already normalized name.
pub(crate) fn c_name_of(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| ShmemqError::InvalidName {
        name: name.to_string(),
        reason: "contains a NUL byte",
    })
}

pub(crate) fn normalize_name(name: &str) -> Result<String> {
    let invalid = |reason| ShmemqError::InvalidName {
        name: name.to_string(),
        reason,
    };

    let bare = name.strip_prefix('/').unwrap_or(name);
    if bare.is_empty() {
        return Err(invalid("name is empty"));
    }
    if bare.contains('/') {
        return Err(invalid("only a single leading '/' is allowed"));
    }
    if bare.contains('\0') {
        return Err(invalid("contains a NUL byte"));
    }
    if bare.len() > NAME_MAX {
        return Err(invalid("longer than 255 bytes"));
    }
    Ok(format!("/{bare}"))
}

/// Builder for opening a queue with non-default parameters.
pub struct QueueBuilder {
    name: String,
    capacity: usize,
    element_size: usize,
    attach_timeout: Duration,
}

impl Default for QueueBuilder {
    fn default() -> Self {
        Self {
            name: "shmemq".to_string(),
            capacity: 1024,    // slots
            element_size: 256, // bytes per slot
            attach_timeout: Self::DEFAULT_ATTACH_TIMEOUT,
        }
    }
}

impl QueueBuilder {
    /// How long an attacher waits for the creator to publish the header.
    pub const DEFAULT_ATTACH_TIMEOUT: Duration = Duration::from_secs(1);

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_element_size(mut self, element_size: usize) -> Self {
        self.element_size = element_size;
        self
    }

    pub fn with_attach_timeout(mut self, timeout: Duration) -> Self {
        self.attach_timeout = timeout;
        self
    }

    pub fn config(&self) -> Result<QueueConfig> {
        Ok(QueueConfig::new(&self.name, self.capacity, self.element_size)?
            .with_attach_timeout(self.attach_timeout))
    }

    /// Create the queue, or attach to it if another process got there first.
    pub fn build(self) -> Result<ShmemQueue> {
        ShmemQueue::create_or_attach_with(&self.config()?)
    }
}
