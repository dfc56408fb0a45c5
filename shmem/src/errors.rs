use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShmemLibError>;

#[derive(Debug, Error)]
pub enum ShmemLibError {
    #[error("queue {name} already exists")]
    AlreadyExists { name: String },

    #[error("queue {name} does not exist")]
    NotFound { name: String },

    #[error("queue {name} has an incompatible layout: {reason}")]
    IncompatibleLayout { name: String, reason: String },

    #[error("payload of {len} bytes exceeds element size {element_size}")]
    PayloadTooLarge { len: usize, element_size: usize },

    #[error("buffer of {available} bytes cannot hold an element of {needed} bytes")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("invalid capacity (max_elements={max_elements}, element_size={element_size}): {reason}")]
    InvalidCapacity {
        max_elements: usize,
        element_size: usize,
        reason: &'static str,
    },

    #[error("invalid queue name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// The segment behind a still-mapped handle was destroyed.
    #[error("queue {name} was destroyed and is no longer usable")]
    SegmentUnavailable { name: String },

    #[error("shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ShmemLibError {
    /// True for the errors a consumer is expected to recover from by
    /// re-opening the queue later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ShmemLibError::NotFound { .. } | ShmemLibError::SegmentUnavailable { .. }
        )
    }
}
