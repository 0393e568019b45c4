//! Store error taxonomy
//!
//! One crate-level error enum; every public operation returns [`Result`].
//! Short reads/writes surface as [`StoreError::Io`] with an `UnexpectedEof`
//! or `WriteZero` kind so callers can still distinguish them from hard
//! syscall failures.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad signature, unsupported version, dimension mismatch, or a size
    /// field exceeding its bound (vector count, metadata length, map region).
    #[error("format error: {0}")]
    Format(String),

    #[error("vector {vector_id} not found")]
    NotFound { vector_id: u32 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation issued before `initialize` opened the device.
    #[error("store is not open")]
    Closed,

    /// The data-region cursor would run past the end of the device.
    #[error("store full: need {needed} bytes at offset {offset}, device ends at {device_size}")]
    Capacity {
        offset: u64,
        needed: u64,
        device_size: u64,
    },
}

impl StoreError {
    /// Short positioned read (fewer bytes transferred than requested).
    pub(crate) fn short_read(expected: usize, actual: usize, offset: u64) -> Self {
        StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("short read: {actual}/{expected} bytes at offset {offset}"),
        ))
    }

    /// Short positioned write.
    pub(crate) fn short_write(expected: usize, actual: usize, offset: u64) -> Self {
        StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            format!("short write: {actual}/{expected} bytes at offset {offset}"),
        ))
    }
}
