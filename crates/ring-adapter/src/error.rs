//! Per-crate error enum, following the same hand-written `Display` +
//! `std::error::Error` pattern as `ring_core::error::RingError` and
//! its siblings.

use std::fmt;

#[derive(Debug)]
pub enum AdapterError {
    /// The underlying ring rejected arming a poll or timeout descriptor.
    Ring(ring_core::error::RingError),
    /// Reserving or protecting the loop fiber's stack failed.
    StackAllocation(i32),
    /// A fiber-swap operation (`FiberAdapter::poll`) was called from
    /// outside the loop context it belongs to.
    NotInLoopContext,
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ring(e) => write!(f, "ring error: {e}"),
            Self::StackAllocation(errno) => write!(f, "failed to allocate fiber stack: errno {errno}"),
            Self::NotInLoopContext => write!(f, "poll() called outside an active loop context"),
        }
    }
}

impl std::error::Error for AdapterError {}

impl From<ring_core::error::RingError> for AdapterError {
    fn from(e: ring_core::error::RingError) -> Self {
        Self::Ring(e)
    }
}

pub type Result<T> = std::result::Result<T, AdapterError>;
