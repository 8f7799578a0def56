//! Kernel interface error types.

use crate::bo::BufferHandle;
use crate::exec::FenceToken;

/// Errors reported by a [`KernelDriver`](crate::KernelDriver).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DrmError {
    /// The kernel could not find memory for the buffer.
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory { size: u64 },

    /// A non-blocking operation hit a buffer the GPU still uses.
    #[error("buffer {0} is busy")]
    Busy(BufferHandle),

    /// The handle does not name a live buffer.
    #[error("no such buffer {0}")]
    NoSuchBuffer(BufferHandle),

    /// The token does not name a live fence.
    #[error("no such fence {0:?}")]
    NoSuchFence(FenceToken),

    /// The request was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Waiting for a fence failed.
    #[error("wait on fence {token:?} failed: {reason}")]
    FenceWait { token: FenceToken, reason: String },

    /// The kernel rejected a command submission.
    #[error("command submission failed: {0}")]
    Submit(String),
}
