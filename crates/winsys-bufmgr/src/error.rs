use winsys_drm::{DrmError, Placement};
use winsys_fence::FenceError;

/// Errors from pools, buffer objects and validation lists.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufmgrError {
    #[error(transparent)]
    Drm(#[from] DrmError),

    #[error(transparent)]
    Fence(#[from] FenceError),

    /// No memory for the buffer, or the slab retry budget ran out.
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory { size: u64 },

    /// A non-blocking map hit a buffer the GPU still uses.
    #[error("buffer is busy")]
    Busy,

    /// The pool cannot perform this operation on its buffers.
    #[error("{pool} pool does not support {op}")]
    InvalidOperation {
        pool: &'static str,
        op: &'static str,
    },

    /// Two uses of one buffer in a batch need incompatible placements.
    #[error("buffer {name}: placement {requested:?} conflicts with {existing:?}")]
    ValidationConflict {
        name: String,
        existing: Placement,
        requested: Placement,
    },

    #[error("buffer {0} has no storage")]
    NoStorage(String),

    #[error("buffer {0} already has storage")]
    AlreadyBacked(String),

    #[error("buffer {0} is mapped")]
    Mapped(String),

    #[error("buffer {0} is not mapped")]
    NotMapped(String),

    /// Imported storage belongs to someone else and cannot be resized.
    #[error("buffer {0} is imported and cannot be reallocated")]
    Imported(String),

    #[error("range {offset}+{len} outside buffer of {size} bytes")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    /// The handle was not created by this pool.
    #[error("{0} pool was handed a foreign buffer")]
    ForeignBuffer(&'static str),
}

impl BufmgrError {
    /// Whether the error means "would block", from either layer.
    pub fn is_busy(&self) -> bool {
        matches!(self, BufmgrError::Busy | BufmgrError::Drm(DrmError::Busy(_)))
    }

    pub(crate) fn unsupported(pool: &'static str, op: &'static str) -> Self {
        BufmgrError::InvalidOperation { pool, op }
    }
}
