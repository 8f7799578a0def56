use winsys_drm::DrmError;

/// Errors from creating or waiting on fences.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FenceError {
    #[error(transparent)]
    Backend(#[from] DrmError),

    /// Too many unsignaled fences in one class; the token was drained and
    /// released instead of being tracked.
    #[error("fence class {class} has too many outstanding fences")]
    Exhausted { class: u32 },

    #[error("fence class {class} out of range ({classes} classes)")]
    InvalidClass { class: u32, classes: u32 },
}
