use winsys_bufmgr::BufmgrError;
use winsys_config::ConfigError;
use winsys_drm::DrmError;
use winsys_fence::FenceError;

/// Errors from the device, batch buffers and the pipe surface.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error(transparent)]
    Bufmgr(#[from] BufmgrError),

    #[error(transparent)]
    Fence(#[from] FenceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The kernel rejected the batch. Its buffers were released unfenced
    /// and the batch was reset.
    #[error("batch submission failed: {0}")]
    Submit(#[source] DrmError),

    /// A single command larger than an empty batch can hold.
    #[error("{bytes} bytes requested, batch holds at most {capacity}")]
    TooLarge { bytes: u32, capacity: u32 },

    /// More relocations than `require_space` made room for.
    #[error("relocation table full ({max} entries)")]
    RelocationsFull { max: usize },

    /// Presentation of the front buffer failed.
    #[error("present failed: {0}")]
    Present(String),
}
