//! The kernel driver trait.

use std::sync::Arc;

use crate::bo::{BufferHandle, KernelBo, Mapping};
use crate::error::DrmError;
use crate::exec::{ExecReply, ExecRequest, FenceToken};
use crate::flags::{FenceFlags, MapFlags, MapHint, Placement};

/// Calls the buffer manager makes into the kernel memory manager.
///
/// Kernel buffers are reference counted on the kernel side, separately from
/// any user-space wrapper: `create_buffer` and `reference_buffer` each take
/// one kernel reference that `unreference_buffer` drops.
pub trait KernelDriver: Send + Sync {
    /// Allocate a buffer of `size` bytes.
    fn create_buffer(
        &self,
        size: u64,
        alignment: u64,
        placement: Placement,
    ) -> Result<Arc<KernelBo>, DrmError>;

    /// Take a reference on a buffer created elsewhere (another process,
    /// the window system).
    fn reference_buffer(&self, handle: BufferHandle) -> Result<Arc<KernelBo>, DrmError>;

    /// Drop one kernel reference; the last one frees the memory.
    fn unreference_buffer(&self, bo: &KernelBo) -> Result<(), DrmError>;

    /// Map the buffer for CPU access. Waits for the GPU unless `hint`
    /// contains [`MapHint::DONT_BLOCK`], in which case a busy buffer yields
    /// [`DrmError::Busy`].
    fn map_buffer(&self, bo: &KernelBo, flags: MapFlags, hint: MapHint)
    -> Result<Mapping, DrmError>;

    fn unmap_buffer(&self, bo: &KernelBo) -> Result<(), DrmError>;

    /// Change the bits of the buffer's placement selected by `mask`.
    fn set_placement(&self, bo: &KernelBo, flags: Placement, mask: Placement)
    -> Result<(), DrmError>;

    /// Block until the GPU no longer uses the buffer.
    fn wait_idle(&self, bo: &KernelBo, lazy: bool) -> Result<(), DrmError>;

    /// Validate the buffers, apply relocations and queue the batch.
    fn submit(&self, request: &ExecRequest<'_>) -> Result<ExecReply, DrmError>;

    /// Which of the `mask` operations the fence has completed.
    fn fence_signaled(&self, token: FenceToken, mask: FenceFlags) -> Result<FenceFlags, DrmError>;

    /// Block until the fence completes every operation in `mask`.
    fn fence_wait(&self, token: FenceToken, mask: FenceFlags, lazy: bool)
    -> Result<(), DrmError>;

    /// Release the kernel's fence object.
    fn fence_unreference(&self, token: FenceToken);
}
