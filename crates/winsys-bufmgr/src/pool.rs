//! The allocation strategy interface.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use winsys_drm::{BufferHandle, KernelBo, MapFlags, MapHint, Mapping, Placement};
use winsys_fence::Fence;

use crate::error::BufmgrError;

/// A pool's handle on one of its buffers.
///
/// Opaque to everyone but the pool that made it, which downcasts it back.
#[derive(Clone)]
pub struct PoolBuffer(Arc<dyn Any + Send + Sync>);

impl PoolBuffer {
    pub fn new<T: Any + Send + Sync>(inner: Arc<T>) -> Self {
        Self(inner)
    }

    /// The pool's own buffer type, if this handle holds one.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.0).downcast::<T>().ok()
    }

    /// Identity of the underlying storage; changes when storage is replaced.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolBuffer({:#x})", self.id())
    }
}

/// An allocation strategy for buffer storage.
///
/// `offset`, `fence` and `kernel` only make sense for pools backed by kernel
/// buffers; the others report [`BufmgrError::InvalidOperation`].
pub trait BufferPool: Send + Sync {
    /// Short name for logs and errors.
    fn name(&self) -> &'static str;

    fn create(&self, size: u64, flags: Placement, alignment: u64)
    -> Result<PoolBuffer, BufmgrError>;

    /// Release storage made by `create`.
    fn destroy(&self, buf: PoolBuffer) -> Result<(), BufmgrError>;

    /// Import a buffer someone else owns.
    fn reference(&self, handle: BufferHandle) -> Result<PoolBuffer, BufmgrError> {
        let _ = handle;
        Err(BufmgrError::unsupported(self.name(), "reference"))
    }

    /// Drop an import made by `reference`.
    fn unreference(&self, buf: PoolBuffer) -> Result<(), BufmgrError> {
        let _ = buf;
        Err(BufmgrError::unsupported(self.name(), "unreference"))
    }

    /// Map for CPU access. With [`MapHint::DONT_BLOCK`] a busy buffer fails
    /// with an error for which [`BufmgrError::is_busy`] holds.
    fn map(&self, buf: &PoolBuffer, flags: MapFlags, hint: MapHint)
    -> Result<Mapping, BufmgrError>;

    fn unmap(&self, buf: &PoolBuffer) -> Result<(), BufmgrError>;

    /// GPU address. Only defined for buffers pinned with `NO_MOVE`.
    fn offset(&self, buf: &PoolBuffer) -> Result<u64, BufmgrError>;

    /// Start of the buffer inside its kernel buffer.
    fn pool_offset(&self, buf: &PoolBuffer) -> Result<u64, BufmgrError>;

    fn flags(&self, buf: &PoolBuffer) -> Result<Placement, BufmgrError>;

    fn size(&self, buf: &PoolBuffer) -> Result<u64, BufmgrError>;

    /// Change placement in place. Pools that cannot report
    /// [`BufmgrError::InvalidOperation`] and callers reallocate instead.
    fn set_status(
        &self,
        buf: &PoolBuffer,
        flags: Placement,
        mask: Placement,
    ) -> Result<(), BufmgrError>;

    /// Record the fence of the last GPU use. `None` cancels a pending
    /// validation without a fence.
    fn fence(&self, buf: &PoolBuffer, fence: Option<&Fence>) -> Result<(), BufmgrError>;

    /// The kernel buffer holding the storage.
    fn kernel(&self, buf: &PoolBuffer) -> Result<Arc<KernelBo>, BufmgrError>;

    /// Block until the GPU no longer uses the buffer.
    fn wait_idle(&self, buf: &PoolBuffer, lazy: bool) -> Result<(), BufmgrError>;

    /// Called before the buffer is handed to the GPU.
    fn validate(
        &self,
        buf: &PoolBuffer,
        flags: Placement,
        mask: Placement,
    ) -> Result<(), BufmgrError> {
        let _ = (buf, flags, mask);
        Ok(())
    }
}

/// Whether two pool handles name the same pool.
pub(crate) fn same_pool(a: &Arc<dyn BufferPool>, b: &Arc<dyn BufferPool>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
