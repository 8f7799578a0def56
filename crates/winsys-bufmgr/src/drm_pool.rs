//! One kernel buffer per request.

use std::sync::Arc;

use winsys_drm::{BufferHandle, KernelBo, KernelDriver, MapFlags, MapHint, Mapping, Placement};
use winsys_fence::Fence;

use crate::error::BufmgrError;
use crate::pool::{BufferPool, PoolBuffer};

/// Storage handed out by [`DrmPool`].
#[derive(Debug)]
pub(crate) struct DrmBuffer {
    pub(crate) bo: Arc<KernelBo>,
}

/// Pool allocating each buffer directly from the kernel.
///
/// Used for batch buffers, large or pinned buffers, and imports of buffers
/// owned by the window system. The kernel tracks GPU use itself, so fencing
/// is a no-op and maps wait in the kernel.
pub struct DrmPool {
    driver: Arc<dyn KernelDriver>,
    page_alignment: u64,
}

impl DrmPool {
    pub fn new(driver: Arc<dyn KernelDriver>, page_alignment: u64) -> Self {
        Self {
            driver,
            page_alignment: page_alignment.max(1),
        }
    }

    pub(crate) fn buffer(&self, buf: &PoolBuffer) -> Result<Arc<DrmBuffer>, BufmgrError> {
        buf.downcast::<DrmBuffer>()
            .ok_or(BufmgrError::ForeignBuffer(self.name()))
    }
}

impl BufferPool for DrmPool {
    fn name(&self) -> &'static str {
        "drm"
    }

    fn create(
        &self,
        size: u64,
        flags: Placement,
        alignment: u64,
    ) -> Result<PoolBuffer, BufmgrError> {
        let size = size.max(1).next_multiple_of(self.page_alignment);
        let bo = self
            .driver
            .create_buffer(size, alignment.max(self.page_alignment), flags)?;
        Ok(PoolBuffer::new(Arc::new(DrmBuffer { bo })))
    }

    fn destroy(&self, buf: PoolBuffer) -> Result<(), BufmgrError> {
        let buffer = self.buffer(&buf)?;
        self.driver.unreference_buffer(&buffer.bo)?;
        Ok(())
    }

    fn reference(&self, handle: BufferHandle) -> Result<PoolBuffer, BufmgrError> {
        let bo = self.driver.reference_buffer(handle)?;
        Ok(PoolBuffer::new(Arc::new(DrmBuffer { bo })))
    }

    fn unreference(&self, buf: PoolBuffer) -> Result<(), BufmgrError> {
        self.destroy(buf)
    }

    fn map(
        &self,
        buf: &PoolBuffer,
        flags: MapFlags,
        hint: MapHint,
    ) -> Result<Mapping, BufmgrError> {
        let buffer = self.buffer(buf)?;
        Ok(self.driver.map_buffer(&buffer.bo, flags, hint)?)
    }

    fn unmap(&self, buf: &PoolBuffer) -> Result<(), BufmgrError> {
        let buffer = self.buffer(buf)?;
        Ok(self.driver.unmap_buffer(&buffer.bo)?)
    }

    fn offset(&self, buf: &PoolBuffer) -> Result<u64, BufmgrError> {
        let buffer = self.buffer(buf)?;
        if !buffer.bo.flags().contains(Placement::NO_MOVE) {
            return Err(BufmgrError::unsupported(self.name(), "offset of a movable buffer"));
        }
        Ok(buffer.bo.offset())
    }

    fn pool_offset(&self, buf: &PoolBuffer) -> Result<u64, BufmgrError> {
        self.buffer(buf)?;
        Ok(0)
    }

    fn flags(&self, buf: &PoolBuffer) -> Result<Placement, BufmgrError> {
        Ok(self.buffer(buf)?.bo.flags())
    }

    fn size(&self, buf: &PoolBuffer) -> Result<u64, BufmgrError> {
        Ok(self.buffer(buf)?.bo.size())
    }

    fn set_status(
        &self,
        buf: &PoolBuffer,
        flags: Placement,
        mask: Placement,
    ) -> Result<(), BufmgrError> {
        let buffer = self.buffer(buf)?;
        Ok(self.driver.set_placement(&buffer.bo, flags, mask)?)
    }

    fn fence(&self, buf: &PoolBuffer, _fence: Option<&Fence>) -> Result<(), BufmgrError> {
        self.buffer(buf)?;
        Ok(())
    }

    fn kernel(&self, buf: &PoolBuffer) -> Result<Arc<KernelBo>, BufmgrError> {
        Ok(Arc::clone(&self.buffer(buf)?.bo))
    }

    fn wait_idle(&self, buf: &PoolBuffer, lazy: bool) -> Result<(), BufmgrError> {
        let buffer = self.buffer(buf)?;
        Ok(self.driver.wait_idle(&buffer.bo, lazy)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use winsys_drm::{DrmError, SimDriver};

    fn pool() -> (Arc<SimDriver>, DrmPool) {
        let sim = Arc::new(SimDriver::default());
        let pool = DrmPool::new(sim.clone(), 4096);
        (sim, pool)
    }

    #[test]
    fn test_create_rounds_to_pages() {
        let (sim, pool) = pool();
        let buf = pool.create(100, Placement::MEM_TT, 0).unwrap();
        assert_eq!(pool.size(&buf).unwrap(), 4096);
        assert_eq!(sim.stats().live_buffers, 1);
        pool.destroy(buf).unwrap();
        assert_eq!(sim.stats().live_buffers, 0);
    }

    #[test]
    fn test_offset_requires_no_move() {
        let (_sim, pool) = pool();
        let movable = pool.create(4096, Placement::MEM_TT, 0).unwrap();
        assert!(matches!(
            pool.offset(&movable),
            Err(BufmgrError::InvalidOperation { .. })
        ));
        let pinned = pool
            .create(4096, Placement::MEM_TT | Placement::NO_MOVE, 0)
            .unwrap();
        let bo = pool.kernel(&pinned).unwrap();
        assert_eq!(pool.offset(&pinned).unwrap(), bo.offset());
    }

    #[test]
    fn test_import_takes_kernel_reference() {
        let (sim, pool) = pool();
        let owned = pool.create(4096, Placement::MEM_TT, 0).unwrap();
        let handle = pool.kernel(&owned).unwrap().handle();
        let imported = pool.reference(handle).unwrap();
        assert_eq!(sim.buffer_refs(handle), Some(2));
        pool.unreference(imported).unwrap();
        assert_eq!(sim.buffer_refs(handle), Some(1));
    }

    #[test]
    fn test_busy_map_reports_busy() {
        let (sim, pool) = pool();
        let buf = pool.create(4096, Placement::MEM_TT, 0).unwrap();
        let handle = pool.kernel(&buf).unwrap().handle();
        sim.inject_busy_map(handle, 1).unwrap();
        let err = pool
            .map(&buf, MapFlags::WRITE, MapHint::DONT_BLOCK)
            .unwrap_err();
        assert!(err.is_busy());
        assert_eq!(err, BufmgrError::Drm(DrmError::Busy(handle)));
    }

    #[test]
    fn test_foreign_buffer_rejected() {
        let (_sim, pool) = pool();
        let foreign = PoolBuffer::new(Arc::new(17u32));
        assert_eq!(
            pool.size(&foreign).unwrap_err(),
            BufmgrError::ForeignBuffer("drm")
        );
    }
}
