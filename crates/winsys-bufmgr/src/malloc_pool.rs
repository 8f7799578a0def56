//! Host memory for buffers the GPU never touches.

use std::sync::Arc;

use winsys_drm::{HostAllocation, KernelBo, MapFlags, MapHint, Mapping, Placement};
use winsys_fence::Fence;

use crate::error::BufmgrError;
use crate::pool::{BufferPool, PoolBuffer};

#[derive(Debug)]
struct MallocBuffer {
    memory: HostAllocation,
    flags: Placement,
}

/// Pool of CPU-only buffers, such as vertex data the driver reads back
/// before emitting it inline.
#[derive(Debug, Default)]
pub struct MallocPool;

impl MallocPool {
    pub fn new() -> Self {
        Self
    }

    fn buffer(&self, buf: &PoolBuffer) -> Result<Arc<MallocBuffer>, BufmgrError> {
        buf.downcast::<MallocBuffer>()
            .ok_or(BufmgrError::ForeignBuffer(self.name()))
    }
}

impl BufferPool for MallocPool {
    fn name(&self) -> &'static str {
        "malloc"
    }

    fn create(
        &self,
        size: u64,
        flags: Placement,
        _alignment: u64,
    ) -> Result<PoolBuffer, BufmgrError> {
        let len = usize::try_from(size).map_err(|_| BufmgrError::OutOfMemory { size })?;
        Ok(PoolBuffer::new(Arc::new(MallocBuffer {
            memory: HostAllocation::zeroed(len),
            flags: flags.access() | Placement::MEM_LOCAL | Placement::CACHED,
        })))
    }

    fn destroy(&self, buf: PoolBuffer) -> Result<(), BufmgrError> {
        self.buffer(&buf)?;
        Ok(())
    }

    fn map(
        &self,
        buf: &PoolBuffer,
        _flags: MapFlags,
        _hint: MapHint,
    ) -> Result<Mapping, BufmgrError> {
        Ok(self.buffer(buf)?.memory.mapping())
    }

    fn unmap(&self, buf: &PoolBuffer) -> Result<(), BufmgrError> {
        self.buffer(buf)?;
        Ok(())
    }

    fn offset(&self, _buf: &PoolBuffer) -> Result<u64, BufmgrError> {
        Err(BufmgrError::unsupported(self.name(), "offset"))
    }

    fn pool_offset(&self, buf: &PoolBuffer) -> Result<u64, BufmgrError> {
        self.buffer(buf)?;
        Ok(0)
    }

    fn flags(&self, buf: &PoolBuffer) -> Result<Placement, BufmgrError> {
        Ok(self.buffer(buf)?.flags)
    }

    fn size(&self, buf: &PoolBuffer) -> Result<u64, BufmgrError> {
        Ok(self.buffer(buf)?.memory.len() as u64)
    }

    fn set_status(
        &self,
        _buf: &PoolBuffer,
        _flags: Placement,
        _mask: Placement,
    ) -> Result<(), BufmgrError> {
        Err(BufmgrError::unsupported(self.name(), "placement changes"))
    }

    fn fence(&self, _buf: &PoolBuffer, _fence: Option<&Fence>) -> Result<(), BufmgrError> {
        Err(BufmgrError::unsupported(self.name(), "fence"))
    }

    fn kernel(&self, _buf: &PoolBuffer) -> Result<Arc<KernelBo>, BufmgrError> {
        Err(BufmgrError::unsupported(self.name(), "kernel"))
    }

    fn wait_idle(&self, buf: &PoolBuffer, _lazy: bool) -> Result<(), BufmgrError> {
        self.buffer(buf)?;
        Ok(())
    }
}
