//! Buffer and fence entry points for the rendering front end.

use std::sync::PoisonError;

use bitflags::bitflags;
use winsys_bufmgr::BufferObject;
use winsys_drm::{FenceFlags, MapFlags, MapHint, Mapping, Placement};
use winsys_fence::Fence;

use crate::batch::{BatchBuffer, BatchFlags};
use crate::device::Device;
use crate::error::BatchError;

bitflags! {
    /// How the front end intends to use a buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsage: u32 {
        const CPU_READ = 1 << 0;
        const CPU_WRITE = 1 << 1;
        const GPU_READ = 1 << 2;
        const GPU_WRITE = 1 << 3;
        const PIXEL = 1 << 4;
        const VERTEX = 1 << 5;
        const INDEX = 1 << 6;
        const CONSTANT = 1 << 7;
    }
}

impl BufferUsage {
    /// Vertex and constant data is read by the CPU before it reaches the
    /// GPU, so it lives in cached host memory.
    pub fn host_local(self) -> bool {
        self.intersects(BufferUsage::VERTEX | BufferUsage::CONSTANT)
    }

    /// Placement for a buffer with this usage.
    pub fn placement(self) -> Placement {
        if self.host_local() {
            return Placement::MEM_LOCAL | Placement::CACHED;
        }
        let mut flags = Placement::MEM_TT;
        if self.intersects(BufferUsage::GPU_READ | BufferUsage::INDEX | BufferUsage::PIXEL) {
            flags |= Placement::READ;
        }
        if self.contains(BufferUsage::GPU_WRITE) {
            flags |= Placement::WRITE;
        }
        flags
    }

    fn map_flags(self) -> MapFlags {
        let mut flags = MapFlags::empty();
        if self.contains(BufferUsage::CPU_READ) {
            flags |= MapFlags::READ;
        }
        if self.contains(BufferUsage::CPU_WRITE) {
            flags |= MapFlags::WRITE;
        }
        flags
    }
}

impl Device {
    /// A buffer of `size` bytes from the pool `usage` calls for.
    pub fn buffer_create(
        &self,
        name: impl Into<String>,
        alignment: u64,
        usage: BufferUsage,
        size: u64,
    ) -> Result<BufferObject, BatchError> {
        let pool = if usage.host_local() {
            self.malloc_pool()
        } else {
            self.slab_pool()
        };
        let flags = usage.placement();
        let buffer = BufferObject::new(name, pool, flags, alignment);
        buffer.data(size, None, None, flags)?;
        Ok(buffer)
    }

    /// Wrap client memory the GPU never sees directly.
    ///
    /// # Safety
    ///
    /// `memory` must stay valid for as long as the returned buffer lives.
    pub unsafe fn user_buffer_create(
        &self,
        name: impl Into<String>,
        memory: Mapping,
    ) -> BufferObject {
        // SAFETY: forwarded to the caller.
        unsafe { BufferObject::user(name, memory) }
    }

    /// Map for the CPU accesses in `usage`, waiting for the GPU if needed.
    pub fn buffer_map(
        &self,
        buffer: &BufferObject,
        usage: BufferUsage,
    ) -> Result<Mapping, BatchError> {
        Ok(buffer.map(usage.map_flags(), MapHint::empty())?)
    }

    pub fn buffer_unmap(&self, buffer: &BufferObject) -> Result<(), BatchError> {
        Ok(buffer.unmap()?)
    }

    pub fn fence_signaled(&self, fence: &Fence, flags: FenceFlags) -> Result<bool, BatchError> {
        Ok(fence.is_signaled(flags)?)
    }

    pub fn fence_finish(&self, fence: &Fence, flags: FenceFlags) -> Result<(), BatchError> {
        Ok(fence.finish(flags, false)?)
    }

    /// Show `surface` in the window: flush the rendering into it, wait
    /// until fewer than `present.max_frames_in_flight` presents are queued,
    /// then have `presenter` emit the copy and submit it.
    pub fn flush_frontbuffer(
        &self,
        batch: &mut BatchBuffer,
        surface: &BufferObject,
        presenter: &dyn Presenter,
    ) -> Result<(), BatchError> {
        batch.flush()?;
        self.throttle()?;
        let _hardware = self.hardware().acquire(batch.context());
        presenter.present(batch, surface)?;
        if let Some(fence) = batch.flush()? {
            self.presents
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(fence);
        }
        Ok(())
    }

    fn throttle(&self) -> Result<(), BatchError> {
        let limit = self.config().present.max_frames_in_flight.max(1);
        loop {
            let oldest = {
                let mut presents = self.presents.lock().unwrap_or_else(PoisonError::into_inner);
                while let Some(front) = presents.front() {
                    if !front.is_signaled(front.fence_type())? {
                        break;
                    }
                    presents.pop_front();
                }
                if presents.len() < limit {
                    return Ok(());
                }
                presents.pop_front()
            };
            if let Some(fence) = oldest {
                log::trace!("present: waiting on frame {}", fence.sequence());
                fence.finish(fence.fence_type(), false)?;
            }
        }
    }
}

/// Replace the fence in `slot` with `fence`.
pub fn fence_reference(slot: &mut Option<Fence>, fence: Option<&Fence>) {
    *slot = fence.cloned();
}

/// Puts a finished surface on screen by emitting commands into a batch.
pub trait Presenter: Send + Sync {
    fn present(&self, batch: &mut BatchBuffer, surface: &BufferObject) -> Result<(), BatchError>;
}

/// Blitter copy from a source to a destination buffer.
pub const XY_SRC_COPY_BLT: u32 = (2 << 29) | (0x53 << 22) | 6;

/// Presents by blitting the surface into the window's front buffer.
pub struct BlitPresenter {
    front: BufferObject,
}

impl BlitPresenter {
    pub fn new(front: BufferObject) -> Self {
        Self { front }
    }

    pub fn front(&self) -> &BufferObject {
        &self.front
    }
}

impl Presenter for BlitPresenter {
    fn present(&self, batch: &mut BatchBuffer, surface: &BufferObject) -> Result<(), BatchError> {
        let bytes = surface.size().min(self.front.size());
        batch.require_space(16, BatchFlags::CLIPRECTS)?;
        batch.emit_dword(XY_SRC_COPY_BLT);
        batch.emit_dword(bytes as u32);
        batch.offset_relocation(
            0,
            &self.front,
            Placement::MEM_TT | Placement::WRITE,
            Placement::MEM_MASK | Placement::WRITE,
        )?;
        batch.offset_relocation(
            0,
            surface,
            Placement::MEM_TT | Placement::READ,
            Placement::MEM_MASK | Placement::READ,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex, OnceLock, Weak};
    use winsys_config::Config;
    use winsys_drm::{
        BufferHandle, DrmError, ExecReply, ExecRequest, FenceToken, KernelBo, KernelDriver,
        SimDriver,
    };

    fn device(config: Config) -> (Arc<SimDriver>, Arc<Device>) {
        let sim = Arc::new(SimDriver::default());
        let device = Device::new(config, sim.clone()).unwrap();
        (sim, device)
    }

    #[test]
    fn test_usage_selects_pool() {
        let (_, device) = device(Config::default());
        let vertices = device
            .buffer_create("vertices", 0, BufferUsage::VERTEX, 256)
            .unwrap();
        assert!(vertices.kernel().is_err());
        assert!(vertices.flags().contains(Placement::MEM_LOCAL));

        let texture = device
            .buffer_create("texture", 0, BufferUsage::PIXEL | BufferUsage::GPU_READ, 100)
            .unwrap();
        assert!(texture.kernel().is_ok());
        assert_eq!(device.slabs().header_stats(100).unwrap().buffer_size, 128);
    }

    #[test]
    fn test_map_and_fence_entry_points() {
        let (sim, device) = device(Config::default());
        let buffer = device
            .buffer_create("constants", 0, BufferUsage::GPU_READ, 64)
            .unwrap();
        let mapping = device
            .buffer_map(&buffer, BufferUsage::CPU_WRITE)
            .unwrap();
        unsafe { mapping.write(0, &[9; 4]) };
        device.buffer_unmap(&buffer).unwrap();

        let mut batch = BatchBuffer::new(device.clone()).unwrap();
        batch.require_space(4, BatchFlags::empty()).unwrap();
        batch
            .offset_relocation(0, &buffer, Placement::MEM_TT | Placement::READ, Placement::MEM_MASK)
            .unwrap();
        let fence = batch.flush().unwrap().unwrap();

        let mut slot = None;
        fence_reference(&mut slot, Some(&fence));
        assert!(slot.as_ref().is_some_and(|f| f.ptr_eq(&fence)));
        assert!(!device.fence_signaled(&fence, FenceFlags::EXE).unwrap());
        device.fence_finish(&fence, FenceFlags::EXE).unwrap();
        assert!(device.fence_signaled(&fence, FenceFlags::EXE).unwrap());
        fence_reference(&mut slot, None);
        assert!(slot.is_none());
        assert_eq!(sim.stats().submissions, 1);
    }

    #[test]
    fn test_user_buffer() {
        let (_, device) = device(Config::default());
        let mut memory = vec![0u8; 16];
        let mapping = unsafe {
            Mapping::from_raw_parts(std::ptr::NonNull::new(memory.as_mut_ptr()).unwrap(), 16)
        };
        let buffer = unsafe { device.user_buffer_create("client", mapping) };
        buffer.sub_data(0, &[1, 2]).unwrap();
        drop(buffer);
        assert_eq!(&memory[..2], &[1, 2]);
    }

    fn front_buffer(sim: &SimDriver, device: &Device) -> BufferObject {
        let kbo = sim.create_buffer(4096, 0, Placement::MEM_TT).unwrap();
        let front = BufferObject::new("front", device.drm_pool(), Placement::empty(), 0);
        front.set_referenced(kbo.handle()).unwrap();
        front
    }

    #[test]
    fn test_flush_frontbuffer_blits_and_records_present() {
        let (sim, device) = device(Config::default());
        let presenter = BlitPresenter::new(front_buffer(&sim, &device));
        let surface = device
            .buffer_create("color", 0, BufferUsage::PIXEL | BufferUsage::GPU_WRITE, 4096)
            .unwrap();
        let mut batch = BatchBuffer::new(device.clone()).unwrap();

        device.flush_frontbuffer(&mut batch, &surface, &presenter).unwrap();
        assert_eq!(device.frames_in_flight(), 1);
        assert_eq!(device.hardware().holder(), None);

        let submissions = sim.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].dwords[0], XY_SRC_COPY_BLT);
        assert_eq!(submissions[0].relocs, 2);
    }

    #[test]
    fn test_flush_frontbuffer_throttles() {
        let mut config = Config::default();
        config.present.max_frames_in_flight = 2;
        let (sim, device) = device(config);
        let presenter = BlitPresenter::new(front_buffer(&sim, &device));
        let surface = device
            .buffer_create("color", 0, BufferUsage::PIXEL, 4096)
            .unwrap();
        let mut batch = BatchBuffer::new(device.clone()).unwrap();

        for _ in 0..5 {
            device.flush_frontbuffer(&mut batch, &surface, &presenter).unwrap();
            assert!(device.frames_in_flight() <= 2);
        }
        sim.retire_all();
        device.flush_frontbuffer(&mut batch, &surface, &presenter).unwrap();
        assert_eq!(device.frames_in_flight(), 1);
    }

    /// Simulated kernel noting who holds the hardware lock during fence
    /// waits.
    struct WaitWatcher {
        sim: SimDriver,
        device: OnceLock<Weak<Device>>,
        holders: Mutex<Vec<Option<u32>>>,
    }

    impl KernelDriver for WaitWatcher {
        fn create_buffer(&self, size: u64, alignment: u64, placement: Placement) -> Result<Arc<KernelBo>, DrmError> {
            self.sim.create_buffer(size, alignment, placement)
        }
        fn reference_buffer(&self, handle: BufferHandle) -> Result<Arc<KernelBo>, DrmError> {
            self.sim.reference_buffer(handle)
        }
        fn unreference_buffer(&self, bo: &KernelBo) -> Result<(), DrmError> {
            self.sim.unreference_buffer(bo)
        }
        fn map_buffer(&self, bo: &KernelBo, flags: MapFlags, hint: MapHint) -> Result<Mapping, DrmError> {
            self.sim.map_buffer(bo, flags, hint)
        }
        fn unmap_buffer(&self, bo: &KernelBo) -> Result<(), DrmError> {
            self.sim.unmap_buffer(bo)
        }
        fn set_placement(&self, bo: &KernelBo, flags: Placement, mask: Placement) -> Result<(), DrmError> {
            self.sim.set_placement(bo, flags, mask)
        }
        fn wait_idle(&self, bo: &KernelBo, lazy: bool) -> Result<(), DrmError> {
            self.sim.wait_idle(bo, lazy)
        }
        fn submit(&self, request: &ExecRequest<'_>) -> Result<ExecReply, DrmError> {
            self.sim.submit(request)
        }
        fn fence_signaled(&self, token: FenceToken, mask: FenceFlags) -> Result<FenceFlags, DrmError> {
            self.sim.fence_signaled(token, mask)
        }
        fn fence_wait(&self, token: FenceToken, mask: FenceFlags, lazy: bool) -> Result<(), DrmError> {
            if let Some(device) = self.device.get().and_then(Weak::upgrade) {
                self.holders.lock().unwrap().push(device.hardware().holder());
            }
            self.sim.fence_wait(token, mask, lazy)
        }
        fn fence_unreference(&self, token: FenceToken) {
            self.sim.fence_unreference(token)
        }
    }

    #[test]
    fn test_throttle_waits_without_hardware_lock() {
        let mut config = Config::default();
        config.present.max_frames_in_flight = 1;
        let watcher = Arc::new(WaitWatcher {
            sim: SimDriver::default(),
            device: OnceLock::new(),
            holders: Mutex::new(Vec::new()),
        });
        let device = Device::new(config, watcher.clone()).unwrap();
        watcher.device.set(Arc::downgrade(&device)).unwrap();

        let kbo = watcher.sim.create_buffer(4096, 0, Placement::MEM_TT).unwrap();
        let front = BufferObject::new("front", device.drm_pool(), Placement::empty(), 0);
        front.set_referenced(kbo.handle()).unwrap();
        let presenter = BlitPresenter::new(front);
        let surface = device
            .buffer_create("color", 0, BufferUsage::PIXEL, 4096)
            .unwrap();
        let mut batch = BatchBuffer::new(device.clone()).unwrap();

        for _ in 0..3 {
            device.flush_frontbuffer(&mut batch, &surface, &presenter).unwrap();
        }
        let holders = watcher.holders.lock().unwrap().clone();
        assert!(!holders.is_empty());
        assert!(holders.iter().all(Option::is_none));
    }
}
