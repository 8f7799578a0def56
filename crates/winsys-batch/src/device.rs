//! Per-connection state shared by every rendering context.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{
    Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use winsys_bufmgr::{BufferPool, DrmPool, FreeSlabManager, MallocPool, SlabPool};
use winsys_config::Config;
use winsys_drm::{KernelDriver, Placement};
use winsys_fence::{DriverFences, Fence, FenceManager};

use crate::error::BatchError;

/// The lock serialising command submission to the hardware.
///
/// Held by one context at a time. A context that already holds it can
/// submit again without re-acquiring, which lets presentation keep the
/// hardware across the flushes it triggers.
#[derive(Debug, Default)]
pub struct HardwareLock {
    owner: Mutex<Option<u32>>,
    released: Condvar,
}

/// Releases the [`HardwareLock`] on drop.
#[derive(Debug)]
pub struct HardwareGuard<'a> {
    lock: &'a HardwareLock,
}

impl HardwareLock {
    fn owner(&self) -> MutexGuard<'_, Option<u32>> {
        self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the lock for `context`, waiting for any other holder. Returns
    /// `None` if `context` already holds it.
    pub fn acquire(&self, context: u32) -> Option<HardwareGuard<'_>> {
        let mut owner = self.owner();
        if *owner == Some(context) {
            return None;
        }
        while owner.is_some() {
            owner = self
                .released
                .wait(owner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *owner = Some(context);
        Some(HardwareGuard { lock: self })
    }

    /// Context currently holding the lock.
    pub fn holder(&self) -> Option<u32> {
        *self.owner()
    }
}

impl Drop for HardwareGuard<'_> {
    fn drop(&mut self) {
        *self.lock.owner() = None;
        self.lock.released.notify_one();
    }
}

/// Everything one connection to the kernel driver owns: the pools, the
/// fence manager and the locks coordinating contexts.
///
/// Shared as `Arc<Device>`; each rendering context creates its own
/// [`BatchBuffer`](crate::BatchBuffer) against it.
pub struct Device {
    config: Config,
    driver: Arc<dyn KernelDriver>,
    fences: Arc<FenceManager>,
    drm_pool: Arc<DrmPool>,
    slab_pool: Arc<SlabPool>,
    malloc_pool: Arc<MallocPool>,
    free_slabs: Arc<FreeSlabManager>,
    /// Readers inspect kernel buffer offsets; the submission path writes.
    kernel_lock: RwLock<()>,
    hardware: HardwareLock,
    next_context: AtomicU32,
    pub(crate) presents: Mutex<VecDeque<Fence>>,
}

static_assertions::assert_impl_all!(Device: Send, Sync);

impl Device {
    pub fn new(config: Config, driver: Arc<dyn KernelDriver>) -> Result<Arc<Self>, BatchError> {
        config.validate()?;
        let fences = FenceManager::new(Arc::new(DriverFences::new(Arc::clone(&driver))), &config.fence);
        let free_slabs = FreeSlabManager::new(Arc::clone(&driver), &config.free_slabs);
        let slab_pool = Arc::new(SlabPool::new(
            Arc::clone(&driver),
            Placement::MEM_TT,
            &config.slab,
            Arc::clone(&free_slabs),
        ));
        let drm_pool = Arc::new(DrmPool::new(Arc::clone(&driver), config.slab.page_alignment));
        log::info!(
            "device: {} slab size classes from {} bytes, batches of {} bytes",
            config.slab.num_buckets,
            config.slab.min_bucket_size,
            config.batch.size
        );
        Ok(Arc::new(Self {
            driver,
            fences,
            drm_pool,
            slab_pool,
            malloc_pool: Arc::new(MallocPool::new()),
            free_slabs,
            kernel_lock: RwLock::new(()),
            hardware: HardwareLock::default(),
            next_context: AtomicU32::new(1),
            presents: Mutex::new(VecDeque::new()),
            config,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn driver(&self) -> &Arc<dyn KernelDriver> {
        &self.driver
    }

    pub fn fences(&self) -> &Arc<FenceManager> {
        &self.fences
    }

    /// Pool making one kernel buffer per request.
    pub fn drm_pool(&self) -> Arc<dyn BufferPool> {
        self.drm_pool.clone()
    }

    /// Pool sub-allocating GPU buffers from slabs.
    pub fn slab_pool(&self) -> Arc<dyn BufferPool> {
        self.slab_pool.clone()
    }

    /// Pool of host-only buffers.
    pub fn malloc_pool(&self) -> Arc<dyn BufferPool> {
        self.malloc_pool.clone()
    }

    /// The slab pool with its statistics and reclaim entry points.
    pub fn slabs(&self) -> &SlabPool {
        &self.slab_pool
    }

    pub fn free_slabs(&self) -> &FreeSlabManager {
        &self.free_slabs
    }

    pub fn hardware(&self) -> &HardwareLock {
        &self.hardware
    }

    /// Shared access to kernel buffer offsets, for emitting relocations.
    pub fn kernel_read(&self) -> RwLockReadGuard<'_, ()> {
        self.kernel_lock.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access for a submission, which may move buffers.
    pub fn kernel_write(&self) -> RwLockWriteGuard<'_, ()> {
        self.kernel_lock.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_context(&self) -> u32 {
        self.next_context.fetch_add(1, Ordering::Relaxed)
    }

    /// Presents queued and not yet known to be complete.
    pub fn frames_in_flight(&self) -> usize {
        self.presents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use winsys_drm::SimDriver;

    #[test]
    fn test_hardware_lock_is_reentrant_per_context() {
        let lock = HardwareLock::default();
        let guard = lock.acquire(1).unwrap();
        assert_eq!(lock.holder(), Some(1));
        assert!(lock.acquire(1).is_none());
        drop(guard);
        assert_eq!(lock.holder(), None);
    }

    #[test]
    fn test_hardware_lock_excludes_other_contexts() {
        let lock = Arc::new(HardwareLock::default());
        let guard = lock.acquire(1).unwrap();
        let waiter = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                let _guard = lock.acquire(2).unwrap();
                lock.holder()
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(lock.holder(), Some(1));
        drop(guard);
        assert_eq!(waiter.join().unwrap(), Some(2));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = Config::default();
        config.slab.min_bucket_size = 100;
        let sim = Arc::new(SimDriver::default());
        assert!(matches!(
            Device::new(config, sim),
            Err(BatchError::Config(_))
        ));
    }

    #[test]
    fn test_contexts_get_distinct_ids() {
        let device = Device::new(Config::default(), Arc::new(SimDriver::default())).unwrap();
        let a = device.next_context();
        let b = device.next_context();
        assert_ne!(a, b);
    }
}
