//! Size-classed sub-allocation out of larger kernel buffers.
//!
//! Each power-of-two size class has a header with its slabs. A slab is one
//! kernel buffer cut into equal sub-buffers. A freed sub-buffer whose last
//! fence has not signaled goes on the header's delayed list and only returns
//! to its slab once the fence is seen signaled; the GPU may still be using
//! its memory until then.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use slotmap::{SlotMap, new_key_type};
use winsys_config::SlabConfig;
use winsys_drm::{BufferHandle, KernelBo, KernelDriver, MapFlags, MapHint, Mapping, Placement};
use winsys_fence::Fence;

use crate::drm_pool::DrmPool;
use crate::error::BufmgrError;
use crate::free_slabs::FreeSlabManager;
use crate::pool::{BufferPool, PoolBuffer};

new_key_type! {
    struct SlabKey;
}

/// Placement bits a slab cannot honour per sub-buffer.
const UNSLABBABLE: Placement = Placement::NO_MOVE
    .union(Placement::NO_EVICT)
    .union(Placement::SHAREABLE);

#[derive(Default)]
struct SlabBufferState {
    map_count: u32,
    /// Validated for a submission whose fence is not known yet.
    unfenced: bool,
    fence: Option<Fence>,
}

/// One sub-buffer of a slab.
pub(crate) struct SlabBuffer {
    bucket: usize,
    slab: SlabKey,
    index: u32,
    start: u64,
    size: u64,
    kbo: Arc<KernelBo>,
    mapping: Mapping,
    state: Mutex<SlabBufferState>,
    event: Condvar,
}

impl SlabBuffer {
    fn state(&self) -> MutexGuard<'_, SlabBufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(
        &self,
        guard: MutexGuard<'a, SlabBufferState>,
        condition: impl FnMut(&mut SlabBufferState) -> bool,
    ) -> MutexGuard<'a, SlabBufferState> {
        self.event
            .wait_while(guard, condition)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the last fence has signaled, asking the backend unless
    /// `cached_only`. A buffer validated for a submission that has no fence
    /// yet is busy.
    fn is_idle(&self, cached_only: bool) -> bool {
        let fence = {
            let state = self.state();
            if state.unfenced {
                return false;
            }
            state.fence.clone()
        };
        let Some(fence) = fence else {
            return true;
        };
        if cached_only {
            return fence.is_signaled_cached(fence.fence_type());
        }
        match fence.is_signaled(fence.fence_type()) {
            Ok(signaled) => signaled,
            Err(e) => {
                log::debug!("slab pool: fence query failed: {e}");
                false
            }
        }
    }

    /// Block on the last fence. There is nothing to wait on while the
    /// buffer is unfenced.
    fn finish(&self) -> bool {
        let fence = {
            let state = self.state();
            if state.unfenced {
                return false;
            }
            state.fence.clone()
        };
        let Some(fence) = fence else {
            return true;
        };
        match fence.finish(fence.fence_type(), false) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("slab pool: fence wait failed: {e}");
                false
            }
        }
    }
}

struct Slab {
    kbo: Arc<KernelBo>,
    buffers: Vec<Arc<SlabBuffer>>,
    free: Vec<u32>,
}

#[derive(Default)]
struct HeaderState {
    slabs: SlotMap<SlabKey, Slab>,
    /// Slabs with at least one free sub-buffer, allocation order.
    active: VecDeque<SlabKey>,
    /// Fully free slabs, oldest first. Also on `active`.
    free_slabs: VecDeque<SlabKey>,
    /// Freed sub-buffers waiting for their fence, oldest first.
    delayed: VecDeque<Arc<SlabBuffer>>,
}

/// Bookkeeping for one size class.
struct SlabHeader {
    bucket: usize,
    buffer_size: u64,
    buffers_per_slab: u32,
    state: Mutex<HeaderState>,
}

impl SlabHeader {
    fn state(&self) -> MutexGuard<'_, HeaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Occupancy of one size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderStats {
    pub buffer_size: u64,
    pub slabs: usize,
    pub active: usize,
    pub free_slabs: usize,
    pub delayed: usize,
    pub free_buffers: usize,
}

/// Pool sub-allocating small buffers from slabs.
///
/// Requests larger than the biggest size class, or needing placement bits a
/// shared kernel buffer cannot give them, go to an internal [`DrmPool`].
pub struct SlabPool {
    driver: Arc<dyn KernelDriver>,
    placement: Placement,
    headers: Vec<SlabHeader>,
    fallback: DrmPool,
    free_slabs: Arc<FreeSlabManager>,
    page_alignment: u64,
    max_retries: u32,
    max_free_slabs: usize,
}

impl SlabPool {
    /// A pool whose slabs are kernel buffers created with `placement`.
    pub fn new(
        driver: Arc<dyn KernelDriver>,
        placement: Placement,
        config: &SlabConfig,
        free_slabs: Arc<FreeSlabManager>,
    ) -> Self {
        let page_alignment = config.page_alignment.max(1);
        let headers = config
            .bucket_sizes()
            .into_iter()
            .enumerate()
            .map(|(bucket, buffer_size)| {
                let fit = (config.max_slab_size / buffer_size).max(1);
                let buffers_per_slab = u64::from(config.desired_buffers_per_slab.max(1)).min(fit);
                SlabHeader {
                    bucket,
                    buffer_size,
                    buffers_per_slab: buffers_per_slab as u32,
                    state: Mutex::new(HeaderState::default()),
                }
            })
            .collect();
        Self {
            fallback: DrmPool::new(Arc::clone(&driver), page_alignment),
            driver,
            placement,
            headers,
            free_slabs,
            page_alignment,
            max_retries: config.max_retries.max(1),
            max_free_slabs: config.max_free_slabs,
        }
    }

    /// Smallest size class holding `size` bytes at `alignment`.
    pub fn bucket_for(&self, size: u64, alignment: u64) -> Option<usize> {
        let needed = size.max(alignment).max(1);
        self.headers.iter().position(|h| h.buffer_size >= needed)
    }

    /// Occupancy of the size class serving `size`-byte requests.
    pub fn header_stats(&self, size: u64) -> Option<HeaderStats> {
        let header = &self.headers[self.bucket_for(size, 0)?];
        let state = header.state();
        Some(HeaderStats {
            buffer_size: header.buffer_size,
            slabs: state.slabs.len(),
            active: state.active.len(),
            free_slabs: state.free_slabs.len(),
            delayed: state.delayed.len(),
            free_buffers: state.slabs.values().map(|s| s.free.len()).sum(),
        })
    }

    /// Kernel buffer and byte range of a slab sub-buffer, or `None` for a
    /// buffer served by the fallback pool.
    pub fn slab_location(&self, buf: &PoolBuffer) -> Option<(BufferHandle, u64, u64)> {
        let buffer = buf.downcast::<SlabBuffer>()?;
        Some((buffer.kbo.handle(), buffer.start, buffer.size))
    }

    /// Reclaim delayed sub-buffers whose fences have signaled. With `wait`,
    /// block on the oldest one first.
    pub fn reclaim(&self, wait: bool) {
        for header in &self.headers {
            let mut state = header.state();
            self.check_free_locked(&mut state, wait);
        }
    }

    fn slabbable(&self, flags: Placement) -> bool {
        let memory = flags.memory();
        !flags.intersects(UNSLABBABLE)
            && (memory.is_empty() || memory.intersects(self.placement.memory()))
    }

    fn alloc_buffer(&self, header: &SlabHeader) -> Result<Arc<SlabBuffer>, BufmgrError> {
        let mut state = header.state();
        let mut retries = self.max_retries;
        while state.active.is_empty() {
            if retries == 0 {
                log::debug!(
                    "slab pool: no {}-byte buffer after {} tries ({} delayed)",
                    header.buffer_size,
                    self.max_retries,
                    state.delayed.len()
                );
                return Err(BufmgrError::OutOfMemory {
                    size: header.buffer_size,
                });
            }
            retries -= 1;
            self.check_free_locked(&mut state, false);
            if !state.active.is_empty() {
                break;
            }
            if let Err(e) = self.alloc_slab(header, &mut state) {
                log::debug!("slab pool: new {}-byte slab failed: {e}", header.buffer_size);
            }
            if state.active.is_empty() && retries > 0 {
                drop(state);
                std::thread::sleep(Duration::from_micros(1));
                state = header.state();
            }
        }

        let Some(&key) = state.active.front() else {
            return Err(BufmgrError::OutOfMemory {
                size: header.buffer_size,
            });
        };
        let slab = &mut state.slabs[key];
        let full = slab.free.len() == slab.buffers.len();
        let index = slab.free.pop().ok_or(BufmgrError::OutOfMemory {
            size: header.buffer_size,
        })?;
        let buffer = Arc::clone(&slab.buffers[index as usize]);
        let drained = slab.free.is_empty();
        if full {
            state.free_slabs.retain(|&k| k != key);
        }
        if drained {
            state.active.pop_front();
        }
        *buffer.state() = SlabBufferState::default();
        Ok(buffer)
    }

    fn alloc_slab(&self, header: &SlabHeader, state: &mut HeaderState) -> Result<(), BufmgrError> {
        let slab_size = (header.buffer_size * u64::from(header.buffers_per_slab))
            .next_multiple_of(self.page_alignment);
        let kbo = match self.free_slabs.take(slab_size, self.placement) {
            Some(kbo) => kbo,
            None => self
                .driver
                .create_buffer(slab_size, self.page_alignment, self.placement)?,
        };
        let mapping = match self
            .driver
            .map_buffer(&kbo, MapFlags::READ | MapFlags::WRITE, MapHint::empty())
        {
            Ok(mapping) => mapping,
            Err(e) => {
                self.free_slabs.add(kbo, self.placement);
                return Err(e.into());
            }
        };

        let windows: Option<Vec<Mapping>> = (0..header.buffers_per_slab)
            .map(|index| {
                let start = u64::from(index) * header.buffer_size;
                mapping.slice(start as usize, header.buffer_size as usize)
            })
            .collect();
        let Some(windows) = windows else {
            if let Err(e) = self.driver.unmap_buffer(&kbo) {
                log::warn!("slab pool: unmapping slab {}: {e}", kbo.handle());
            }
            self.free_slabs.add(kbo, self.placement);
            return Err(BufmgrError::OutOfRange {
                offset: 0,
                len: header.buffer_size * u64::from(header.buffers_per_slab),
                size: mapping.len() as u64,
            });
        };

        let key = state.slabs.insert_with_key(|key| {
            let buffers = windows
                .into_iter()
                .zip(0..)
                .map(|(window, index)| {
                    Arc::new(SlabBuffer {
                        bucket: header.bucket,
                        slab: key,
                        index,
                        start: u64::from(index) * header.buffer_size,
                        size: header.buffer_size,
                        kbo: Arc::clone(&kbo),
                        mapping: window,
                        state: Mutex::new(SlabBufferState::default()),
                        event: Condvar::new(),
                    })
                })
                .collect();
            Slab {
                kbo: Arc::clone(&kbo),
                buffers,
                free: (0..header.buffers_per_slab).rev().collect(),
            }
        });
        state.active.push_back(key);
        state.free_slabs.push_back(key);
        log::debug!(
            "slab pool: new {slab_size}-byte slab {} for {}-byte buffers",
            kbo.handle(),
            header.buffer_size
        );
        Ok(())
    }

    /// Return a sub-buffer to its slab, releasing fully free slabs beyond
    /// the configured spare count.
    fn free_buffer_locked(&self, state: &mut HeaderState, buffer: &SlabBuffer) {
        let key = buffer.slab;
        let Some(slab) = state.slabs.get_mut(key) else {
            return;
        };
        {
            let mut buffer_state = buffer.state();
            buffer_state.fence = None;
            buffer_state.unfenced = false;
        }
        let was_drained = slab.free.is_empty();
        slab.free.push(buffer.index);
        let now_free = slab.free.len() == slab.buffers.len();
        if was_drained {
            state.active.push_back(key);
        }
        if now_free {
            state.free_slabs.push_back(key);
        }
        while state.free_slabs.len() > self.max_free_slabs {
            let Some(victim) = state.free_slabs.pop_front() else {
                break;
            };
            state.active.retain(|&k| k != victim);
            if let Some(slab) = state.slabs.remove(victim) {
                self.release_slab(slab);
            }
        }
    }

    fn release_slab(&self, slab: Slab) {
        if let Err(e) = self.driver.unmap_buffer(&slab.kbo) {
            log::warn!("slab pool: unmapping slab {}: {e}", slab.kbo.handle());
        }
        log::debug!("slab pool: releasing slab {}", slab.kbo.handle());
        self.free_slabs.add(slab.kbo, self.placement);
    }

    /// Move delayed sub-buffers whose fences have signaled back to their
    /// slabs.
    ///
    /// Looks at the oldest third of the list. Until one signaled buffer is
    /// found each candidate is asked about; after that the cached state is
    /// enough, since the fence manager has already marked older fences. If
    /// the very oldest entry was reclaimed the scan starts over.
    fn check_free_locked(&self, state: &mut HeaderState, wait: bool) {
        let mut reclaimed = 0;
        loop {
            let pending = state.delayed.len();
            if pending == 0 {
                break;
            }
            let budget = pending.div_ceil(3);
            let mut examined = 0;
            let mut index = 0;
            let mut found = false;
            let mut oldest_freed = false;
            while examined < budget && index < state.delayed.len() {
                let buffer = Arc::clone(&state.delayed[index]);
                let idle = if found {
                    buffer.is_idle(true)
                } else if wait && examined == 0 {
                    buffer.finish()
                } else {
                    buffer.is_idle(false)
                };
                if idle {
                    if examined == 0 {
                        oldest_freed = true;
                    }
                    found = true;
                    state.delayed.remove(index);
                    self.free_buffer_locked(state, &buffer);
                    reclaimed += 1;
                } else {
                    index += 1;
                }
                examined += 1;
            }
            if !oldest_freed {
                break;
            }
        }
        if reclaimed > 0 {
            log::trace!("slab pool: reclaimed {reclaimed} delayed buffers");
        }
    }

    fn slab_buffer(&self, buf: &PoolBuffer) -> Option<Arc<SlabBuffer>> {
        buf.downcast::<SlabBuffer>()
    }
}

impl Drop for SlabPool {
    fn drop(&mut self) {
        for header in &mut self.headers {
            let state = header.state.get_mut().unwrap_or_else(PoisonError::into_inner);
            state.delayed.clear();
            state.active.clear();
            state.free_slabs.clear();
            let slabs: Vec<_> = state.slabs.drain().map(|(_, slab)| slab).collect();
            for slab in slabs {
                if let Err(e) = self.driver.unmap_buffer(&slab.kbo) {
                    log::warn!("slab pool: unmapping slab {}: {e}", slab.kbo.handle());
                }
                if let Err(e) = self.driver.unreference_buffer(&slab.kbo) {
                    log::warn!("slab pool: releasing slab {}: {e}", slab.kbo.handle());
                }
            }
        }
    }
}

impl BufferPool for SlabPool {
    fn name(&self) -> &'static str {
        "slab"
    }

    fn create(
        &self,
        size: u64,
        flags: Placement,
        alignment: u64,
    ) -> Result<PoolBuffer, BufmgrError> {
        let bucket = self
            .bucket_for(size, alignment)
            .filter(|_| self.slabbable(flags));
        let Some(bucket) = bucket else {
            return self.fallback.create(size, flags, alignment);
        };
        let buffer = self.alloc_buffer(&self.headers[bucket])?;
        Ok(PoolBuffer::new(buffer))
    }

    fn destroy(&self, buf: PoolBuffer) -> Result<(), BufmgrError> {
        let Some(buffer) = self.slab_buffer(&buf) else {
            return self.fallback.destroy(buf);
        };
        let busy = {
            let state = buffer.state();
            if state.map_count > 0 {
                // The slot stays out of the free list; its memory may still
                // be written through the mapping.
                return Err(BufmgrError::Mapped(format!(
                    "slab {}+{}",
                    buffer.kbo.handle(),
                    buffer.start
                )));
            }
            state.unfenced
                || state
                    .fence
                    .as_ref()
                    .is_some_and(|f| !f.is_signaled_cached(f.fence_type()))
        };
        let header = &self.headers[buffer.bucket];
        let mut state = header.state();
        if busy {
            state.delayed.push_back(buffer);
        } else {
            self.free_buffer_locked(&mut state, &buffer);
        }
        Ok(())
    }

    fn reference(&self, handle: BufferHandle) -> Result<PoolBuffer, BufmgrError> {
        self.fallback.reference(handle)
    }

    fn unreference(&self, buf: PoolBuffer) -> Result<(), BufmgrError> {
        if self.slab_buffer(&buf).is_some() {
            return Err(BufmgrError::unsupported(self.name(), "unreference of a slab buffer"));
        }
        self.fallback.unreference(buf)
    }

    fn map(
        &self,
        buf: &PoolBuffer,
        flags: MapFlags,
        hint: MapHint,
    ) -> Result<Mapping, BufmgrError> {
        let Some(buffer) = self.slab_buffer(buf) else {
            return self.fallback.map(buf, flags, hint);
        };
        let dont_block = hint.contains(MapHint::DONT_BLOCK);
        let mut state = buffer.state();
        if !hint.contains(MapHint::ALLOW_UNFENCED) && state.unfenced {
            if dont_block {
                return Err(BufmgrError::Busy);
            }
            state = buffer.wait(state, |s| s.unfenced);
        }
        if let Some(fence) = state.fence.clone() {
            let fence_type = fence.fence_type();
            if dont_block {
                if !fence.is_signaled(fence_type)? {
                    return Err(BufmgrError::Busy);
                }
            } else {
                fence.finish(fence_type, false)?;
            }
            state.fence = None;
        }
        state.map_count += 1;
        Ok(buffer.mapping)
    }

    fn unmap(&self, buf: &PoolBuffer) -> Result<(), BufmgrError> {
        let Some(buffer) = self.slab_buffer(buf) else {
            return self.fallback.unmap(buf);
        };
        let mut state = buffer.state();
        if state.map_count == 0 {
            return Err(BufmgrError::NotMapped(format!(
                "slab {}+{}",
                buffer.kbo.handle(),
                buffer.start
            )));
        }
        state.map_count -= 1;
        if state.map_count == 0 {
            buffer.event.notify_all();
        }
        Ok(())
    }

    fn offset(&self, buf: &PoolBuffer) -> Result<u64, BufmgrError> {
        let Some(buffer) = self.slab_buffer(buf) else {
            return self.fallback.offset(buf);
        };
        if !buffer.kbo.flags().contains(Placement::NO_MOVE) {
            return Err(BufmgrError::unsupported(self.name(), "offset of a movable buffer"));
        }
        Ok(buffer.kbo.offset() + buffer.start)
    }

    fn pool_offset(&self, buf: &PoolBuffer) -> Result<u64, BufmgrError> {
        match self.slab_buffer(buf) {
            Some(buffer) => Ok(buffer.start),
            None => self.fallback.pool_offset(buf),
        }
    }

    fn flags(&self, buf: &PoolBuffer) -> Result<Placement, BufmgrError> {
        match self.slab_buffer(buf) {
            Some(buffer) => Ok(buffer.kbo.flags()),
            None => self.fallback.flags(buf),
        }
    }

    fn size(&self, buf: &PoolBuffer) -> Result<u64, BufmgrError> {
        match self.slab_buffer(buf) {
            Some(buffer) => Ok(buffer.size),
            None => self.fallback.size(buf),
        }
    }

    fn set_status(
        &self,
        buf: &PoolBuffer,
        flags: Placement,
        mask: Placement,
    ) -> Result<(), BufmgrError> {
        if self.slab_buffer(buf).is_some() {
            return Err(BufmgrError::unsupported(self.name(), "placement changes"));
        }
        self.fallback.set_status(buf, flags, mask)
    }

    fn fence(&self, buf: &PoolBuffer, fence: Option<&Fence>) -> Result<(), BufmgrError> {
        let Some(buffer) = self.slab_buffer(buf) else {
            return self.fallback.fence(buf, fence);
        };
        let mut state = buffer.state();
        if let Some(fence) = fence {
            state.fence = Some(fence.clone());
        }
        state.unfenced = false;
        buffer.event.notify_all();
        Ok(())
    }

    fn kernel(&self, buf: &PoolBuffer) -> Result<Arc<KernelBo>, BufmgrError> {
        match self.slab_buffer(buf) {
            Some(buffer) => Ok(Arc::clone(&buffer.kbo)),
            None => self.fallback.kernel(buf),
        }
    }

    fn wait_idle(&self, buf: &PoolBuffer, lazy: bool) -> Result<(), BufmgrError> {
        let Some(buffer) = self.slab_buffer(buf) else {
            return self.fallback.wait_idle(buf, lazy);
        };
        let mut state = buffer.wait(buffer.state(), |s| s.unfenced);
        if let Some(fence) = state.fence.clone() {
            fence.finish(fence.fence_type(), lazy)?;
            state.fence = None;
        }
        Ok(())
    }

    fn validate(
        &self,
        buf: &PoolBuffer,
        flags: Placement,
        mask: Placement,
    ) -> Result<(), BufmgrError> {
        let Some(buffer) = self.slab_buffer(buf) else {
            return self.fallback.validate(buf, flags, mask);
        };
        let mut state = buffer.wait(buffer.state(), |s| s.map_count > 0);
        state.unfenced = true;
        Ok(())
    }
}
