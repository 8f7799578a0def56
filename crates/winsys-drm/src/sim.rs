//! An in-process stand-in for the kernel memory manager.
//!
//! Buffers live in host memory at stable addresses. GPU offsets come from a
//! bump allocator over a fake aperture, fences are sequence numbers that
//! retire when a test (or a blocking wait) says so, and submissions patch
//! relocations the way the kernel does when a presumed offset is stale.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;

use crate::bo::{BufferHandle, HostAllocation, KernelBo, Mapping};
use crate::driver::KernelDriver;
use crate::error::DrmError;
use crate::exec::{BufferReply, ExecReply, ExecRequest, FenceReply, FenceToken};
use crate::flags::{FenceFlags, MapFlags, MapHint, Placement};

/// Tunables of the simulated device.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Total bytes of live buffers before creation fails.
    pub memory_limit: u64,
    /// First GPU offset handed out.
    pub aperture_base: u64,
    /// Retire every earlier batch on each submission, so at most one batch
    /// is in flight.
    pub auto_retire: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            memory_limit: 256 * 1024 * 1024,
            aperture_base: 0x1000_0000,
            auto_retire: false,
        }
    }
}

/// A batch as the simulated GPU received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub context: u32,
    /// Command dwords after relocation patching.
    pub dwords: Vec<u32>,
    pub relocs: usize,
    pub buffers: usize,
    /// Relocations whose presumed offset was stale.
    pub patched: usize,
}

/// Counters for tests and the demo summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub live_buffers: usize,
    pub live_bytes: u64,
    pub buffers_created: u64,
    pub submissions: u64,
    pub live_fences: usize,
    pub migrations: u64,
}

struct SimBuffer {
    bo: Arc<KernelBo>,
    storage: HostAllocation,
    /// Where the buffer really is; `bo` only caches what user space was told.
    offset: u64,
    flags: Placement,
    refs: u32,
    map_count: u32,
    busy_until: u64,
    injected_busy: u32,
}

struct SimState {
    config: SimConfig,
    buffers: FxHashMap<BufferHandle, SimBuffer>,
    next_handle: u32,
    next_offset: u64,
    live_bytes: u64,
    next_seq: u64,
    fences: BTreeMap<u64, FenceFlags>,
    exe_retired: u64,
    rw_retired: u64,
    stalled: bool,
    fail_next_submit: Option<String>,
    idle_next_submit: bool,
    submissions: Vec<Submission>,
    stats: SimStats,
}

impl SimState {
    fn buffer(&self, handle: BufferHandle) -> Result<&SimBuffer, DrmError> {
        self.buffers.get(&handle).ok_or(DrmError::NoSuchBuffer(handle))
    }

    fn buffer_mut(&mut self, handle: BufferHandle) -> Result<&mut SimBuffer, DrmError> {
        self.buffers
            .get_mut(&handle)
            .ok_or(DrmError::NoSuchBuffer(handle))
    }

    fn allocate_offset(&mut self, size: u64, alignment: u64) -> u64 {
        let alignment = alignment.max(4096);
        let offset = self.next_offset.next_multiple_of(alignment);
        self.next_offset = offset + size.max(1);
        offset
    }

    fn is_busy(&self, buffer: &SimBuffer) -> bool {
        buffer.busy_until > self.exe_retired
    }

    fn retire(&mut self, seq: u64, mask: FenceFlags) {
        if mask.contains(FenceFlags::EXE) {
            self.exe_retired = self.exe_retired.max(seq);
        }
        if mask.contains(FenceFlags::RW) {
            self.rw_retired = self.rw_retired.max(seq);
        }
    }

    fn signaled(&self, seq: u64) -> FenceFlags {
        let mut flags = FenceFlags::empty();
        if seq <= self.exe_retired {
            flags |= FenceFlags::EXE;
        }
        if seq <= self.rw_retired {
            flags |= FenceFlags::RW;
        }
        flags
    }

    /// Block (instantly, unless stalled) until `seq` retires for `mask`.
    fn wait(&mut self, seq: u64, mask: FenceFlags) -> Result<(), DrmError> {
        if self.signaled(seq).contains(mask) {
            return Ok(());
        }
        if self.stalled {
            return Err(DrmError::FenceWait {
                token: FenceToken(seq),
                reason: "gpu stalled".to_string(),
            });
        }
        self.retire(seq, mask);
        Ok(())
    }

    /// Move a buffer to a new GPU offset inside `memory`.
    fn relocate(&mut self, handle: BufferHandle, memory: Placement) -> Result<u64, DrmError> {
        let (size, flags) = {
            let buffer = self.buffer(handle)?;
            (buffer.bo.size(), buffer.flags)
        };
        let offset = self.allocate_offset(size, 4096);
        let buffer = self.buffer_mut(handle)?;
        buffer.offset = offset;
        buffer.flags = flags.access() | memory;
        self.stats.migrations += 1;
        log::debug!(
            "sim: moved buffer {handle} to {:#x} ({})",
            offset,
            memory.memory_name()
        );
        Ok(offset)
    }
}

/// Simulated kernel driver.
pub struct SimDriver {
    state: Mutex<SimState>,
}

static_assertions::assert_impl_all!(SimDriver: Send, Sync);
static_assertions::assert_impl_all!(KernelBo: Send, Sync);
static_assertions::assert_impl_all!(Mapping: Send, Sync, Copy);

impl Default for SimDriver {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SimDriver {
    pub fn new(config: SimConfig) -> Self {
        let next_offset = config.aperture_base;
        Self {
            state: Mutex::new(SimState {
                config,
                buffers: FxHashMap::default(),
                next_handle: 1,
                next_offset,
                live_bytes: 0,
                next_seq: 1,
                fences: BTreeMap::new(),
                exe_retired: 0,
                rw_retired: 0,
                stalled: false,
                fail_next_submit: None,
                idle_next_submit: false,
                submissions: Vec::new(),
                stats: SimStats::default(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Emit a fence outside any batch, as another client of the GPU would.
    pub fn emit_fence(&self, fence_type: FenceFlags) -> FenceToken {
        let mut state = self.state();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.fences.insert(seq, fence_type);
        FenceToken(seq)
    }

    /// Complete every batch submitted so far.
    pub fn retire_all(&self) {
        let mut state = self.state();
        let last = state.next_seq.saturating_sub(1);
        state.retire(last, FenceFlags::all());
    }

    /// Complete `mask` for every batch up to and including `token`.
    pub fn retire_through(&self, token: FenceToken, mask: FenceFlags) {
        self.state().retire(token.0, mask);
    }

    /// While stalled, nothing retires and blocking waits fail.
    pub fn set_stalled(&self, stalled: bool) {
        self.state().stalled = stalled;
    }

    /// Make the next submission fail with `reason`.
    pub fn fail_next_submit(&self, reason: impl Into<String>) {
        self.state().fail_next_submit = Some(reason.into());
    }

    /// Make the next submission report that the hardware idled.
    pub fn idle_next_submit(&self) {
        self.state().idle_next_submit = true;
    }

    /// Make the next `count` maps of `handle` see the buffer as busy.
    pub fn inject_busy_map(&self, handle: BufferHandle, count: u32) -> Result<(), DrmError> {
        self.state().buffer_mut(handle)?.injected_busy += count;
        Ok(())
    }

    /// Evict a buffer to a fresh offset in the same memory type, as memory
    /// pressure from another client would. User space learns the new offset
    /// at its next submission.
    pub fn migrate(&self, handle: BufferHandle) -> Result<u64, DrmError> {
        let mut state = self.state();
        let memory = state.buffer(handle)?.flags.memory();
        state.relocate(handle, memory)
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state().submissions.clone()
    }

    pub fn stats(&self) -> SimStats {
        let state = self.state();
        SimStats {
            live_buffers: state.buffers.len(),
            live_bytes: state.live_bytes,
            live_fences: state.fences.len(),
            ..state.stats
        }
    }

    /// Kernel references held on `handle`, or `None` once it is freed.
    pub fn buffer_refs(&self, handle: BufferHandle) -> Option<u32> {
        self.state().buffers.get(&handle).map(|b| b.refs)
    }

    pub fn map_count(&self, handle: BufferHandle) -> Option<u32> {
        self.state().buffers.get(&handle).map(|b| b.map_count)
    }

    pub fn is_busy(&self, handle: BufferHandle) -> bool {
        let state = self.state();
        state
            .buffers
            .get(&handle)
            .is_some_and(|b| state.is_busy(b))
    }

    /// The kernel's view of the buffer's GPU offset.
    pub fn gpu_offset(&self, handle: BufferHandle) -> Option<u64> {
        self.state().buffers.get(&handle).map(|b| b.offset)
    }

    /// Copy bytes out of a buffer, bypassing any mapping.
    pub fn read_buffer(&self, handle: BufferHandle, offset: usize, len: usize) -> Option<Vec<u8>> {
        let state = self.state();
        let buffer = state.buffers.get(&handle)?;
        let mapping = buffer.storage.mapping().slice(offset, len)?;
        let mut out = vec![0u8; len];
        // SAFETY: the storage is alive while the state lock is held.
        unsafe { mapping.read(0, &mut out) };
        Some(out)
    }
}

impl KernelDriver for SimDriver {
    fn create_buffer(
        &self,
        size: u64,
        alignment: u64,
        placement: Placement,
    ) -> Result<Arc<KernelBo>, DrmError> {
        let mut state = self.state();
        if state.live_bytes + size > state.config.memory_limit {
            log::debug!(
                "sim: refusing {size} bytes, {} of {} in use",
                state.live_bytes,
                state.config.memory_limit
            );
            return Err(DrmError::OutOfMemory { size });
        }
        let len = usize::try_from(size)
            .map_err(|_| DrmError::InvalidArgument(format!("buffer size {size}")))?;

        let handle = BufferHandle(state.next_handle);
        state.next_handle += 1;
        let offset = state.allocate_offset(size, alignment);
        let flags = placement.access() | placement.preferred_memory();
        let bo = Arc::new(KernelBo::new(handle, size, offset, flags));

        state.buffers.insert(
            handle,
            SimBuffer {
                bo: Arc::clone(&bo),
                storage: HostAllocation::zeroed(len),
                offset,
                flags,
                refs: 1,
                map_count: 0,
                busy_until: 0,
                injected_busy: 0,
            },
        );
        state.live_bytes += size;
        state.stats.buffers_created += 1;
        Ok(bo)
    }

    fn reference_buffer(&self, handle: BufferHandle) -> Result<Arc<KernelBo>, DrmError> {
        let mut state = self.state();
        let buffer = state.buffer_mut(handle)?;
        buffer.refs += 1;
        Ok(Arc::clone(&buffer.bo))
    }

    fn unreference_buffer(&self, bo: &KernelBo) -> Result<(), DrmError> {
        let mut state = self.state();
        let handle = bo.handle();
        let buffer = state.buffer_mut(handle)?;
        buffer.refs -= 1;
        if buffer.refs == 0 {
            if let Some(buffer) = state.buffers.remove(&handle) {
                state.live_bytes -= buffer.bo.size();
            }
        }
        Ok(())
    }

    fn map_buffer(
        &self,
        bo: &KernelBo,
        _flags: MapFlags,
        hint: MapHint,
    ) -> Result<Mapping, DrmError> {
        let mut state = self.state();
        let handle = bo.handle();
        let injected = {
            let buffer = state.buffer_mut(handle)?;
            let injected = buffer.injected_busy > 0;
            if injected {
                buffer.injected_busy -= 1;
            }
            injected
        };
        let busy_until = state.buffer(handle)?.busy_until;
        let busy = injected || busy_until > state.exe_retired;
        if busy {
            if hint.contains(MapHint::DONT_BLOCK) {
                return Err(DrmError::Busy(handle));
            }
            state.wait(busy_until, FenceFlags::EXE)?;
        }
        let buffer = state.buffer_mut(handle)?;
        buffer.map_count += 1;
        Ok(buffer.storage.mapping())
    }

    fn unmap_buffer(&self, bo: &KernelBo) -> Result<(), DrmError> {
        let mut state = self.state();
        let buffer = state.buffer_mut(bo.handle())?;
        if buffer.map_count == 0 {
            return Err(DrmError::InvalidArgument(format!(
                "buffer {} is not mapped",
                bo.handle()
            )));
        }
        buffer.map_count -= 1;
        Ok(())
    }

    fn set_placement(
        &self,
        bo: &KernelBo,
        flags: Placement,
        mask: Placement,
    ) -> Result<(), DrmError> {
        let mut state = self.state();
        let handle = bo.handle();
        let current = state.buffer(handle)?.flags;
        let requested = (current - mask) | (flags & mask);
        let allowed = if mask.intersects(Placement::MEM_MASK) {
            requested.memory()
        } else {
            current.memory()
        };
        if allowed.is_empty() {
            return Err(DrmError::InvalidArgument(format!(
                "placement {requested:?} names no memory type"
            )));
        }
        let mut offset = state.buffer(handle)?.offset;
        if !allowed.intersects(current.memory()) {
            offset = state.relocate(handle, allowed.preferred_memory())?;
        }
        let buffer = state.buffer_mut(handle)?;
        buffer.flags = requested.access() | buffer.flags.memory();
        bo.update(offset, buffer.flags);
        Ok(())
    }

    fn wait_idle(&self, bo: &KernelBo, _lazy: bool) -> Result<(), DrmError> {
        let mut state = self.state();
        let busy_until = state.buffer(bo.handle())?.busy_until;
        state.wait(busy_until, FenceFlags::EXE)
    }

    fn submit(&self, request: &ExecRequest<'_>) -> Result<ExecReply, DrmError> {
        let mut state = self.state();
        if let Some(reason) = state.fail_next_submit.take() {
            return Err(DrmError::Submit(reason));
        }
        let batch = request
            .buffers
            .get(request.batch as usize)
            .ok_or_else(|| DrmError::InvalidArgument("batch index out of range".to_string()))?;
        if request.batch_offset + u64::from(request.used) > batch.bo.size() {
            return Err(DrmError::InvalidArgument(format!(
                "batch of {} bytes at {} overruns buffer {}",
                request.used,
                request.batch_offset,
                batch.bo.handle()
            )));
        }

        // Validate: every buffer must sit in a memory type it allows.
        for entry in request.buffers {
            let handle = entry.bo.handle();
            let current = state.buffer(handle)?.flags;
            let allowed = (entry.flags & entry.mask).memory();
            if !allowed.is_empty() && !allowed.intersects(current.memory()) {
                state.relocate(handle, allowed.preferred_memory())?;
            }
        }

        let mut patched = 0;
        for reloc in request.relocs {
            let target = request
                .buffers
                .get(reloc.target as usize)
                .ok_or_else(|| DrmError::InvalidArgument("relocation target".to_string()))?;
            let dest = request
                .buffers
                .get(reloc.dest as usize)
                .ok_or_else(|| DrmError::InvalidArgument("relocation destination".to_string()))?;
            let actual = state.buffer(target.bo.handle())?.offset;
            if target.presumed_offset == Some(actual) {
                continue;
            }
            let mapping = state.buffer(dest.bo.handle())?.storage.mapping();
            let value = (actual + u64::from(reloc.delta)) as u32;
            if mapping.slice(reloc.offset as usize, 4).is_none() {
                return Err(DrmError::InvalidArgument(format!(
                    "relocation at {} outside buffer {}",
                    reloc.offset,
                    dest.bo.handle()
                )));
            }
            // SAFETY: bounds checked above and the storage outlives the lock.
            unsafe { mapping.write_u32(reloc.offset as usize, value) };
            patched += 1;
        }

        let commands = state
            .buffer(batch.bo.handle())?
            .storage
            .mapping()
            .slice(request.batch_offset as usize, request.used as usize)
            .ok_or_else(|| DrmError::InvalidArgument("batch range".to_string()))?;
        let dwords = (0..request.used as usize / 4)
            // SAFETY: in range of the slice, storage alive under the lock.
            .map(|i| unsafe { commands.read_u32(i * 4) })
            .collect();
        state.submissions.push(Submission {
            context: request.context,
            dwords,
            relocs: request.relocs.len(),
            buffers: request.buffers.len(),
            patched,
        });
        state.stats.submissions += 1;

        let seq = state.next_seq;
        state.next_seq += 1;
        let fence = if std::mem::take(&mut state.idle_next_submit) {
            state.retire(seq, FenceFlags::all());
            FenceReply::HardwareIdle
        } else {
            state.fences.insert(seq, request.fence_type);
            if state.config.auto_retire {
                state.retire(seq - 1, FenceFlags::all());
            }
            FenceReply::Emitted {
                token: FenceToken(seq),
                fence_type: request.fence_type,
            }
        };

        let mut buffers = Vec::with_capacity(request.buffers.len());
        for entry in request.buffers {
            let buffer = state.buffer_mut(entry.bo.handle())?;
            buffer.busy_until = buffer.busy_until.max(seq);
            buffers.push(BufferReply {
                offset: buffer.offset,
                flags: buffer.flags,
            });
        }
        Ok(ExecReply { fence, buffers })
    }

    fn fence_signaled(&self, token: FenceToken, mask: FenceFlags) -> Result<FenceFlags, DrmError> {
        let state = self.state();
        if token.0 == 0 || token.0 >= state.next_seq {
            return Err(DrmError::NoSuchFence(token));
        }
        Ok(state.signaled(token.0) & mask)
    }

    fn fence_wait(&self, token: FenceToken, mask: FenceFlags, _lazy: bool) -> Result<(), DrmError> {
        let mut state = self.state();
        if token.0 == 0 || token.0 >= state.next_seq {
            return Err(DrmError::NoSuchFence(token));
        }
        state.wait(token.0, mask)
    }

    fn fence_unreference(&self, token: FenceToken) {
        self.state().fences.remove(&token.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{Relocation, ValidateEntry};

    fn entry(bo: &Arc<KernelBo>, presumed: Option<u64>) -> ValidateEntry {
        ValidateEntry {
            bo: Arc::clone(bo),
            flags: Placement::READ | Placement::MEM_TT,
            mask: Placement::ACCESS_MASK | Placement::MEM_MASK,
            presumed_offset: presumed,
        }
    }

    fn request<'a>(buffers: &'a [ValidateEntry], relocs: &'a [Relocation], used: u32) -> ExecRequest<'a> {
        ExecRequest {
            context: 0,
            batch: 0,
            batch_offset: 0,
            used,
            buffers,
            relocs,
            fence_class: 0,
            fence_type: FenceFlags::EXE,
        }
    }

    #[test]
    fn test_create_and_release_tracks_memory() {
        let sim = SimDriver::default();
        let bo = sim.create_buffer(8192, 0, Placement::MEM_TT).unwrap();
        assert_eq!(sim.stats().live_bytes, 8192);
        assert_eq!(bo.flags().memory(), Placement::MEM_TT);

        let again = sim.reference_buffer(bo.handle()).unwrap();
        assert_eq!(sim.buffer_refs(bo.handle()), Some(2));
        sim.unreference_buffer(&again).unwrap();
        sim.unreference_buffer(&bo).unwrap();
        assert_eq!(sim.buffer_refs(bo.handle()), None);
        assert_eq!(sim.stats().live_bytes, 0);
    }

    #[test]
    fn test_memory_limit() {
        let sim = SimDriver::new(SimConfig {
            memory_limit: 4096,
            ..Default::default()
        });
        sim.create_buffer(4096, 0, Placement::MEM_TT).unwrap();
        assert_eq!(
            sim.create_buffer(1, 0, Placement::MEM_TT).unwrap_err(),
            DrmError::OutOfMemory { size: 1 }
        );
    }

    #[test]
    fn test_non_blocking_map_of_busy_buffer() {
        let sim = SimDriver::default();
        let bo = sim.create_buffer(4096, 0, Placement::MEM_TT).unwrap();
        let buffers = [entry(&bo, None)];
        let reply = sim.submit(&request(&buffers, &[], 0)).unwrap();
        assert!(sim.is_busy(bo.handle()));

        let err = sim
            .map_buffer(&bo, MapFlags::WRITE, MapHint::DONT_BLOCK)
            .unwrap_err();
        assert_eq!(err, DrmError::Busy(bo.handle()));

        // A blocking map waits the batch out.
        sim.map_buffer(&bo, MapFlags::WRITE, MapHint::empty()).unwrap();
        let FenceReply::Emitted { token, .. } = reply.fence else {
            panic!("expected a fence");
        };
        assert_eq!(
            sim.fence_signaled(token, FenceFlags::EXE).unwrap(),
            FenceFlags::EXE
        );
    }

    #[test]
    fn test_stalled_wait_fails() {
        let sim = SimDriver::default();
        let token = sim.emit_fence(FenceFlags::EXE);
        sim.set_stalled(true);
        assert!(matches!(
            sim.fence_wait(token, FenceFlags::EXE, false),
            Err(DrmError::FenceWait { .. })
        ));
        sim.set_stalled(false);
        sim.fence_wait(token, FenceFlags::EXE, false).unwrap();
    }

    #[test]
    fn test_partial_retirement() {
        let sim = SimDriver::default();
        let first = sim.emit_fence(FenceFlags::all());
        let second = sim.emit_fence(FenceFlags::all());
        sim.retire_through(second, FenceFlags::EXE);
        assert_eq!(sim.fence_signaled(first, FenceFlags::all()).unwrap(), FenceFlags::EXE);
        sim.retire_through(first, FenceFlags::RW);
        assert_eq!(sim.fence_signaled(first, FenceFlags::all()).unwrap(), FenceFlags::all());
        assert_eq!(sim.fence_signaled(second, FenceFlags::all()).unwrap(), FenceFlags::EXE);
    }

    #[test]
    fn test_stale_relocation_is_patched() {
        let sim = SimDriver::default();
        let batch = sim.create_buffer(4096, 0, Placement::MEM_TT).unwrap();
        let target = sim.create_buffer(4096, 0, Placement::MEM_TT).unwrap();
        let stale = target.offset();
        let moved = sim.migrate(target.handle()).unwrap();
        assert_ne!(stale, moved);

        let buffers = [entry(&batch, None), entry(&target, Some(stale))];
        let relocs = [Relocation {
            offset: 4,
            delta: 16,
            target: 1,
            dest: 0,
        }];
        let reply = sim.submit(&request(&buffers, &relocs, 8)).unwrap();

        let submission = &sim.submissions()[0];
        assert_eq!(submission.patched, 1);
        assert_eq!(submission.dwords[1], (moved + 16) as u32);
        assert_eq!(reply.buffers[1].offset, moved);
    }

    #[test]
    fn test_current_relocation_is_left_alone() {
        let sim = SimDriver::default();
        let batch = sim.create_buffer(4096, 0, Placement::MEM_TT).unwrap();
        let target = sim.create_buffer(4096, 0, Placement::MEM_TT).unwrap();
        let buffers = [entry(&batch, None), entry(&target, Some(target.offset()))];
        let relocs = [Relocation {
            offset: 0,
            delta: 0,
            target: 1,
            dest: 0,
        }];
        sim.submit(&request(&buffers, &relocs, 4)).unwrap();
        assert_eq!(sim.submissions()[0].patched, 0);
        assert_eq!(sim.submissions()[0].dwords, vec![0]);
    }

    #[test]
    fn test_submit_moves_buffer_into_allowed_memory() {
        let sim = SimDriver::default();
        let bo = sim.create_buffer(4096, 0, Placement::MEM_LOCAL).unwrap();
        let buffers = [entry(&bo, None)];
        let reply = sim.submit(&request(&buffers, &[], 0)).unwrap();
        assert_eq!(reply.buffers[0].flags.memory(), Placement::MEM_TT);
        assert_eq!(sim.stats().migrations, 1);
        // User space has not been told yet.
        assert_eq!(bo.flags().memory(), Placement::MEM_LOCAL);
    }

    #[test]
    fn test_injected_failures() {
        let sim = SimDriver::default();
        let bo = sim.create_buffer(4096, 0, Placement::MEM_TT).unwrap();
        let buffers = [entry(&bo, None)];

        sim.fail_next_submit("ring hung");
        assert_eq!(
            sim.submit(&request(&buffers, &[], 0)).unwrap_err(),
            DrmError::Submit("ring hung".to_string())
        );

        sim.idle_next_submit();
        let reply = sim.submit(&request(&buffers, &[], 0)).unwrap();
        assert_eq!(reply.fence, FenceReply::HardwareIdle);
        assert!(!sim.is_busy(bo.handle()));
    }

    #[test]
    fn test_auto_retire_keeps_one_batch_in_flight() {
        let sim = SimDriver::new(SimConfig {
            auto_retire: true,
            ..Default::default()
        });
        let bo = sim.create_buffer(4096, 0, Placement::MEM_TT).unwrap();
        let buffers = [entry(&bo, None)];
        let first = sim.submit(&request(&buffers, &[], 0)).unwrap();
        let second = sim.submit(&request(&buffers, &[], 0)).unwrap();
        let (FenceReply::Emitted { token: a, .. }, FenceReply::Emitted { token: b, .. }) =
            (first.fence, second.fence)
        else {
            panic!("expected fences");
        };
        assert_eq!(sim.fence_signaled(a, FenceFlags::EXE).unwrap(), FenceFlags::EXE);
        assert!(sim.fence_signaled(b, FenceFlags::EXE).unwrap().is_empty());
    }

    #[test]
    fn test_injected_busy_map() {
        let sim = SimDriver::default();
        let bo = sim.create_buffer(4096, 0, Placement::MEM_TT).unwrap();
        sim.inject_busy_map(bo.handle(), 1).unwrap();
        assert!(sim.map_buffer(&bo, MapFlags::WRITE, MapHint::DONT_BLOCK).is_err());
        sim.map_buffer(&bo, MapFlags::WRITE, MapHint::DONT_BLOCK).unwrap();
        assert_eq!(sim.map_count(bo.handle()), Some(1));
        sim.unmap_buffer(&bo).unwrap();
        assert!(sim.unmap_buffer(&bo).is_err());
    }
}
