//! Per-context command batches.

use std::sync::Arc;

use bitflags::bitflags;
use winsys_bufmgr::{BufferList, BufferObject};
use winsys_drm::{
    ExecRequest, FenceFlags, FenceReply, MI_BATCH_BUFFER_END, MI_FLUSH, MI_NOOP, MapFlags,
    MapHint, Mapping, Placement, Relocation, ValidateEntry,
};
use winsys_fence::Fence;

use crate::device::Device;
use crate::error::BatchError;

bitflags! {
    /// Submission properties a batch accumulates from its commands.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BatchFlags: u32 {
        /// Commands run once per window cliprect.
        const CLIPRECTS = 1 << 0;
        /// Commands run once, ignoring cliprects.
        const NO_CLIPRECTS = 1 << 1;
    }
}

impl BatchFlags {
    fn conflicts(self, other: BatchFlags) -> bool {
        (self | other).contains(BatchFlags::CLIPRECTS | BatchFlags::NO_CLIPRECTS)
    }
}

const BATCH_FLAGS: Placement = Placement::MEM_TT.union(Placement::EXE);
const BATCH_MASK: Placement = Placement::MEM_MASK.union(Placement::EXE);

/// A buffer of GPU commands filled by one rendering context and submitted
/// to the kernel as a unit.
///
/// Every flush produces a fence ordered after the previous one in the
/// device's fence class. The batch is usable again after every flush,
/// including failed ones; if no storage could be had for the next batch,
/// `require_space` keeps asking for it. Dropping the batch waits for its
/// last submission.
pub struct BatchBuffer {
    device: Arc<Device>,
    context: u32,
    buffer: BufferObject,
    mapping: Option<Mapping>,
    list: BufferList,
    relocs: Vec<Relocation>,
    /// Kernel entry of the batch itself in `list`.
    batch_index: u32,
    /// Start of the commands inside the batch's kernel buffer.
    batch_offset: u64,
    used: u32,
    size: u32,
    reserved: u32,
    max_relocs: usize,
    flags: BatchFlags,
    last_fence: Option<Fence>,
}

impl BatchBuffer {
    pub fn new(device: Arc<Device>) -> Result<Self, BatchError> {
        let context = device.next_context();
        let config = device.config().batch.clone();
        let buffer = BufferObject::new(format!("batch-{context}"), device.drm_pool(), BATCH_FLAGS, 0);
        let mut batch = Self {
            context,
            buffer,
            mapping: None,
            list: BufferList::new(),
            relocs: Vec::with_capacity(config.max_relocs as usize),
            batch_index: 0,
            batch_offset: 0,
            used: 0,
            size: config.size,
            reserved: config.reserved,
            max_relocs: (config.max_relocs as usize).max(1),
            flags: BatchFlags::empty(),
            last_fence: None,
            device,
        };
        batch.reset()?;
        log::debug!("context {context}: batch of {} bytes", batch.size);
        Ok(batch)
    }

    /// Hardware context the batch submits on.
    pub fn context(&self) -> u32 {
        self.context
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Bytes of commands written since the last flush.
    pub fn used(&self) -> u32 {
        self.used
    }

    /// Bytes still available for commands.
    pub fn space(&self) -> u32 {
        self.size - self.reserved - self.used
    }

    pub fn relocation_count(&self) -> usize {
        self.relocs.len()
    }

    pub fn flags(&self) -> BatchFlags {
        self.flags
    }

    /// Fence of the most recent submission, if it may still be pending.
    pub fn last_fence(&self) -> Option<&Fence> {
        self.last_fence.as_ref()
    }

    /// Start an empty batch in idle storage.
    ///
    /// The batch only counts as having storage once it is mapped, which is
    /// the last step; after a failure the next `require_space` tries again.
    fn reset(&mut self) -> Result<(), BatchError> {
        if self.mapping.take().is_some() {
            self.buffer.unmap()?;
        }
        self.list.reset();
        self.relocs.clear();
        self.used = 0;
        self.flags = BatchFlags::empty();

        self.buffer
            .data(u64::from(self.size), None, None, BATCH_FLAGS)?;
        self.batch_index = self.list.add_list_item(&self.buffer, BATCH_FLAGS, BATCH_MASK)?;
        self.batch_offset = self.buffer.pool_offset()?;
        self.mapping = Some(self.buffer.map(MapFlags::WRITE, MapHint::empty())?);
        Ok(())
    }

    /// Whether the batch has storage to write commands into.
    pub fn has_storage(&self) -> bool {
        self.mapping.is_some()
    }

    fn ensure_storage(&mut self) -> Result<(), BatchError> {
        if self.mapping.is_none() {
            self.reset()?;
        }
        Ok(())
    }

    /// Make room for `bytes` of commands with `flags`, flushing first if the
    /// batch is too full, its relocation table is full, or its flags
    /// conflict with `flags`.
    pub fn require_space(&mut self, bytes: u32, flags: BatchFlags) -> Result<(), BatchError> {
        let capacity = self.size - self.reserved;
        if bytes > capacity {
            return Err(BatchError::TooLarge { bytes, capacity });
        }
        self.ensure_storage()?;
        if self.space() < bytes
            || self.relocs.len() >= self.max_relocs
            || self.flags.conflicts(flags)
        {
            self.flush()?;
            self.ensure_storage()?;
        }
        self.flags |= flags;
        Ok(())
    }

    /// Append one command dword.
    ///
    /// # Panics
    ///
    /// If [`BatchBuffer::require_space`] did not make room for it.
    pub fn emit_dword(&mut self, dword: u32) {
        assert!(self.space() >= 4, "batch overflow: emit without require_space");
        let Some(mapping) = self.mapping else {
            panic!("batch has no storage: emit without require_space");
        };
        // SAFETY: the batch stays mapped until flush; `used + 4` is within
        // the buffer since `space()` accounts for it.
        unsafe { mapping.write_u32(self.used as usize, dword) };
        self.used += 4;
    }

    /// Append the GPU address of `target` plus `pre_add`, recording a
    /// relocation so the kernel fixes the dword up if `target` moved.
    ///
    /// `target` joins the validation list with `flags` under `mask`.
    pub fn offset_relocation(
        &mut self,
        pre_add: u32,
        target: &BufferObject,
        flags: Placement,
        mask: Placement,
    ) -> Result<(), BatchError> {
        if self.relocs.len() >= self.max_relocs {
            return Err(BatchError::RelocationsFull {
                max: self.max_relocs,
            });
        }
        self.ensure_storage()?;
        let device = Arc::clone(&self.device);
        let _readers = device.kernel_read();
        let index = self.list.add_list_item(target, flags, mask)?;
        let (kbo, start) = target.kernel_location()?;
        let presumed = self.list.presume_offset(index, kbo.offset());
        let delta = start as u32 + pre_add;
        self.relocs.push(Relocation {
            offset: (self.batch_offset + u64::from(self.used)) as u32,
            delta,
            target: index,
            dest: self.batch_index,
        });
        self.emit_dword((presumed + u64::from(delta)) as u32);
        Ok(())
    }

    /// Submit the batch and start a new one.
    ///
    /// Returns the fence of the submission, or the previous fence if nothing
    /// was written since the last flush. `None` means nothing is pending.
    pub fn flush(&mut self) -> Result<Option<Fence>, BatchError> {
        if self.used == 0 {
            return Ok(self.last_fence.clone());
        }
        self.emit_trailer();
        let submitted = self.submit();
        if submitted.is_err() {
            self.list.unfence();
        }
        match &submitted {
            Ok(fence) => self.last_fence = fence.clone(),
            Err(e) => log::error!("context {}: {e}", self.context),
        }
        if let Err(e) = self.reset() {
            log::warn!("context {}: no storage for the next batch: {e}", self.context);
        }
        submitted
    }

    /// Flush and wait for the GPU to finish everything submitted.
    pub fn finish(&mut self) -> Result<(), BatchError> {
        if let Some(fence) = self.flush()? {
            fence.finish(fence.fence_type(), false)?;
        }
        Ok(())
    }

    /// Cache flush and end-of-batch, padded to a multiple of 8 bytes.
    fn emit_trailer(&mut self) {
        let pad = self.used % 8 != 0;
        self.reserved = 0;
        self.emit_dword(MI_FLUSH);
        if pad {
            self.emit_dword(MI_NOOP);
        }
        self.emit_dword(MI_BATCH_BUFFER_END);
        self.reserved = self.device.config().batch.reserved;
    }

    fn submit(&mut self) -> Result<Option<Fence>, BatchError> {
        if self.mapping.take().is_some() {
            self.buffer.unmap()?;
        }
        let _hardware = self.device.hardware().acquire(self.context);
        self.list.validate_user_list()?;
        let entries = self.list.validate_entries();
        if self.device.config().debug.dump_validation {
            self.dump(&entries);
        }

        let reply = {
            let _writer = self.device.kernel_write();
            let request = ExecRequest {
                context: self.context,
                batch: self.batch_index,
                batch_offset: self.batch_offset,
                used: self.used,
                buffers: &entries,
                relocs: &self.relocs,
                fence_class: self.device.config().batch.fence_class,
                fence_type: FenceFlags::EXE,
            };
            let reply = self
                .device
                .driver()
                .submit(&request)
                .map_err(BatchError::Submit)?;
            for (entry, placed) in entries.iter().zip(&reply.buffers) {
                let (offset, flags) = entry.bo.update(placed.offset, placed.flags);
                if offset != placed.offset || flags.memory() != placed.flags.memory() {
                    log::debug!(
                        "buffer {} moved: {offset:#x} ({}) -> {:#x} ({})",
                        entry.bo.handle(),
                        flags.memory_name(),
                        placed.offset,
                        placed.flags.memory_name(),
                    );
                }
            }
            reply
        };

        match reply.fence {
            FenceReply::Emitted { token, fence_type } => Ok(self.list.fence_user_list(
                self.device.fences(),
                self.device.config().batch.fence_class,
                fence_type,
                token,
            )?),
            FenceReply::HardwareIdle => {
                log::debug!("context {}: hardware idled, no fence", self.context);
                self.list.unfence();
                Ok(None)
            }
        }
    }

    fn dump(&self, entries: &[ValidateEntry]) {
        log::info!(
            "context {}: {} bytes, {} buffers, {} relocations",
            self.context,
            self.used,
            entries.len(),
            self.relocs.len()
        );
        self.list.dump();
        for reloc in &self.relocs {
            let target = &entries[reloc.target as usize];
            log::info!(
                "  batch@{:#x} -> {}@{:#x} + {:#x}",
                reloc.offset,
                target.bo.handle(),
                target.presumed_offset.unwrap_or_default(),
                reloc.delta
            );
        }
    }
}

impl Drop for BatchBuffer {
    fn drop(&mut self) {
        if let Some(fence) = self.last_fence.take()
            && let Err(e) = fence.finish(fence.fence_type(), false)
        {
            log::warn!("context {}: waiting for last batch: {e}", self.context);
        }
        if self.mapping.take().is_some()
            && let Err(e) = self.buffer.unmap()
        {
            log::warn!("context {}: unmapping batch: {e}", self.context);
        }
    }
}
