//! The set of buffers one batch touches.

use std::sync::Arc;

use winsys_drm::{FenceFlags, FenceToken, KernelBo, Placement, ValidateEntry};
use winsys_fence::{Fence, FenceError, FenceManager};

use crate::buffer::BufferObject;
use crate::error::BufmgrError;

/// A buffer object with the placement a batch needs for it.
#[derive(Debug, Clone)]
pub struct ListEntry {
    pub buffer: BufferObject,
    pub flags: Placement,
    pub mask: Placement,
}

/// A kernel buffer with the merged placement of every object living in it.
#[derive(Debug, Clone)]
struct KernelEntry {
    bo: Arc<KernelBo>,
    flags: Placement,
    mask: Placement,
    presumed_offset: Option<u64>,
}

/// Combine two placement requests for one buffer.
///
/// Memory types both requests pin must overlap; the result allows only the
/// common ones. Other bits both pin must agree, except access bits, which
/// accumulate.
fn merge(
    (flags, mask): (Placement, Placement),
    (new_flags, new_mask): (Placement, Placement),
) -> Option<(Placement, Placement)> {
    let both = mask & new_mask;
    let memory = if both.intersects(Placement::MEM_MASK) {
        let common = flags.memory() & new_flags.memory();
        if common.is_empty() {
            return None;
        }
        common
    } else if mask.intersects(Placement::MEM_MASK) {
        flags.memory()
    } else {
        new_flags.memory()
    };
    let pinned = both - Placement::MEM_MASK - Placement::ACCESS_MASK;
    if !((flags ^ new_flags) & pinned).is_empty() {
        return None;
    }
    let rest = (flags | new_flags) - Placement::MEM_MASK;
    Some((memory | rest, mask | new_mask))
}

/// Validation list for one submission.
///
/// Holds a reference on every buffer object added until the list is fenced,
/// unfenced or reset. Sub-buffers sharing a kernel buffer collapse into one
/// kernel entry, whose index relocations refer to.
#[derive(Debug, Default)]
pub struct BufferList {
    user: Vec<ListEntry>,
    kernel: Vec<KernelEntry>,
}

impl BufferList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_empty()
    }

    pub fn entries(&self) -> &[ListEntry] {
        &self.user
    }

    pub fn kernel_len(&self) -> usize {
        self.kernel.len()
    }

    /// Add `buffer` with the placement the batch needs, merging with any
    /// earlier request for the same buffer. Returns the kernel entry index.
    ///
    /// A conflicting request fails with [`BufmgrError::ValidationConflict`]
    /// and leaves the list unchanged.
    pub fn add_list_item(
        &mut self,
        buffer: &BufferObject,
        flags: Placement,
        mask: Placement,
    ) -> Result<u32, BufmgrError> {
        let bo = buffer.kernel()?;
        let conflict = |existing: Placement| BufmgrError::ValidationConflict {
            name: buffer.name().to_string(),
            existing,
            requested: flags,
        };

        let user_index = self.user.iter().position(|e| e.buffer.ptr_eq(buffer));
        let user_merged = match user_index {
            Some(i) => {
                let entry = &self.user[i];
                Some(merge((entry.flags, entry.mask), (flags, mask)).ok_or_else(|| conflict(entry.flags))?)
            }
            None => None,
        };
        let kernel_index = self.kernel.iter().position(|e| Arc::ptr_eq(&e.bo, &bo));
        let kernel_merged = match kernel_index {
            Some(i) => {
                let entry = &self.kernel[i];
                Some(merge((entry.flags, entry.mask), (flags, mask)).ok_or_else(|| conflict(entry.flags))?)
            }
            None => None,
        };

        match (user_index, user_merged) {
            (Some(i), Some((flags, mask))) => {
                self.user[i].flags = flags;
                self.user[i].mask = mask;
            }
            _ => self.user.push(ListEntry {
                buffer: buffer.clone(),
                flags,
                mask,
            }),
        }
        let index = match (kernel_index, kernel_merged) {
            (Some(i), Some((flags, mask))) => {
                self.kernel[i].flags = flags;
                self.kernel[i].mask = mask;
                i
            }
            _ => {
                self.kernel.push(KernelEntry {
                    bo,
                    flags,
                    mask,
                    presumed_offset: None,
                });
                self.kernel.len() - 1
            }
        };
        Ok(index as u32)
    }

    /// Merged placement of the kernel entry at `index`.
    pub fn kernel_flags(&self, index: u32) -> Option<(Placement, Placement)> {
        self.kernel.get(index as usize).map(|e| (e.flags, e.mask))
    }

    /// GPU offset relocations against the kernel entry at `index` assume.
    ///
    /// The first relocation fixes it to `current`; later ones reuse that
    /// value even if another context has since seen the buffer move, so the
    /// kernel patches all of them or none.
    pub fn presume_offset(&mut self, index: u32, current: u64) -> u64 {
        match self.kernel.get_mut(index as usize) {
            Some(entry) => *entry.presumed_offset.get_or_insert(current),
            None => current,
        }
    }

    /// The kernel-level list handed to the driver.
    pub fn validate_entries(&self) -> Vec<ValidateEntry> {
        self.kernel
            .iter()
            .map(|e| ValidateEntry {
                bo: Arc::clone(&e.bo),
                flags: e.flags,
                mask: e.mask,
                presumed_offset: e.presumed_offset,
            })
            .collect()
    }

    /// Run every buffer's pre-submission hook. On failure the buffers
    /// already validated are released again.
    pub fn validate_user_list(&self) -> Result<(), BufmgrError> {
        for (done, entry) in self.user.iter().enumerate() {
            if let Err(e) = entry.buffer.validate(entry.flags, entry.mask) {
                for earlier in &self.user[..done] {
                    if let Err(e) = earlier.buffer.fence(None) {
                        log::warn!("buffer {}: unfence: {e}", earlier.buffer.name());
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Wrap the submission's fence token in a [`Fence`], attach it to every
    /// buffer and drop the list's references.
    ///
    /// If the fence manager is exhausted it has already waited the token
    /// out; the buffers are released unfenced and `None` is returned. A
    /// token it could not wait out still comes back as a fence.
    pub fn fence_user_list(
        &mut self,
        manager: &Arc<FenceManager>,
        class: u32,
        fence_type: FenceFlags,
        token: FenceToken,
    ) -> Result<Option<Fence>, BufmgrError> {
        let fence = match manager.create(class, fence_type, token) {
            Ok(fence) => fence,
            Err(FenceError::Exhausted { .. }) => {
                self.unfence();
                return Ok(None);
            }
            Err(e) => {
                self.unfence();
                return Err(e.into());
            }
        };
        self.attach(Some(&fence));
        Ok(Some(fence))
    }

    /// Release the buffers without a fence, as when the hardware reported
    /// nothing pending or the submission failed.
    pub fn unfence(&mut self) {
        self.attach(None);
    }

    fn attach(&mut self, fence: Option<&Fence>) {
        for entry in &self.user {
            if let Err(e) = entry.buffer.fence(fence) {
                log::warn!("buffer {}: fence: {e}", entry.buffer.name());
            }
        }
        self.reset();
    }

    /// Drop the references on the buffer objects, keeping kernel entries.
    pub fn unref_user_list(&mut self) {
        self.user.clear();
    }

    /// Empty both lists, keeping their capacity for the next batch.
    pub fn reset(&mut self) {
        self.user.clear();
        self.kernel.clear();
    }

    /// Log every kernel entry.
    pub fn dump(&self) {
        for (index, entry) in self.kernel.iter().enumerate() {
            log::info!(
                "validate[{index}] {} size {} flags {:?} mask {:?} presumed {:?}",
                entry.bo.handle(),
                entry.bo.size(),
                entry.flags,
                entry.mask,
                entry.presumed_offset,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use winsys_config::{FenceConfig, FreeSlabConfig, SlabConfig};
    use winsys_drm::{KernelDriver, SimDriver};
    use winsys_fence::DriverFences;

    use crate::{BufferPool, FreeSlabManager, SlabPool};

    fn slab_pool(sim: &Arc<SimDriver>) -> Arc<dyn BufferPool> {
        let free = FreeSlabManager::new(sim.clone(), &FreeSlabConfig::default());
        Arc::new(SlabPool::new(
            sim.clone(),
            Placement::MEM_TT,
            &SlabConfig::default(),
            free,
        ))
    }

    fn object(pool: &Arc<dyn BufferPool>, name: &str) -> BufferObject {
        BufferObject::create(name, pool.clone(), 64, Placement::MEM_TT, 0).unwrap()
    }

    const MEM: Placement = Placement::MEM_MASK;

    #[test]
    fn test_merge_rules() {
        let tt_read = (Placement::MEM_TT | Placement::READ, MEM | Placement::ACCESS_MASK);
        let any_write = (
            Placement::MEM_TT | Placement::MEM_VRAM | Placement::WRITE,
            MEM | Placement::ACCESS_MASK,
        );
        let (flags, _) = merge(tt_read, any_write).unwrap();
        assert_eq!(flags, Placement::MEM_TT | Placement::READ | Placement::WRITE);

        let vram = (Placement::MEM_VRAM, MEM);
        assert!(merge(tt_read, vram).is_none());

        let cached = (Placement::CACHED, Placement::CACHED);
        let uncached = (Placement::empty(), Placement::CACHED);
        assert!(merge(cached, uncached).is_none());

        // Memory pinned by only one side is taken from it.
        let unpinned = (Placement::READ, Placement::ACCESS_MASK);
        assert_eq!(merge(unpinned, vram).unwrap().0, Placement::MEM_VRAM | Placement::READ);
    }

    #[test]
    fn test_duplicates_merge() {
        let sim = Arc::new(SimDriver::default());
        let pool = slab_pool(&sim);
        let bo = object(&pool, "tex");
        let mut list = BufferList::new();
        let first = list
            .add_list_item(&bo, Placement::MEM_TT | Placement::READ, MEM | Placement::READ)
            .unwrap();
        let second = list
            .add_list_item(&bo, Placement::MEM_TT | Placement::WRITE, MEM | Placement::WRITE)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(list.len(), 1);
        assert_eq!(
            list.kernel_flags(first).unwrap().0,
            Placement::MEM_TT | Placement::READ | Placement::WRITE
        );
    }

    #[test]
    fn test_sub_buffers_share_kernel_entry() {
        let sim = Arc::new(SimDriver::default());
        let pool = slab_pool(&sim);
        let a = object(&pool, "a");
        let b = object(&pool, "b");
        let mut list = BufferList::new();
        let ia = list.add_list_item(&a, Placement::MEM_TT, MEM).unwrap();
        let ib = list.add_list_item(&b, Placement::MEM_TT, MEM).unwrap();
        assert_eq!(ia, ib);
        assert_eq!(list.len(), 2);
        assert_eq!(list.kernel_len(), 1);
    }

    #[test]
    fn test_first_presumed_offset_sticks() {
        let sim = Arc::new(SimDriver::default());
        let pool = slab_pool(&sim);
        let bo = object(&pool, "target");
        let mut list = BufferList::new();
        let index = list.add_list_item(&bo, Placement::MEM_TT, MEM).unwrap();
        assert_eq!(list.presume_offset(index, 0x1000), 0x1000);
        assert_eq!(list.presume_offset(index, 0x2000), 0x1000);
        assert_eq!(list.validate_entries()[0].presumed_offset, Some(0x1000));
    }

    #[test]
    fn test_conflicting_placement_is_rejected() {
        let sim = Arc::new(SimDriver::default());
        let pool = slab_pool(&sim);
        let bo = object(&pool, "vbo");
        let mut list = BufferList::new();
        let index = list
            .add_list_item(&bo, Placement::MEM_TT | Placement::READ, MEM | Placement::READ)
            .unwrap();
        let err = list
            .add_list_item(&bo, Placement::MEM_VRAM, MEM)
            .unwrap_err();
        assert!(matches!(err, BufmgrError::ValidationConflict { .. }));
        assert_eq!(
            list.kernel_flags(index).unwrap(),
            (Placement::MEM_TT | Placement::READ, MEM | Placement::READ)
        );
        assert_eq!(list.entries()[0].flags, Placement::MEM_TT | Placement::READ);
    }

    #[test]
    fn test_reference_counts_are_conserved() {
        let sim = Arc::new(SimDriver::default());
        let pool = slab_pool(&sim);
        let fences = FenceManager::new(
            Arc::new(DriverFences::new(sim.clone())),
            &FenceConfig::default(),
        );
        let a = object(&pool, "a");
        let b = object(&pool, "b");
        let counts = || (a.reference_count(), b.reference_count());
        let before = counts();

        let fill = |list: &mut BufferList| {
            list.add_list_item(&a, Placement::MEM_TT, MEM).unwrap();
            list.add_list_item(&b, Placement::MEM_TT, MEM).unwrap();
            list.add_list_item(&a, Placement::MEM_TT | Placement::READ, MEM).unwrap();
        };

        let mut list = BufferList::new();
        fill(&mut list);
        assert_eq!(counts(), (before.0 + 1, before.1 + 1));
        let token = sim.emit_fence(FenceFlags::EXE);
        let fence = list
            .fence_user_list(&fences, 0, FenceFlags::EXE, token)
            .unwrap();
        assert!(fence.is_some());
        assert_eq!(counts(), before);

        fill(&mut list);
        list.unref_user_list();
        assert_eq!(counts(), before);

        fill(&mut list);
        list.reset();
        assert_eq!(counts(), before);
        assert!(list.is_empty());
        assert_eq!(list.kernel_len(), 0);
    }

    #[test]
    fn test_validate_then_unfence() {
        let sim = Arc::new(SimDriver::default());
        let pool = slab_pool(&sim);
        let bo = object(&pool, "vbo");
        let mut list = BufferList::new();
        list.add_list_item(&bo, Placement::MEM_TT, MEM).unwrap();
        list.validate_user_list().unwrap();
        assert!(
            bo.map(winsys_drm::MapFlags::WRITE, winsys_drm::MapHint::DONT_BLOCK)
                .unwrap_err()
                .is_busy()
        );
        list.unfence();
        bo.map(winsys_drm::MapFlags::WRITE, winsys_drm::MapHint::DONT_BLOCK)
            .unwrap();
        bo.unmap().unwrap();
    }

    fn exhausted_manager(sim: &Arc<SimDriver>) -> (Arc<FenceManager>, Fence) {
        let fences = FenceManager::new(
            Arc::new(DriverFences::new(sim.clone())),
            &FenceConfig {
                max_outstanding: 1,
                pressure_sleep_us: 1,
                ..Default::default()
            },
        );
        let pending = fences
            .create(0, FenceFlags::EXE, sim.emit_fence(FenceFlags::EXE))
            .unwrap();
        (fences, pending)
    }

    #[test]
    fn test_exhausted_manager_drains_and_leaves_buffers_unfenced() {
        let sim = Arc::new(SimDriver::default());
        let pool = slab_pool(&sim);
        let (fences, _pending) = exhausted_manager(&sim);

        let bo = object(&pool, "vbo");
        let mut list = BufferList::new();
        list.add_list_item(&bo, Placement::MEM_TT, MEM).unwrap();
        list.validate_user_list().unwrap();
        let token = sim.emit_fence(FenceFlags::EXE);
        let fence = list
            .fence_user_list(&fences, 0, FenceFlags::EXE, token)
            .unwrap();
        assert!(fence.is_none());
        assert!(list.is_empty());
        assert_eq!(sim.fence_signaled(token, FenceFlags::EXE).unwrap(), FenceFlags::EXE);
        bo.map(winsys_drm::MapFlags::WRITE, winsys_drm::MapHint::DONT_BLOCK)
            .unwrap();
        bo.unmap().unwrap();
    }

    #[test]
    fn test_stalled_drain_keeps_buffers_fenced() {
        let sim = Arc::new(SimDriver::default());
        let pool = slab_pool(&sim);
        let (fences, _pending) = exhausted_manager(&sim);
        sim.set_stalled(true);

        let bo = object(&pool, "vbo");
        let mut list = BufferList::new();
        list.add_list_item(&bo, Placement::MEM_TT, MEM).unwrap();
        list.validate_user_list().unwrap();
        let token = sim.emit_fence(FenceFlags::EXE);
        let fence = list
            .fence_user_list(&fences, 0, FenceFlags::EXE, token)
            .unwrap()
            .unwrap();
        assert!(list.is_empty());
        assert!(!fence.is_signaled(FenceFlags::EXE).unwrap());
        assert!(
            bo.map(winsys_drm::MapFlags::WRITE, winsys_drm::MapHint::DONT_BLOCK)
                .unwrap_err()
                .is_busy()
        );

        sim.set_stalled(false);
        sim.retire_all();
        bo.map(winsys_drm::MapFlags::WRITE, winsys_drm::MapHint::DONT_BLOCK)
            .unwrap();
        bo.unmap().unwrap();
    }
}
