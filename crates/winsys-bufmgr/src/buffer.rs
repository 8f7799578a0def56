//! Reference-counted buffer objects.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use winsys_drm::{BufferHandle, KernelBo, MapFlags, MapHint, Mapping, Placement};
use winsys_fence::Fence;

use crate::error::BufmgrError;
use crate::pool::{BufferPool, PoolBuffer, same_pool};

/// What backs a buffer object.
enum Storage {
    /// Nothing yet; the first `data` call allocates.
    Empty,
    /// Allocated from the pool; destroyed with the object.
    Owned(PoolBuffer),
    /// Someone else's buffer; only our reference is dropped.
    Imported(PoolBuffer),
    /// Client memory, never seen by the GPU through this object.
    User(Mapping),
}

struct BufferState {
    pool: Option<Arc<dyn BufferPool>>,
    storage: Storage,
    size: u64,
    flags: Placement,
    alignment: u64,
    map_count: u32,
}

impl BufferState {
    fn pool(&self, name: &str) -> Result<&Arc<dyn BufferPool>, BufmgrError> {
        self.pool
            .as_ref()
            .ok_or_else(|| BufmgrError::NoStorage(name.to_string()))
    }

    /// Pool and handle of kernel-visible storage.
    fn backing(&self, name: &str) -> Result<(&Arc<dyn BufferPool>, &PoolBuffer), BufmgrError> {
        match &self.storage {
            Storage::Owned(buf) | Storage::Imported(buf) => Ok((self.pool(name)?, buf)),
            Storage::Empty | Storage::User(_) => Err(BufmgrError::NoStorage(name.to_string())),
        }
    }

    /// Destroy owned storage, leaving the object empty.
    fn release(&mut self, name: &str) -> Result<(), BufmgrError> {
        match std::mem::replace(&mut self.storage, Storage::Empty) {
            Storage::Owned(buf) => self.pool(name)?.destroy(buf),
            Storage::Imported(buf) => self.pool(name)?.unreference(buf),
            Storage::Empty | Storage::User(_) => Ok(()),
        }
    }
}

struct BufferInner {
    name: String,
    state: Mutex<BufferState>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.map_count > 0 {
            log::warn!("buffer {}: dropped while mapped", self.name);
            if let Ok((pool, buf)) = state.backing(&self.name) {
                for _ in 0..state.map_count {
                    if let Err(e) = pool.unmap(buf) {
                        log::warn!("buffer {}: unmap on drop: {e}", self.name);
                        break;
                    }
                }
            }
        }
        if let Err(e) = state.release(&self.name) {
            log::warn!("buffer {}: release failed: {e}", self.name);
        }
    }
}

/// A shared handle on a block of GPU-addressable memory.
///
/// Cloning takes a reference. When the last reference drops, owned storage
/// is returned to its pool (which may defer reuse until the GPU is done)
/// and imported storage has its foreign reference dropped.
#[derive(Clone)]
pub struct BufferObject(Arc<BufferInner>);

static_assertions::assert_impl_all!(BufferObject: Send, Sync);

impl BufferObject {
    /// An object with no storage yet. `data` allocates it from `pool`.
    pub fn new(
        name: impl Into<String>,
        pool: Arc<dyn BufferPool>,
        flags: Placement,
        alignment: u64,
    ) -> Self {
        Self::from_state(
            name.into(),
            BufferState {
                pool: Some(pool),
                storage: Storage::Empty,
                size: 0,
                flags,
                alignment,
                map_count: 0,
            },
        )
    }

    /// An object allocated right away with `size` bytes.
    pub fn create(
        name: impl Into<String>,
        pool: Arc<dyn BufferPool>,
        size: u64,
        flags: Placement,
        alignment: u64,
    ) -> Result<Self, BufmgrError> {
        let buf = pool.create(size, flags, alignment)?;
        Ok(Self::from_state(
            name.into(),
            BufferState {
                pool: Some(pool),
                storage: Storage::Owned(buf),
                size,
                flags,
                alignment,
                map_count: 0,
            },
        ))
    }

    /// Wrap client memory.
    ///
    /// # Safety
    ///
    /// `memory` must stay valid for reads and writes for as long as any
    /// clone of the returned object exists.
    pub unsafe fn user(name: impl Into<String>, memory: Mapping) -> Self {
        Self::from_state(
            name.into(),
            BufferState {
                pool: None,
                size: memory.len() as u64,
                storage: Storage::User(memory),
                flags: Placement::MEM_LOCAL | Placement::CACHED,
                alignment: 0,
                map_count: 0,
            },
        )
    }

    fn from_state(name: String, state: BufferState) -> Self {
        Self(Arc::new(BufferInner {
            name,
            state: Mutex::new(state),
        }))
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.0.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn size(&self) -> u64 {
        self.state().size
    }

    /// Requested placement.
    pub fn flags(&self) -> Placement {
        self.state().flags
    }

    pub fn is_user(&self) -> bool {
        matches!(self.state().storage, Storage::User(_))
    }

    pub fn is_imported(&self) -> bool {
        matches!(self.state().storage, Storage::Imported(_))
    }

    pub fn has_storage(&self) -> bool {
        !matches!(self.state().storage, Storage::Empty)
    }

    /// Identity of the current storage; changes when `data` reallocates.
    pub fn storage_id(&self) -> Option<usize> {
        match &self.state().storage {
            Storage::Owned(buf) | Storage::Imported(buf) => Some(buf.id()),
            Storage::User(memory) => Some(memory.as_ptr() as usize),
            Storage::Empty => None,
        }
    }

    /// Whether both handles refer to the same object.
    pub fn ptr_eq(&self, other: &BufferObject) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Handles currently sharing this object.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Upload `data` (if any) into storage of at least `size` bytes from
    /// `pool` (or the current pool), reallocating when needed.
    ///
    /// Storage is replaced when there is none, the pool changed, it is too
    /// small, or it is still busy on the GPU (so the upload never stalls).
    /// A placement change is applied in place when the pool supports it and
    /// by reallocating otherwise. On return the buffer is unmapped. On error
    /// the old storage may already be gone.
    pub fn data(
        &self,
        size: u64,
        data: Option<&[u8]>,
        pool: Option<Arc<dyn BufferPool>>,
        flags: Placement,
    ) -> Result<(), BufmgrError> {
        let name = self.name();
        if let Some(data) = data
            && data.len() as u64 > size
        {
            return Err(BufmgrError::OutOfRange {
                offset: 0,
                len: data.len() as u64,
                size,
            });
        }

        let mut state = self.state();
        if state.map_count > 0 {
            return Err(BufmgrError::Mapped(name.to_string()));
        }
        if let Storage::User(_) = state.storage {
            return Err(BufmgrError::unsupported("user", "data"));
        }
        let pool = match pool {
            Some(pool) => pool,
            None => Arc::clone(state.pool(name)?),
        };
        let pool_changed = state.pool.as_ref().is_none_or(|p| !same_pool(p, &pool));

        let adequate = match &state.storage {
            Storage::Owned(buf) | Storage::Imported(buf) if !pool_changed => {
                pool.size(buf)? >= size
            }
            _ => false,
        };
        if !adequate {
            if let Storage::Imported(_) = state.storage {
                return Err(BufmgrError::Imported(name.to_string()));
            }
            state.release(name)?;
            let buf = pool.create(size, flags, state.alignment)?;
            state.pool = Some(pool);
            state.storage = Storage::Owned(buf);
            state.flags = flags;
            state.size = size;
            return upload(&state, name, data);
        }

        let (_, buf) = state.backing(name)?;
        let buf = buf.clone();
        match pool.map(&buf, MapFlags::WRITE, MapHint::DONT_BLOCK) {
            Err(e) if e.is_busy() && !matches!(state.storage, Storage::Imported(_)) => {
                log::debug!("buffer {name}: busy, uploading into fresh storage");
                let replacement = pool.create(size, flags, state.alignment)?;
                state.release(name)?;
                state.storage = Storage::Owned(replacement);
                state.flags = flags;
                state.size = size;
                upload(&state, name, data)
            }
            Err(e) if e.is_busy() => {
                state.size = size;
                upload(&state, name, data)
            }
            Err(e) => Err(e),
            Ok(mapping) => {
                if flags != state.flags {
                    pool.unmap(&buf)?;
                    match pool.set_status(&buf, flags, Placement::all()) {
                        Ok(()) => {}
                        Err(BufmgrError::InvalidOperation { .. })
                            if !matches!(state.storage, Storage::Imported(_)) =>
                        {
                            log::debug!("buffer {name}: reallocating for placement {flags:?}");
                            let replacement = pool.create(size, flags, state.alignment)?;
                            state.release(name)?;
                            state.storage = Storage::Owned(replacement);
                        }
                        Err(e) => return Err(e),
                    }
                    state.flags = flags;
                    state.size = size;
                    return upload(&state, name, data);
                }
                if let Some(data) = data {
                    // SAFETY: mapped above and bounds checked against `size`,
                    // which the storage was found to hold.
                    unsafe { mapping.write(0, data) };
                }
                state.size = size;
                pool.unmap(&buf)
            }
        }
    }

    /// Map the buffer. Pairs with [`BufferObject::unmap`].
    pub fn map(&self, flags: MapFlags, hint: MapHint) -> Result<Mapping, BufmgrError> {
        let mut state = self.state();
        let size = state.size;
        let mapping = match &state.storage {
            Storage::User(memory) => *memory,
            _ => {
                let (pool, buf) = state.backing(self.name())?;
                let mapping = pool.map(buf, flags, hint)?;
                if mapping.len() < size as usize {
                    pool.unmap(buf)?;
                }
                mapping
            }
        };
        let Some(mapping) = mapping.slice(0, size as usize) else {
            return Err(BufmgrError::OutOfRange {
                offset: 0,
                len: size,
                size: mapping.len() as u64,
            });
        };
        state.map_count += 1;
        Ok(mapping)
    }

    pub fn unmap(&self) -> Result<(), BufmgrError> {
        let mut state = self.state();
        if state.map_count == 0 {
            return Err(BufmgrError::NotMapped(self.name().to_string()));
        }
        if !matches!(state.storage, Storage::User(_)) {
            let (pool, buf) = state.backing(self.name())?;
            pool.unmap(buf)?;
        }
        state.map_count -= 1;
        Ok(())
    }

    /// Copy `data` into the buffer at `offset`.
    pub fn sub_data(&self, offset: u64, data: &[u8]) -> Result<(), BufmgrError> {
        self.check_range(offset, data.len() as u64)?;
        let mapping = self.map(MapFlags::WRITE, MapHint::empty())?;
        // SAFETY: mapped, and the range was checked against the size.
        unsafe { mapping.write(offset as usize, data) };
        self.unmap()
    }

    /// Copy bytes at `offset` into `out`.
    pub fn get_sub_data(&self, offset: u64, out: &mut [u8]) -> Result<(), BufmgrError> {
        self.check_range(offset, out.len() as u64)?;
        let mapping = self.map(MapFlags::READ, MapHint::empty())?;
        // SAFETY: mapped, and the range was checked against the size.
        unsafe { mapping.read(offset as usize, out) };
        self.unmap()
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<(), BufmgrError> {
        let size = self.size();
        if offset.checked_add(len).is_none_or(|end| end > size) {
            return Err(BufmgrError::OutOfRange { offset, len, size });
        }
        Ok(())
    }

    /// Back an empty object with the kernel buffer `handle`, owned elsewhere.
    pub fn set_referenced(&self, handle: BufferHandle) -> Result<(), BufmgrError> {
        let mut state = self.state();
        if !matches!(state.storage, Storage::Empty) {
            return Err(BufmgrError::AlreadyBacked(self.name().to_string()));
        }
        let pool = Arc::clone(state.pool(self.name())?);
        let buf = pool.reference(handle)?;
        state.size = pool.size(&buf)?;
        state.flags = pool.flags(&buf)?;
        state.storage = Storage::Imported(buf);
        Ok(())
    }

    /// Attach the fence of the last GPU use, or with `None` clear a pending
    /// validation.
    pub fn fence(&self, fence: Option<&Fence>) -> Result<(), BufmgrError> {
        let state = self.state();
        match &state.storage {
            Storage::Owned(buf) | Storage::Imported(buf) => {
                state.pool(self.name())?.fence(buf, fence)
            }
            Storage::Empty | Storage::User(_) => Ok(()),
        }
    }

    /// Pool hook run before a submission that uses the buffer.
    pub fn validate(&self, flags: Placement, mask: Placement) -> Result<(), BufmgrError> {
        let state = self.state();
        match &state.storage {
            Storage::Owned(buf) | Storage::Imported(buf) => {
                state.pool(self.name())?.validate(buf, flags, mask)
            }
            Storage::Empty | Storage::User(_) => Ok(()),
        }
    }

    pub fn wait_idle(&self, lazy: bool) -> Result<(), BufmgrError> {
        let state = self.state();
        match state.backing(self.name()) {
            Ok((pool, buf)) => pool.wait_idle(buf, lazy),
            Err(_) => Ok(()),
        }
    }

    /// GPU address of a pinned buffer.
    pub fn offset(&self) -> Result<u64, BufmgrError> {
        let state = self.state();
        let (pool, buf) = state.backing(self.name())?;
        pool.offset(buf)
    }

    /// Start of the buffer inside its kernel buffer.
    pub fn pool_offset(&self) -> Result<u64, BufmgrError> {
        let state = self.state();
        let (pool, buf) = state.backing(self.name())?;
        pool.pool_offset(buf)
    }

    pub fn kernel(&self) -> Result<Arc<KernelBo>, BufmgrError> {
        let state = self.state();
        let (pool, buf) = state.backing(self.name())?;
        pool.kernel(buf)
    }

    /// The kernel buffer holding this one and the start inside it, read
    /// under one lock.
    pub fn kernel_location(&self) -> Result<(Arc<KernelBo>, u64), BufmgrError> {
        let state = self.state();
        let (pool, buf) = state.backing(self.name())?;
        Ok((pool.kernel(buf)?, pool.pool_offset(buf)?))
    }
}

/// Map write-only, copy, unmap.
fn upload(state: &BufferState, name: &str, data: Option<&[u8]>) -> Result<(), BufmgrError> {
    let Some(data) = data else {
        return Ok(());
    };
    let (pool, buf) = state.backing(name)?;
    let mapping = pool.map(buf, MapFlags::WRITE, MapHint::empty())?;
    // SAFETY: freshly mapped storage of at least `state.size >= data.len()` bytes.
    unsafe { mapping.write(0, data) };
    pool.unmap(buf)
}

impl fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferObject")
            .field("name", &self.0.name)
            .field("size", &self.size())
            .finish()
    }
}
