//! Fence objects and the per-class ordering that lets one completion answer
//! for many.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use winsys_config::FenceConfig;
use winsys_drm::{FenceFlags, FenceToken};

use crate::backend::FenceBackend;
use crate::error::FenceError;

/// Unsignaled fences of one class, oldest first.
#[derive(Default)]
struct FenceClass {
    next_seq: u64,
    pending: BTreeMap<u64, Weak<FenceInner>>,
}

/// Creates fences and propagates completion between them.
///
/// Lock order: a fence's token lock is always taken before the manager
/// lock, never the other way round.
pub struct FenceManager {
    backend: Arc<dyn FenceBackend>,
    classes: Mutex<Vec<FenceClass>>,
    max_outstanding: usize,
    pressure_sleep: Duration,
}

static_assertions::assert_impl_all!(FenceManager: Send, Sync);
static_assertions::assert_impl_all!(Fence: Send, Sync, Clone);

impl FenceManager {
    pub fn new(backend: Arc<dyn FenceBackend>, config: &FenceConfig) -> Arc<Self> {
        let classes = (0..config.num_classes.max(1))
            .map(|_| FenceClass::default())
            .collect();
        Arc::new(Self {
            backend,
            classes: Mutex::new(classes),
            max_outstanding: config.max_outstanding.max(1),
            pressure_sleep: config.pressure_sleep(),
        })
    }

    fn classes(&self) -> MutexGuard<'_, Vec<FenceClass>> {
        self.classes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn num_classes(&self) -> u32 {
        self.classes().len() as u32
    }

    /// Unsignaled fences tracked in `class`.
    pub fn outstanding(&self, class: u32) -> usize {
        self.classes()
            .get(class as usize)
            .map_or(0, |c| c.pending.len())
    }

    /// Wrap a kernel token in a fence appended to `class`.
    ///
    /// When the class already holds `max_outstanding` unsignaled fences the
    /// newest one is polled, which may retire the whole class. If that does
    /// not free room, the token is drained and released and creation fails
    /// with [`FenceError::Exhausted`]. A token that cannot be drained still
    /// gets its fence, past the limit, since the work behind it may be
    /// running.
    pub fn create(
        self: &Arc<Self>,
        class: u32,
        fence_type: FenceFlags,
        token: FenceToken,
    ) -> Result<Fence, FenceError> {
        let classes = self.num_classes();
        if class >= classes {
            return Err(FenceError::InvalidClass { class, classes });
        }

        let mut guard = self.classes();
        if guard[class as usize].pending.len() >= self.max_outstanding {
            drop(guard);
            self.poll_class(class);
            guard = self.classes();
            if guard[class as usize].pending.len() >= self.max_outstanding {
                drop(guard);
                log::warn!(
                    "fence class {class}: {} fences outstanding, draining {token:?}",
                    self.max_outstanding
                );
                match self.backend.finish(token, fence_type, false) {
                    Ok(()) => {
                        self.backend.unreference(token);
                        std::thread::sleep(self.pressure_sleep);
                        return Err(FenceError::Exhausted { class });
                    }
                    Err(e) => {
                        log::warn!("fence class {class}: drain of {token:?} failed: {e}");
                    }
                }
                guard = self.classes();
            }
        }

        let state = &mut guard[class as usize];
        let seq = state.next_seq;
        state.next_seq += 1;
        let inner = Arc::new(FenceInner {
            manager: Arc::clone(self),
            class,
            fence_type,
            seq,
            signaled: AtomicU32::new(0),
            token: Mutex::new(Some(token)),
        });
        if !fence_type.is_empty() {
            state.pending.insert(seq, Arc::downgrade(&inner));
        }
        Ok(Fence(inner))
    }

    /// Ask the backend about the newest live fence of `class`.
    fn poll_class(&self, class: u32) {
        let newest = {
            let classes = self.classes();
            classes[class as usize]
                .pending
                .values()
                .rev()
                .find_map(Weak::upgrade)
        };
        if let Some(inner) = newest {
            let fence = Fence(inner);
            if let Err(e) = fence.signaled_type(fence.fence_type()) {
                log::debug!("fence class {class}: poll failed: {e}");
            }
        }
    }

    /// Mark `bits` signaled on `fence` and every older fence of its class.
    ///
    /// Fences whose whole type is now signaled leave the class list and give
    /// their token back to the backend.
    fn cascade(&self, fence: &FenceInner, bits: FenceFlags) {
        let mut retired = Vec::new();
        // Upgraded handles may be the last ones; they drop after the lock.
        let mut pending = Vec::new();
        {
            let mut classes = self.classes();
            let state = &mut classes[fence.class as usize];
            let mut done = Vec::new();
            for (&seq, weak) in state.pending.range(..=fence.seq).rev() {
                let Some(older) = weak.upgrade() else {
                    continue;
                };
                let mask = bits & older.fence_type;
                let now = older.signaled.fetch_or(mask.bits(), Ordering::AcqRel) | mask.bits();
                if FenceFlags::from_bits_retain(now).contains(older.fence_type) {
                    done.push(seq);
                    retired.push(older);
                } else {
                    pending.push(older);
                }
            }
            for seq in done {
                state.pending.remove(&seq);
            }
        }
        if !retired.is_empty() {
            log::trace!(
                "fence class {}: {} fences retired through #{}",
                fence.class,
                retired.len(),
                fence.seq
            );
        }
        for older in retired {
            older.release_token();
        }
        drop(pending);
    }

    fn remove(&self, class: u32, seq: u64) {
        let mut classes = self.classes();
        if let Some(state) = classes.get_mut(class as usize) {
            state.pending.remove(&seq);
        }
    }
}

impl fmt::Debug for FenceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceManager")
            .field("classes", &self.num_classes())
            .field("max_outstanding", &self.max_outstanding)
            .finish()
    }
}

struct FenceInner {
    manager: Arc<FenceManager>,
    class: u32,
    fence_type: FenceFlags,
    seq: u64,
    signaled: AtomicU32,
    /// `None` once handed back to the backend.
    token: Mutex<Option<FenceToken>>,
}

impl FenceInner {
    fn token(&self) -> MutexGuard<'_, Option<FenceToken>> {
        self.token.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signaled(&self) -> FenceFlags {
        FenceFlags::from_bits_retain(self.signaled.load(Ordering::Acquire))
    }

    fn release_token(&self) {
        let token = self.token().take();
        if let Some(token) = token {
            self.manager.backend.unreference(token);
        }
    }
}

impl Drop for FenceInner {
    fn drop(&mut self) {
        self.manager.remove(self.class, self.seq);
        self.release_token();
    }
}

/// A shared handle on a point in a command stream.
///
/// Cloning takes a reference; dropping the last one removes the fence from
/// its class and releases the kernel token.
#[derive(Clone)]
pub struct Fence(Arc<FenceInner>);

impl Fence {
    pub fn class(&self) -> u32 {
        self.0.class
    }

    /// Operations this fence reports on.
    pub fn fence_type(&self) -> FenceFlags {
        self.0.fence_type
    }

    /// Position in the class, increasing with creation order.
    pub fn sequence(&self) -> u64 {
        self.0.seq
    }

    pub fn manager(&self) -> &Arc<FenceManager> {
        &self.0.manager
    }

    /// Whether both handles refer to the same fence.
    pub fn ptr_eq(&self, other: &Fence) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// The last known signaled mask, without asking the backend.
    pub fn signaled_cached(&self) -> FenceFlags {
        self.0.signaled()
    }

    /// Whether the cached mask already covers `flush_type`.
    pub fn is_signaled_cached(&self, flush_type: FenceFlags) -> bool {
        self.signaled_cached().contains(flush_type & self.0.fence_type)
    }

    /// The signaled mask, asking the backend if the cache does not already
    /// cover `flush_type`.
    pub fn signaled_type(&self, flush_type: FenceFlags) -> Result<FenceFlags, FenceError> {
        let inner = &self.0;
        let wanted = flush_type & inner.fence_type;
        let cached = inner.signaled();
        if cached.contains(wanted) {
            return Ok(cached);
        }

        let learned = {
            let token = inner.token();
            let Some(token) = *token else {
                return Ok(inner.signaled());
            };
            let reported = inner.manager.backend.signaled(token, inner.fence_type)? & inner.fence_type;
            let before = inner.signaled.fetch_or(reported.bits(), Ordering::AcqRel);
            reported - FenceFlags::from_bits_retain(before)
        };
        if !learned.is_empty() {
            inner.manager.cascade(inner, inner.signaled());
        }
        Ok(inner.signaled())
    }

    /// Whether `flush_type` has signaled, asking the backend if needed.
    pub fn is_signaled(&self, flush_type: FenceFlags) -> Result<bool, FenceError> {
        let wanted = flush_type & self.0.fence_type;
        Ok(self.signaled_type(flush_type)?.contains(wanted))
    }

    /// Block until `flush_type` has signaled.
    pub fn finish(&self, flush_type: FenceFlags, lazy: bool) -> Result<(), FenceError> {
        let inner = &self.0;
        let wanted = flush_type & inner.fence_type;
        if inner.signaled().contains(wanted) {
            return Ok(());
        }
        {
            let token = inner.token();
            let Some(token) = *token else {
                return Ok(());
            };
            inner.manager.backend.finish(token, wanted, lazy)?;
            inner.signaled.fetch_or(wanted.bits(), Ordering::AcqRel);
        }
        inner.manager.cascade(inner, inner.signaled());
        Ok(())
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("class", &self.0.class)
            .field("seq", &self.0.seq)
            .field("type", &self.0.fence_type)
            .field("signaled", &self.0.signaled())
            .finish()
    }
}
