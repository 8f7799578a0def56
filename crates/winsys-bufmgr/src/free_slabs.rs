//! Cache of kernel buffers from released slabs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use winsys_config::FreeSlabConfig;
use winsys_drm::{KernelBo, KernelDriver, Placement};

struct CachedSlab {
    bo: Arc<KernelBo>,
    placement: Placement,
    expires: Instant,
}

struct FreeSlabState {
    entries: VecDeque<CachedSlab>,
    next_check: Instant,
}

/// Holds kernel buffers of released slabs for a while so a size class that
/// churns can pick them up again instead of going back to the kernel.
pub struct FreeSlabManager {
    driver: Arc<dyn KernelDriver>,
    state: Mutex<FreeSlabState>,
    check_interval: Duration,
    timeout: Duration,
}

impl FreeSlabManager {
    pub fn new(driver: Arc<dyn KernelDriver>, config: &FreeSlabConfig) -> Arc<Self> {
        Arc::new(Self {
            driver,
            state: Mutex::new(FreeSlabState {
                entries: VecDeque::new(),
                next_check: Instant::now(),
            }),
            check_interval: config.check_interval(),
            timeout: config.timeout(),
        })
    }

    fn state(&self) -> MutexGuard<'_, FreeSlabState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of kernel buffers currently cached.
    pub fn cached(&self) -> usize {
        self.state().entries.len()
    }

    /// Cache `bo`, which was allocated with `placement`.
    pub fn add(&self, bo: Arc<KernelBo>, placement: Placement) {
        let now = Instant::now();
        let mut state = self.state();
        state.entries.push_back(CachedSlab {
            bo,
            placement,
            expires: now + self.timeout,
        });
        self.reap_locked(&mut state, now);
    }

    /// A cached buffer of exactly `size` bytes made with `placement`.
    pub fn take(&self, size: u64, placement: Placement) -> Option<Arc<KernelBo>> {
        let now = Instant::now();
        let mut state = self.state();
        self.reap_locked(&mut state, now);
        let position = state
            .entries
            .iter()
            .position(|e| e.bo.size() == size && e.placement == placement)?;
        state.entries.remove(position).map(|e| e.bo)
    }

    /// Release cached buffers whose timeout has passed.
    pub fn reap(&self) {
        let now = Instant::now();
        let mut state = self.state();
        state.next_check = now;
        self.reap_locked(&mut state, now);
    }

    fn reap_locked(&self, state: &mut FreeSlabState, now: Instant) {
        if now < state.next_check {
            return;
        }
        state.next_check = now + self.check_interval;
        let mut released = 0;
        // Entries are queued in expiry order.
        while state.entries.front().is_some_and(|e| e.expires <= now) {
            if let Some(entry) = state.entries.pop_front() {
                self.release(&entry.bo);
                released += 1;
            }
        }
        if released > 0 {
            log::debug!("free slabs: released {released} expired kernel buffers");
        }
    }

    fn release(&self, bo: &KernelBo) {
        if let Err(e) = self.driver.unreference_buffer(bo) {
            log::warn!("free slabs: releasing buffer {}: {e}", bo.handle());
        }
    }
}

impl Drop for FreeSlabManager {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for entry in std::mem::take(&mut state.entries) {
            self.release(&entry.bo);
        }
    }
}
