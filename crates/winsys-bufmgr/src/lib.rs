//! Buffer objects and the pools that back them.
//!
//! A [`BufferObject`] is a shared handle on a block of GPU-addressable
//! memory. Its storage comes from a [`BufferPool`]: [`DrmPool`] makes one
//! kernel buffer per request, [`MallocPool`] serves CPU-only buffers from
//! host memory, and [`SlabPool`] carves small buffers out of larger kernel
//! allocations and defers their reuse until the GPU is done with them.
//! A [`BufferList`] collects the buffers one batch touches for validation.

mod buffer;
mod drm_pool;
mod error;
mod free_slabs;
mod list;
mod malloc_pool;
mod pool;
mod slab;

pub use buffer::BufferObject;
pub use drm_pool::DrmPool;
pub use error::BufmgrError;
pub use free_slabs::FreeSlabManager;
pub use list::{BufferList, ListEntry};
pub use malloc_pool::MallocPool;
pub use pool::{BufferPool, PoolBuffer};
pub use slab::{HeaderStats, SlabPool};
