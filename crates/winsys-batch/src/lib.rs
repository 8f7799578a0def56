//! Command batches and the winsys surface the rendering front end calls.
//!
//! A [`Device`] owns one connection's pools, fence manager and locks. Each
//! rendering context fills its own [`BatchBuffer`] with commands and
//! relocations against shared [`BufferObject`](winsys_bufmgr::BufferObject)s;
//! a flush validates the buffers, submits the batch to the kernel and fences
//! every buffer it touched.

mod batch;
mod device;
mod error;
mod winsys;

pub use batch::{BatchBuffer, BatchFlags};
pub use device::{Device, HardwareGuard, HardwareLock};
pub use error::BatchError;
pub use winsys::{BlitPresenter, BufferUsage, Presenter, XY_SRC_COPY_BLT, fence_reference};
