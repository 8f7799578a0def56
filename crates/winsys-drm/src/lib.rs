//! The kernel memory-manager surface the buffer manager is built on.
//!
//! [`KernelDriver`] is the narrow set of calls the rest of the workspace makes
//! into the kernel: buffer creation and mapping, placement changes, command
//! submission and fence queries. [`SimDriver`] implements it entirely in
//! process memory for tests and the demo.

mod bo;
mod driver;
mod error;
mod exec;
mod flags;
pub mod sim;

pub use bo::{BufferHandle, HostAllocation, KernelBo, Mapping};
pub use driver::KernelDriver;
pub use error::DrmError;
pub use exec::{
    BufferReply, ExecReply, ExecRequest, FenceReply, FenceToken, Relocation, ValidateEntry,
};
pub use flags::{FenceFlags, MapFlags, MapHint, Placement};
pub use sim::{SimConfig, SimDriver, SimStats, Submission};

/// Command that flushes the render caches.
pub const MI_FLUSH: u32 = 0x04 << 23;
/// Command that terminates a batch.
pub const MI_BATCH_BUFFER_END: u32 = 0x0A << 23;
/// Padding command.
pub const MI_NOOP: u32 = 0;
