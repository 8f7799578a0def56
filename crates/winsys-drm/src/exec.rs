//! Command submission requests and replies.

use std::sync::Arc;

use crate::bo::KernelBo;
use crate::flags::{FenceFlags, Placement};

/// Kernel-side name of an emitted fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FenceToken(pub u64);

/// One buffer the kernel must make resident for a submission.
#[derive(Debug, Clone)]
pub struct ValidateEntry {
    pub bo: Arc<KernelBo>,
    /// Required placement and access.
    pub flags: Placement,
    /// Which bits of `flags` are binding.
    pub mask: Placement,
    /// Offset every relocation against this buffer assumed, if any were emitted.
    pub presumed_offset: Option<u64>,
}

/// A dword in a buffer that holds the GPU address of another buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Byte offset of the dword inside the kernel buffer holding it.
    pub offset: u32,
    /// Added to the target's offset to form the address.
    pub delta: u32,
    /// Index of the target in the validate list.
    pub target: u32,
    /// Index of the buffer containing the dword in the validate list.
    pub dest: u32,
}

/// Everything the kernel needs to run one batch.
#[derive(Debug, Clone, Copy)]
pub struct ExecRequest<'a> {
    /// Hardware context submitting the batch.
    pub context: u32,
    /// Index of the batch buffer in `buffers`.
    pub batch: u32,
    /// Start of the commands inside the batch's kernel buffer.
    pub batch_offset: u64,
    /// Bytes of commands.
    pub used: u32,
    pub buffers: &'a [ValidateEntry],
    pub relocs: &'a [Relocation],
    pub fence_class: u32,
    pub fence_type: FenceFlags,
}

/// How the kernel tracks completion of a submitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceReply {
    /// A fence was emitted after the batch.
    Emitted {
        token: FenceToken,
        fence_type: FenceFlags,
    },
    /// The hardware idled and dropped its fences; nothing is pending.
    HardwareIdle,
}

/// Where a validated buffer ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferReply {
    pub offset: u64,
    pub flags: Placement,
}

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecReply {
    pub fence: FenceReply,
    /// One entry per validate entry, in request order.
    pub buffers: Vec<BufferReply>,
}
