//! Placement, mapping and fence flag sets shared with the kernel.

use bitflags::bitflags;

bitflags! {
    /// Where a buffer may live and how the GPU accesses it.
    ///
    /// Bits under [`Placement::MEM_MASK`] name memory types; a buffer
    /// resides in exactly one of them at a time, and a request naming
    /// several lets the kernel choose.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Placement: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXE = 1 << 2;
        const NO_EVICT = 1 << 4;
        const MAPPABLE = 1 << 5;
        const SHAREABLE = 1 << 6;
        const CACHED = 1 << 7;
        const NO_MOVE = 1 << 8;

        const MEM_LOCAL = 1 << 24;
        const MEM_TT = 1 << 25;
        const MEM_VRAM = 1 << 26;

        const ACCESS_MASK = Self::READ.bits() | Self::WRITE.bits() | Self::EXE.bits();
        const MEM_MASK = Self::MEM_LOCAL.bits() | Self::MEM_TT.bits() | Self::MEM_VRAM.bits();
    }
}

impl Placement {
    /// The memory-type bits only.
    pub fn memory(self) -> Placement {
        self & Placement::MEM_MASK
    }

    /// Everything but the memory-type bits.
    pub fn access(self) -> Placement {
        self - Placement::MEM_MASK
    }

    /// Short name of the memory type, for logs.
    pub fn memory_name(self) -> &'static str {
        match self.memory() {
            m if m == Placement::MEM_LOCAL => "local",
            m if m == Placement::MEM_TT => "tt",
            m if m == Placement::MEM_VRAM => "vram",
            m if m.is_empty() => "none",
            _ => "mixed",
        }
    }

    /// The memory type the kernel settles on when several are allowed.
    pub fn preferred_memory(self) -> Placement {
        let mem = self.memory();
        if mem.contains(Placement::MEM_TT) {
            Placement::MEM_TT
        } else if mem.contains(Placement::MEM_VRAM) {
            Placement::MEM_VRAM
        } else {
            Placement::MEM_LOCAL
        }
    }
}

bitflags! {
    /// CPU access requested by a map.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MapFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

bitflags! {
    /// Hints modifying map and wait behavior.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MapHint: u32 {
        /// Fail with `Busy` instead of waiting for the GPU.
        const DONT_BLOCK = 1 << 0;
        /// Map even while the buffer is queued for a submission.
        const ALLOW_UNFENCED = 1 << 1;
    }
}

bitflags! {
    /// Operations whose completion a fence reports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FenceFlags: u32 {
        /// The commands have executed.
        const EXE = 1 << 0;
        /// Rendering caches have been flushed to memory.
        const RW = 1 << 1;
    }
}
