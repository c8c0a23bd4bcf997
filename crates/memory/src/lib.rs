//! Guest physical memory backends and big-endian access primitives.
#![forbid(unsafe_code)]

pub mod be;
pub mod phys;

pub use be::{read_be, write_be, BeValue};
pub use phys::{MemoryMap, MemoryMapConfig};

/// Real (backed) main RAM size: 24 MiB.
pub const REALRAM_SIZE: u32 = 0x0180_0000;
/// Addressable main RAM window: 32 MiB. Offsets are masked with [`RAM_MASK`],
/// so the upper 8 MiB mirror the lower region.
pub const RAM_SIZE: u32 = 0x0200_0000;
pub const RAM_MASK: u32 = RAM_SIZE - 1;

/// Extended RAM (console variants with the second bank): 64 MiB at physical
/// segment 0x1, addressed by its 28-bit segment offset.
pub const EXRAM_SIZE: u32 = 0x0400_0000;

/// Locked L1 data-cache scratchpad: 256 KiB. Games address it at
/// 0xE000_0000 even though the hardware location is configurable.
pub const L1_CACHE_SIZE: u32 = 0x0004_0000;
pub const L1_CACHE_MASK: u32 = L1_CACHE_SIZE - 1;

/// Fake-VMEM backing: 32 MiB mapped at [0x7E00_0000, 0x8000_0000) when full
/// page-translation emulation is disabled.
pub const FAKEVMEM_SIZE: u32 = 0x0200_0000;
pub const FAKEVMEM_MASK: u32 = FAKEVMEM_SIZE - 1;
