//! Effective → physical address translation and memory access core for a
//! 32-bit big-endian PowerPC-derived console CPU.
//!
//! Every guest memory reference passes through this crate: block address
//! translation (BAT), segment-register + hashed-page-table translation with a
//! software TLB, region routing to RAM / EXRAM / locked L1 / fake-VMEM /
//! MMIO / EFB / gather pipe, big-endian byte swapping, and DSI/ISI synthesis
//! on faults. External collaborators (the video backend, the MMIO registry,
//! the gather-pipe FIFO, the JIT cache and the debugger's memory watch) are
//! injected as trait objects.
#![forbid(unsafe_code)]

pub mod bat;
pub mod dispatch;
pub mod tlb;
pub mod translate;

#[cfg(test)]
mod tests;

use bitflags::bitflags;
use memory::{MemoryMap, MemoryMapConfig};
use tracing::warn;

pub use bat::{BatPair, BatTable, BAT_BLOCK_MASK, BAT_INDEX_SHIFT};
pub use dispatch::{InstructionFetch, JitTranslation, GATHER_PIPE_PHYSICAL_ADDRESS};
pub use tlb::{Tlb, TlbLookup, PAGE_SHIFT, PAGE_SIZE};
pub use translate::{Access, Translation};

/// DSISR: translation found no matching PTE.
pub const DSISR_PAGE: u32 = 1 << 30;
/// DSISR: access violated page protection (not raised by this core).
pub const DSISR_PROT: u32 = 1 << 27;
/// DSISR: the faulting access was a store.
pub const DSISR_STORE: u32 = 1 << 25;

bitflags! {
    /// Pending-exception mask bits this subsystem raises.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Exceptions: u32 {
        const DSI = 0x0000_0008;
        const ISI = 0x0000_0010;
        /// The DSI was forced by a debugger memory watch, not a fault.
        const FAKE_MEMCHECK_HIT = 0x0000_0200;
    }
}

/// The MSR bits this subsystem consumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Msr {
    /// Data address translation enable.
    pub dr: bool,
    /// Instruction address translation enable.
    pub ir: bool,
}

/// EFB access kinds forwarded to the video backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EfbAccess {
    PeekColor,
    PokeColor,
    PeekZ,
    PokeZ,
}

/// The memory-mapped I/O registry. Looked up by physical address; reads and
/// writes carry the access size in bytes.
pub trait MmioMap {
    fn read(&mut self, paddr: u32, size: usize) -> u64;
    fn write(&mut self, paddr: u32, size: usize, value: u64);
    /// Whether `paddr` is a known MMIO register (used by the JIT to decide
    /// whether to emit a direct call).
    fn is_mapped(&self, paddr: u32) -> bool;
}

/// The graphics backend's embedded-framebuffer window.
pub trait VideoBackend {
    /// Performs an EFB peek or poke at pixel `(x, y)`; returns the read value
    /// for peeks (pokes return don't-care).
    fn access_efb(&mut self, access: EfbAccess, x: u32, y: u32, data: u32) -> u32;
}

/// The write-only command FIFO at [`GATHER_PIPE_PHYSICAL_ADDRESS`].
pub trait GatherPipe {
    fn write_u8(&mut self, value: u8);
    fn write_u16(&mut self, value: u16);
    fn write_u32(&mut self, value: u32);
    fn write_u64(&mut self, value: u64);
}

/// The JIT block cache. BAT rebuilds invalidate cached fast paths.
pub trait JitCache {
    fn invalidate_all(&mut self);
}

/// Debugger memory-watch observer, consulted on every guest-visible access.
///
/// `on_access` returns true when the debugger wants the CPU paused at this
/// access; hit counting and the suppress-while-stepping rule live behind the
/// implementation.
pub trait MemoryWatch {
    fn has_any(&self) -> bool;
    fn on_access(&mut self, ea: u32, value: u64, write: bool, size: u32, pc: u32) -> bool;
}

/// No-op collaborators for hosts (and tests) without the corresponding
/// device.
#[derive(Debug, Default)]
pub struct NullMmio;

impl MmioMap for NullMmio {
    fn read(&mut self, _paddr: u32, _size: usize) -> u64 {
        0
    }

    fn write(&mut self, _paddr: u32, _size: usize, _value: u64) {}

    fn is_mapped(&self, _paddr: u32) -> bool {
        false
    }
}

#[derive(Debug, Default)]
pub struct NullVideo;

impl VideoBackend for NullVideo {
    fn access_efb(&mut self, _access: EfbAccess, _x: u32, _y: u32, _data: u32) -> u32 {
        0
    }
}

#[derive(Debug, Default)]
pub struct NullGatherPipe;

impl GatherPipe for NullGatherPipe {
    fn write_u8(&mut self, _value: u8) {}
    fn write_u16(&mut self, _value: u16) {}
    fn write_u32(&mut self, _value: u32) {}
    fn write_u64(&mut self, _value: u64) {}
}

#[derive(Debug, Default)]
pub struct NullJit;

impl JitCache for NullJit {
    fn invalidate_all(&mut self) {}
}

/// The release-build default watch: a predictable branch, nothing more.
#[derive(Debug, Default)]
pub struct NullWatch;

impl MemoryWatch for NullWatch {
    fn has_any(&self) -> bool {
        false
    }

    fn on_access(&mut self, _ea: u32, _value: u64, _write: bool, _size: u32, _pc: u32) -> bool {
        false
    }
}

/// Static configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct MmuConfig {
    /// Full page-translation emulation. When clear, the fake-VMEM window is
    /// allocated instead and a failing translation is a host bug (we panic
    /// rather than synthesise a DSI).
    pub mmu: bool,
    /// Console variant with EXRAM and the extended BAT set.
    pub wii: bool,
}

/// The MMU context: guest register file slice, derived lookup tables, backing
/// memory and injected collaborators. One instance per emulated core; all
/// entry points take `&mut self` so the subsystem is host-testable and
/// multi-instance capable.
pub struct Mmu {
    pub msr: Msr,
    pub pc: u32,
    pub npc: u32,
    /// Segment registers, indexed by the top 4 bits of the EA.
    pub sr: [u32; 16],
    /// Raw SDR1; call [`Mmu::sdr_updated`] after writing.
    pub sdr1: u32,
    /// Data BAT pairs 0-7; pairs 4-7 are only consulted with the extended
    /// set enabled. Call [`Mmu::dbat_updated`] after writing.
    pub dbat: [BatPair; 8],
    /// Instruction BAT pairs; call [`Mmu::ibat_updated`] after writing.
    pub ibat: [BatPair; 8],
    /// HID4.SBE: the extended BAT enable on the newer console variant.
    pub hid4_sbe: bool,
    /// Data-fault address register.
    pub dar: u32,
    /// Data-fault status register.
    pub dsisr: u32,
    pub exceptions: Exceptions,

    config: MmuConfig,
    pagetable_base: u32,
    pagetable_hashmask: u32,
    dbat_table: BatTable,
    ibat_table: BatTable,
    dtlb: Tlb,
    itlb: Tlb,

    pub mem: MemoryMap,
    pub mmio: Box<dyn MmioMap>,
    pub video: Box<dyn VideoBackend>,
    pub gather_pipe: Box<dyn GatherPipe>,
    pub jit: Box<dyn JitCache>,
    pub watch: Box<dyn MemoryWatch>,
}

impl Mmu {
    pub fn new(config: MmuConfig) -> Self {
        Self {
            msr: Msr::default(),
            pc: 0,
            npc: 0,
            sr: [0; 16],
            sdr1: 0,
            dbat: [BatPair::default(); 8],
            ibat: [BatPair::default(); 8],
            hid4_sbe: false,
            dar: 0,
            dsisr: 0,
            exceptions: Exceptions::empty(),
            config,
            pagetable_base: 0,
            pagetable_hashmask: 0,
            dbat_table: BatTable::new(),
            ibat_table: BatTable::new(),
            dtlb: Tlb::new(),
            itlb: Tlb::new(),
            mem: MemoryMap::new(MemoryMapConfig {
                exram: config.wii,
                fake_vmem: !config.mmu,
            }),
            mmio: Box::new(NullMmio),
            video: Box::new(NullVideo),
            gather_pipe: Box::new(NullGatherPipe),
            jit: Box::new(NullJit),
            watch: Box::new(NullWatch),
        }
    }

    #[inline]
    pub fn config(&self) -> MmuConfig {
        self.config
    }

    /// Derives the page-table base and hash mask from SDR1. Invalid values
    /// (a non-contiguous HTABMASK, or HTABORG bits inside the mask) leave the
    /// previous derived state in place.
    pub fn sdr_updated(&mut self) {
        let htabmask = self.sdr1 & 0x1FF;
        let mut bit = 1u32;
        let mut prefix = 0u32;
        let mut n = 0;
        while htabmask & bit != 0 && n < 9 {
            n += 1;
            prefix |= bit;
            bit <<= 1;
        }
        if htabmask & !prefix != 0 {
            return;
        }
        let htaborg = (self.sdr1 >> 16) & 0xFFFF;
        if htaborg & prefix != 0 {
            return;
        }
        self.pagetable_base = htaborg << 16;
        self.pagetable_hashmask = (prefix << 10) | 0x3FF;
    }

    /// Rebuilds the data BAT table. Must be called after any DBAT register
    /// write (and after a state restore).
    pub fn dbat_updated(&mut self) {
        self.dbat_table.clear();
        self.dbat_table.map_pairs(&self.dbat[..4], &self.mem);
        if self.config.wii && self.hid4_sbe {
            self.dbat_table.map_pairs(&self.dbat[4..], &self.mem);
        }
        if self.mem.has_fake_vmem() {
            self.dbat_table.map_fake_vmem(0x4000_0000);
            self.dbat_table.map_fake_vmem(0x7000_0000);
        }
        // The optimizability queries and dcbz depend on the BAT mapping.
        self.jit.invalidate_all();
    }

    /// Rebuilds the instruction BAT table; same contract as
    /// [`Mmu::dbat_updated`].
    pub fn ibat_updated(&mut self) {
        self.ibat_table.clear();
        self.ibat_table.map_pairs(&self.ibat[..4], &self.mem);
        if self.config.wii && self.hid4_sbe {
            self.ibat_table.map_pairs(&self.ibat[4..], &self.mem);
        }
        if self.mem.has_fake_vmem() {
            self.ibat_table.map_fake_vmem(0x4000_0000);
            self.ibat_table.map_fake_vmem(0x7000_0000);
        }
        self.jit.invalidate_all();
    }

    /// `tlbie`: drops the cached translations for `ea`'s set on both the
    /// data and instruction sides.
    pub fn invalidate_tlb_entry(&mut self, ea: u32) {
        self.dtlb.invalidate_page(ea);
        self.itlb.invalidate_page(ea);
    }

    pub(crate) fn generate_dsi(&mut self, ea: u32, write: bool) {
        if !self.config.mmu {
            // Without page-translation emulation a failing translation is an
            // emulator bug, not guest behaviour.
            panic!(
                "invalid {} {ea:#010x}, PC = {:#010x}",
                if write { "write to" } else { "read from" },
                self.pc
            );
        }

        self.dsisr = if write {
            DSISR_PAGE | DSISR_STORE
        } else {
            DSISR_PAGE
        };
        self.dar = ea;
        self.exceptions |= Exceptions::DSI;
    }

    pub(crate) fn generate_isi(&mut self, ea: u32) {
        // The faulting address becomes the next PC for the handler.
        self.npc = ea;
        self.exceptions |= Exceptions::ISI;
        warn!("ISI exception at {:#010x}", self.pc);
    }
}
