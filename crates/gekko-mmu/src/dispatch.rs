//! Width-generic guest and host memory access, region routing, DMA and the
//! JIT optimizability queries.
//!
//! Every guest load/store funnels through [`Mmu::read_from_hardware`] /
//! [`Mmu::write_to_hardware`]: translate (when enabled), split accesses that
//! straddle a 4 KiB page, then route the physical address to locked L1,
//! fake-VMEM, EFB, MMIO, the gather pipe, main RAM or EXRAM.

use memory::{be, BeValue, EXRAM_SIZE, FAKEVMEM_MASK, L1_CACHE_MASK, L1_CACHE_SIZE, RAM_MASK};
use tracing::{debug, error};

use crate::tlb::PAGE_SIZE;
use crate::translate::{Access, Translation};
use crate::{EfbAccess, Mmu};

/// Physical address of the gather-pipe write port.
pub const GATHER_PIPE_PHYSICAL_ADDRESS: u32 = 0x0C00_8000;

/// Integer widths the dispatcher moves between guest memory and the MMIO /
/// EFB / gather-pipe side channels.
pub(crate) trait GuestValue: BeValue {
    fn to_u64(self) -> u64;
    fn from_u64(v: u64) -> Self;
}

impl GuestValue for u8 {
    #[inline]
    fn to_u64(self) -> u64 {
        self.into()
    }

    #[inline]
    fn from_u64(v: u64) -> Self {
        v as u8
    }
}

impl GuestValue for u16 {
    #[inline]
    fn to_u64(self) -> u64 {
        self.into()
    }

    #[inline]
    fn from_u64(v: u64) -> Self {
        v as u16
    }
}

impl GuestValue for u32 {
    #[inline]
    fn to_u64(self) -> u64 {
        self.into()
    }

    #[inline]
    fn from_u64(v: u64) -> Self {
        v as u32
    }
}

impl GuestValue for u64 {
    #[inline]
    fn to_u64(self) -> u64 {
        self
    }

    #[inline]
    fn from_u64(v: u64) -> Self {
        v
    }
}

/// A successfully fetched instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstructionFetch {
    /// Whether the fetch address was covered by a BAT mapping (the JIT caches
    /// BAT-mapped code more aggressively).
    pub from_bat: bool,
    pub value: u32,
}

/// Compile-time translation result handed to the JIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitTranslation {
    pub from_bat: bool,
    pub address: u32,
}

impl Mmu {
    fn read_from_hardware<T: GuestValue>(&mut self, flag: Access, ea: u32) -> T {
        let mut addr = ea;
        if self.msr.dr {
            let size = T::SIZE as u32;
            let Some(translated) = self.translate_address(flag, ea).physical() else {
                if flag == Access::Read {
                    self.generate_dsi(ea, false);
                }
                return T::from_u64(0);
            };
            if (ea & (PAGE_SIZE - 1)) > PAGE_SIZE - size {
                // Straddles a page boundary: translate the second page and
                // gather one byte at a time, big-endian.
                let next_page = (ea + size - 1) & !(PAGE_SIZE - 1);
                let Some(next_translated) =
                    self.translate_address(flag, next_page).physical()
                else {
                    if flag == Access::Read {
                        self.generate_dsi(next_page, false);
                    }
                    return T::from_u64(0);
                };
                let mut acc: u64 = 0;
                let mut phys = translated;
                for current in ea..ea + size {
                    if current == next_page {
                        phys = next_translated;
                    }
                    acc = (acc << 8) | u64::from(self.read_physical::<u8>(flag, phys));
                    phys = phys.wrapping_add(1);
                }
                return T::from_u64(acc);
            }
            addr = translated;
        }
        self.read_physical::<T>(flag, addr)
    }

    fn write_to_hardware<T: GuestValue>(&mut self, flag: Access, ea: u32, data: T) {
        let mut addr = ea;
        if self.msr.dr {
            let size = T::SIZE as u32;
            let Some(translated) = self.translate_address(flag, ea).physical() else {
                if flag == Access::Write {
                    self.generate_dsi(ea, true);
                }
                return;
            };
            if (ea & (PAGE_SIZE - 1)) > PAGE_SIZE - size {
                let next_page = (ea + size - 1) & !(PAGE_SIZE - 1);
                let Some(next_translated) =
                    self.translate_address(flag, next_page).physical()
                else {
                    if flag == Access::Write {
                        self.generate_dsi(next_page, true);
                    }
                    return;
                };
                let val = data.to_u64();
                let mut phys = translated;
                for (i, current) in (ea..ea + size).enumerate() {
                    if current == next_page {
                        phys = next_translated;
                    }
                    let byte = (val >> (8 * (size as usize - 1 - i))) as u8;
                    self.write_physical::<u8>(flag, phys, byte);
                    phys = phys.wrapping_add(1);
                }
                return;
            }
            addr = translated;
        }
        self.write_physical::<T>(flag, addr, data);
    }

    /// Routes a physical read. Order matters: the fixed windows shadow the
    /// RAM mirror test.
    fn read_physical<T: GuestValue>(&mut self, flag: Access, addr: u32) -> T {
        // Locked L1 has no architecturally fixed address, but every title
        // maps it at 0xE0000000.
        if addr >> 28 == 0xE && addr < 0xE000_0000 + L1_CACHE_SIZE {
            return be::read_be(self.mem.l1_cache(), (addr & L1_CACHE_MASK) as usize);
        }

        if addr & 0xFE00_0000 == 0x7E00_0000 {
            if let Some(fake_vmem) = self.mem.fake_vmem() {
                return be::read_be(fake_vmem, (addr & FAKEVMEM_MASK) as usize);
            }
        }

        if flag == Access::Read && addr & 0xF800_0000 == 0x0800_0000 {
            if addr < 0x0C00_0000 {
                return T::from_u64(self.efb_read(addr).into());
            }
            return T::from_u64(self.mmio.read(addr, T::SIZE));
        }

        if addr & 0xF800_0000 == 0 {
            return be::read_be(self.mem.ram(), (addr & RAM_MASK) as usize);
        }

        if addr >> 28 == 0x1 && addr & 0x0FFF_FFFF < EXRAM_SIZE {
            if let Some(exram) = self.mem.exram() {
                return be::read_be(exram, (addr & 0x0FFF_FFFF) as usize);
            }
        }

        error!(
            "unable to resolve read address {addr:#010x} (PC = {:#010x})",
            self.pc
        );
        T::from_u64(0)
    }

    fn write_physical<T: GuestValue>(&mut self, flag: Access, addr: u32, data: T) {
        if addr >> 28 == 0xE && addr < 0xE000_0000 + L1_CACHE_SIZE {
            be::write_be(self.mem.l1_cache_mut(), (addr & L1_CACHE_MASK) as usize, data);
            return;
        }

        if addr & 0xFE00_0000 == 0x7E00_0000 {
            if let Some(fake_vmem) = self.mem.fake_vmem_mut() {
                be::write_be(fake_vmem, (addr & FAKEVMEM_MASK) as usize, data);
                return;
            }
        }

        // The window is masked: some titles write the gather pipe through
        // mirrored addresses.
        if flag == Access::Write && addr & 0xFFFF_F000 == GATHER_PIPE_PHYSICAL_ADDRESS {
            let val = data.to_u64();
            match T::SIZE {
                1 => self.gather_pipe.write_u8(val as u8),
                2 => self.gather_pipe.write_u16(val as u16),
                4 => self.gather_pipe.write_u32(val as u32),
                _ => self.gather_pipe.write_u64(val),
            }
            return;
        }

        if flag == Access::Write && addr & 0xF800_0000 == 0x0800_0000 {
            if addr < 0x0C00_0000 {
                self.efb_write(data.to_u64() as u32, addr);
                return;
            }
            self.mmio.write(addr, T::SIZE, data.to_u64());
            return;
        }

        if addr & 0xF800_0000 == 0 {
            be::write_be(self.mem.ram_mut(), (addr & RAM_MASK) as usize, data);
            return;
        }

        if addr >> 28 == 0x1 && addr & 0x0FFF_FFFF < EXRAM_SIZE {
            if let Some(exram) = self.mem.exram_mut() {
                be::write_be(exram, (addr & 0x0FFF_FFFF) as usize, data);
                return;
            }
        }

        error!(
            "unable to resolve write address {addr:#010x} (PC = {:#010x})",
            self.pc
        );
    }

    fn efb_read(&mut self, addr: u32) -> u32 {
        let x = (addr & 0xFFF) >> 2;
        let y = (addr >> 12) & 0x3FF;

        if addr & 0x0080_0000 != 0 {
            error!("unimplemented Z+color EFB read @ {addr:#010x}");
            0
        } else if addr & 0x0040_0000 != 0 {
            let value = self.video.access_efb(EfbAccess::PeekZ, x, y, 0);
            debug!("EFB Z read @ {x}, {y} = {value:#010x}");
            value
        } else {
            let value = self.video.access_efb(EfbAccess::PeekColor, x, y, 0);
            debug!("EFB color read @ {x}, {y} = {value:#010x}");
            value
        }
    }

    fn efb_write(&mut self, data: u32, addr: u32) {
        let x = (addr & 0xFFF) >> 2;
        let y = (addr >> 12) & 0x3FF;

        if addr & 0x0080_0000 != 0 {
            // Z-tested 64-bit writes land here; semantics unknown.
            error!("unimplemented Z+color EFB write {data:#010x} @ {addr:#010x}");
        } else if addr & 0x0040_0000 != 0 {
            self.video.access_efb(EfbAccess::PokeZ, x, y, data);
            debug!("EFB Z write {data:#010x} @ {x}, {y}");
        } else {
            self.video.access_efb(EfbAccess::PokeColor, x, y, data);
            debug!("EFB color write {data:#010x} @ {x}, {y}");
        }
    }

    fn memcheck(&mut self, ea: u32, value: u64, write: bool, size: u32) {
        if !self.watch.has_any() {
            return;
        }
        if self.watch.on_access(ea, value, write, size, self.pc) {
            // Fake a DSI so the interpreter skips the rest of the
            // instruction; the watch flag tells the exception handler this
            // was debugger-forced rather than a translation failure.
            self.exceptions |=
                crate::Exceptions::DSI | crate::Exceptions::FAKE_MEMCHECK_HIT;
        }
    }

    // Guest-visible accessors.

    pub fn read_u8(&mut self, ea: u32) -> u8 {
        let value = self.read_from_hardware::<u8>(Access::Read, ea);
        self.memcheck(ea, value.into(), false, 1);
        value
    }

    pub fn read_u16(&mut self, ea: u32) -> u16 {
        let value = self.read_from_hardware::<u16>(Access::Read, ea);
        self.memcheck(ea, value.into(), false, 2);
        value
    }

    pub fn read_u32(&mut self, ea: u32) -> u32 {
        let value = self.read_from_hardware::<u32>(Access::Read, ea);
        self.memcheck(ea, value.into(), false, 4);
        value
    }

    pub fn read_u64(&mut self, ea: u32) -> u64 {
        let value = self.read_from_hardware::<u64>(Access::Read, ea);
        self.memcheck(ea, value, false, 8);
        value
    }

    pub fn read_f32(&mut self, ea: u32) -> f32 {
        f32::from_bits(self.read_u32(ea))
    }

    pub fn read_f64(&mut self, ea: u32) -> f64 {
        f64::from_bits(self.read_u64(ea))
    }

    pub fn write_u8(&mut self, ea: u32, value: u8) {
        self.memcheck(ea, value.into(), true, 1);
        self.write_to_hardware::<u8>(Access::Write, ea, value);
    }

    pub fn write_u16(&mut self, ea: u32, value: u16) {
        self.memcheck(ea, value.into(), true, 2);
        self.write_to_hardware::<u16>(Access::Write, ea, value);
    }

    pub fn write_u32(&mut self, ea: u32, value: u32) {
        self.memcheck(ea, value.into(), true, 4);
        self.write_to_hardware::<u32>(Access::Write, ea, value);
    }

    pub fn write_u64(&mut self, ea: u32, value: u64) {
        self.memcheck(ea, value, true, 8);
        self.write_to_hardware::<u64>(Access::Write, ea, value);
    }

    pub fn write_f32(&mut self, ea: u32, value: f32) {
        self.write_u32(ea, value.to_bits());
    }

    pub fn write_f64(&mut self, ea: u32, value: f64) {
        self.write_u64(ea, value.to_bits());
    }

    /// Byte-reversed store (`sthbrx`).
    pub fn write_u16_swap(&mut self, ea: u32, value: u16) {
        self.write_u16(ea, value.swap_bytes());
    }

    /// Byte-reversed store (`stwbrx`).
    pub fn write_u32_swap(&mut self, ea: u32, value: u32) {
        self.write_u32(ea, value.swap_bytes());
    }

    pub fn write_u64_swap(&mut self, ea: u32, value: u64) {
        self.write_u64(ea, value.swap_bytes());
    }

    // Host accessors: used by the debugger and the instruction decoder to
    // observe guest memory. Never raise guest exceptions, never set R/C bits,
    // never trip memory watches.

    pub fn host_read_u8(&mut self, ea: u32) -> u8 {
        self.read_from_hardware::<u8>(Access::NoException, ea)
    }

    pub fn host_read_u16(&mut self, ea: u32) -> u16 {
        self.read_from_hardware::<u16>(Access::NoException, ea)
    }

    pub fn host_read_u32(&mut self, ea: u32) -> u32 {
        self.read_from_hardware::<u32>(Access::NoException, ea)
    }

    pub fn host_read_u64(&mut self, ea: u32) -> u64 {
        self.read_from_hardware::<u64>(Access::NoException, ea)
    }

    pub fn host_write_u8(&mut self, ea: u32, value: u8) {
        self.write_to_hardware::<u8>(Access::NoException, ea, value);
    }

    pub fn host_write_u16(&mut self, ea: u32, value: u16) {
        self.write_to_hardware::<u16>(Access::NoException, ea, value);
    }

    pub fn host_write_u32(&mut self, ea: u32, value: u32) {
        self.write_to_hardware::<u32>(Access::NoException, ea, value);
    }

    pub fn host_write_u64(&mut self, ea: u32, value: u64) {
        self.write_to_hardware::<u64>(Access::NoException, ea, value);
    }

    /// Reads a NUL-terminated string, stopping at `max_len` bytes when
    /// nonzero, at the first non-RAM address, or at NUL.
    pub fn host_get_string(&mut self, ea: u32, max_len: usize) -> String {
        let mut s = String::new();
        let mut addr = ea;
        loop {
            if !self.host_is_ram_address(addr) {
                break;
            }
            let byte = self.host_read_u8(addr);
            if byte == 0 {
                break;
            }
            s.push(char::from(byte));
            addr = addr.wrapping_add(1);
            if max_len != 0 && s.len() >= max_len {
                break;
            }
        }
        s
    }

    /// Whether `ea` resolves (after optional translation) to directly-backed
    /// memory the host may touch freely.
    pub fn host_is_ram_address(&mut self, ea: u32) -> bool {
        let mut addr = ea;
        if self.msr.dr {
            match self.translate_address(Access::NoException, ea).physical() {
                Some(translated) => addr = translated,
                None => return false,
            }
        }
        let segment = addr >> 28;
        if segment == 0x0 && addr & 0x0FFF_FFFF < memory::REALRAM_SIZE {
            true
        } else if self.mem.has_exram() && segment == 0x1 && addr & 0x0FFF_FFFF < EXRAM_SIZE {
            true
        } else if self.mem.has_fake_vmem() && addr & 0xFE00_0000 == 0x7E00_0000 {
            true
        } else if segment == 0xE && addr < 0xE000_0000 + L1_CACHE_SIZE {
            true
        } else {
            false
        }
    }

    // Instruction fetch.

    /// Fetches the instruction word at `ea`, translating with the opcode
    /// flag when MSR.IR is set. Returns `None` on translation failure
    /// without synthesising an exception.
    pub fn try_read_instruction(&mut self, ea: u32) -> Option<InstructionFetch> {
        let mut addr = ea;
        let mut from_bat = true;
        if self.msr.ir {
            let translated = self.translate_address(Access::Opcode, ea);
            addr = translated.physical()?;
            from_bat = matches!(translated, Translation::Bat(_));
        }
        let value = self.read_physical::<u32>(Access::OpcodeNoException, addr);
        Some(InstructionFetch { from_bat, value })
    }

    /// Fetches the instruction word at `ea`, synthesising an ISI on failure.
    pub fn read_opcode(&mut self, ea: u32) -> u32 {
        match self.try_read_instruction(ea) {
            Some(fetch) => fetch.value,
            None => {
                self.generate_isi(ea);
                0
            }
        }
    }

    // DMA between the locked-L1 scratchpad and physical memory, in 32-byte
    // blocks.

    pub fn dma_lc_to_memory(&mut self, mem_addr: u32, cache_addr: u32, num_blocks: u32) {
        let len = 32 * num_blocks;

        // EFB and MMIO targets go through the handlers a word at a time.
        if mem_addr & 0x0F00_0000 == 0x0800_0000 {
            for i in (0..len).step_by(4) {
                let data = be::read_be::<u32>(
                    self.mem.l1_cache(),
                    ((cache_addr + i) & L1_CACHE_MASK) as usize,
                );
                self.efb_write(data, mem_addr + i);
            }
            return;
        }
        if mem_addr & 0x0F00_0000 == 0x0C00_0000 {
            for i in (0..len).step_by(4) {
                let data = be::read_be::<u32>(
                    self.mem.l1_cache(),
                    ((cache_addr + i) & L1_CACHE_MASK) as usize,
                );
                self.mmio.write(mem_addr + i, 4, data.into());
            }
            return;
        }

        let mut block = [0u8; 32];
        for i in 0..num_blocks {
            let l1_off = ((cache_addr + i * 32) & L1_CACHE_MASK) as usize;
            block.copy_from_slice(&self.mem.l1_cache()[l1_off..l1_off + 32]);
            match self.mem.get_span_mut(mem_addr + i * 32, 32) {
                Some(dst) => dst.copy_from_slice(&block),
                None => return,
            }
        }
    }

    pub fn dma_memory_to_lc(&mut self, cache_addr: u32, mem_addr: u32, num_blocks: u32) {
        let len = 32 * num_blocks;

        if mem_addr & 0x0F00_0000 == 0x0800_0000 {
            for i in (0..len).step_by(4) {
                let data = self.efb_read(mem_addr + i);
                be::write_be(
                    self.mem.l1_cache_mut(),
                    ((cache_addr + i) & L1_CACHE_MASK) as usize,
                    data,
                );
            }
            return;
        }
        if mem_addr & 0x0F00_0000 == 0x0C00_0000 {
            for i in (0..len).step_by(4) {
                let data = self.mmio.read(mem_addr + i, 4) as u32;
                be::write_be(
                    self.mem.l1_cache_mut(),
                    ((cache_addr + i) & L1_CACHE_MASK) as usize,
                    data,
                );
            }
            return;
        }

        let mut block = [0u8; 32];
        for i in 0..num_blocks {
            match self.mem.get_span(mem_addr + i * 32, 32) {
                Some(src) => block.copy_from_slice(src),
                None => return,
            }
            let l1_off = ((cache_addr + i * 32) & L1_CACHE_MASK) as usize;
            self.mem.l1_cache_mut()[l1_off..l1_off + 32].copy_from_slice(&block);
        }
    }

    /// `dcbz`: zero-fills the 32-byte cache line containing `ea`.
    pub fn clear_cache_line(&mut self, ea: u32) {
        debug_assert!(ea & 0x1F == 0);
        let mut addr = ea;
        if self.msr.dr {
            match self.translate_address(Access::Write, ea) {
                // dcbz to a direct-store segment is quietly dropped; this is
                // consistent with console behaviour and the PEM.
                Translation::DirectStore => return,
                Translation::PageFault => {
                    self.generate_dsi(ea, true);
                    return;
                }
                Translation::Bat(translated) | Translation::PageTable(translated) => {
                    addr = translated;
                }
            }
        }

        // Not precisely correct for non-RAM targets, but the difference is
        // unlikely to matter.
        for i in (0..32).step_by(8) {
            self.write_physical::<u64>(Access::Write, addr + i, 0);
        }
    }

    // JIT fast-path queries. All of these consult only the BAT tables:
    // optimizing TLB mappings too would force a JIT cache clear on every TLB
    // invalidation.

    /// Whether the JIT may compile an unchecked fastmem access for `ea`.
    pub fn is_optimizable_ram_address(&self, ea: u32) -> bool {
        if self.watch.has_any() {
            return false;
        }
        if !self.msr.dr {
            return false;
        }
        self.dbat_table.is_fastmem(ea)
    }

    /// Returns the physical MMIO register address when `ea` is a BAT-mapped,
    /// size-aligned access to a known register.
    pub fn is_optimizable_mmio_access(&self, ea: u32, access_bits: u32) -> Option<u32> {
        if self.watch.has_any() {
            return None;
        }
        if !self.msr.dr {
            return None;
        }
        let addr = self.dbat_table.translate(ea)?;
        let aligned = addr & ((access_bits >> 3) - 1) == 0;
        if !aligned || !self.mmio.is_mapped(addr) {
            return None;
        }
        Some(addr)
    }

    /// Whether `ea` BAT-translates to exactly the gather-pipe write port.
    pub fn is_optimizable_gather_pipe_write(&self, ea: u32) -> bool {
        if self.watch.has_any() {
            return false;
        }
        if !self.msr.dr {
            return false;
        }
        self.dbat_table.translate(ea) == Some(GATHER_PIPE_PHYSICAL_ADDRESS)
    }

    /// Compile-time translation for the JIT block cache.
    pub fn jit_translate(&mut self, ea: u32) -> Option<JitTranslation> {
        if !self.msr.ir {
            return Some(JitTranslation {
                from_bat: true,
                address: ea,
            });
        }
        let translated = self.translate_address(Access::Opcode, ea);
        let address = translated.physical()?;
        Some(JitTranslation {
            from_bat: matches!(translated, Translation::Bat(_)),
            address,
        })
    }
}
