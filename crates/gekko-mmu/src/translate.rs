//! Effective → physical address translation.
//!
//! Hardware looks up BAT and page translation in parallel; a matching BAT
//! always wins. We model that by consulting the block table first and only
//! falling back to the segment registers + hashed page table on a miss.

use crate::tlb::TlbLookup;
use crate::Mmu;

const SR_T: u32 = 1 << 31;
const SR_N: u32 = 1 << 28;

const PTE1_V: u32 = 1 << 31;
const PTE1_H: u32 = 1 << 6;

const PTE2_R: u32 = 1 << 8;
const PTE2_C: u32 = 1 << 7;

/// Access kind driving a translation: which BAT/TLB side to consult, whether
/// to set R/C bits in the PTE, and whether the caller will raise exceptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Host/debugger access: no side effects, no exceptions.
    NoException,
    Read,
    Write,
    /// Instruction fetch.
    Opcode,
    /// Instruction fetch without side effects or exceptions.
    OpcodeNoException,
}

impl Access {
    #[inline]
    pub(crate) fn is_opcode(self) -> bool {
        matches!(self, Access::Opcode | Access::OpcodeNoException)
    }

    #[inline]
    pub(crate) fn is_no_exception(self) -> bool {
        matches!(self, Access::NoException | Access::OpcodeNoException)
    }
}

/// The second word of a page table entry, as a native-order value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pte2(pub u32);

impl Pte2 {
    #[inline]
    pub fn page_base(self) -> u32 {
        self.0 & 0xFFFF_F000
    }

    #[inline]
    pub fn c(self) -> bool {
        self.0 & PTE2_C != 0
    }

    #[inline]
    pub fn set_r(&mut self) {
        self.0 |= PTE2_R;
    }

    #[inline]
    pub fn set_c(&mut self) {
        self.0 |= PTE2_C;
    }
}

/// Result of translating one effective address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Translation {
    /// Translated by a block-address-translation entry.
    Bat(u32),
    /// Translated through the TLB or the hashed page table.
    PageTable(u32),
    /// The segment register has T set; there is no physical address.
    DirectStore,
    PageFault,
}

impl Translation {
    /// The physical address, when translation succeeded.
    #[inline]
    pub fn physical(self) -> Option<u32> {
        match self {
            Translation::Bat(addr) | Translation::PageTable(addr) => Some(addr),
            Translation::DirectStore | Translation::PageFault => None,
        }
    }
}

impl Mmu {
    /// Translates `ea` for the given access kind.
    pub fn translate_address(&mut self, flag: Access, ea: u32) -> Translation {
        let table = if flag.is_opcode() {
            &self.ibat_table
        } else {
            &self.dbat_table
        };
        if let Some(addr) = table.translate(ea) {
            return Translation::Bat(addr);
        }
        self.translate_page_address(flag, ea)
    }

    /// Page address translation: TLB probe, then the two-pass hashed
    /// page-table search.
    fn translate_page_address(&mut self, flag: Access, ea: u32) -> Translation {
        // The TLB catches the overwhelming majority of lookups, so the walk
        // below sees little traffic.
        let tlb_res = if flag.is_opcode() {
            self.itlb.lookup(flag, ea)
        } else {
            self.dtlb.lookup(flag, ea)
        };
        if let TlbLookup::Found(paddr) = tlb_res {
            return Translation::PageTable(paddr);
        }

        let sr = self.sr[(ea >> 28) as usize];

        if sr & SR_T != 0 {
            return Translation::DirectStore;
        }

        if flag.is_opcode() && sr & SR_N != 0 {
            return Translation::PageFault;
        }

        let offset = ea & 0xFFF;
        let page_index = (ea >> 12) & 0xFFFF;
        let vsid = sr & 0x00FF_FFFF;
        let api = (ea >> 22) & 0x3F;

        let mut hash = vsid ^ page_index;
        // The guest stores PTEs big-endian; read_phys swaps on load, so the
        // search template stays in native order.
        let mut pte1 = (vsid << 7) | api | PTE1_V;

        for hash_pass in 0..2 {
            if hash_pass == 1 {
                hash = !hash;
                pte1 |= PTE1_H;
            }

            let pteg_addr = ((hash & self.pagetable_hashmask) << 6) | self.pagetable_base;

            for i in 0..8u32 {
                let pte_addr = pteg_addr + i * 8;
                if self.mem.read_phys::<u32>(pte_addr) != Some(pte1) {
                    continue;
                }
                let Some(raw) = self.mem.read_phys::<u32>(pte_addr + 4) else {
                    continue;
                };
                let mut pte2 = Pte2(raw);

                match flag {
                    Access::NoException | Access::OpcodeNoException => {}
                    Access::Read | Access::Opcode => pte2.set_r(),
                    Access::Write => {
                        pte2.set_r();
                        pte2.set_c();
                    }
                }

                if !flag.is_no_exception() {
                    let _ = self.mem.write_phys::<u32>(pte_addr + 4, pte2.0);
                }

                // The C-bit update path already patched the cached entry.
                if tlb_res != TlbLookup::UpdateC {
                    if flag.is_opcode() {
                        self.itlb.update(flag, pte2, ea);
                    } else {
                        self.dtlb.update(flag, pte2, ea);
                    }
                }

                return Translation::PageTable(pte2.page_base() | offset);
            }
        }

        Translation::PageFault
    }
}
