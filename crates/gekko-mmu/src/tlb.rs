//! Software TLB: a direct-mapped cache of page-table translations.
//!
//! Two disjoint instances exist, one for instruction fetches and one for data
//! accesses. Each has [`TLB_SETS`] sets of two ways; a per-set `recent` bit
//! names the more-recently used way for victim selection.

use crate::translate::{Access, Pte2};

pub const PAGE_SIZE: u32 = 0x1000;
pub const PAGE_SHIFT: u32 = 12;

pub const TLB_SETS: usize = 128;
const INDEX_MASK: u32 = TLB_SETS as u32 - 1;
const TAG_INVALID: u32 = 0xFFFF_FFFF;

#[derive(Clone, Copy)]
struct TlbSet {
    tag: [u32; 2],
    paddr: [u32; 2],
    pte: [u32; 2],
    recent: usize,
}

impl TlbSet {
    const INVALID: Self = Self {
        tag: [TAG_INVALID; 2],
        paddr: [0; 2],
        pte: [0; 2],
        recent: 0,
    };
}

/// Outcome of a TLB probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbLookup {
    /// Hit; the payload is the full physical address (page base | offset).
    Found(u32),
    /// Hit on a write whose cached PTE had the C bit clear. The cached copy
    /// has been updated; the caller must walk the page table to update guest
    /// memory, and must not re-insert the entry.
    UpdateC,
    NotFound,
}

pub struct Tlb {
    sets: Box<[TlbSet; TLB_SETS]>,
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}

impl Tlb {
    pub fn new() -> Self {
        Self {
            sets: Box::new([TlbSet::INVALID; TLB_SETS]),
        }
    }

    pub fn lookup(&mut self, flag: Access, ea: u32) -> TlbLookup {
        let tag = ea >> PAGE_SHIFT;
        let set = &mut self.sets[(tag & INDEX_MASK) as usize];
        for way in 0..2 {
            if set.tag[way] != tag {
                continue;
            }
            if flag == Access::Write {
                let mut pte2 = Pte2(set.pte[way]);
                if !pte2.c() {
                    pte2.set_c();
                    set.pte[way] = pte2.0;
                    return TlbLookup::UpdateC;
                }
            }
            if !flag.is_no_exception() {
                set.recent = way;
            }
            return TlbLookup::Found(set.paddr[way] | (ea & (PAGE_SIZE - 1)));
        }
        TlbLookup::NotFound
    }

    /// Inserts a freshly-walked translation. No-op for the no-exception
    /// flags, which must leave all cached state untouched.
    pub fn update(&mut self, flag: Access, pte2: Pte2, ea: u32) {
        if flag.is_no_exception() {
            return;
        }
        let tag = ea >> PAGE_SHIFT;
        let set = &mut self.sets[(tag & INDEX_MASK) as usize];
        let way = usize::from(set.recent == 0 && set.tag[0] != TAG_INVALID);
        set.recent = way;
        set.paddr[way] = pte2.page_base();
        set.pte[way] = pte2.0;
        set.tag[way] = tag;
    }

    /// Drops both ways of the set indexed by `ea`.
    pub fn invalidate_page(&mut self, ea: u32) {
        let set = &mut self.sets[((ea >> PAGE_SHIFT) & INDEX_MASK) as usize];
        set.tag = [TAG_INVALID; 2];
    }
}
