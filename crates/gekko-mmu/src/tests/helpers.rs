use std::sync::{Arc, Mutex};

use crate::{
    BatPair, EfbAccess, GatherPipe, MemoryWatch, Mmu, MmioMap, MmuConfig, VideoBackend,
};

/// An MMU with full page-translation emulation, segment registers seeded with
/// VSID = segment index, and the page table at [`PAGETABLE_BASE`].
pub fn new_mmu() -> Mmu {
    let mut mmu = Mmu::new(MmuConfig {
        mmu: true,
        wii: false,
    });
    for (i, sr) in mmu.sr.iter_mut().enumerate() {
        *sr = i as u32;
    }
    mmu.sdr1 = PAGETABLE_BASE;
    mmu.sdr_updated();
    mmu
}

pub const PAGETABLE_BASE: u32 = 0x0010_0000;

pub fn bat_pair(effective: u32, physical: u32, bl: u32) -> BatPair {
    BatPair {
        up: effective | (bl << 2) | 0x3,
        lo: physical,
    }
}

pub fn map_dbat(mmu: &mut Mmu, effective: u32, physical: u32, bl: u32) {
    mmu.dbat[0] = bat_pair(effective, physical, bl);
    mmu.dbat_updated();
}

pub fn map_ibat(mmu: &mut Mmu, effective: u32, physical: u32, bl: u32) {
    mmu.ibat[0] = bat_pair(effective, physical, bl);
    mmu.ibat_updated();
}

/// Writes a primary-hash PTE mapping `ea`'s page to `paddr`'s page into slot
/// `slot` of its group. Returns the physical address of the PTE's second
/// word.
pub fn map_page_slot(mmu: &mut Mmu, ea: u32, paddr: u32, slot: u32) -> u32 {
    let sr = mmu.sr[(ea >> 28) as usize];
    let vsid = sr & 0x00FF_FFFF;
    let page_index = (ea >> 12) & 0xFFFF;
    let api = (ea >> 22) & 0x3F;
    let hash = vsid ^ page_index;
    let pte_addr = (((hash & 0x3FF) << 6) | PAGETABLE_BASE) + slot * 8;

    let pte1 = (vsid << 7) | api | (1 << 31);
    let pte2 = paddr & 0xFFFF_F000;
    mmu.mem.write_phys::<u32>(pte_addr, pte1).unwrap();
    mmu.mem.write_phys::<u32>(pte_addr + 4, pte2).unwrap();
    pte_addr + 4
}

pub fn map_page(mmu: &mut Mmu, ea: u32, paddr: u32) -> u32 {
    map_page_slot(mmu, ea, paddr, 0)
}

/// The PTE second word as currently stored in guest memory.
pub fn pte2_in_memory(mmu: &Mmu, pte2_addr: u32) -> u32 {
    mmu.mem.read_phys::<u32>(pte2_addr).unwrap()
}

// Recording collaborators, shared-handle style so the test keeps a view after
// the box moves into the MMU.

pub struct RecordingMmio {
    pub reads: Arc<Mutex<Vec<(u32, usize)>>>,
    pub writes: Arc<Mutex<Vec<(u32, usize, u64)>>>,
    pub value: u64,
    pub mapped: Vec<u32>,
}

impl RecordingMmio {
    pub fn new(value: u64) -> (Self, Arc<Mutex<Vec<(u32, usize)>>>, Arc<Mutex<Vec<(u32, usize, u64)>>>) {
        let reads = Arc::new(Mutex::new(Vec::new()));
        let writes = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                reads: reads.clone(),
                writes: writes.clone(),
                value,
                mapped: Vec::new(),
            },
            reads,
            writes,
        )
    }
}

impl MmioMap for RecordingMmio {
    fn read(&mut self, paddr: u32, size: usize) -> u64 {
        self.reads.lock().unwrap().push((paddr, size));
        self.value
    }

    fn write(&mut self, paddr: u32, size: usize, value: u64) {
        self.writes.lock().unwrap().push((paddr, size, value));
    }

    fn is_mapped(&self, paddr: u32) -> bool {
        self.mapped.contains(&paddr)
    }
}

pub struct RecordingVideo {
    pub accesses: Arc<Mutex<Vec<(EfbAccess, u32, u32, u32)>>>,
    pub value: u32,
}

impl RecordingVideo {
    pub fn new(value: u32) -> (Self, Arc<Mutex<Vec<(EfbAccess, u32, u32, u32)>>>) {
        let accesses = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                accesses: accesses.clone(),
                value,
            },
            accesses,
        )
    }
}

impl VideoBackend for RecordingVideo {
    fn access_efb(&mut self, access: EfbAccess, x: u32, y: u32, data: u32) -> u32 {
        self.accesses.lock().unwrap().push((access, x, y, data));
        self.value
    }
}

pub struct RecordingGatherPipe {
    pub writes: Arc<Mutex<Vec<(usize, u64)>>>,
}

impl RecordingGatherPipe {
    pub fn new() -> (Self, Arc<Mutex<Vec<(usize, u64)>>>) {
        let writes = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                writes: writes.clone(),
            },
            writes,
        )
    }
}

impl GatherPipe for RecordingGatherPipe {
    fn write_u8(&mut self, value: u8) {
        self.writes.lock().unwrap().push((1, value.into()));
    }

    fn write_u16(&mut self, value: u16) {
        self.writes.lock().unwrap().push((2, value.into()));
    }

    fn write_u32(&mut self, value: u32) {
        self.writes.lock().unwrap().push((4, value.into()));
    }

    fn write_u64(&mut self, value: u64) {
        self.writes.lock().unwrap().push((8, value));
    }
}

/// A watch that fires (and requests a pause) on exactly one address.
pub struct SingleWatch {
    pub watched: u32,
    pub hits: Arc<Mutex<Vec<(u32, u64, bool, u32)>>>,
}

impl SingleWatch {
    pub fn new(watched: u32) -> (Self, Arc<Mutex<Vec<(u32, u64, bool, u32)>>>) {
        let hits = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                watched,
                hits: hits.clone(),
            },
            hits,
        )
    }
}

impl MemoryWatch for SingleWatch {
    fn has_any(&self) -> bool {
        true
    }

    fn on_access(&mut self, ea: u32, value: u64, write: bool, size: u32, _pc: u32) -> bool {
        if ea != self.watched {
            return false;
        }
        self.hits.lock().unwrap().push((ea, value, write, size));
        true
    }
}
