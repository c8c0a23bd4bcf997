use proptest::prelude::*;

use super::helpers::{map_page, new_mmu};
use crate::{Access, Mmu};

#[derive(Clone, Debug)]
struct Mapping {
    mapped: bool,
    phys_page: u32,
}

prop_compose! {
    fn arb_mapping(max_phys_pages: u32)(
        mapped in any::<bool>(),
        phys_page in 1u32..max_phys_pages,
    ) -> Mapping {
        Mapping {
            mapped,
            // Stay clear of the page table itself at 0x0010_0000.
            phys_page: (0x0300 + phys_page) << 12,
        }
    }
}

fn arb_access() -> impl Strategy<Value = Access> {
    prop_oneof![Just(Access::Read), Just(Access::Write), Just(Access::Opcode)]
}

fn build_mmu(mappings: &[Mapping]) -> Mmu {
    let mut mmu = new_mmu();
    for (i, mapping) in mappings.iter().enumerate() {
        if mapping.mapped {
            // Segment 0x1, consecutive effective pages: VSID ^ page_index is
            // distinct per page, so the groups never collide.
            map_page(&mut mmu, 0x1000_0000 + (i as u32) * 0x1000, mapping.phys_page);
        }
    }
    mmu
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Translating through the TLB must agree with a fresh page-table walk
    /// at every step, for any mapping layout and access sequence.
    #[test]
    fn tlb_and_walk_agree(
        mappings in prop::collection::vec(arb_mapping(64), 1..16),
        accesses in prop::collection::vec((0usize..16usize, 0u16..4096u16, arb_access()), 1..32),
    ) {
        let mut mmu_tlb = build_mmu(&mappings);
        let mut mmu_walk = build_mmu(&mappings);

        for (page_idx, offset, access) in accesses {
            let ea = 0x1000_0000 + ((page_idx as u32) << 12) | u32::from(offset);

            let res_tlb = mmu_tlb.translate_address(access, ea);
            // The second instance never keeps a cached translation.
            mmu_walk.invalidate_tlb_entry(ea);
            let res_walk = mmu_walk.translate_address(access, ea);
            prop_assert_eq!(res_tlb, res_walk);
        }
    }

    /// Repeating a successful translation with no intervening invalidation
    /// always produces the same physical address.
    #[test]
    fn translation_is_stable(
        mappings in prop::collection::vec(arb_mapping(64), 1..16),
        accesses in prop::collection::vec((0usize..16usize, 0u16..4096u16, arb_access()), 1..32),
    ) {
        let mut mmu = build_mmu(&mappings);

        for (page_idx, offset, access) in accesses {
            let ea = 0x1000_0000 + ((page_idx as u32) << 12) | u32::from(offset);
            let first = mmu.translate_address(access, ea);
            prop_assert_eq!(mmu.translate_address(access, ea), first);
        }
    }
}
