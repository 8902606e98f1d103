use proptest::prelude::*;
use snapemu_mem::{
    AddressSpace, MemError, MemorySnapshot, PageTableBuilder, Permission, SnapshotPager, PAGE_SIZE,
};

const CODE_BASE: u64 = 0x0000_7FF6_0000_0000;

/// Three consecutive pages at `CODE_BASE`, backed by frames 0x1000..0x4000, with the table
/// committed above them.
fn three_page_layout() -> (AddressSpace, u64) {
    let mut space = AddressSpace::new();
    let mut builder = PageTableBuilder::new();
    for i in 0..3u64 {
        let gpa = 0x1000 * (i + 1);
        builder
            .insert(CODE_BASE + i * PAGE_SIZE as u64, gpa, Permission::Data)
            .unwrap();
        let page = space.allocate_host_page();
        space.page_insert(gpa, page).unwrap();
    }
    let base = builder.suggested_table_base();
    let table = builder.commit(base, &mut space).unwrap();
    let cr3 = space.bind_committed(table).unwrap();
    (space, cr3)
}

#[test]
fn single_page_round_trip() {
    let (mut space, cr3) = three_page_layout();
    let data = b"hello from the guest";
    space.virt_write(cr3, CODE_BASE + 0x80, data).unwrap();
    assert_eq!(space.virt_read(cr3, CODE_BASE + 0x80, data.len()).unwrap(), data);
}

#[test]
fn two_page_round_trip() {
    let (mut space, cr3) = three_page_layout();
    let data: Vec<u8> = (0..PAGE_SIZE + 16).map(|i| (i % 251) as u8).collect();
    let gva = CODE_BASE + 4080;

    space.virt_write(cr3, gva, &data).unwrap();
    assert_eq!(space.virt_read(cr3, gva, data.len()).unwrap(), data);

    // The write was split across two frames.
    assert_eq!(space.phy_read(0x1FF0, 16).unwrap(), data[..16]);
    assert_eq!(space.phy_read(0x2000, PAGE_SIZE).unwrap(), data[16..16 + PAGE_SIZE]);
}

#[test]
fn identical_inserts_commit_identically() {
    let build = || {
        let mut space = AddressSpace::new();
        let mut b = PageTableBuilder::new();
        b.insert(0x40_0000, 0x1000, Permission::Code).unwrap();
        b.insert(0xFFFF_8000_0000_0000, 0x2000, Permission::Data).unwrap();
        b.insert(0x7FFF_FFFF_F000, 0x3000, Permission::Data).unwrap();
        let table = b.commit(0x10_0000, &mut space).unwrap();
        let gpas: Vec<u64> = table.pages.iter().map(|p| p.gpa).collect();
        let bytes: Vec<Vec<u8>> = table
            .pages
            .iter()
            .map(|p| p.page.as_bytes().to_vec())
            .collect();
        (gpas, bytes)
    };
    assert_eq!(build(), build());
}

#[test]
fn walk_pages_in_table_and_data_from_snapshot() {
    // Build a committed table in one address space and capture every bound page into a
    // snapshot; a fresh address space then pages everything in lazily.
    let (mut space, cr3) = three_page_layout();
    space.virt_write(cr3, CODE_BASE + 0x10, b"lazy").unwrap();

    let mut snap = MemorySnapshot::new();
    for (gpa, _) in space.bindings().collect::<Vec<_>>() {
        snap.load(gpa, &space.phy_read(gpa, PAGE_SIZE).unwrap());
    }

    let mut fresh = AddressSpace::new();
    let mut pager = SnapshotPager::new(&snap);
    let mut view = fresh.with_pager(&mut pager);
    assert_eq!(view.virt_read(cr3, CODE_BASE + 0x10, 4).unwrap(), b"lazy");
    // PML4, PDPT, PD, PT and the data frame.
    assert_eq!(pager.stats().invocations, 5);

    let mut view = fresh.with_pager(&mut pager);
    assert_eq!(view.virt_read(cr3, CODE_BASE + 0x10, 4).unwrap(), b"lazy");
    assert_eq!(pager.stats().invocations, 5);
    assert_eq!(fresh.stats().allocated, 5);
}

#[test]
fn unmapped_virtual_address() {
    let (space, cr3) = three_page_layout();
    let gva = CODE_BASE + 3 * PAGE_SIZE as u64;
    assert_eq!(
        space.virt_read(cr3, gva, 1).unwrap_err(),
        MemError::UnmappedAddress { gva }
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn translate_after_insert(
        pages in prop::collection::btree_map(0u64..(1 << 35), 1u64..1024, 1..32),
        offset in 0u64..4096,
    ) {
        let mut b = PageTableBuilder::new();
        for (&vpn, &pfn) in &pages {
            b.insert(vpn << 12, pfn << 12, Permission::Data).unwrap();
        }
        prop_assert_eq!(b.len(), pages.len());
        for (&vpn, &pfn) in &pages {
            prop_assert_eq!(b.translate((vpn << 12) | offset).unwrap(), (pfn << 12) | offset);
        }
    }

    #[test]
    fn virt_round_trip(
        start in 0u64..(3 * PAGE_SIZE as u64),
        data in prop::collection::vec(any::<u8>(), 0..2 * PAGE_SIZE),
    ) {
        let (mut space, cr3) = three_page_layout();
        let len = data.len().min(3 * PAGE_SIZE - start as usize);
        let gva = CODE_BASE + start;
        space.virt_write(cr3, gva, &data[..len]).unwrap();
        prop_assert_eq!(space.virt_read(cr3, gva, len).unwrap(), &data[..len]);
    }
}
