//! In-memory 4-level page-table builder.
//!
//! Layouts are described with [`PageTableBuilder::insert`] and then serialized once with
//! [`PageTableBuilder::commit`], which lays the table nodes out in guest physical memory the
//! way a hardware walker expects to find them.

use std::collections::{BTreeMap, BTreeSet};

use bitflags::bitflags;

use crate::error::{MemError, Result};
use crate::page::{
    is_canonical, is_page_aligned, page_align_down, page_offset, HostPage, PageAllocator,
    MAX_PHYS_ADDR, PAGE_SIZE,
};

bitflags! {
    /// Low/high control bits of a 4-level paging entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EntryFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const PAGE_SIZE = 1 << 7;
        const GLOBAL = 1 << 8;
        const NO_EXECUTE = 1 << 63;
    }
}

/// Frame bits of a 4 KiB entry (bits 51..12).
pub const ADDR_MASK_4K: u64 = 0x000F_FFFF_FFFF_F000;

/// Flags on every PML4/PDPT/PD entry the builder writes.
pub const NODE_FLAGS: EntryFlags = EntryFlags::PRESENT
    .union(EntryFlags::WRITABLE)
    .union(EntryFlags::USER);

pub const ENTRIES_PER_TABLE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    /// Present and user-accessible, not writable.
    Code,
    /// Present, user-accessible and writable.
    Data,
}

impl Permission {
    pub const fn entry_flags(self) -> EntryFlags {
        match self {
            Permission::Code => EntryFlags::PRESENT.union(EntryFlags::USER),
            Permission::Data => NODE_FLAGS,
        }
    }
}

impl TryFrom<u32> for Permission {
    type Error = MemError;

    fn try_from(tag: u32) -> Result<Self> {
        match tag {
            0 => Ok(Permission::Code),
            1 => Ok(Permission::Data),
            other => Err(MemError::InvalidPermission(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Leaf {
    gpa: u64,
    permission: Permission,
}

type PageTable = BTreeMap<u16, Leaf>;
type PageDirectory = BTreeMap<u16, PageTable>;
type PageDirectoryPointerTable = BTreeMap<u16, PageDirectory>;

/// Table indices for (PML4, PDPT, PD, PT).
#[inline]
pub fn table_indices(gva: u64) -> [u16; 4] {
    [39, 30, 21, 12].map(|shift| ((gva >> shift) & 0x1FF) as u16)
}

/// Reassembles a canonical virtual address from table indices.
pub fn gva_from_indices(indices: [u16; 4]) -> u64 {
    let raw = indices
        .iter()
        .zip([39u32, 30, 21, 12])
        .fold(0u64, |acc, (&index, shift)| acc | (u64::from(index) << shift));
    (((raw << 16) as i64) >> 16) as u64
}

/// One committed node: the host page holding its 512 entries and the GPA it must be bound at.
#[derive(Debug)]
pub struct CommittedPage {
    pub gpa: u64,
    pub page: HostPage,
}

/// Result of [`PageTableBuilder::commit`]. Nothing in here is bound yet.
#[derive(Debug)]
pub struct CommittedTable {
    /// GPA of the PML4; the value to load into CR3.
    pub root: u64,
    /// Every node page in ascending GPA order, root first.
    pub pages: Vec<CommittedPage>,
}

impl CommittedTable {
    /// `(host_address, gpa)` pairs to install into the physical backing store.
    pub fn bindings(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.pages.iter().map(|p| (p.page.host_address(), p.gpa))
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct PageTableBuilder {
    pml4: BTreeMap<u16, PageDirectoryPointerTable>,
    leaves: usize,
    frozen: bool,
}

impl PageTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps the page containing `gva` to the frame containing `gpa`. Re-inserting a page
    /// replaces its previous mapping.
    ///
    /// `gpa` must fit in an entry's frame field, i.e. lie below [`MAX_PHYS_ADDR`].
    pub fn insert(&mut self, gva: u64, gpa: u64, permission: Permission) -> Result<()> {
        if self.frozen {
            return Err(MemError::TableFrozen);
        }
        if !is_canonical(gva) {
            return Err(MemError::NonCanonicalAddress(gva));
        }
        if gpa >= MAX_PHYS_ADDR {
            return Err(MemError::PhysicalAddressOutOfRange(gpa));
        }

        let [i4, i3, i2, i1] = table_indices(gva);
        let leaf = Leaf {
            gpa: page_align_down(gpa),
            permission,
        };
        let previous = self
            .pml4
            .entry(i4)
            .or_default()
            .entry(i3)
            .or_default()
            .entry(i2)
            .or_default()
            .insert(i1, leaf);
        if previous.is_none() {
            self.leaves += 1;
        }
        Ok(())
    }

    /// [`insert`](Self::insert) with an integer permission tag (0 = code, 1 = data).
    pub fn insert_tagged(&mut self, gva: u64, gpa: u64, tag: u32) -> Result<()> {
        self.insert(gva, gpa, Permission::try_from(tag)?)
    }

    fn leaf(&self, gva: u64) -> Option<&Leaf> {
        let [i4, i3, i2, i1] = table_indices(gva);
        self.pml4.get(&i4)?.get(&i3)?.get(&i2)?.get(&i1)
    }

    /// Resolves `gva` through the in-memory tree, keeping its page offset.
    pub fn translate(&self, gva: u64) -> Result<u64> {
        if !is_canonical(gva) {
            return Err(MemError::NonCanonicalAddress(gva));
        }
        self.leaf(gva)
            .map(|leaf| leaf.gpa + page_offset(gva) as u64)
            .ok_or(MemError::UnmappedAddress { gva })
    }

    pub fn permission(&self, gva: u64) -> Option<Permission> {
        self.leaf(gva).map(|leaf| leaf.permission)
    }

    /// Every mapping as `(gva, gpa, permission)` in ascending table order.
    pub fn mappings(&self) -> impl Iterator<Item = (u64, u64, Permission)> + '_ {
        self.pml4.iter().flat_map(|(&i4, pdpt)| {
            pdpt.iter().flat_map(move |(&i3, pd)| {
                pd.iter().flat_map(move |(&i2, pt)| {
                    pt.iter().map(move |(&i1, leaf)| {
                        (gva_from_indices([i4, i3, i2, i1]), leaf.gpa, leaf.permission)
                    })
                })
            })
        })
    }

    fn leaf_frames(&self) -> BTreeSet<u64> {
        self.mappings().map(|(_, gpa, _)| gpa).collect()
    }

    /// Number of mapped pages.
    pub fn len(&self) -> usize {
        self.leaves
    }

    pub fn is_empty(&self) -> bool {
        self.leaves == 0
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Number of table pages a commit would produce, including the root.
    pub fn node_count(&self) -> usize {
        1 + self
            .pml4
            .values()
            .map(|pdpt| {
                1 + pdpt
                    .values()
                    .map(|pd| 1 + pd.len())
                    .sum::<usize>()
            })
            .sum::<usize>()
    }

    /// First page strictly above every mapped frame (0 for an empty layout).
    pub fn suggested_table_base(&self) -> u64 {
        self.leaf_frames()
            .last()
            .map_or(0, |&highest| highest + PAGE_SIZE as u64)
    }

    /// Serializes the tree into freshly allocated host pages.
    ///
    /// The root lives at `pml4_base`; the remaining nodes take consecutive pages above it in
    /// depth-first order with ascending indices, so identical insert sequences always commit to
    /// identical bytes. The builder is frozen afterwards.
    pub fn commit(
        &mut self,
        pml4_base: u64,
        alloc: &mut impl PageAllocator,
    ) -> Result<CommittedTable> {
        if self.frozen {
            return Err(MemError::TableFrozen);
        }
        if !is_page_aligned(pml4_base) {
            return Err(MemError::UnalignedAddress(pml4_base));
        }

        let nodes = self.node_count() as u64;
        let end = nodes
            .checked_mul(PAGE_SIZE as u64)
            .and_then(|len| pml4_base.checked_add(len))
            .filter(|&end| end <= MAX_PHYS_ADDR)
            .ok_or(MemError::PhysicalAddressOutOfRange(pml4_base))?;
        if let Some(&frame) = self.leaf_frames().range(pml4_base..end).next() {
            return Err(MemError::FrameOverlap(frame));
        }

        let mut next_gpa = pml4_base;
        let mut frame = || {
            let gpa = next_gpa;
            next_gpa += PAGE_SIZE as u64;
            gpa
        };
        let mut pages = Vec::with_capacity(nodes as usize);

        let root = frame();
        let mut pml4_page = alloc.allocate_host_page();
        for (&i4, pdpt) in &self.pml4 {
            let pdpt_gpa = frame();
            let mut pdpt_page = alloc.allocate_host_page();
            for (&i3, pd) in pdpt {
                let pd_gpa = frame();
                let mut pd_page = alloc.allocate_host_page();
                for (&i2, pt) in pd {
                    let pt_gpa = frame();
                    let mut pt_page = alloc.allocate_host_page();
                    for (&i1, leaf) in pt {
                        write_entry(&mut pt_page, i1, leaf.gpa, leaf.permission.entry_flags());
                    }
                    write_entry(&mut pd_page, i2, pt_gpa, NODE_FLAGS);
                    pages.push(CommittedPage { gpa: pt_gpa, page: pt_page });
                }
                write_entry(&mut pdpt_page, i3, pd_gpa, NODE_FLAGS);
                pages.push(CommittedPage { gpa: pd_gpa, page: pd_page });
            }
            write_entry(&mut pml4_page, i4, pdpt_gpa, NODE_FLAGS);
            pages.push(CommittedPage { gpa: pdpt_gpa, page: pdpt_page });
        }
        pages.push(CommittedPage { gpa: root, page: pml4_page });
        pages.sort_by_key(|p| p.gpa);

        self.frozen = true;
        tracing::debug!(
            root = format_args!("{root:#x}"),
            nodes = pages.len(),
            leaves = self.leaves,
            "committed page table"
        );
        Ok(CommittedTable { root, pages })
    }
}

fn write_entry(page: &mut HostPage, index: u16, frame: u64, flags: EntryFlags) {
    page.write_u64(usize::from(index) * 8, (frame & ADDR_MASK_4K) | flags.bits());
}
