//! Hardware-style 4-level walk over committed table bytes.
//!
//! The walker does not know where entries live; callers supply a reader so the same walk runs
//! against plain bindings and against a demand-paged view.

use std::ops::Range;

use crate::error::{MemError, Result};
use crate::page::{is_canonical, page_offset, PageSize, PAGE_SIZE};
use crate::pagetable::{
    gva_from_indices, table_indices, EntryFlags, ADDR_MASK_4K, ENTRIES_PER_TABLE,
};

const CR3_PML4_BASE_MASK: u64 = 0x000F_FFFF_FFFF_F000;
const ADDR_MASK_2M: u64 = 0x000F_FFFF_FFE0_0000;
const ADDR_MASK_1G: u64 = 0x000F_FFFF_C000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub gpa: u64,
    pub size: PageSize,
}

/// One present leaf entry of a committed table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableRecord {
    pub gva: u64,
    pub gpa: u64,
    pub size: PageSize,
    pub flags: EntryFlags,
}

pub(crate) fn translate(
    cr3: u64,
    gva: u64,
    mut read_entry: impl FnMut(u64) -> Result<u64>,
) -> Result<Translation> {
    if !is_canonical(gva) {
        return Err(MemError::NonCanonicalAddress(gva));
    }
    let not_present = || MemError::UnmappedAddress { gva };
    let [pml4_index, pdpt_index, pd_index, pt_index] = table_indices(gva).map(u64::from);

    let pml4e = read_entry((cr3 & CR3_PML4_BASE_MASK) + pml4_index * 8)?;
    if pml4e & EntryFlags::PRESENT.bits() == 0 {
        return Err(not_present());
    }

    let pdpte = read_entry((pml4e & ADDR_MASK_4K) + pdpt_index * 8)?;
    if pdpte & EntryFlags::PRESENT.bits() == 0 {
        return Err(not_present());
    }
    if pdpte & EntryFlags::PAGE_SIZE.bits() != 0 {
        return Ok(Translation {
            gpa: (pdpte & ADDR_MASK_1G) + (gva & 0x3FFF_FFFF),
            size: PageSize::Size1G,
        });
    }

    let pde = read_entry((pdpte & ADDR_MASK_4K) + pd_index * 8)?;
    if pde & EntryFlags::PRESENT.bits() == 0 {
        return Err(not_present());
    }
    if pde & EntryFlags::PAGE_SIZE.bits() != 0 {
        return Ok(Translation {
            gpa: (pde & ADDR_MASK_2M) + (gva & 0x1F_FFFF),
            size: PageSize::Size2M,
        });
    }

    let pte = read_entry((pde & ADDR_MASK_4K) + pt_index * 8)?;
    if pte & EntryFlags::PRESENT.bits() == 0 {
        return Err(not_present());
    }
    Ok(Translation {
        gpa: (pte & ADDR_MASK_4K) + page_offset(gva) as u64,
        size: PageSize::Size4K,
    })
}

/// Splits `len` bytes starting at `gva` into per-page pieces: `(piece_gva, buffer_range)`.
pub(crate) fn page_chunks(gva: u64, len: usize) -> impl Iterator<Item = (u64, Range<usize>)> {
    let mut offset = 0usize;
    std::iter::from_fn(move || {
        if offset >= len {
            return None;
        }
        let addr = gva.wrapping_add(offset as u64);
        let page_rem = PAGE_SIZE - page_offset(addr);
        let chunk_len = page_rem.min(len - offset);
        let piece = (addr, offset..offset + chunk_len);
        offset += chunk_len;
        Some(piece)
    })
}

/// Enumerates every present leaf reachable from `cr3`, in ascending address order.
pub(crate) fn dump(
    cr3: u64,
    mut read_entry: impl FnMut(u64) -> Result<u64>,
) -> Result<Vec<PageTableRecord>> {
    let mut records = Vec::new();
    let mut frontier = vec![(cr3 & CR3_PML4_BASE_MASK, [0u16; 4])];
    for level in 0..4 {
        let mut next = Vec::new();
        for (table, prefix) in frontier {
            visit_table(&mut read_entry, table, level, prefix, &mut records, &mut next)?;
        }
        frontier = next;
    }
    records.sort_by_key(|r| r.gva);
    Ok(records)
}

fn visit_table(
    read_entry: &mut impl FnMut(u64) -> Result<u64>,
    table: u64,
    level: usize,
    prefix: [u16; 4],
    records: &mut Vec<PageTableRecord>,
    children: &mut Vec<(u64, [u16; 4])>,
) -> Result<()> {
    for index in 0..ENTRIES_PER_TABLE {
        let entry = read_entry(table + index as u64 * 8)?;
        if entry & EntryFlags::PRESENT.bits() == 0 {
            continue;
        }
        let mut indices = prefix;
        indices[level] = index as u16;
        let flags = EntryFlags::from_bits_truncate(entry);
        let large = flags.contains(EntryFlags::PAGE_SIZE);
        let leaf = match level {
            3 => Some((PageSize::Size4K, ADDR_MASK_4K)),
            2 if large => Some((PageSize::Size2M, ADDR_MASK_2M)),
            1 if large => Some((PageSize::Size1G, ADDR_MASK_1G)),
            _ => None,
        };
        match leaf {
            Some((size, mask)) => records.push(PageTableRecord {
                gva: gva_from_indices(indices),
                gpa: entry & mask,
                size,
                flags,
            }),
            None => children.push((entry & ADDR_MASK_4K, indices)),
        }
    }
    Ok(())
}
