use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::{MemError, Result};
use crate::page::{
    is_page_aligned, page_align_down, page_offset, HostPage, PageAllocator, PAGE_SIZE,
};
use crate::pagetable::CommittedTable;
use crate::walk::{self, PageTableRecord, Translation};

/// What [`AddressSpace::page_insert`] does when the GPA is already bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BindingPolicy {
    /// Fail with [`MemError::DuplicateBinding`].
    #[default]
    Reject,
    /// Install the new page and hand the old one back to the caller.
    Replace,
}

impl FromStr for BindingPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(BindingPolicy::Reject),
            "replace" => Ok(BindingPolicy::Replace),
            other => Err(format!("expected `reject` or `replace`, got `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationStats {
    pub allocated: u64,
    pub released: u64,
}

impl AllocationStats {
    pub fn live(&self) -> u64 {
        self.allocated - self.released
    }
}

/// Guest-physical to host-page bindings for one emulation session.
#[derive(Debug, Default)]
pub struct AddressSpace {
    bindings: BTreeMap<u64, HostPage>,
    policy: BindingPolicy,
    stats: AllocationStats,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: BindingPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> BindingPolicy {
        self.policy
    }

    pub fn stats(&self) -> AllocationStats {
        self.stats
    }

    /// Number of bound pages.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn is_bound(&self, gpa: u64) -> bool {
        self.bindings.contains_key(&page_align_down(gpa))
    }

    /// Bound pages as `(gpa, host_address)` in ascending GPA order.
    pub fn bindings(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.bindings
            .iter()
            .map(|(&gpa, page)| (gpa, page.host_address()))
    }

    pub fn allocate_host_page(&mut self) -> HostPage {
        self.stats.allocated += 1;
        HostPage::zeroed()
    }

    pub fn release_host_page(&mut self, page: HostPage) {
        debug_assert!(
            self.stats.released < self.stats.allocated,
            "released more host pages than were allocated"
        );
        self.stats.released += 1;
        drop(page);
    }

    /// Binds `page` at `gpa`.
    ///
    /// Under [`BindingPolicy::Reject`] a duplicate is refused and the offered page is released.
    /// Under [`BindingPolicy::Replace`] the previously bound page is returned.
    pub fn page_insert(&mut self, gpa: u64, page: HostPage) -> Result<Option<HostPage>> {
        if !is_page_aligned(gpa) {
            self.release_host_page(page);
            return Err(MemError::UnalignedAddress(gpa));
        }
        if self.policy == BindingPolicy::Reject && self.bindings.contains_key(&gpa) {
            tracing::warn!(gpa = format_args!("{gpa:#x}"), "rejecting duplicate binding");
            self.release_host_page(page);
            return Err(MemError::DuplicateBinding(gpa));
        }

        tracing::debug!(
            gpa = format_args!("{gpa:#x}"),
            host = format_args!("{:#x}", page.host_address()),
            "bound guest page"
        );
        Ok(self.bindings.insert(gpa, page))
    }

    /// Unbinds the page containing `gpa` and returns it.
    pub fn page_remove(&mut self, gpa: u64) -> Result<HostPage> {
        self.bindings
            .remove(&page_align_down(gpa))
            .ok_or(MemError::UnboundPhysicalAddress(gpa))
    }

    /// Binds every node page of a committed table and returns its root.
    ///
    /// Under [`BindingPolicy::Reject`] every node GPA is checked first, so a collision leaves the
    /// address space untouched and releases the whole table.
    pub fn bind_committed(&mut self, table: CommittedTable) -> Result<u64> {
        if self.policy == BindingPolicy::Reject {
            let taken = table
                .pages
                .iter()
                .map(|p| p.gpa)
                .find(|gpa| self.bindings.contains_key(gpa));
            if let Some(gpa) = taken {
                tracing::warn!(
                    gpa = format_args!("{gpa:#x}"),
                    root = format_args!("{:#x}", table.root),
                    "page-table node collides with a bound page"
                );
                for committed in table.pages {
                    self.release_host_page(committed.page);
                }
                return Err(MemError::DuplicateBinding(gpa));
            }
        }

        let mut pages = table.pages.into_iter();
        while let Some(committed) = pages.next() {
            match self.page_insert(committed.gpa, committed.page) {
                Ok(Some(old)) => self.release_host_page(old),
                Ok(None) => {}
                Err(err) => {
                    for rest in pages {
                        self.release_host_page(rest.page);
                    }
                    return Err(err);
                }
            }
        }
        Ok(table.root)
    }

    /// Releases every bound page. Returns how many were released.
    pub fn release_all(&mut self) -> usize {
        let bindings = std::mem::take(&mut self.bindings);
        let count = bindings.len();
        for page in bindings.into_values() {
            self.release_host_page(page);
        }
        count
    }

    fn page(&self, gpa: u64) -> Result<&HostPage> {
        self.bindings
            .get(&page_align_down(gpa))
            .ok_or(MemError::UnboundPhysicalAddress(gpa))
    }

    fn page_mut(&mut self, gpa: u64) -> Result<&mut HostPage> {
        self.bindings
            .get_mut(&page_align_down(gpa))
            .ok_or(MemError::UnboundPhysicalAddress(gpa))
    }

    pub fn phy_translate(&self, gpa: u64) -> Result<u64> {
        Ok(self.page(gpa)?.host_address() + page_offset(gpa) as u64)
    }

    pub fn phy_read_into(&self, gpa: u64, dst: &mut [u8]) -> Result<()> {
        let range = single_page(gpa, dst.len())?;
        dst.copy_from_slice(&self.page(gpa)?.as_bytes()[range]);
        Ok(())
    }

    pub fn phy_read(&self, gpa: u64, len: usize) -> Result<Vec<u8>> {
        single_page(gpa, len)?;
        let mut buf = vec![0; len];
        self.phy_read_into(gpa, &mut buf)?;
        Ok(buf)
    }

    pub fn phy_write(&mut self, gpa: u64, src: &[u8]) -> Result<()> {
        let range = single_page(gpa, src.len())?;
        self.page_mut(gpa)?.as_bytes_mut()[range].copy_from_slice(src);
        Ok(())
    }

    pub fn read_u64(&self, gpa: u64) -> Result<u64> {
        single_page(gpa, 8)?;
        Ok(self.page(gpa)?.read_u64(page_offset(gpa)))
    }

    pub fn write_u64(&mut self, gpa: u64, val: u64) -> Result<()> {
        single_page(gpa, 8)?;
        self.page_mut(gpa)?.write_u64(page_offset(gpa), val);
        Ok(())
    }

    /// Walks the committed table rooted at `cr3` for `gva`.
    pub fn virt_translate(&self, cr3: u64, gva: u64) -> Result<u64> {
        self.virt_lookup(cr3, gva).map(|t| t.gpa)
    }

    pub fn virt_lookup(&self, cr3: u64, gva: u64) -> Result<Translation> {
        walk::translate(cr3, gva, |entry| self.read_u64(entry))
    }

    pub fn virt_read_into(&self, cr3: u64, gva: u64, dst: &mut [u8]) -> Result<()> {
        for (va, range) in walk::page_chunks(gva, dst.len()) {
            let gpa = self.virt_translate(cr3, va)?;
            self.phy_read_into(gpa, &mut dst[range])?;
        }
        Ok(())
    }

    pub fn virt_read(&self, cr3: u64, gva: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.virt_read_into(cr3, gva, &mut buf)?;
        Ok(buf)
    }

    pub fn virt_write(&mut self, cr3: u64, gva: u64, src: &[u8]) -> Result<()> {
        for (va, range) in walk::page_chunks(gva, src.len()) {
            let gpa = self.virt_translate(cr3, va)?;
            self.phy_write(gpa, &src[range])?;
        }
        Ok(())
    }

    /// Every present leaf of the table rooted at `cr3`.
    pub fn dump_page_table(&self, cr3: u64) -> Result<Vec<PageTableRecord>> {
        walk::dump(cr3, |entry| self.read_u64(entry))
    }
}

impl PageAllocator for AddressSpace {
    fn allocate_host_page(&mut self) -> HostPage {
        AddressSpace::allocate_host_page(self)
    }
}

/// Byte range inside one page, or [`MemError::CrossPageAccess`].
pub(crate) fn single_page(gpa: u64, len: usize) -> Result<std::ops::Range<usize>> {
    let start = page_offset(gpa);
    if len > PAGE_SIZE - start {
        return Err(MemError::CrossPageAccess { gpa, len });
    }
    Ok(start..start + len)
}
