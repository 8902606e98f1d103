//! Demand paging from snapshot sources.
//!
//! Guest physical pages are only materialized the first time something touches them. The
//! execution engine (or a [`PagedView`]) calls a [`MissingPageHandler`] exactly when a GPA has no
//! binding; [`SnapshotPager`] answers by copying the page out of a [`SnapshotSource`].

use std::collections::BTreeMap;

use crate::address_space::{single_page, AddressSpace};
use crate::error::{MemError, Result};
use crate::page::{page_align_down, page_offset, PAGE_SIZE};
use crate::walk::{self, Translation};

/// Outcome of a missing-page callback. `Err` stops the session.
pub type MapResult = Result<()>;

/// Page-granular view of a memory dump.
pub trait SnapshotSource {
    /// Whether the dump holds the page at `gpa` (page aligned).
    fn contains(&self, gpa: u64) -> bool;

    /// Copies the page at `gpa` (page aligned) into `dst`.
    fn read_page(&self, gpa: u64, dst: &mut [u8; PAGE_SIZE]) -> Result<()>;
}

impl<S: SnapshotSource + ?Sized> SnapshotSource for &S {
    fn contains(&self, gpa: u64) -> bool {
        (**self).contains(gpa)
    }

    fn read_page(&self, gpa: u64, dst: &mut [u8; PAGE_SIZE]) -> Result<()> {
        (**self).read_page(gpa, dst)
    }
}

/// Sparse in-memory snapshot.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshot {
    pages: BTreeMap<u64, Box<[u8; PAGE_SIZE]>>,
}

impl MemorySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `bytes` into the snapshot starting at `gpa`, creating zeroed pages as needed.
    pub fn load(&mut self, gpa: u64, bytes: &[u8]) {
        for (addr, range) in walk::page_chunks(gpa, bytes.len()) {
            let page = self
                .pages
                .entry(page_align_down(addr))
                .or_insert_with(|| Box::new([0; PAGE_SIZE]));
            let start = page_offset(addr);
            page[start..start + range.len()].copy_from_slice(&bytes[range]);
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

impl SnapshotSource for MemorySnapshot {
    fn contains(&self, gpa: u64) -> bool {
        self.pages.contains_key(&gpa)
    }

    fn read_page(&self, gpa: u64, dst: &mut [u8; PAGE_SIZE]) -> Result<()> {
        let page = self.pages.get(&gpa).ok_or_else(|| MemError::SnapshotRead {
            gpa,
            reason: "page not present".to_owned(),
        })?;
        dst.copy_from_slice(&page[..]);
        Ok(())
    }
}

/// Resolver invoked for a GPA that has no host binding.
pub trait MissingPageHandler {
    fn missing_page(&mut self, space: &mut AddressSpace, gpa: u64) -> MapResult;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PagerStats {
    pub invocations: u64,
    pub pages_loaded: u64,
}

/// [`MissingPageHandler`] backed by a [`SnapshotSource`].
#[derive(Debug)]
pub struct SnapshotPager<S> {
    source: S,
    stats: PagerStats,
}

impl<S: SnapshotSource> SnapshotPager<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            stats: PagerStats::default(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn stats(&self) -> PagerStats {
        self.stats
    }
}

impl<S: SnapshotSource> MissingPageHandler for SnapshotPager<S> {
    fn missing_page(&mut self, space: &mut AddressSpace, gpa: u64) -> MapResult {
        let gpa = page_align_down(gpa);
        self.stats.invocations += 1;

        if space.is_bound(gpa) {
            return Ok(());
        }
        if !self.source.contains(gpa) {
            tracing::error!(gpa = format_args!("{gpa:#x}"), "page missing from snapshot");
            return Err(MemError::MissingPageFatal { gpa });
        }

        let mut page = space.allocate_host_page();
        if let Err(err) = self.source.read_page(gpa, page.as_bytes_mut()) {
            tracing::error!(gpa = format_args!("{gpa:#x}"), %err, "snapshot read failed");
            space.release_host_page(page);
            return Err(err);
        }
        space.page_insert(gpa, page)?;
        self.stats.pages_loaded += 1;
        tracing::debug!(gpa = format_args!("{gpa:#x}"), "paged in from snapshot");
        Ok(())
    }
}

impl AddressSpace {
    /// A view whose accesses resolve unbound pages through `handler` before touching them.
    pub fn with_pager<'a, H: MissingPageHandler + ?Sized>(
        &'a mut self,
        handler: &'a mut H,
    ) -> PagedView<'a, H> {
        PagedView {
            space: self,
            handler,
        }
    }
}

/// [`AddressSpace`] access with demand paging.
///
/// The handler runs only for GPAs that are unbound at the moment they are needed, including the
/// page-table pages touched by a virtual walk.
pub struct PagedView<'a, H: ?Sized> {
    space: &'a mut AddressSpace,
    handler: &'a mut H,
}

impl<H: MissingPageHandler + ?Sized> PagedView<'_, H> {
    pub fn space(&self) -> &AddressSpace {
        self.space
    }

    /// Makes sure the page containing `gpa` is bound.
    pub fn ensure(&mut self, gpa: u64) -> Result<()> {
        if self.space.is_bound(gpa) {
            return Ok(());
        }
        self.handler.missing_page(self.space, gpa)?;
        if self.space.is_bound(gpa) {
            Ok(())
        } else {
            Err(MemError::UnboundPhysicalAddress(gpa))
        }
    }

    pub fn phy_translate(&mut self, gpa: u64) -> Result<u64> {
        self.ensure(gpa)?;
        self.space.phy_translate(gpa)
    }

    pub fn phy_read_into(&mut self, gpa: u64, dst: &mut [u8]) -> Result<()> {
        single_page(gpa, dst.len())?;
        self.ensure(gpa)?;
        self.space.phy_read_into(gpa, dst)
    }

    pub fn phy_read(&mut self, gpa: u64, len: usize) -> Result<Vec<u8>> {
        single_page(gpa, len)?;
        let mut buf = vec![0; len];
        self.phy_read_into(gpa, &mut buf)?;
        Ok(buf)
    }

    pub fn phy_write(&mut self, gpa: u64, src: &[u8]) -> Result<()> {
        single_page(gpa, src.len())?;
        self.ensure(gpa)?;
        self.space.phy_write(gpa, src)
    }

    fn read_entry(&mut self, gpa: u64) -> Result<u64> {
        self.ensure(gpa)?;
        self.space.read_u64(gpa)
    }

    pub fn virt_lookup(&mut self, cr3: u64, gva: u64) -> Result<Translation> {
        walk::translate(cr3, gva, |entry| self.read_entry(entry))
    }

    pub fn virt_translate(&mut self, cr3: u64, gva: u64) -> Result<u64> {
        self.virt_lookup(cr3, gva).map(|t| t.gpa)
    }

    pub fn virt_read_into(&mut self, cr3: u64, gva: u64, dst: &mut [u8]) -> Result<()> {
        for (va, range) in walk::page_chunks(gva, dst.len()) {
            let gpa = self.virt_translate(cr3, va)?;
            self.phy_read_into(gpa, &mut dst[range])?;
        }
        Ok(())
    }

    pub fn virt_read(&mut self, cr3: u64, gva: u64, len: usize) -> Result<Vec<u8>> {
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
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> MemorySnapshot {
        let mut snap = MemorySnapshot::new();
        snap.load(0x7000, b"snapshot page");
        snap
    }

    #[test]
    fn load_spans_pages() {
        let mut snap = MemorySnapshot::new();
        snap.load(0x1FFE, &[1, 2, 3, 4]);
        assert_eq!(snap.len(), 2);

        let mut page = [0u8; PAGE_SIZE];
        snap.read_page(0x1000, &mut page).unwrap();
        assert_eq!(&page[0xFFE..], &[1, 2]);
        snap.read_page(0x2000, &mut page).unwrap();
        assert_eq!(&page[..2], &[3, 4]);
    }

    #[test]
    fn first_access_pages_in_once() {
        let mut space = AddressSpace::new();
        let mut pager = SnapshotPager::new(snapshot());

        let mut view = space.with_pager(&mut pager);
        assert_eq!(view.phy_read(0x7000, 8).unwrap(), b"snapshot");
        assert_eq!(view.phy_read(0x7009, 4).unwrap(), b"page");

        assert_eq!(pager.stats(), PagerStats { invocations: 1, pages_loaded: 1 });
        assert_eq!(space.stats().allocated, 1);
    }

    #[test]
    fn missing_page_is_fatal() {
        let mut space = AddressSpace::new();
        let mut pager = SnapshotPager::new(snapshot());

        let err = space.with_pager(&mut pager).phy_read(0x8010, 1).unwrap_err();
        assert_eq!(err, MemError::MissingPageFatal { gpa: 0x8000 });
        assert!(err.is_fatal());
        assert_eq!(pager.stats().pages_loaded, 0);
        assert_eq!(space.stats().allocated, 0);
    }

    #[test]
    fn cross_page_access_is_refused_before_paging() {
        let mut space = AddressSpace::new();
        let mut pager = SnapshotPager::new(snapshot());

        let mut view = space.with_pager(&mut pager);
        assert_eq!(
            view.phy_read(0x7000, usize::MAX),
            Err(MemError::CrossPageAccess { gpa: 0x7000, len: usize::MAX })
        );
        assert_eq!(
            view.phy_write(0x7FFF, &[1, 2]),
            Err(MemError::CrossPageAccess { gpa: 0x7FFF, len: 2 })
        );
        assert_eq!(pager.stats().invocations, 0);
        assert!(space.is_empty());
    }

    #[test]
    fn handler_that_binds_nothing_is_reported() {
        struct Lazy;
        impl MissingPageHandler for Lazy {
            fn missing_page(&mut self, _: &mut AddressSpace, _: u64) -> MapResult {
                Ok(())
            }
        }

        let mut space = AddressSpace::new();
        assert_eq!(
            space.with_pager(&mut Lazy).phy_read(0x3000, 1),
            Err(MemError::UnboundPhysicalAddress(0x3000))
        );
    }

    #[test]
    fn bound_pages_never_reach_the_handler() {
        let mut space = AddressSpace::new();
        let page = space.allocate_host_page();
        space.page_insert(0x7000, page).unwrap();
        let mut pager = SnapshotPager::new(snapshot());

        // The local binding shadows the snapshot contents.
        assert_eq!(
            space.with_pager(&mut pager).phy_read(0x7000, 4).unwrap(),
            [0, 0, 0, 0]
        );
        assert_eq!(pager.stats().invocations, 0);
    }
}
