//! Guest memory for snapshot emulation: 4-level page-table construction, GPA to host-page
//! bindings, physical/virtual access, and demand paging from memory dumps.

#![forbid(unsafe_code)]

pub mod address_space;
pub mod demand;
pub mod error;
pub mod page;
pub mod pagetable;
mod walk;

pub use address_space::{AddressSpace, AllocationStats, BindingPolicy};
pub use demand::{
    MapResult, MemorySnapshot, MissingPageHandler, PagedView, PagerStats, SnapshotPager,
    SnapshotSource,
};
pub use error::{MemError, Result};
pub use page::{
    is_canonical, page_align_down, page_offset, HostPage, PageAllocator, PageSize, MAX_PHYS_ADDR,
    PAGE_SIZE,
};
pub use pagetable::{CommittedPage, CommittedTable, EntryFlags, PageTableBuilder, Permission};
pub use walk::{PageTableRecord, Translation};
