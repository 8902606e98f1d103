use thiserror::Error;

pub type Result<T> = std::result::Result<T, MemError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemError {
    #[error("invalid permission tag {0} (expected 0 for code or 1 for data)")]
    InvalidPermission(u32),

    #[error("virtual address {gva:#x} is not mapped")]
    UnmappedAddress { gva: u64 },

    #[error("virtual address {0:#x} is not canonical")]
    NonCanonicalAddress(u64),

    #[error("guest physical page {0:#x} is already bound")]
    DuplicateBinding(u64),

    #[error("guest physical address {0:#x} has no host binding")]
    UnboundPhysicalAddress(u64),

    #[error("physical access of {len} bytes at {gpa:#x} crosses a page boundary")]
    CrossPageAccess { gpa: u64, len: usize },

    #[error("address {0:#x} is not page aligned")]
    UnalignedAddress(u64),

    #[error("page table has already been committed")]
    TableFrozen,

    #[error("guest physical address {0:#x} is beyond the 52-bit physical address limit")]
    PhysicalAddressOutOfRange(u64),

    #[error("page-table node at {0:#x} overlaps a mapped frame")]
    FrameOverlap(u64),

    #[error("guest physical page {gpa:#x} is not present in the snapshot")]
    MissingPageFatal { gpa: u64 },

    #[error("failed to read snapshot page {gpa:#x}: {reason}")]
    SnapshotRead { gpa: u64, reason: String },
}

impl MemError {
    /// Errors after which an emulation session cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MemError::MissingPageFatal { .. } | MemError::SnapshotRead { .. }
        )
    }
}
