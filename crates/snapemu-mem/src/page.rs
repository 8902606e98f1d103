use std::fmt;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

/// Exclusive upper bound of a guest physical address (52-bit physical address width).
pub const MAX_PHYS_ADDR: u64 = 1 << 52;

#[inline]
pub const fn page_align_down(addr: u64) -> u64 {
    addr & !PAGE_MASK
}

#[inline]
pub const fn page_offset(addr: u64) -> usize {
    (addr & PAGE_MASK) as usize
}

#[inline]
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & PAGE_MASK == 0
}

/// 48-bit canonical form: bits 63..48 replicate bit 47.
#[inline]
pub const fn is_canonical(addr: u64) -> bool {
    let upper = addr >> 48;
    if (addr >> 47) & 1 == 0 {
        upper == 0
    } else {
        upper == 0xFFFF
    }
}

/// Granularity of a translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageSize {
    Size4K,
    Size2M,
    Size1G,
}

impl PageSize {
    pub const fn bytes(self) -> u64 {
        match self {
            PageSize::Size4K => 1 << 12,
            PageSize::Size2M => 1 << 21,
            PageSize::Size1G => 1 << 30,
        }
    }
}

/// One zero-initialized 4 KiB block of host memory.
///
/// The backing allocation never moves, so [`HostPage::host_address`] is stable for the page's
/// lifetime and can be handed to an execution engine.
pub struct HostPage {
    bytes: Box<[u8; PAGE_SIZE]>,
}

impl HostPage {
    pub(crate) fn zeroed() -> Self {
        Self {
            bytes: Box::new([0; PAGE_SIZE]),
        }
    }

    #[inline]
    pub fn host_address(&self) -> u64 {
        self.bytes.as_ptr() as u64
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.bytes
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.bytes
    }

    pub(crate) fn read_u64(&self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.bytes[offset..offset + 8]);
        u64::from_le_bytes(buf)
    }

    pub(crate) fn write_u64(&mut self, offset: usize, val: u64) {
        self.bytes[offset..offset + 8].copy_from_slice(&val.to_le_bytes());
    }
}

impl fmt::Debug for HostPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostPage")
            .field("host_address", &format_args!("{:#x}", self.host_address()))
            .finish()
    }
}

/// Source of fresh host pages.
pub trait PageAllocator {
    fn allocate_host_page(&mut self) -> HostPage;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(page_align_down(0x1FFF), 0x1000);
        assert_eq!(page_offset(0x1FFF), 0xFFF);
        assert!(is_page_aligned(0x7000));
        assert!(!is_page_aligned(0x7001));
    }

    #[test]
    fn canonical_addresses() {
        assert!(is_canonical(0));
        assert!(is_canonical(0x0000_7FFF_FFFF_FFFF));
        assert!(is_canonical(0xFFFF_8000_0000_0000));
        assert!(!is_canonical(0x0000_8000_0000_0000));
        assert!(!is_canonical(0xFFFF_7FFF_FFFF_FFFF));
    }

    #[test]
    fn host_pages_are_zeroed_and_distinct() {
        let a = HostPage::zeroed();
        let b = HostPage::zeroed();
        assert!(a.as_bytes().iter().all(|&b| b == 0));
        assert_ne!(a.host_address(), b.host_address());
        assert_eq!(a.host_address() as usize, a.as_bytes().as_ptr() as usize);
    }
}
