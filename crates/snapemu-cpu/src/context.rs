use crate::segments::GlobalSegment;
use crate::state::Gpr;

/// A captured thread's register record, as exposed by a process or kernel dump.
///
/// Kernel dumps additionally carry the page-table root and descriptor-table registers; user
/// dumps leave those as `None` and the session keeps whatever it had installed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadContext {
    /// General-purpose registers indexed by [`Gpr`].
    pub gprs: [u64; 16],
    pub rip: u64,
    pub rflags: u64,

    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,

    pub fs_base: Option<u64>,
    /// TEB / per-thread pointer.
    pub gs_base: Option<u64>,

    pub cr3: Option<u64>,
    pub gdtr: Option<GlobalSegment>,
    pub idtr: Option<GlobalSegment>,
}

impl ThreadContext {
    #[inline]
    pub fn gpr(&self, reg: Gpr) -> u64 {
        self.gprs[reg as usize]
    }

    #[inline]
    pub fn set_gpr(&mut self, reg: Gpr, val: u64) {
        self.gprs[reg as usize] = val;
    }

    #[inline]
    pub fn rsp(&self) -> u64 {
        self.gpr(Gpr::Rsp)
    }
}
