//! Snapshot emulation harness.
//!
//! Builds guest address spaces and CPU register state for an external x86 execution engine and
//! lazily materializes guest memory from memory dumps. The work is split across three crates,
//! re-exported here:
//!
//! - [`cpu`]: control registers, mode detection, segment descriptors and [`cpu::CpuState`].
//! - [`mem`]: page-table construction, guest physical bindings and demand paging.
//! - [`session`]: the session context object and the engine/hook seams.

#![forbid(unsafe_code)]

pub use snapemu_cpu as cpu;
pub use snapemu_mem as mem;
pub use snapemu_session as session;

/// The types most callers need.
pub mod prelude {
    pub use snapemu_cpu::mode::{
        enter_long_mode, enter_protected_mode, enter_real_mode, enter_virtual8086_mode,
    };
    pub use snapemu_cpu::{CpuMode, CpuState, Gpr, SegmentSet, ThreadContext};
    pub use snapemu_mem::{
        AddressSpace, MemorySnapshot, PageTableBuilder, Permission, SnapshotPager,
        SnapshotSource,
    };
    pub use snapemu_session::{
        EngineContext, ExecutionEngine, HookAction, RunSummary, Session, SessionConfig,
        SessionError, StepHook, StopAtAddress, StopReason,
    };
}
