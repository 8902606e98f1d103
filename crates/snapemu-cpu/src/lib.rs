//! CPU control state for the snapshot emulation harness.
//!
//! Everything in here is a value type: control registers are built, mutated, packed to integers
//! and handed to the execution engine as part of a [`CpuState`]. Operating mode is never stored;
//! it is recomputed from the live registers by [`mode::detect`].

#![forbid(unsafe_code)]

pub mod context;
pub mod control;
pub mod error;
pub mod mode;
pub mod segments;
pub mod state;

pub use context::ThreadContext;
pub use control::{ControlRegister, Cr0, Cr4, Efer, Flag, FlagSpec, RegisterLayout, Rflags, Xcr0};
pub use error::{CpuError, Result};
pub use mode::{CpuMode, ModeEntry, ModeRegisters};
pub use segments::{GlobalSegment, SegReg, SegmentAttributes, SegmentDescriptor, SegmentSet};
pub use state::{CpuState, Gpr};
