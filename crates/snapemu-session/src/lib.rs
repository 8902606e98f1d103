//! Emulation session: the context object an execution engine is driven through.
//!
//! A [`Session`] owns the CPU register snapshot, the guest [`AddressSpace`](snapemu_mem::AddressSpace)
//! and the missing-page handler. The engine itself stays opaque behind [`ExecutionEngine`]; it
//! receives an [`EngineContext`] for every step and reaches guest memory through a demand-paged
//! view, so snapshot pages are only copied in when first touched.

#![forbid(unsafe_code)]

pub mod config;
pub mod engine;
pub mod error;
pub mod hook;
pub mod session;

pub use config::{ConfigError, SessionConfig};
pub use engine::{EngineContext, ExecutionEngine};
pub use error::{Result, SessionError};
pub use hook::{HookAction, StepHook, StopAtAddress, StopHandle};
pub use session::{RunSummary, Session, StopReason};
