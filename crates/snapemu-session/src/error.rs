use snapemu_cpu::CpuError;
use snapemu_mem::MemError;
use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Mem(#[from] MemError),

    #[error(transparent)]
    Cpu(#[from] CpuError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("execution engine failed at rip {rip:#x}: {message}")]
    Engine { rip: u64, message: String },
}

impl SessionError {
    /// Whether the session must stop for good after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            SessionError::Mem(err) => err.is_fatal(),
            SessionError::Cpu(CpuError::InvalidCpuMode(_)) => true,
            SessionError::Cpu(CpuError::UnknownFlag { .. }) => false,
            SessionError::Config(_) => false,
            SessionError::Engine { .. } => true,
        }
    }
}
