use thiserror::Error;

use crate::mode::ModeRegisters;

pub type Result<T> = std::result::Result<T, CpuError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CpuError {
    #[error("{register} has no flag named {flag:?}")]
    UnknownFlag {
        register: &'static str,
        flag: String,
    },

    #[error("register state does not describe a valid cpu mode ({0})")]
    InvalidCpuMode(ModeRegisters),
}
