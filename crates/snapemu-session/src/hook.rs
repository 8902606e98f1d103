use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use snapemu_cpu::CpuState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    Continue,
    Stop,
}

/// Observer called around every engine step.
pub trait StepHook {
    fn before_step(&mut self, _cpu: &CpuState) -> HookAction {
        HookAction::Continue
    }

    fn after_step(&mut self, _cpu: &CpuState) -> HookAction {
        HookAction::Continue
    }
}

/// Stops the run once RIP reaches `address`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopAtAddress {
    pub address: u64,
}

impl StopAtAddress {
    pub fn new(address: u64) -> Self {
        Self { address }
    }
}

impl StepHook for StopAtAddress {
    fn after_step(&mut self, cpu: &CpuState) -> HookAction {
        if cpu.rip == self.address {
            tracing::debug!(rip = format_args!("{:#x}", cpu.rip), "reached stop address");
            HookAction::Stop
        } else {
            HookAction::Continue
        }
    }
}

/// Cooperative stop flag, observed between steps.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
