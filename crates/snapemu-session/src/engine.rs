use snapemu_cpu::CpuState;
use snapemu_mem::{MissingPageHandler, PagedView};

use crate::error::Result;
use crate::hook::StopHandle;

/// The instruction-execution engine. Opaque to this crate: it is only ever asked to make one
/// step of progress against the session's CPU state and memory.
pub trait ExecutionEngine {
    fn step(&mut self, ctx: &mut EngineContext<'_>) -> Result<()>;
}

/// Everything an engine may touch during one step.
pub struct EngineContext<'a> {
    pub cpu: &'a mut CpuState,
    /// Guest memory; unbound pages are resolved on first touch.
    pub memory: PagedView<'a, dyn MissingPageHandler + 'a>,
    pub(crate) stop: &'a StopHandle,
    pub(crate) step: u64,
}

impl EngineContext<'_> {
    /// Index of the step being executed, counted over the session's lifetime.
    pub fn step_index(&self) -> u64 {
        self.step
    }

    /// Ends the run after this step.
    pub fn request_stop(&self) {
        self.stop.stop();
    }

    /// Reads through the page table the CPU currently has loaded.
    pub fn read_virt(&mut self, gva: u64, len: usize) -> Result<Vec<u8>> {
        Ok(self.memory.virt_read(self.cpu.cr3, gva, len)?)
    }

    pub fn write_virt(&mut self, gva: u64, src: &[u8]) -> Result<()> {
        Ok(self.memory.virt_write(self.cpu.cr3, gva, src)?)
    }
}
