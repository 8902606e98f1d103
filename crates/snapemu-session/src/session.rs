use snapemu_cpu::{CpuState, ThreadContext};
use snapemu_mem::{
    AddressSpace, MemorySnapshot, MissingPageHandler, PageTableBuilder, PagedView, SnapshotPager,
};

use crate::config::SessionConfig;
use crate::engine::{EngineContext, ExecutionEngine};
use crate::error::{Result, SessionError};
use crate::hook::{HookAction, StepHook, StopAtAddress, StopHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The stop handle was raised, by the engine or from outside.
    Requested,
    /// A hook returned [`HookAction::Stop`].
    Hook,
    /// The configured step budget was used up.
    StepLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Steps executed by this run.
    pub steps: u64,
    pub reason: StopReason,
}

/// One emulation session: CPU state, guest memory, the missing-page handler and the hooks,
/// handed by reference to the engine on every step.
pub struct Session<H = SnapshotPager<MemorySnapshot>> {
    config: SessionConfig,
    cpu: CpuState,
    space: AddressSpace,
    pager: H,
    hooks: Vec<Box<dyn StepHook>>,
    stop: StopHandle,
    steps: u64,
    failure: Option<SessionError>,
}

impl<H: MissingPageHandler> Session<H> {
    pub fn new(config: SessionConfig, pager: H) -> Self {
        let mut hooks: Vec<Box<dyn StepHook>> = Vec::new();
        if let Some(address) = config.stop_address {
            hooks.push(Box::new(StopAtAddress::new(address)));
        }
        Self {
            space: AddressSpace::with_policy(config.binding_policy),
            config,
            cpu: CpuState::default(),
            pager,
            hooks,
            stop: StopHandle::new(),
            steps: 0,
            failure: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn cpu(&self) -> &CpuState {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut CpuState {
        &mut self.cpu
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn address_space_mut(&mut self) -> &mut AddressSpace {
        &mut self.space
    }

    pub fn pager(&self) -> &H {
        &self.pager
    }

    /// Guest memory with demand paging.
    pub fn memory(&mut self) -> PagedView<'_, H> {
        self.space.with_pager(&mut self.pager)
    }

    /// Total successful steps over the session's lifetime.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// The fatal error that ended the session, if any.
    pub fn failure(&self) -> Option<&SessionError> {
        self.failure.as_ref()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn add_hook(&mut self, hook: impl StepHook + 'static) {
        self.hooks.push(Box::new(hook));
    }

    pub fn load_thread(&mut self, ctx: &ThreadContext) {
        self.cpu.switch_to_thread(ctx);
    }

    /// Commits `builder`, binds its nodes and loads the root into CR3.
    ///
    /// Without an explicit `base` the configured one is used, then the builder's suggestion.
    pub fn install_layout(
        &mut self,
        builder: &mut PageTableBuilder,
        base: Option<u64>,
    ) -> Result<u64> {
        let base = base
            .or(self.config.page_table_base)
            .unwrap_or_else(|| builder.suggested_table_base());
        let table = builder.commit(base, &mut self.space)?;
        let root = self.space.bind_committed(table)?;
        self.cpu.cr3 = root;
        Ok(root)
    }

    /// Steps `engine` until a stop condition or an error.
    ///
    /// The CPU mode is validated first. A stop requested before the call is cleared. Fatal
    /// errors raised while stepping are remembered: every later call fails with the same error
    /// and the step counter never moves again.
    pub fn run<E: ExecutionEngine + ?Sized>(&mut self, engine: &mut E) -> Result<RunSummary> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        if let Err(err) = self.cpu.require_mode() {
            tracing::error!(%err, "refusing to run");
            return Err(err.into());
        }

        self.stop.reset();
        let start = self.steps;
        tracing::debug!(
            mode = %self.cpu.mode(),
            rip = format_args!("{:#x}", self.cpu.rip),
            "starting run"
        );

        let reason = loop {
            if self.stop.is_stopped() {
                break StopReason::Requested;
            }
            if self.config.max_steps.is_some_and(|max| self.steps - start >= max) {
                break StopReason::StepLimit;
            }
            let cpu = &self.cpu;
            if self.hooks.iter_mut().any(|h| h.before_step(cpu) == HookAction::Stop) {
                break StopReason::Hook;
            }

            let result = {
                let mut ctx = EngineContext {
                    cpu: &mut self.cpu,
                    memory: self
                        .space
                        .with_pager(&mut self.pager as &mut dyn MissingPageHandler),
                    stop: &self.stop,
                    step: self.steps,
                };
                engine.step(&mut ctx)
            };
            if let Err(err) = result {
                if err.is_fatal() {
                    return Err(self.fail(err));
                }
                tracing::warn!(%err, steps = self.steps - start, "run aborted");
                return Err(err);
            }

            self.steps += 1;
            tracing::trace!(
                step = self.steps,
                rip = format_args!("{:#x}", self.cpu.rip),
                "stepped"
            );

            let cpu = &self.cpu;
            if self.hooks.iter_mut().any(|h| h.after_step(cpu) == HookAction::Stop) {
                break StopReason::Hook;
            }
        };

        let summary = RunSummary {
            steps: self.steps - start,
            reason,
        };
        tracing::debug!(steps = summary.steps, ?reason, "run finished");
        Ok(summary)
    }

    fn fail(&mut self, err: SessionError) -> SessionError {
        tracing::error!(
            %err,
            rip = format_args!("{:#x}", self.cpu.rip),
            steps = self.steps,
            "session stopped on fatal error"
        );
        self.stop.stop();
        self.failure = Some(err.clone());
        err
    }

    /// Releases every host page the session owns. Returns how many were released.
    pub fn release(&mut self) -> usize {
        let released = self.space.release_all();
        tracing::debug!(released, "released session memory");
        released
    }
}

impl Session<SnapshotPager<MemorySnapshot>> {
    /// A session paging from an in-memory snapshot.
    pub fn from_snapshot(config: SessionConfig, snapshot: MemorySnapshot) -> Self {
        Self::new(config, SnapshotPager::new(snapshot))
    }
}
