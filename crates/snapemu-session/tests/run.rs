use snapemu_cpu::mode::enter_long_mode;
use snapemu_cpu::{CpuError, CpuMode, CpuState, Cr0};
use snapemu_mem::{MemError, MemorySnapshot, PageTableBuilder, Permission};
use snapemu_session::{
    EngineContext, ExecutionEngine, HookAction, Result, RunSummary, Session, SessionConfig,
    SessionError, StepHook, StopReason,
};

const CODE: u64 = 0x40_0000;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Reads one byte of guest physical memory per step.
struct PhysToucher {
    gpa: u64,
}

impl ExecutionEngine for PhysToucher {
    fn step(&mut self, ctx: &mut EngineContext<'_>) -> Result<()> {
        ctx.memory.phy_read(self.gpa, 1)?;
        ctx.cpu.rip += 1;
        Ok(())
    }
}

/// Tiny byte-code machine: 0x90 advances, 0xF4 halts, anything else is an engine fault.
struct ByteMachine;

impl ExecutionEngine for ByteMachine {
    fn step(&mut self, ctx: &mut EngineContext<'_>) -> Result<()> {
        let rip = ctx.cpu.rip;
        let opcode = ctx.read_virt(rip, 1)?[0];
        match opcode {
            0x90 => {}
            0xF4 => ctx.request_stop(),
            other => {
                return Err(SessionError::Engine {
                    rip,
                    message: format!("unsupported opcode {other:#04x}"),
                })
            }
        }
        ctx.cpu.rip = rip + 1;
        Ok(())
    }
}

fn snapshot_with(gpa: u64, bytes: &[u8]) -> MemorySnapshot {
    let mut snap = MemorySnapshot::new();
    snap.load(gpa, bytes);
    snap
}

/// A long-mode session whose code page at `CODE` is backed lazily by `program`.
fn long_mode_session(config: SessionConfig, program: &[u8]) -> Session {
    let mut session = Session::from_snapshot(config, snapshot_with(0x1000, program));
    let mut builder = PageTableBuilder::new();
    builder.insert(CODE, 0x1000, Permission::Code).unwrap();
    let root = session.install_layout(&mut builder, None).unwrap();
    assert_eq!(root, 0x2000);

    let cpu = session.cpu_mut();
    cpu.apply_mode(&enter_long_mode(), 0x33, 0x2B);
    cpu.rip = CODE;
    session
}

#[test]
fn first_access_resolves_once() {
    init_tracing();
    let config = SessionConfig {
        max_steps: Some(1),
        ..SessionConfig::default()
    };
    let mut session = Session::from_snapshot(config, snapshot_with(0x5000, &[0xAB; 16]));
    let mut engine = PhysToucher { gpa: 0x5010 };

    let summary = session.run(&mut engine).unwrap();
    assert_eq!(summary.steps, 1);
    assert_eq!(summary.reason, StopReason::StepLimit);
    assert_eq!(session.pager().stats().invocations, 1);
    assert_eq!(session.address_space().stats().allocated, 1);

    session.run(&mut engine).unwrap();
    assert_eq!(session.steps(), 2);
    assert_eq!(session.pager().stats().invocations, 1);
    assert_eq!(session.address_space().stats().allocated, 1);
    assert_eq!(session.memory().phy_read(0x5000, 2).unwrap(), [0xAB, 0xAB]);
}

#[test]
fn missing_page_stops_the_session_for_good() {
    init_tracing();
    let mut session = Session::from_snapshot(SessionConfig::default(), MemorySnapshot::new());

    let err = session.run(&mut PhysToucher { gpa: 0x9000 }).unwrap_err();
    assert_eq!(err, SessionError::Mem(MemError::MissingPageFatal { gpa: 0x9000 }));
    assert!(err.is_fatal());
    assert_eq!(session.steps(), 0);
    assert_eq!(session.failure(), Some(&err));
    assert!(session.stop_handle().is_stopped());

    // Nothing runs afterwards, even with memory the engine could reach.
    let page = session.address_space_mut().allocate_host_page();
    session.address_space_mut().page_insert(0x1000, page).unwrap();
    assert_eq!(session.run(&mut PhysToucher { gpa: 0x1000 }), Err(err));
    assert_eq!(session.steps(), 0);
}

#[test]
fn invalid_mode_is_refused_before_stepping() {
    init_tracing();
    let config = SessionConfig {
        max_steps: Some(3),
        ..SessionConfig::default()
    };
    let mut session = Session::from_snapshot(config, snapshot_with(0, &[0]));
    session.cpu_mut().cr0.set(Cr0::PG, true);

    let err = session.run(&mut PhysToucher { gpa: 0 }).unwrap_err();
    assert!(matches!(err, SessionError::Cpu(CpuError::InvalidCpuMode(_))));
    assert!(err.is_fatal());
    assert_eq!(session.steps(), 0);
    assert_eq!(session.pager().stats().invocations, 0);

    // The register state was the problem, not the session.
    *session.cpu_mut() = CpuState::default();
    let summary = session.run(&mut PhysToucher { gpa: 0 }).unwrap();
    assert_eq!(summary.steps, 3);
    assert_eq!(summary.reason, StopReason::StepLimit);
}

#[test]
fn long_mode_program_runs_to_halt() {
    init_tracing();
    let mut session = long_mode_session(SessionConfig::default(), &[0x90, 0x90, 0xF4]);
    assert_eq!(session.cpu().mode(), CpuMode::Long);

    let summary = session.run(&mut ByteMachine).unwrap();
    assert_eq!(summary.steps, 3);
    assert_eq!(summary.reason, StopReason::Requested);
    assert_eq!(session.cpu().rip, CODE + 3);
    // Table pages were bound by install_layout; only the code page came from the snapshot.
    assert_eq!(session.pager().stats().pages_loaded, 1);
}

#[test]
fn stop_address_from_config() {
    init_tracing();
    let config = SessionConfig {
        stop_address: Some(CODE + 1),
        ..SessionConfig::default()
    };
    let mut session = long_mode_session(config, &[0x90, 0x90, 0xF4]);

    let summary = session.run(&mut ByteMachine).unwrap();
    assert_eq!(
        summary,
        RunSummary {
            steps: 1,
            reason: StopReason::Hook
        }
    );
    assert_eq!(session.cpu().rip, CODE + 1);
}

#[test]
fn engine_fault_is_fatal() {
    init_tracing();
    let mut session = long_mode_session(SessionConfig::default(), &[0x90, 0x0F, 0x0B]);

    let err = session.run(&mut ByteMachine).unwrap_err();
    assert_eq!(
        err.to_string(),
        "execution engine failed at rip 0x400001: unsupported opcode 0x0f"
    );
    assert_eq!(session.steps(), 1);
    assert!(session.failure().is_some());
}

#[test]
fn unmapped_fetch_is_not_fatal() {
    init_tracing();
    let mut session = long_mode_session(SessionConfig::default(), &[0xF4]);
    session.cpu_mut().rip = CODE + 0x1000;

    let err = session.run(&mut ByteMachine).unwrap_err();
    assert_eq!(
        err,
        SessionError::Mem(MemError::UnmappedAddress { gva: CODE + 0x1000 })
    );
    assert!(session.failure().is_none());

    session.cpu_mut().rip = CODE;
    assert_eq!(session.run(&mut ByteMachine).unwrap().steps, 1);
}

#[test]
fn hooks_can_stop_before_a_step() {
    struct Budget(u32);
    impl StepHook for Budget {
        fn before_step(&mut self, _: &CpuState) -> HookAction {
            if self.0 == 0 {
                return HookAction::Stop;
            }
            self.0 -= 1;
            HookAction::Continue
        }
    }

    init_tracing();
    let mut session = long_mode_session(SessionConfig::default(), &[0x90; 8]);
    session.add_hook(Budget(5));

    let summary = session.run(&mut ByteMachine).unwrap();
    assert_eq!(summary.steps, 5);
    assert_eq!(summary.reason, StopReason::Hook);
}

#[test]
fn release_returns_every_page() {
    init_tracing();
    let mut session = long_mode_session(SessionConfig::default(), &[0xF4]);
    session.run(&mut ByteMachine).unwrap();

    // Four table nodes plus the paged-in code page.
    assert_eq!(session.release(), 5);
    assert_eq!(session.address_space().stats().live(), 0);
}
