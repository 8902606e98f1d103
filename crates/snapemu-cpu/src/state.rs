use std::fmt;

use crate::context::ThreadContext;
use crate::control::{Cr0, Cr4, Efer, Rflags, Xcr0};
use crate::error::Result;
use crate::mode::{enter_long_mode, CpuMode, ModeEntry, ModeRegisters};
use crate::segments::{GlobalSegment, SegmentSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

/// Register snapshot handed to the execution engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuState {
    gprs: [u64; 16],
    pub rip: u64,
    pub rflags: Rflags,

    pub segments: SegmentSet,
    pub gdtr: GlobalSegment,
    pub idtr: GlobalSegment,

    pub cr0: Cr0,
    pub cr3: u64,
    pub cr4: Cr4,
    pub efer: Efer,
    pub xcr0: Xcr0,
}

impl CpuState {
    #[inline]
    pub fn gpr(&self, reg: Gpr) -> u64 {
        self.gprs[reg as usize]
    }

    #[inline]
    pub fn set_gpr(&mut self, reg: Gpr, val: u64) {
        self.gprs[reg as usize] = val;
    }

    pub fn mode_registers(&self) -> ModeRegisters {
        ModeRegisters {
            cr0: self.cr0,
            cr4: self.cr4,
            efer: self.efer,
            rflags: self.rflags,
            cs_attributes: self.segments.cs.attributes,
        }
    }

    /// The operating mode the current registers describe. Never cached.
    pub fn mode(&self) -> CpuMode {
        self.mode_registers().detect()
    }

    pub fn require_mode(&self) -> Result<CpuMode> {
        CpuMode::require(self.mode_registers())
    }

    /// Installs a mode entry's control registers and flat segments built from the two selectors.
    pub fn apply_mode(&mut self, entry: &ModeEntry, code_selector: u16, data_selector: u16) {
        self.cr0 = entry.cr0;
        self.cr4 = entry.cr4;
        self.efer = entry.efer;
        self.rflags = entry.rflags;
        self.segments = SegmentSet::flat(entry.mode, code_selector, data_selector);
        tracing::debug!(mode = %entry.mode, code_selector, data_selector, "applied cpu mode");
    }

    /// Loads a captured 64-bit thread.
    ///
    /// Control registers are kept if they already describe long mode with the thread's CS;
    /// otherwise the long-mode entry values are installed. CR3 and the descriptor tables are
    /// only replaced when the context carries them.
    pub fn switch_to_thread(&mut self, ctx: &ThreadContext) {
        self.gprs = ctx.gprs;
        self.rip = ctx.rip;
        self.rflags = Rflags::new(Rflags::default().pack() | ctx.rflags);
        self.segments = SegmentSet::from_context(ctx);

        if self.mode() != CpuMode::Long {
            let entry = enter_long_mode();
            self.cr0 = entry.cr0;
            self.cr4 = entry.cr4;
            self.efer = entry.efer;
            tracing::debug!("thread context requires long mode; installed long-mode control registers");
        }

        if let Some(cr3) = ctx.cr3 {
            self.cr3 = cr3;
        }
        if let Some(gdtr) = ctx.gdtr {
            self.gdtr = gdtr;
        }
        if let Some(idtr) = ctx.idtr {
            self.idtr = idtr;
        }
        tracing::debug!(
            rip = format_args!("{:#x}", self.rip),
            rsp = format_args!("{:#x}", self.gpr(Gpr::Rsp)),
            "switched to thread context"
        );
    }

    /// Enables x87/SSE/AVX state: CR0.MP set and CR0.EM clear, CR4.OSFXSR and CR4.OSXSAVE set,
    /// and XCR0 enabling x87, SSE and YMM.
    pub fn enable_sse_avx(&mut self) {
        self.cr0.set(Cr0::MP, true);
        self.cr0.set(Cr0::EM, false);
        self.cr4.set(Cr4::OSFXSR, true);
        self.cr4.set(Cr4::OSXSAVE, true);
        self.xcr0.set(Xcr0::SSE, true);
        self.xcr0.set(Xcr0::YMM, true);
    }

    fn flag_mnemonics(&self) -> [&'static str; 8] {
        let f = |flag, on, off| if self.rflags.get(flag) { on } else { off };
        [
            f(Rflags::OF, "ov", "nv"),
            f(Rflags::DF, "dn", "up"),
            f(Rflags::IF, "ei", "di"),
            f(Rflags::SF, "ng", "pl"),
            f(Rflags::ZF, "zr", "nz"),
            f(Rflags::AF, "ac", "na"),
            f(Rflags::PF, "pe", "po"),
            f(Rflags::CF, "cy", "nc"),
        ]
    }

    fn iopl(&self) -> u8 {
        (u8::from(self.rflags.get(Rflags::IOPL1)) << 1) | u8::from(self.rflags.get(Rflags::IOPL0))
    }
}

/// Debugger-style register dump. The alternate form (`{:#}`) appends the system registers.
impl fmt::Display for CpuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Gpr::*;

        let rows: [[(&str, Gpr); 3]; 5] = [
            [("rax", Rax), ("rbx", Rbx), ("rcx", Rcx)],
            [("rdx", Rdx), ("rsi", Rsi), ("rdi", Rdi)],
            [(" r8", R8), (" r9", R9), ("r10", R10)],
            [("r11", R11), ("r12", R12), ("r13", R13)],
            [("r14", R14), ("r15", R15), ("rbp", Rbp)],
        ];
        for row in rows {
            let [a, b, c] = row.map(|(name, reg)| format!("{name}={:016x}", self.gpr(reg)));
            writeln!(f, "{a} {b} {c}")?;
        }
        writeln!(f, "rip={:016x} rsp={:016x}", self.rip, self.gpr(Rsp))?;
        writeln!(f, "iopl={:<9} {}", self.iopl(), self.flag_mnemonics().join(" "))?;

        let s = &self.segments;
        write!(
            f,
            "cs={:04x}  ss={:04x}  ds={:04x}  es={:04x}  fs={:04x}  gs={:04x}             efl={:08x}",
            s.cs.selector,
            s.ss.selector,
            s.ds.selector,
            s.es.selector,
            s.fs.selector,
            s.gs.selector,
            self.rflags.pack()
        )?;

        if f.alternate() {
            writeln!(f)?;
            writeln!(f, "{:?}", self.cr0)?;
            writeln!(f, "{:?}", self.cr4)?;
            writeln!(f, "{:?}", self.efer)?;
            writeln!(f, "{:?}", self.xcr0)?;
            writeln!(f, "cr3={:016x} fsbase={:016x} gsbase={:016x}", self.cr3, s.fs.base, s.gs.base)?;
            write!(
                f,
                "gdtr={:016x}:{:04x} idtr={:016x}:{:04x} mode={}",
                self.gdtr.base,
                self.gdtr.limit,
                self.idtr.base,
                self.idtr.limit,
                self.mode()
            )?;
        }
        Ok(())
    }
}
