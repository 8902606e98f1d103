//! Operating-mode detection and deterministic mode-entry register values.

use std::fmt;

use crate::control::{Cr0, Cr4, Efer, Rflags};
use crate::error::{CpuError, Result};
use crate::segments::SegmentAttributes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuMode {
    Real,
    Protected,
    Virtual8086,
    Long,
    /// The registers do not describe any supported mode.
    Invalid,
}

impl CpuMode {
    /// Fails with [`CpuError::InvalidCpuMode`] unless `regs` detect as a supported mode.
    pub fn require(regs: ModeRegisters) -> Result<CpuMode> {
        match regs.detect() {
            CpuMode::Invalid => Err(CpuError::InvalidCpuMode(regs)),
            mode => Ok(mode),
        }
    }
}

impl fmt::Display for CpuMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CpuMode::Real => "real",
            CpuMode::Protected => "protected",
            CpuMode::Virtual8086 => "virtual-8086",
            CpuMode::Long => "long",
            CpuMode::Invalid => "invalid",
        })
    }
}

/// The register subset mode detection looks at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeRegisters {
    pub cr0: Cr0,
    pub cr4: Cr4,
    pub efer: Efer,
    pub rflags: Rflags,
    pub cs_attributes: SegmentAttributes,
}

impl ModeRegisters {
    pub fn detect(&self) -> CpuMode {
        detect(&self.cr0, &self.cr4, &self.efer, &self.rflags, self.cs_attributes)
    }
}

impl fmt::Display for ModeRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cr0={:#x} cr4={:#x} efer={:#x} rflags={:#x} cs.attr={:#x}",
            self.cr0.pack(),
            self.cr4.pack(),
            self.efer.pack(),
            self.rflags.pack(),
            self.cs_attributes.bits()
        )
    }
}

pub fn is_long(cr0: &Cr0, cr4: &Cr4, efer: &Efer, cs: SegmentAttributes) -> bool {
    efer.get(Efer::LME) && cr4.get(Cr4::PAE) && cr0.get(Cr0::PE) && cs.is_long()
}

fn is_legacy_protected(cr0: &Cr0, cr4: &Cr4, efer: &Efer, cs: SegmentAttributes) -> bool {
    cr0.get(Cr0::PE) && !efer.get(Efer::LME) && !cr4.get(Cr4::PAE) && !cs.is_long()
}

pub fn is_protected(
    cr0: &Cr0,
    cr4: &Cr4,
    efer: &Efer,
    rflags: &Rflags,
    cs: SegmentAttributes,
) -> bool {
    is_legacy_protected(cr0, cr4, efer, cs) && !rflags.get(Rflags::VM)
}

pub fn is_virtual8086(
    cr0: &Cr0,
    cr4: &Cr4,
    efer: &Efer,
    rflags: &Rflags,
    cs: SegmentAttributes,
) -> bool {
    is_legacy_protected(cr0, cr4, efer, cs) && rflags.get(Rflags::VM)
}

/// Real mode: no protection, and paging, PAE and global pages all off.
pub fn is_real(cr0: &Cr0, cr4: &Cr4, cs: SegmentAttributes) -> bool {
    !cs.is_long()
        && !cr0.get(Cr0::PE)
        && !cr0.get(Cr0::PG)
        && !cr4.get(Cr4::PAE)
        && !cr4.get(Cr4::PGE)
}

pub fn detect(
    cr0: &Cr0,
    cr4: &Cr4,
    efer: &Efer,
    rflags: &Rflags,
    cs: SegmentAttributes,
) -> CpuMode {
    if is_long(cr0, cr4, efer, cs) {
        CpuMode::Long
    } else if is_protected(cr0, cr4, efer, rflags, cs) {
        CpuMode::Protected
    } else if is_virtual8086(cr0, cr4, efer, rflags, cs) {
        CpuMode::Virtual8086
    } else if is_real(cr0, cr4, cs) {
        CpuMode::Real
    } else {
        CpuMode::Invalid
    }
}

/// Fresh control-register values for entering a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeEntry {
    pub mode: CpuMode,
    pub cr0: Cr0,
    pub cr4: Cr4,
    pub efer: Efer,
    pub rflags: Rflags,
}

impl ModeEntry {
    /// Packed `(cr0, cr4, efer, rflags)`.
    pub fn packed(&self) -> (u64, u64, u64, u64) {
        (
            self.cr0.pack(),
            self.cr4.pack(),
            self.efer.pack(),
            self.rflags.pack(),
        )
    }

    /// The detection inputs this entry produces together with a CS carrying `cs_attributes`.
    pub fn registers(&self, cs_attributes: SegmentAttributes) -> ModeRegisters {
        ModeRegisters {
            cr0: self.cr0,
            cr4: self.cr4,
            efer: self.efer,
            rflags: self.rflags,
            cs_attributes,
        }
    }
}

/// CR0 with the extension-type bit hardwired, as on every processor since the 486.
fn fresh_cr0() -> Cr0 {
    Cr0::new(Cr0::ET.mask())
}

/// 64-bit paging, NX and SYSCALL enabled: CR0=0x80050031, CR4=0x20, EFER=0xD01.
pub fn enter_long_mode() -> ModeEntry {
    let mut cr0 = fresh_cr0();
    for flag in [Cr0::PG, Cr0::AM, Cr0::WP, Cr0::NE, Cr0::PE] {
        cr0.set(flag, true);
    }

    let mut cr4 = Cr4::default();
    cr4.set(Cr4::PAE, true);

    let mut efer = Efer::default();
    for flag in [Efer::NXE, Efer::LMA, Efer::LME, Efer::SCE] {
        efer.set(flag, true);
    }

    ModeEntry {
        mode: CpuMode::Long,
        cr0,
        cr4,
        efer,
        rflags: Rflags::default(),
    }
}

pub fn enter_real_mode() -> ModeEntry {
    ModeEntry {
        mode: CpuMode::Real,
        cr0: Cr0::default(),
        cr4: Cr4::default(),
        efer: Efer::default(),
        rflags: Rflags::default(),
    }
}

/// Unpaged 32-bit protected mode.
pub fn enter_protected_mode() -> ModeEntry {
    let mut cr0 = Cr0::default();
    cr0.set(Cr0::PE, true);
    ModeEntry {
        mode: CpuMode::Protected,
        cr0,
        cr4: Cr4::default(),
        efer: Efer::default(),
        rflags: Rflags::default(),
    }
}

pub fn enter_virtual8086_mode() -> ModeEntry {
    let mut entry = enter_protected_mode();
    entry.mode = CpuMode::Virtual8086;
    entry.rflags.set(Rflags::VM, true);
    entry
}
