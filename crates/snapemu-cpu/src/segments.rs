//! Segment registers and descriptor-table pointers.
//!
//! Descriptors are produced either from intent (a flat segment for a target mode) or from a
//! captured thread context. The attribute word uses the emulator's packed layout: the descriptor
//! access byte in bits 0..8 followed by the AVL/L/D/G nibble in bits 8..12.

use bitflags::bitflags;

use crate::context::ThreadContext;
use crate::mode::CpuMode;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SegmentAttributes: u16 {
        const ACCESSED = 1 << 0;
        /// Readable for code segments, writable for data segments.
        const READ_WRITE = 1 << 1;
        /// Conforming for code segments, expand-down for data segments.
        const CONFORMING = 1 << 2;
        const EXECUTABLE = 1 << 3;
        /// Descriptor type (S): set for code/data, clear for system descriptors.
        const CODE_DATA = 1 << 4;
        const DPL_LOW = 1 << 5;
        const DPL_HIGH = 1 << 6;
        const PRESENT = 1 << 7;
        const AVAILABLE = 1 << 8;
        /// 64-bit code segment (CS.L).
        const LONG = 1 << 9;
        /// Default operand size (D/B).
        const DEFAULT_SIZE = 1 << 10;
        const GRANULARITY = 1 << 11;
    }
}

impl SegmentAttributes {
    const DPL_SHIFT: u16 = 5;

    /// Present, accessed, readable 64-bit code segment.
    pub const LONG_CODE: Self = Self::from_bits_retain(0x029B);
    /// Present, accessed, writable 4 GiB data segment (32-bit default size, page granular).
    pub const FLAT_DATA: Self = Self::from_bits_retain(0x0C93);
    /// Present, accessed, readable 4 GiB 32-bit code segment.
    pub const FLAT_CODE: Self = Self::from_bits_retain(0x0C9B);

    #[inline]
    pub fn dpl(self) -> u8 {
        ((self.bits() >> Self::DPL_SHIFT) & 0b11) as u8
    }

    pub fn with_dpl(self, dpl: u8) -> Self {
        let cleared = self.bits() & !(0b11 << Self::DPL_SHIFT);
        Self::from_bits_retain(cleared | (u16::from(dpl & 0b11) << Self::DPL_SHIFT))
    }

    #[inline]
    pub fn is_long(self) -> bool {
        self.contains(Self::LONG)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegReg {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
}

impl SegReg {
    pub const ALL: [SegReg; 6] = [
        SegReg::Es,
        SegReg::Cs,
        SegReg::Ss,
        SegReg::Ds,
        SegReg::Fs,
        SegReg::Gs,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub attributes: SegmentAttributes,
    pub present: bool,
}

impl Default for SegmentDescriptor {
    fn default() -> Self {
        Self::null()
    }
}

impl SegmentDescriptor {
    pub const FLAT_LIMIT: u32 = 0xFFFF_FFFF;
    pub const REAL_MODE_LIMIT: u32 = 0xFFFF;

    pub const fn null() -> Self {
        Self {
            selector: 0,
            base: 0,
            limit: 0,
            attributes: SegmentAttributes::empty(),
            present: false,
        }
    }

    /// Flat code segment suitable for executing in `mode`. The DPL follows the selector's RPL.
    pub fn code(mode: CpuMode, selector: u16) -> Self {
        match mode {
            CpuMode::Long => Self::flat(selector, SegmentAttributes::LONG_CODE),
            CpuMode::Protected => Self::flat(selector, SegmentAttributes::FLAT_CODE),
            CpuMode::Real | CpuMode::Virtual8086 | CpuMode::Invalid => {
                Self::real(mode, selector, true)
            }
        }
    }

    /// Flat data/stack segment suitable for `mode`. The DPL follows the selector's RPL.
    pub fn data(mode: CpuMode, selector: u16) -> Self {
        match mode {
            CpuMode::Long | CpuMode::Protected => {
                Self::flat(selector, SegmentAttributes::FLAT_DATA)
            }
            CpuMode::Real | CpuMode::Virtual8086 | CpuMode::Invalid => {
                Self::real(mode, selector, false)
            }
        }
    }

    fn flat(selector: u16, attributes: SegmentAttributes) -> Self {
        Self {
            selector,
            base: 0,
            limit: Self::FLAT_LIMIT,
            attributes: attributes.with_dpl(rpl(selector)),
            present: true,
        }
    }

    fn real(mode: CpuMode, selector: u16, code: bool) -> Self {
        let mut attributes = SegmentAttributes::PRESENT
            | SegmentAttributes::CODE_DATA
            | SegmentAttributes::READ_WRITE
            | SegmentAttributes::ACCESSED;
        if code {
            attributes |= SegmentAttributes::EXECUTABLE;
        }
        if mode == CpuMode::Virtual8086 {
            attributes = attributes.with_dpl(3);
        }
        Self {
            selector,
            base: u64::from(selector) << 4,
            limit: Self::REAL_MODE_LIMIT,
            attributes,
            present: true,
        }
    }
}

#[inline]
fn rpl(selector: u16) -> u8 {
    (selector & 0b11) as u8
}

/// Base + limit of a descriptor table (GDTR / IDTR).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalSegment {
    pub base: u64,
    pub limit: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentSet {
    pub es: SegmentDescriptor,
    pub cs: SegmentDescriptor,
    pub ss: SegmentDescriptor,
    pub ds: SegmentDescriptor,
    pub fs: SegmentDescriptor,
    pub gs: SegmentDescriptor,
}

impl SegmentSet {
    /// Flat segments for `mode`: CS uses `code_selector`, every other register `data_selector`.
    pub fn flat(mode: CpuMode, code_selector: u16, data_selector: u16) -> Self {
        let data = SegmentDescriptor::data(mode, data_selector);
        Self {
            es: data,
            cs: SegmentDescriptor::code(mode, code_selector),
            ss: data,
            ds: data,
            fs: data,
            gs: data,
        }
    }

    /// Segments for resuming a captured 64-bit thread.
    ///
    /// In 64-bit mode the processor does not check FS/GS limits or attributes, only that the
    /// effective address is canonical (AMD Vol2 4.5.3). FS/GS therefore keep whatever base the
    /// context carries (TLS / TEB pointers); the base is canonicalized if the dump stored it
    /// truncated.
    pub fn from_context(ctx: &ThreadContext) -> Self {
        let data = |selector| SegmentDescriptor::data(CpuMode::Long, selector);

        let mut fs = data(ctx.fs);
        fs.base = canonical_base("fs", ctx.fs_base.unwrap_or(0));

        let mut gs = data(ctx.gs);
        gs.base = canonical_base("gs", ctx.gs_base.unwrap_or(0));
        gs.limit = 0x0FFF;
        gs.attributes.remove(SegmentAttributes::GRANULARITY);

        Self {
            es: data(ctx.es),
            cs: SegmentDescriptor::code(CpuMode::Long, ctx.cs),
            ss: data(ctx.ss),
            ds: data(ctx.ds),
            fs,
            gs,
        }
    }

    pub fn get(&self, reg: SegReg) -> &SegmentDescriptor {
        match reg {
            SegReg::Es => &self.es,
            SegReg::Cs => &self.cs,
            SegReg::Ss => &self.ss,
            SegReg::Ds => &self.ds,
            SegReg::Fs => &self.fs,
            SegReg::Gs => &self.gs,
        }
    }

    pub fn get_mut(&mut self, reg: SegReg) -> &mut SegmentDescriptor {
        match reg {
            SegReg::Es => &mut self.es,
            SegReg::Cs => &mut self.cs,
            SegReg::Ss => &mut self.ss,
            SegReg::Ds => &mut self.ds,
            SegReg::Fs => &mut self.fs,
            SegReg::Gs => &mut self.gs,
        }
    }
}

fn canonical_base(reg: &'static str, base: u64) -> u64 {
    let canonical = (((base << 16) as i64) >> 16) as u64;
    if canonical != base {
        tracing::warn!(
            reg,
            base = format_args!("{base:#x}"),
            "segment base is not canonical; sign-extending bit 47"
        );
    }
    canonical
}
