//! Named-bitfield model for CR0, CR4, EFER, RFLAGS and XCR0.
//!
//! Each register is described by a static flag table (bit position, name, description, writable).
//! Reads and writes go through that table, either with a typed [`Flag`] handle
//! (`cr0.set(Cr0::PE, true)`) or by name (`cr0.write("PE", true)`) when the flag comes from
//! outside the program.
//!
//! Read-only flags can only be established when the register is constructed from a raw value.
//! Writing one afterwards is logged and ignored: callers routinely merge whole raw register images
//! in which most fixed bits are expected to be no-ops.
//!
//! Bit layouts follow the AMD64 Architecture Programmer's Manual Vol. 2 (3.1.1, 3.1.3, 3.1.6, 3.1.7,
//! 11.5.2).

use core::fmt;
use core::marker::PhantomData;

use crate::error::{CpuError, Result};

/// One row of a register's flag table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagSpec {
    pub bit: u8,
    pub name: &'static str,
    pub description: &'static str,
    pub writable: bool,
}

impl FlagSpec {
    #[inline]
    pub const fn mask(&self) -> u64 {
        1u64 << self.bit
    }
}

/// Typed handle to a flag of register layout `L`.
///
/// The type parameter keeps `Cr4::PAE` from being applied to a [`Cr0`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flag<L> {
    spec: FlagSpec,
    _layout: PhantomData<fn() -> L>,
}

impl<L> Flag<L> {
    const fn new(spec: FlagSpec) -> Self {
        Self {
            spec,
            _layout: PhantomData,
        }
    }

    #[inline]
    pub const fn spec(&self) -> &FlagSpec {
        &self.spec
    }

    #[inline]
    pub const fn mask(&self) -> u64 {
        self.spec.mask()
    }
}

/// Static description of a register: its name, flag table and reset value.
pub trait RegisterLayout {
    const NAME: &'static str;
    const FLAGS: &'static [FlagSpec];
    /// Value used by `Default`. Only differs from zero for registers with bits that read as one.
    const RESET: u64 = 0;

    fn find(name: &str) -> Option<&'static FlagSpec> {
        Self::FLAGS.iter().find(|flag| flag.name == name)
    }

    fn writable_mask() -> u64 {
        Self::FLAGS
            .iter()
            .filter(|flag| flag.writable)
            .fold(0, |mask, flag| mask | flag.mask())
    }
}

/// A control/flags register value interpreted through layout `L`.
pub struct ControlRegister<L> {
    value: u64,
    _layout: PhantomData<fn() -> L>,
}

impl<L: RegisterLayout> ControlRegister<L> {
    /// Seeds the register from a raw value. This is the only way to establish read-only flags.
    pub const fn new(initial: u64) -> Self {
        Self {
            value: initial,
            _layout: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        L::NAME
    }

    pub fn flags() -> &'static [FlagSpec] {
        L::FLAGS
    }

    #[inline]
    pub fn get(&self, flag: Flag<L>) -> bool {
        self.value & flag.mask() != 0
    }

    /// Sets or clears a writable flag. Writes to read-only flags leave the value unchanged.
    pub fn set(&mut self, flag: Flag<L>, on: bool) {
        self.apply(flag.spec(), on);
    }

    /// Reads a flag by name.
    pub fn read(&self, name: &str) -> Result<bool> {
        let flag = self.lookup(name)?;
        Ok(self.value & flag.mask() != 0)
    }

    /// Writes a flag by name. Unknown names fail; read-only flags are logged and ignored.
    pub fn write(&mut self, name: &str, on: bool) -> Result<()> {
        let flag = self.lookup(name)?;
        self.apply(flag, on);
        Ok(())
    }

    /// ORs the writable bits of `raw` into the register, leaving fixed and reserved bits alone.
    pub fn merge(&mut self, raw: u64) {
        self.value |= raw & L::writable_mask();
    }

    #[inline]
    pub fn pack(&self) -> u64 {
        self.value
    }

    fn lookup(&self, name: &str) -> Result<&'static FlagSpec> {
        L::find(name).ok_or_else(|| CpuError::UnknownFlag {
            register: L::NAME,
            flag: name.to_owned(),
        })
    }

    fn apply(&mut self, flag: &FlagSpec, on: bool) {
        if !flag.writable {
            tracing::warn!(
                register = L::NAME,
                flag = flag.name,
                bit = flag.bit,
                "ignoring write to read-only flag"
            );
            return;
        }
        if on {
            self.value |= flag.mask();
        } else {
            self.value &= !flag.mask();
        }
    }
}

impl<L: RegisterLayout> Default for ControlRegister<L> {
    fn default() -> Self {
        Self::new(L::RESET)
    }
}

impl<L> Clone for ControlRegister<L> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<L> Copy for ControlRegister<L> {}

impl<L> PartialEq for ControlRegister<L> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<L> Eq for ControlRegister<L> {}

impl<L: RegisterLayout> From<ControlRegister<L>> for u64 {
    fn from(reg: ControlRegister<L>) -> u64 {
        reg.pack()
    }
}

impl<L: RegisterLayout> fmt::Display for ControlRegister<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(flags=", L::NAME)?;
        let mut first = true;
        for flag in L::FLAGS.iter().filter(|flag| self.value & flag.mask() != 0) {
            if !first {
                f.write_str(",")?;
            }
            f.write_str(flag.name)?;
            first = false;
        }
        f.write_str(")")
    }
}

impl<L: RegisterLayout> fmt::Debug for ControlRegister<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self} = 0x{:x}", self.value)
    }
}

macro_rules! control_register {
    (@writable rw) => {
        true
    };
    (@writable ro) => {
        false
    };
    (
        $(#[$meta:meta])*
        pub type $alias:ident = $layout:ident($name:literal $(, reset = $reset:literal)?) {
            $( $flag:ident = $bit:literal, $access:ident, $desc:literal; )*
        }
    ) => {
        #[doc = concat!("Flag table for ", $name, ".")]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $layout {}

        impl RegisterLayout for $layout {
            const NAME: &'static str = $name;
            const FLAGS: &'static [FlagSpec] = &[
                $(
                    FlagSpec {
                        bit: $bit,
                        name: stringify!($flag),
                        description: $desc,
                        writable: control_register!(@writable $access),
                    },
                )*
            ];
            $( const RESET: u64 = $reset; )?
        }

        $(#[$meta])*
        pub type $alias = ControlRegister<$layout>;

        #[allow(non_upper_case_globals)]
        impl ControlRegister<$layout> {
            $(
                #[doc = $desc]
                pub const $flag: Flag<$layout> = Flag::new(FlagSpec {
                    bit: $bit,
                    name: stringify!($flag),
                    description: $desc,
                    writable: control_register!(@writable $access),
                });
            )*
        }
    };
}

control_register! {
    /// CR0 (AMD Vol2 3.1.1).
    pub type Cr0 = Cr0Layout("CR0") {
        PG = 31, rw, "Paging";
        CD = 30, rw, "Cache Disable";
        NW = 29, rw, "Not Writethrough";
        AM = 18, rw, "Alignment Mask";
        WP = 16, rw, "Write Protect";
        NE = 5, rw, "Numeric Error";
        ET = 4, ro, "Extension Type";
        TS = 3, rw, "Task Switched";
        EM = 2, rw, "Emulation";
        MP = 1, rw, "Monitor Coprocessor";
        PE = 0, rw, "Protection Enabled";
    }
}

control_register! {
    /// CR4 (AMD Vol2 3.1.3).
    pub type Cr4 = Cr4Layout("CR4") {
        OSXSAVE = 18, rw, "XSAVE and Processor Extended States Enable";
        FSGSBASE = 16, rw, "Enable RDFSBASE/RDGSBASE/WRFSBASE/WRGSBASE";
        OSXMMEXCPT = 10, rw, "Operating System Unmasked Exception Support";
        OSFXSR = 9, rw, "Operating System FXSAVE/FXRSTOR Support";
        PCE = 8, rw, "Performance-Monitoring Counter Enable";
        PGE = 7, rw, "Page-Global Enable";
        MCE = 6, rw, "Machine Check Enable";
        PAE = 5, rw, "Physical-Address Extension";
        PSE = 4, rw, "Page Size Extensions";
        DE = 3, rw, "Debugging Extensions";
        TSD = 2, rw, "Time Stamp Disable";
        PVI = 1, rw, "Protected-Mode Virtual Interrupts";
        VME = 0, rw, "Virtual-8086 Mode Extensions";
    }
}

control_register! {
    /// Extended Feature Enable Register (AMD Vol2 3.1.7).
    pub type Efer = EferLayout("EFER") {
        TCE = 15, rw, "Translation Cache Extension";
        FFXSR = 14, rw, "Fast FXSAVE/FXRSTOR";
        LMSLE = 13, rw, "Long Mode Segment Limit Enable";
        SVME = 12, rw, "Secure Virtual Machine Enable";
        NXE = 11, rw, "No-Execute Enable";
        LMA = 10, rw, "Long Mode Active";
        LME = 8, rw, "Long Mode Enable";
        SCE = 0, rw, "System Call Extensions";
    }
}

control_register! {
    /// RFLAGS (AMD Vol2 3.1.6). Bit 1 reads as one and is fixed at construction.
    pub type Rflags = RflagsLayout("RFLAGS", reset = 0x2) {
        ID = 21, rw, "ID Flag";
        VIP = 20, rw, "Virtual Interrupt Pending";
        VIF = 19, rw, "Virtual Interrupt Flag";
        AC = 18, rw, "Alignment Check";
        VM = 17, rw, "Virtual-8086 Mode";
        RF = 16, rw, "Resume Flag";
        NT = 14, rw, "Nested Task";
        IOPL1 = 13, rw, "I/O Privilege Level (high bit)";
        IOPL0 = 12, rw, "I/O Privilege Level (low bit)";
        OF = 11, rw, "Overflow Flag";
        DF = 10, rw, "Direction Flag";
        IF = 9, rw, "Interrupt Flag";
        TF = 8, rw, "Trap Flag";
        SF = 7, rw, "Sign Flag";
        ZF = 6, rw, "Zero Flag";
        AF = 4, rw, "Auxiliary Flag";
        PF = 2, rw, "Parity Flag";
        Reserved1 = 1, ro, "Reserved, Read as One";
        CF = 0, rw, "Carry Flag";
    }
}

control_register! {
    /// Extended control register 0 (AMD Vol2 11.5.2). x87 state is always enabled.
    pub type Xcr0 = Xcr0Layout("XCR0", reset = 0x1) {
        X = 63, ro, "Reserved for XCR0 bit vector expansion";
        LWP = 62, rw, "Lightweight Profiling state management";
        YMM = 2, rw, "256-bit SSE state management (required for AVX)";
        SSE = 1, rw, "128-bit SSE state management (required if YMM is set)";
        x87 = 0, ro, "x87 FPU state management (must be 1)";
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_set_and_get() {
        let mut cr0 = Cr0::default();
        cr0.set(Cr0::PE, true);
        cr0.set(Cr0::PG, true);
        assert!(cr0.get(Cr0::PE));
        assert!(cr0.get(Cr0::PG));
        assert_eq!(cr0.pack(), 0x8000_0001);

        cr0.set(Cr0::PG, false);
        assert_eq!(cr0.pack(), 0x1);
    }

    #[test]
    fn read_only_flag_keeps_construction_value() {
        let mut cr0 = Cr0::new(Cr0::ET.mask());
        cr0.set(Cr0::ET, false);
        assert!(cr0.get(Cr0::ET));
        cr0.write("ET", false).unwrap();
        assert!(cr0.read("ET").unwrap());

        let mut cr0 = Cr0::new(0);
        cr0.set(Cr0::ET, true);
        assert!(!cr0.get(Cr0::ET));
        assert_eq!(cr0.pack(), 0);
    }

    #[test]
    fn unknown_flag_is_rejected() {
        let mut cr4 = Cr4::default();
        assert_eq!(
            cr4.read("LME"),
            Err(CpuError::UnknownFlag {
                register: "CR4",
                flag: "LME".to_owned(),
            })
        );
        assert!(cr4.write("bogus", true).is_err());
        assert_eq!(cr4.pack(), 0);
    }

    #[test]
    fn by_name_access_matches_typed_access() {
        let mut efer = Efer::default();
        efer.write("LME", true).unwrap();
        assert!(efer.get(Efer::LME));
        assert!(efer.read("LME").unwrap());
        assert!(!efer.read("LMA").unwrap());
    }

    #[test]
    fn merge_only_absorbs_writable_bits() {
        let mut cr0 = Cr0::new(0);
        // ET (bit 4) is read-only and bit 7 is not in the table at all.
        cr0.merge(0x8000_0011 | (1 << 7));
        assert_eq!(cr0.pack(), 0x8000_0001);

        // Merge never clears bits that are already set.
        cr0.set(Cr0::WP, true);
        cr0.merge(0);
        assert!(cr0.get(Cr0::WP));
    }

    #[test]
    fn reset_values() {
        assert_eq!(Rflags::default().pack(), 0x2);
        assert_eq!(Xcr0::default().pack(), 0x1);
        assert_eq!(Cr4::default().pack(), 0);

        let mut rflags = Rflags::default();
        rflags.set(Rflags::Reserved1, false);
        assert_eq!(rflags.pack(), 0x2);
    }

    #[test]
    fn display_lists_set_flags_in_table_order() {
        let mut cr0 = Cr0::new(Cr0::ET.mask());
        cr0.set(Cr0::PE, true);
        cr0.set(Cr0::PG, true);
        assert_eq!(cr0.to_string(), "CR0(flags=PG,ET,PE)");
        assert_eq!(Cr4::default().to_string(), "CR4(flags=)");
    }

    #[test]
    fn flag_tables_have_unique_bits_and_names() {
        fn check<L: RegisterLayout>() {
            for (i, a) in L::FLAGS.iter().enumerate() {
                for b in &L::FLAGS[i + 1..] {
                    assert_ne!(a.bit, b.bit, "{}: duplicate bit {}", L::NAME, a.bit);
                    assert_ne!(a.name, b.name, "{}: duplicate name {}", L::NAME, a.name);
                }
            }
        }
        check::<Cr0Layout>();
        check::<Cr4Layout>();
        check::<EferLayout>();
        check::<RflagsLayout>();
        check::<Xcr0Layout>();
    }
}
