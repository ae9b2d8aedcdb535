//! The CHERIoT compartment export/import record formats. Upstream tooling
//! emits these sections; the linker consumes them to build the loader's
//! compartment switch tables, so the layout here has to match the emitter
//! byte for byte.

use crate::error::Result;
use linker_utils::elf::shf;
use linker_utils::elf::SectionFlags;
use zerocopy::byteorder::little_endian::U16;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

pub const COMPARTMENT_EXPORTS_SECTION: &str = ".compartment_exports";
pub const COMPARTMENT_IMPORTS_SECTION: &str = ".compartment_imports";

/// Label the export records are measured from.
pub const COMPARTMENT_PCC_START_SYMBOL: &str = "__compartment_pcc_start";

pub const EXPORT_ENTRY_SIZE: usize = size_of::<ExportEntry>();
pub const IMPORT_ENTRY_SIZE: usize = size_of::<ImportEntry>();
pub const EXPORT_SECTION_ALIGNMENT: u64 = 4;

/// Flags the emitter sets on `.compartment_exports`: allocated, and retained
/// even if nothing references it.
pub fn exports_section_flags() -> SectionFlags {
    shf::ALLOC.with(shf::GNU_RETAIN)
}

/// Number of argument registers in the compartment calling convention; the
/// switcher zeroes every register above the recorded count.
pub const MAX_ARG_REGISTERS: u8 = 7;

/// Interrupt posture recorded for an exported entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptStatus {
    Unspecified,
    Enabled,
    Disabled,
}

impl InterruptStatus {
    const SHIFT: u32 = 3;

    fn to_flags(self) -> u8 {
        match self {
            InterruptStatus::Unspecified => 0,
            InterruptStatus::Enabled => 1 << Self::SHIFT,
            InterruptStatus::Disabled => 2 << Self::SHIFT,
        }
    }

    fn from_flags(flags: u8) -> Result<Self> {
        match flags >> Self::SHIFT {
            0 => Ok(InterruptStatus::Unspecified),
            1 => Ok(InterruptStatus::Enabled),
            2 => Ok(InterruptStatus::Disabled),
            other => crate::bail!("invalid interrupt state {other} in compartment export entry"),
        }
    }
}

/// One `.compartment_exports` record: 4 bytes per exported entry point,
/// aligned to 4.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct ExportEntry {
    /// Distance of the entry point from `__compartment_pcc_start`.
    pub function_offset: U16,
    /// Stack usage in 8-byte units, saturated at 255.
    pub stack_quota: u8,
    /// Packed used-argument-register count and interrupt posture.
    pub flags: u8,
}

impl ExportEntry {
    pub fn new(
        function_offset: u16,
        stack_size: u32,
        used_arg_registers: u8,
        interrupts: InterruptStatus,
    ) -> Result<Self> {
        crate::ensure!(
            used_arg_registers <= MAX_ARG_REGISTERS,
            "{used_arg_registers} argument registers recorded in a compartment export, at most {} are possible",
            MAX_ARG_REGISTERS
        );
        Ok(Self {
            function_offset: U16::new(function_offset),
            stack_quota: stack_size_quota(stack_size),
            flags: used_arg_registers | interrupts.to_flags(),
        })
    }

    pub fn used_arg_registers(&self) -> u8 {
        self.flags & 0x7
    }

    pub fn interrupt_status(&self) -> Result<InterruptStatus> {
        InterruptStatus::from_flags(self.flags)
    }
}

/// Stack usage byte: `min(255, ceil(stack_size / 8))`.
pub fn stack_size_quota(stack_size: u32) -> u8 {
    stack_size.div_ceil(8).min(255) as u8
}

/// One `.compartment_imports` record: a capability-sized slot whose first
/// word names the export-table entry being imported and whose second word is
/// zero. Public imports live in COMDAT groups so identical imports merge
/// across compilation units.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct ImportEntry {
    export_entry: U32,
    reserved: U32,
}

impl ImportEntry {
    pub fn new(export_address: u32, library_call: bool) -> Result<Self> {
        // Export entries are 4-aligned, which frees the low bit to mark
        // cross-library calls.
        crate::ensure!(
            export_address & 1 == 0,
            "compartment export entry address {export_address:#x} has the library bit set"
        );
        Ok(Self {
            export_entry: U32::new(export_address | u32::from(library_call)),
            reserved: U32::new(0),
        })
    }

    pub fn export_address(&self) -> u32 {
        self.export_entry.get() & !1
    }

    pub fn is_library_call(&self) -> bool {
        self.export_entry.get() & 1 != 0
    }
}

/// Views a `.compartment_exports` section's contents as export records.
pub fn parse_exports(data: &[u8]) -> Result<&[ExportEntry]> {
    <[ExportEntry]>::ref_from_bytes(data).map_err(|_| {
        crate::error!(
            "{COMPARTMENT_EXPORTS_SECTION} size {} is not a multiple of {EXPORT_ENTRY_SIZE}",
            data.len()
        )
    })
}

/// Views a `.compartment_imports` section's contents as import records,
/// verifying the reserved words are zero.
pub fn parse_imports(data: &[u8]) -> Result<&[ImportEntry]> {
    let entries = <[ImportEntry]>::ref_from_bytes(data).map_err(|_| {
        crate::error!(
            "{COMPARTMENT_IMPORTS_SECTION} size {} is not a multiple of {IMPORT_ENTRY_SIZE}",
            data.len()
        )
    })?;
    for (index, entry) in entries.iter().enumerate() {
        crate::ensure!(
            entry.reserved.get() == 0,
            "compartment import entry {index} has a non-zero reserved word"
        );
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes as _;

    #[test]
    fn test_export_entry_packing() {
        let entry = ExportEntry::new(0x1234, 100, 3, InterruptStatus::Disabled).unwrap();
        assert_eq!(entry.as_bytes(), &[0x34, 0x12, 13, 3 | (2 << 3)]);
        assert_eq!(entry.used_arg_registers(), 3);
        assert_eq!(entry.interrupt_status().unwrap(), InterruptStatus::Disabled);
    }

    #[test]
    fn test_stack_quota_saturates() {
        assert_eq!(stack_size_quota(0), 0);
        assert_eq!(stack_size_quota(1), 1);
        assert_eq!(stack_size_quota(8), 1);
        assert_eq!(stack_size_quota(9), 2);
        assert_eq!(stack_size_quota(2040), 255);
        assert_eq!(stack_size_quota(100_000), 255);
    }

    #[test]
    fn test_too_many_arg_registers() {
        assert!(ExportEntry::new(0, 0, 8, InterruptStatus::Unspecified).is_err());
    }

    #[test]
    fn test_parse_exports() {
        let data = [
            0x00, 0x01, 2, 1 | (1 << 3), //
            0x10, 0x01, 0, 0,
        ];
        let entries = parse_exports(&data).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].function_offset.get(), 0x100);
        assert_eq!(entries[0].used_arg_registers(), 1);
        assert_eq!(entries[0].interrupt_status().unwrap(), InterruptStatus::Enabled);
        assert_eq!(entries[1].interrupt_status().unwrap(), InterruptStatus::Unspecified);

        assert!(parse_exports(&data[..7]).is_err());
    }

    #[test]
    fn test_import_entry_library_bit() {
        let entry = ImportEntry::new(0x8000_0040, true).unwrap();
        assert_eq!(entry.export_address(), 0x8000_0040);
        assert!(entry.is_library_call());
        assert_eq!(entry.as_bytes(), &[0x41, 0x00, 0x00, 0x80, 0, 0, 0, 0]);

        let entry = ImportEntry::new(0x8000_0040, false).unwrap();
        assert!(!entry.is_library_call());

        assert!(ImportEntry::new(0x8000_0041, false).is_err());
    }

    #[test]
    fn test_parse_imports_rejects_bad_reserved_word() {
        let mut data = [0u8; 16];
        data[0] = 0x40;
        data[12] = 1; // second entry's reserved word
        assert!(parse_imports(&data[..8]).is_ok());
        assert!(parse_imports(&data).is_err());
    }

    #[test]
    fn test_exports_section_shape() {
        assert_eq!(EXPORT_ENTRY_SIZE, 4);
        assert_eq!(IMPORT_ENTRY_SIZE, 8);
        assert!(exports_section_flags().contains(shf::ALLOC));
    }
}
