use std::borrow::Cow;

macro_rules! const_name_by_value {
    ($needle: expr, $( $const:ident ),*) => {
        match $needle {
            $(object::elf::$const => Some(stringify!($const)),)*
            _ => None
        }
    };
}

macro_rules! cheri_const_name_by_value {
    ($needle: expr, $( $const:ident ),*) => {
        match $needle {
            $(cheri::$const => Some(stringify!($const)),)*
            _ => None
        }
    };
}

/// CHERI and CHERIoT extensions to the RISC-V ELF format. These live in the
/// vendor relocation range and aren't defined by the `object` crate.
pub mod cheri {
    pub const R_RISCV_CHERI_CAPABILITY: u32 = 192;
    pub const R_RISCV_CHERI_CAPTAB_PCREL_HI20: u32 = 193;
    pub const R_RISCV_CHERI_TPREL_CINCOFFSET: u32 = 194;
    pub const R_RISCV_CHERI_TLS_IE_CAPTAB_PCREL_HI20: u32 = 195;
    pub const R_RISCV_CHERI_TLS_GD_CAPTAB_PCREL_HI20: u32 = 196;
    pub const R_RISCV_CHERI_CCALL: u32 = 197;
    pub const R_RISCV_CHERI_CJAL: u32 = 198;
    pub const R_RISCV_CHERI_RVC_CJUMP: u32 = 199;
    pub const R_RISCV_CHERI_SIZE: u32 = 200;

    pub const R_RISCV_CHERIOT_COMPARTMENT_HI: u32 = 220;
    pub const R_RISCV_CHERIOT_COMPARTMENT_LO_I: u32 = 221;
    pub const R_RISCV_CHERIOT_COMPARTMENT_LO_S: u32 = 222;
    pub const R_RISCV_CHERIOT_COMPARTMENT_SIZE: u32 = 223;

    /// The object file targets a pure-capability ABI.
    pub const EF_RISCV_CHERIABI: u32 = 0x1_0000;
    /// The object file was compiled for capability-mode instruction encodings.
    pub const EF_RISCV_CAP_MODE: u32 = 0x2_0000;
}

pub fn riscv_rel_type_to_string(r_type: u32) -> Cow<'static, str> {
    if let Some(name) = const_name_by_value![
        r_type,
        R_RISCV_NONE,
        R_RISCV_32,
        R_RISCV_64,
        R_RISCV_RELATIVE,
        R_RISCV_COPY,
        R_RISCV_JUMP_SLOT,
        R_RISCV_TLS_DTPMOD32,
        R_RISCV_TLS_DTPMOD64,
        R_RISCV_TLS_DTPREL32,
        R_RISCV_TLS_DTPREL64,
        R_RISCV_TLS_TPREL32,
        R_RISCV_TLS_TPREL64,
        R_RISCV_BRANCH,
        R_RISCV_JAL,
        R_RISCV_CALL,
        R_RISCV_CALL_PLT,
        R_RISCV_GOT_HI20,
        R_RISCV_TLS_GOT_HI20,
        R_RISCV_TLS_GD_HI20,
        R_RISCV_PCREL_HI20,
        R_RISCV_PCREL_LO12_I,
        R_RISCV_PCREL_LO12_S,
        R_RISCV_HI20,
        R_RISCV_LO12_I,
        R_RISCV_LO12_S,
        R_RISCV_TPREL_HI20,
        R_RISCV_TPREL_LO12_I,
        R_RISCV_TPREL_LO12_S,
        R_RISCV_TPREL_ADD,
        R_RISCV_ADD8,
        R_RISCV_ADD16,
        R_RISCV_ADD32,
        R_RISCV_ADD64,
        R_RISCV_SUB8,
        R_RISCV_SUB16,
        R_RISCV_SUB32,
        R_RISCV_SUB64,
        R_RISCV_ALIGN,
        R_RISCV_RVC_BRANCH,
        R_RISCV_RVC_JUMP,
        R_RISCV_RVC_LUI,
        R_RISCV_RELAX,
        R_RISCV_SUB6,
        R_RISCV_SET6,
        R_RISCV_SET8,
        R_RISCV_SET16,
        R_RISCV_SET32,
        R_RISCV_32_PCREL,
        R_RISCV_IRELATIVE
    ] {
        return Cow::Borrowed(name);
    }
    if let Some(name) = cheri_const_name_by_value![
        r_type,
        R_RISCV_CHERI_CAPABILITY,
        R_RISCV_CHERI_CAPTAB_PCREL_HI20,
        R_RISCV_CHERI_TPREL_CINCOFFSET,
        R_RISCV_CHERI_TLS_IE_CAPTAB_PCREL_HI20,
        R_RISCV_CHERI_TLS_GD_CAPTAB_PCREL_HI20,
        R_RISCV_CHERI_CCALL,
        R_RISCV_CHERI_CJAL,
        R_RISCV_CHERI_RVC_CJUMP,
        R_RISCV_CHERI_SIZE,
        R_RISCV_CHERIOT_COMPARTMENT_HI,
        R_RISCV_CHERIOT_COMPARTMENT_LO_I,
        R_RISCV_CHERIOT_COMPARTMENT_LO_S,
        R_RISCV_CHERIOT_COMPARTMENT_SIZE
    ] {
        return Cow::Borrowed(name);
    }
    Cow::Owned(format!("Unknown relocation type 0x{r_type:x}"))
}

/// Section flag bit values.
#[allow(unused)]
pub mod shf {
    use super::SectionFlags;

    pub const WRITE: SectionFlags = SectionFlags::from_u32(object::elf::SHF_WRITE);
    pub const ALLOC: SectionFlags = SectionFlags::from_u32(object::elf::SHF_ALLOC);
    pub const EXECINSTR: SectionFlags = SectionFlags::from_u32(object::elf::SHF_EXECINSTR);
    pub const MERGE: SectionFlags = SectionFlags::from_u32(object::elf::SHF_MERGE);
    pub const STRINGS: SectionFlags = SectionFlags::from_u32(object::elf::SHF_STRINGS);
    pub const GROUP: SectionFlags = SectionFlags::from_u32(object::elf::SHF_GROUP);
    pub const TLS: SectionFlags = SectionFlags::from_u32(object::elf::SHF_TLS);
    pub const GNU_RETAIN: SectionFlags = SectionFlags::from_u32(object::elf::SHF_GNU_RETAIN);
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SectionFlags(u32);

impl SectionFlags {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_u32(raw: u32) -> SectionFlags {
        SectionFlags(raw)
    }

    pub fn contains(self, flag: SectionFlags) -> bool {
        self.0 & flag.0 != 0
    }

    /// Returns self with the specified flags set.
    #[must_use]
    pub const fn with(self, flags: SectionFlags) -> SectionFlags {
        SectionFlags(self.0 | flags.0)
    }

    /// Returns self with the specified flags cleared.
    #[must_use]
    pub const fn without(self, flags: SectionFlags) -> SectionFlags {
        SectionFlags(self.0 & !flags.0)
    }

    pub const fn raw(self) -> u64 {
        self.0 as u64
    }
}

impl From<u64> for SectionFlags {
    fn from(value: u64) -> Self {
        Self(value as u32)
    }
}

impl std::fmt::Display for SectionFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.contains(shf::WRITE) {
            f.write_str("W")?;
        }
        if self.contains(shf::ALLOC) {
            f.write_str("A")?;
        }
        if self.contains(shf::EXECINSTR) {
            f.write_str("X")?;
        }
        if self.contains(shf::MERGE) {
            f.write_str("M")?;
        }
        if self.contains(shf::STRINGS) {
            f.write_str("S")?;
        }
        if self.contains(shf::GROUP) {
            f.write_str("G")?;
        }
        if self.contains(shf::TLS) {
            f.write_str("T")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SectionFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

impl std::ops::BitOrAssign for SectionFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rel_type_to_string() {
        assert_eq!(
            &riscv_rel_type_to_string(object::elf::R_RISCV_BRANCH),
            stringify!(R_RISCV_BRANCH)
        );
        assert_eq!(
            &riscv_rel_type_to_string(cheri::R_RISCV_CHERIOT_COMPARTMENT_HI),
            stringify!(R_RISCV_CHERIOT_COMPARTMENT_HI)
        );
        assert_eq!(
            &riscv_rel_type_to_string(0x7777),
            "Unknown relocation type 0x7777"
        );
    }

    #[test]
    fn test_section_flags_display() {
        let flags = shf::ALLOC.with(shf::EXECINSTR);
        assert_eq!(flags.to_string(), "AX");
        assert!(!flags.contains(shf::WRITE));
        assert!(flags.without(shf::EXECINSTR).contains(shf::ALLOC));
    }
}
