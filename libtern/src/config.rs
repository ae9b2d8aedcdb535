/// Link-wide configuration consumed by the backend. The embedding linker
/// builds this from its command line, then fills in `eflags` and
/// `is_cheri_abi` from [`crate::arch::Arch::calc_eflags`] and
/// [`crate::arch::Arch::calc_is_cheri_abi`] once the inputs are known.
#[derive(Debug, Clone)]
pub struct Config {
    pub is_64: bool,

    /// Whether this is a pure-capability (CHERI ABI) link. Before e_flags
    /// merging this holds what the emulation requested; afterwards, the
    /// merged determination.
    pub is_cheri_abi: bool,

    /// Whether linker relaxation is enabled.
    pub relax: bool,

    /// Producing a relocatable output (`-r`). Disables relaxation.
    pub relocatable: bool,

    /// Whether implicit addends are materialised into allocated sections.
    pub write_addends: bool,

    /// Merged ELF header flags for the output.
    pub eflags: u32,

    /// Bound on relaxation passes. Relaxation is not formally guaranteed to
    /// terminate, so exceeding the cap is reported as an error rather than
    /// silently accepting a stale shrink.
    pub max_relax_passes: u32,
}

impl Config {
    pub fn new(is_64: bool) -> Self {
        Self {
            is_64,
            is_cheri_abi: false,
            relax: true,
            relocatable: false,
            write_addends: true,
            eflags: 0,
            max_relax_passes: 32,
        }
    }

    /// Pointer size in bytes.
    pub fn wordsize(&self) -> u32 {
        if self.is_64 { 8 } else { 4 }
    }

    /// Whether the inputs use compressed instructions.
    pub fn rvc(&self) -> bool {
        self.eflags & object::elf::EF_RISCV_RVC != 0
    }
}
