use crate::config::Config;
use crate::context::LinkContext;
use crate::error::Result;
use crate::relocation::RelExpr;
use crate::relocation::Relocation;
use crate::section::InputObject;
use crate::symbol::SymbolId;
use std::borrow::Cow;
use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    RiscV,
}

impl Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Architecture::RiscV => write!(f, "riscv"),
        }
    }
}

/// The target interface. Everything instruction-set specific that the linker
/// core needs goes through here; other architectures supply their own
/// implementation.
pub trait Arch {
    const KIND: Architecture;

    /// Size in bytes of the PLT header this target emits.
    const PLT_HEADER_SIZE: usize;
    /// Size in bytes of one PLT entry.
    const PLT_ENTRY_SIZE: usize;

    fn elf_header_arch_magic() -> u16;

    fn rel_type_to_string(r_type: u32) -> Cow<'static, str>;

    /// Merges ELF header flags across the input objects, verifying ABI
    /// compatibility. With no relocatable inputs (pure binary input) the
    /// merged flags are zero.
    fn calc_eflags(objects: &[InputObject]) -> Result<u32>;

    /// Determines whether the link is pure-capability, re-reading the merged
    /// flags and cross-checking the requested emulation.
    fn calc_is_cheri_abi(config: &Config, objects: &[InputObject]) -> Result<bool>;

    /// Capability size in bytes under the CHERI ABI.
    fn capability_size(config: &Config) -> u32;

    /// Reads the implicit addend stored at `buf` for a REL-form relocation.
    fn get_implicit_addend(config: &Config, buf: &[u8], r_type: u32) -> Result<i64>;

    /// The relocation type to emit dynamically for `r_type`, or the null
    /// relocation if it cannot be represented.
    fn get_dyn_rel(config: &Config, r_type: u32) -> u32;

    /// Classifies a relocation: which value the relocation engine must
    /// compute before applying it.
    fn get_rel_expr(ctx: &LinkContext, rel: &Relocation) -> Result<RelExpr>;

    /// Applies `value` to the bytes at `loc` (the start of the relocated
    /// location) according to the relocation's type.
    fn relocate(ctx: &LinkContext, loc: &mut [u8], rel: &Relocation, value: u64) -> Result;

    fn write_got_header(config: &Config, buf: &mut [u8], dynamic_address: u64) -> Result;

    fn write_got_plt(config: &Config, buf: &mut [u8], plt_address: u64) -> Result;

    fn write_igot_plt(config: &Config, buf: &mut [u8], symbol_address: u64) -> Result;

    fn write_plt_header(ctx: &LinkContext, buf: &mut [u8]) -> Result;

    fn write_plt(
        ctx: &LinkContext,
        buf: &mut [u8],
        symbol: SymbolId,
        plt_entry_address: u64,
    ) -> Result;

    /// One relaxation pass over every executable input section. Returns true
    /// if anything changed; the caller reassigns addresses and calls again
    /// until quiescent.
    fn relax_once(ctx: &mut LinkContext, pass: u32) -> Result<bool>;

    /// Materialises the shrunk section bodies and rebases relocation offsets
    /// once no pass reports a change.
    fn finalize_relax(ctx: &mut LinkContext, passes: u32) -> Result;

    /// Minimum alignment at which a capability of the given size has exactly
    /// representable bounds.
    fn cheri_required_alignment(size: u64) -> u64;
}
