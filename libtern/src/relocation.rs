use crate::arch::Arch;
use crate::context::LinkContext;
use crate::diagnostics::Diagnostics;
use crate::error::Result;
use crate::section::InputSectionId;
use crate::symbol::SymbolId;
use crate::symbol::SymbolPlacement;
use linker_utils::elf::cheri;
use linker_utils::elf::riscv_rel_type_to_string;

/// What the relocation engine must compute before the bytes can be patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelExpr {
    /// Nothing to do.
    #[default]
    None,
    /// `S + A`
    Abs,
    /// `S + A`, folded into the existing contents (label-difference
    /// arithmetic: ADD/SUB/SET families).
    AbsAdd,
    /// `S + A - P`
    Pc,
    /// `PLT(S) + A - P`
    PltPc,
    /// `GOT(S) + A - P`
    GotPc,
    /// The symbol marks a paired high-part relocation; reuse its value.
    PcIndirect,
    /// `GOT(S) + A - P` where the GOT slots hold the TLS module/offset pair.
    TlsGdPc,
    /// `S + A - TP`
    TpRel,
    /// Only meaningful while relaxation runs.
    RelaxHint,
    /// A capability-sized tagged slot; written by the capability relocation
    /// writer, not the byte applier.
    CheriCapability,
    /// `CAPTAB(S) + A - P`
    CheriCaptabPc,
    CheriTlsIeCaptabPc,
    CheriTlsGdCaptabPc,
    /// Upper immediate of the symbol's CGP-relative offset.
    CheriotCgpRelHi,
    /// Low immediate of the symbol's CGP-relative offset (I-form encoding).
    CheriotCgpRelLoI,
    /// Low immediate of the symbol's CGP-relative offset (S-form encoding).
    CheriotCgpRelLoS,
    /// The size of the symbol's allocation.
    CheriotSize,
}

/// One relocation record. `offset` and `r_type` are rewritten in place by
/// relaxation finalisation; `expr` is filled in by classification.
#[derive(Debug, Clone)]
pub struct Relocation {
    pub offset: u64,
    pub r_type: u32,
    pub symbol: SymbolId,
    pub addend: i64,
    pub expr: RelExpr,
}

impl Relocation {
    pub fn new(offset: u64, r_type: u32, symbol: SymbolId, addend: i64) -> Self {
        Self {
            offset,
            r_type,
            symbol,
            addend,
            expr: RelExpr::None,
        }
    }
}

/// Classifies every relocation in the section, recording the expression class
/// each one needs. Unknown relocation kinds are reported and degrade to
/// `None` so that later relocations still get checked.
pub fn classify_relocations<A: Arch>(
    ctx: &mut LinkContext,
    id: InputSectionId,
    diagnostics: &mut Diagnostics,
) {
    let mut exprs = Vec::with_capacity(ctx.section(id).relocations.len());
    for rel in &ctx.section(id).relocations {
        match A::get_rel_expr(ctx, rel) {
            Ok(expr) => exprs.push(expr),
            Err(error) => {
                exprs.push(RelExpr::None);
                diagnostics.error(error.context(format!("in section `{}`", ctx.section(id).name)));
            }
        }
    }
    for (rel, expr) in ctx
        .section_mut(id)
        .relocations
        .iter_mut()
        .zip(exprs)
    {
        rel.expr = expr;
    }
}

/// Computes the value a relocation needs, per its expression class.
pub fn resolve_value(ctx: &LinkContext, section: InputSectionId, rel: &Relocation) -> Result<u64> {
    let place = ctx.section(section).address.wrapping_add(rel.offset);
    let symbol = &ctx.symbols[rel.symbol];
    let symbol_address = ctx.symbol_address(rel.symbol);
    let addend = rel.addend as u64;

    let value = match rel.expr {
        RelExpr::None | RelExpr::RelaxHint => 0,
        RelExpr::Abs | RelExpr::AbsAdd | RelExpr::CheriCapability => {
            symbol_address.wrapping_add(addend)
        }
        RelExpr::Pc => symbol_address.wrapping_add(addend).wrapping_sub(place),
        RelExpr::PltPc => symbol
            .plt_address
            .unwrap_or(symbol_address)
            .wrapping_add(addend)
            .wrapping_sub(place),
        RelExpr::GotPc | RelExpr::TlsGdPc => symbol
            .got_address
            .ok_or_else(|| {
                crate::error!("no GOT entry allocated for symbol `{}`", symbol.name)
            })?
            .wrapping_add(addend)
            .wrapping_sub(place),
        RelExpr::CheriCaptabPc | RelExpr::CheriTlsIeCaptabPc | RelExpr::CheriTlsGdCaptabPc => {
            symbol
                .captable_address
                .ok_or_else(|| {
                    crate::error!(
                        "no capability table entry allocated for symbol `{}`",
                        symbol.name
                    )
                })?
                .wrapping_add(addend)
                .wrapping_sub(place)
        }
        RelExpr::TpRel => symbol_address
            .wrapping_add(addend)
            .wrapping_sub(ctx.tls_base),
        RelExpr::CheriotCgpRelHi => {
            let offset = cgp_offset(ctx, symbol_address.wrapping_add(addend));
            (offset.wrapping_add(0x800) >> 12) as u64
        }
        RelExpr::CheriotCgpRelLoI | RelExpr::CheriotCgpRelLoS => {
            if ctx.is_pcc_relative(rel.symbol) {
                // The symbol marks the paired HI instruction; reuse its
                // displacement.
                let (hi_section, hi_rel) =
                    find_paired_hi(ctx, rel, Some(cheri::R_RISCV_CHERIOT_COMPARTMENT_HI))?;
                if ctx.is_pcc_relative(hi_rel.symbol) {
                    let hi_place = ctx
                        .section(hi_section)
                        .address
                        .wrapping_add(hi_rel.offset);
                    ctx.symbol_address(hi_rel.symbol)
                        .wrapping_add(hi_rel.addend as u64)
                        .wrapping_sub(hi_place)
                } else {
                    let target = ctx
                        .symbol_address(hi_rel.symbol)
                        .wrapping_add(hi_rel.addend as u64);
                    cgp_lo12(ctx, target) as u64
                }
            } else {
                cgp_lo12(ctx, symbol_address.wrapping_add(addend)) as u64
            }
        }
        RelExpr::CheriotSize => symbol.size,
        RelExpr::PcIndirect => {
            crate::ensure!(
                rel.addend == 0,
                "unexpected addend {} for relocation {}",
                rel.addend,
                riscv_rel_type_to_string(rel.r_type)
            );
            let (hi_section, hi_rel) = find_paired_hi(ctx, rel, None)?;
            crate::ensure!(
                matches!(
                    hi_rel.expr,
                    RelExpr::Pc
                        | RelExpr::GotPc
                        | RelExpr::TlsGdPc
                        | RelExpr::TpRel
                        | RelExpr::CheriCaptabPc
                        | RelExpr::CheriTlsIeCaptabPc
                        | RelExpr::CheriTlsGdCaptabPc
                ),
                "paired relocation {} at offset 0x{:x} cannot supply a value for {}",
                riscv_rel_type_to_string(hi_rel.r_type),
                hi_rel.offset,
                riscv_rel_type_to_string(rel.r_type)
            );
            resolve_value(ctx, hi_section, hi_rel)?
        }
    };
    Ok(value)
}

/// Offset of an address from the compartment globals pointer.
fn cgp_offset(ctx: &LinkContext, address: u64) -> i64 {
    address.wrapping_sub(ctx.cgp_base) as i64
}

/// The signed low 12 bits of a CGP offset, matching the biased high part.
fn cgp_lo12(ctx: &LinkContext, address: u64) -> i64 {
    let offset = cgp_offset(ctx, address);
    let hi = offset.wrapping_add(0x800) >> 12;
    offset.wrapping_sub(hi << 12)
}

/// The biased upper part of the symbol's CGP offset. Zero means the offset
/// fits entirely in the low immediate, which makes the `auicgp` removable.
pub(crate) fn cgp_hi(ctx_cgp_base: u64, address: u64) -> i64 {
    let offset = address.wrapping_sub(ctx_cgp_base) as i64;
    offset.wrapping_add(0x800) >> 12
}

/// Finds the relocation that a paired low-part relocation's symbol points at.
/// Relocations are sorted by offset, so a binary search narrows the
/// candidates; relaxation hints sharing the offset are skipped.
pub(crate) fn find_paired_hi<'ctx>(
    ctx: &'ctx LinkContext,
    rel: &Relocation,
    required_type: Option<u32>,
) -> Result<(InputSectionId, &'ctx Relocation)> {
    let symbol = &ctx.symbols[rel.symbol];
    let SymbolPlacement::Section(hi_section) = symbol.placement else {
        crate::bail!(
            "{} relocation points to an absolute symbol: {}",
            riscv_rel_type_to_string(rel.r_type),
            symbol.name
        );
    };
    let relocations = &ctx.section(hi_section).relocations;
    let start = relocations.partition_point(|r| r.offset < symbol.value);
    for candidate in &relocations[start..] {
        if candidate.offset != symbol.value {
            break;
        }
        if candidate.r_type == object::elf::R_RISCV_RELAX {
            continue;
        }
        if required_type.is_some_and(|required| candidate.r_type != required) {
            continue;
        }
        return Ok((hi_section, candidate));
    }
    crate::bail!(
        "could not find a paired high relocation for {} against symbol {}",
        riscv_rel_type_to_string(rel.r_type),
        symbol.name
    )
}

fn relocation_location(ctx: &LinkContext, id: InputSectionId, rel: &Relocation) -> String {
    format!(
        "in section `{}` at offset 0x{:x} against symbol `{}`",
        ctx.section(id).name,
        rel.offset,
        ctx.symbols[rel.symbol].name
    )
}

/// Applies every relocation in the section to its data, accumulating errors.
pub fn apply_section_relocations<A: Arch>(
    ctx: &mut LinkContext,
    id: InputSectionId,
    diagnostics: &mut Diagnostics,
) {
    let mut data = std::mem::take(&mut ctx.section_mut(id).data);
    let count = ctx.section(id).relocations.len();
    for index in 0..count {
        let rel = &ctx.section(id).relocations[index];
        match rel.expr {
            RelExpr::None | RelExpr::RelaxHint => continue,
            // Capability slots carry tags; the capability relocation writer
            // owns those bytes.
            RelExpr::CheriCapability => continue,
            _ => {}
        }
        let offset = rel.offset as usize;
        if offset > data.len() {
            diagnostics.error(crate::error!(
                "relocation offset 0x{:x} is outside section `{}` ({} bytes)",
                rel.offset,
                ctx.section(id).name,
                data.len()
            ));
            continue;
        }
        let result = resolve_value(ctx, id, rel)
            .and_then(|value| A::relocate(ctx, &mut data[offset..], rel, value));
        if let Err(error) = result {
            diagnostics.error(error.context(relocation_location(ctx, id, rel)));
        }
    }
    ctx.section_mut(id).data = data;
}

/// Classifies relocations across every input section. Runs before relaxation
/// so that expression classes survive relocation-type rewrites (a relaxed
/// call keeps addressing its PLT target). All user errors are accumulated and
/// reported together.
pub fn scan_relocations<A: Arch>(ctx: &mut LinkContext) -> Result {
    let mut diagnostics = Diagnostics::new();
    for index in 0..ctx.sections.len() {
        classify_relocations::<A>(ctx, InputSectionId::from_usize(index), &mut diagnostics);
    }
    diagnostics.into_result()
}

/// Applies relocations across every input section, after classification and
/// relaxation. All user errors are accumulated and reported together; the
/// link aborts before emission if any were found.
pub fn apply_relocations<A: Arch>(ctx: &mut LinkContext) -> Result {
    let mut diagnostics = Diagnostics::new();
    for index in 0..ctx.sections.len() {
        apply_section_relocations::<A>(ctx, InputSectionId::from_usize(index), &mut diagnostics);
    }
    diagnostics.into_result()
}
