//! Iterative linker relaxation: a fixed-point byte-removal process over the
//! executable input sections. Each pass walks a section's relocations in
//! offset order, deciding how many bytes each site can drop, while streaming
//! adjustments to the symbols anchored in the section. Once no pass changes
//! anything, finalisation materialises the shrunk section bodies and rebases
//! relocation offsets.

use crate::arch::Arch;
use crate::config::Config;
use crate::context::is_pcc_relative_in;
use crate::context::symbol_address_in;
use crate::context::LinkContext;
use crate::error::Result;
use crate::relocation::cgp_hi;
use crate::relocation::find_paired_hi;
use crate::relocation::RelExpr;
use crate::relocation::Relocation;
use crate::riscv::read32;
use crate::riscv::read64;
use crate::section::InputSection;
use crate::section::InputSectionId;
use crate::symbol::SymbolId;
use crate::symbol::SymbolPlacement;
use crate::symbol::SymbolTable;
use hashbrown::HashMap;
use linker_utils::bit_misc::fits_signed;
use linker_utils::bit_misc::BitExtraction as _;
use linker_utils::elf::cheri;
use linker_utils::riscv::reg;
use linker_utils::riscv::C_NOP;
use linker_utils::riscv::NOP;
use smallvec::SmallVec;

/// Marks a text symbol's start (`st_value`) or end (`st_value + st_size`)
/// within its section. Anchors are kept sorted by `(offset, end)` so a
/// zero-size symbol's start precedes its end.
#[derive(Debug, Clone, Copy)]
struct SymbolAnchor {
    offset: u64,
    symbol: SymbolId,
    end: bool,
}

/// Per-section relaxation state, attached to every executable input section
/// for the duration of relaxation.
#[derive(Debug, Default)]
pub(crate) struct RelaxAux {
    anchors: SmallVec<[SymbolAnchor; 4]>,
    /// For relocation `i`, the cumulative bytes removed up to and including
    /// it. Non-decreasing within a pass.
    reloc_deltas: Vec<u32>,
    /// For relocation `i`, the rewritten type, or `R_RISCV_NONE` if the site
    /// was untouched this pass.
    reloc_types: Vec<u32>,
    /// Replacement instruction words, consumed in rewrite order during
    /// finalisation.
    writes: SmallVec<[u32; 4]>,
}

fn executable_section_ids(ctx: &LinkContext) -> Vec<InputSectionId> {
    ctx.output_sections
        .iter()
        .filter(|osec| osec.is_executable())
        .flat_map(|osec| osec.sections.iter().copied())
        .collect()
}

fn init_symbol_anchors(ctx: &mut LinkContext) {
    let ids = executable_section_ids(ctx);
    for &id in &ids {
        let sec = &mut ctx.sections[id.as_usize()];
        let count = sec.relocations.len();
        sec.relax_aux = Some(RelaxAux {
            anchors: SmallVec::new(),
            reloc_deltas: vec![0; count],
            reloc_types: vec![object::elf::R_RISCV_NONE; count],
            writes: SmallVec::new(),
        });
    }

    // Anchor st_value and st_value+st_size for every symbol defined in a text
    // section of its own object.
    let LinkContext {
        sections, symbols, ..
    } = ctx;
    for (id, symbol) in symbols.iter() {
        let SymbolPlacement::Section(section) = symbol.placement else {
            continue;
        };
        let sec = &mut sections[section.as_usize()];
        if symbol.object != sec.object {
            continue;
        }
        let Some(aux) = sec.relax_aux.as_mut() else {
            continue;
        };
        aux.anchors.push(SymbolAnchor {
            offset: symbol.value,
            symbol: id,
            end: false,
        });
        aux.anchors.push(SymbolAnchor {
            offset: symbol.value + symbol.size,
            symbol: id,
            end: true,
        });
    }

    for &id in &ids {
        if let Some(aux) = ctx.sections[id.as_usize()].relax_aux.as_mut() {
            aux.anchors.sort_by_key(|anchor| (anchor.offset, anchor.end));
        }
    }
}

/// CHERIoT uses the same relocation kinds for PC- and CGP-relative low
/// halves; a `LO_I` nominally points at its paired `HI` instruction. If that
/// `HI` turns out to be CGP-relative, relaxation may delete the `auicgp`,
/// stranding the `LO_I`. Rewrite such `LO_I` relocations to point directly at
/// the `HI`'s ultimate target before any shrinking happens.
fn rewrite_cheriot_low_relocs(ctx: &mut LinkContext) -> Result<bool> {
    let mut rewrites: Vec<(usize, usize, SymbolId, i64)> = Vec::new();
    for (sec_index, sec) in ctx.sections.iter().enumerate() {
        if sec.relax_aux.is_none() {
            continue;
        }
        for (rel_index, rel) in sec.relocations.iter().enumerate() {
            if rel.r_type != cheri::R_RISCV_CHERIOT_COMPARTMENT_LO_I {
                continue;
            }
            if !is_pcc_relative_in(&ctx.sections, &ctx.symbols, rel.symbol) {
                continue;
            }
            let (_, target) =
                find_paired_hi(ctx, rel, Some(cheri::R_RISCV_CHERIOT_COMPARTMENT_HI))?;
            // A PCC-relative auipcc can't be erased, so the pair stays
            // intact and no rewrite is needed.
            if is_pcc_relative_in(&ctx.sections, &ctx.symbols, target.symbol) {
                continue;
            }
            rewrites.push((sec_index, rel_index, target.symbol, target.addend));
        }
    }

    let modified = !rewrites.is_empty();
    for (sec_index, rel_index, symbol, addend) in rewrites {
        let rel = &mut ctx.sections[sec_index].relocations[rel_index];
        rel.symbol = symbol;
        rel.addend = addend;
    }
    Ok(modified)
}

fn followed_by_relax(relocations: &[Relocation], index: usize) -> bool {
    relocations
        .get(index + 1)
        .is_some_and(|next| next.r_type == object::elf::R_RISCV_RELAX)
}

/// `R_RISCV_ALIGN`: drop the bytes beyond the next aligned boundary. The
/// addend is the number of padding bytes the assembler emitted (the desired
/// alignment minus two for the smallest instruction).
fn relax_align(loc: u64, rel: &Relocation) -> Result<u32> {
    let addend = rel.addend as u64;
    let next_loc = loc + addend;
    let align = (addend + 2).next_power_of_two();
    let boundary = (loc + align - 1) & !(align - 1);
    crate::ensure!(
        next_loc >= boundary,
        "insufficient padding to satisfy alignment relocation at address 0x{loc:x}"
    );
    Ok((next_loc - boundary) as u32)
}

/// Relax a `CALL`/`CALL_PLT` auipc+jalr (or `CHERI_CCALL` auipcc+cjalr) pair
/// to `c.j`, `c.jal`, or `jal` when the displacement allows. The CHERI
/// variants keep CHERI relocation types even though the rewritten encodings
/// are identical.
#[allow(clippy::too_many_arguments)]
fn relax_call(
    config: &Config,
    sections: &[InputSection],
    symbols: &SymbolTable,
    data: &[u8],
    aux: &mut RelaxAux,
    index: usize,
    loc: u64,
    rel: &Relocation,
) -> Result<u32> {
    let (jal_rvc_type, jal_type) = if rel.r_type == cheri::R_RISCV_CHERI_CCALL {
        (cheri::R_RISCV_CHERI_RVC_CJUMP, cheri::R_RISCV_CHERI_CJAL)
    } else {
        (object::elf::R_RISCV_RVC_JUMP, object::elf::R_RISCV_JAL)
    };
    let rvc = config.rvc();
    let offset = rel.offset as usize;
    crate::ensure!(
        offset + 8 <= data.len(),
        "call relocation at offset 0x{:x} runs past the end of its section",
        rel.offset
    );
    let insn_pair = read64(&data[offset..]);
    let rd = insn_pair.extract_bits(32 + 11, 32 + 7) as u32;

    let symbol = &symbols[rel.symbol];
    let dest = if rel.expr == RelExpr::PltPc {
        symbol
            .plt_address
            .unwrap_or_else(|| symbol_address_in(sections, symbols, rel.symbol))
    } else {
        symbol_address_in(sections, symbols, rel.symbol)
    }
    .wrapping_add(rel.addend as u64);
    let displace = dest.wrapping_sub(loc) as i64;

    if rvc && fits_signed(displace, 12) && rd == 0 {
        aux.reloc_types[index] = jal_rvc_type;
        aux.writes.push(0xa001); // c.[c]j
        Ok(6)
    } else if rvc && fits_signed(displace, 12) && rd == reg::RA && !config.is_64 {
        // RV32C only
        aux.reloc_types[index] = jal_rvc_type;
        aux.writes.push(0x2001); // c.[c]jal
        Ok(6)
    } else if fits_signed(displace, 21) {
        aux.reloc_types[index] = jal_type;
        aux.writes.push(0x6f | (rd << 7)); // [c]jal
        Ok(4)
    } else {
        Ok(0)
    }
}

/// Relax `auicgp` + cincoffset/load/store to a single instruction addressed
/// off cgp directly, when the upper immediate would be zero.
fn relax_cgp(
    sections: &[InputSection],
    symbols: &SymbolTable,
    cgp_base: u64,
    data: &[u8],
    aux: &mut RelaxAux,
    index: usize,
    rel: &Relocation,
) -> Result<u32> {
    if is_pcc_relative_in(sections, symbols, rel.symbol) {
        return Ok(0);
    }
    let address = symbol_address_in(sections, symbols, rel.symbol);
    // Only relaxable when the pair is `auicgp rd, 0`.
    if cgp_hi(cgp_base, address) != 0 {
        return Ok(0);
    }
    let offset = rel.offset as usize;
    crate::ensure!(
        offset + 4 <= data.len(),
        "compartment relocation at offset 0x{:x} runs past the end of its section",
        rel.offset
    );
    let insn = read32(&data[offset..]);
    match rel.r_type {
        cheri::R_RISCV_CHERIOT_COMPARTMENT_HI => {
            // Remove auicgp rd, 0.
            aux.reloc_types[index] = object::elf::R_RISCV_RELAX;
            Ok(4)
        }
        cheri::R_RISCV_CHERIOT_COMPARTMENT_LO_I | cheri::R_RISCV_CHERIOT_COMPARTMENT_LO_S => {
            // cincoffset/load/store rd, cs1, %lo(x) => same, with cs1 = cgp
            aux.reloc_types[index] = cheri::R_RISCV_CHERIOT_COMPARTMENT_LO_I;
            aux.writes.push((insn & !(31 << 15)) | (reg::CGP << 15));
            Ok(0)
        }
        _ => Ok(0),
    }
}

fn relax_section(
    config: &Config,
    sections: &mut [InputSection],
    symbols: &mut SymbolTable,
    cgp_base: u64,
    id: InputSectionId,
) -> Result<bool> {
    let Some(mut aux) = sections[id.as_usize()].relax_aux.take() else {
        return Ok(false);
    };

    let result = relax_section_body(config, sections, symbols, cgp_base, id, &mut aux);

    let sec = &mut sections[id.as_usize()];
    match result {
        Ok((changed, delta)) => {
            sec.bytes_dropped = delta;
            sec.relax_aux = Some(aux);
            Ok(changed)
        }
        Err(error) => {
            sec.relax_aux = Some(aux);
            Err(error)
        }
    }
}

fn relax_section_body(
    config: &Config,
    sections: &[InputSection],
    symbols: &mut SymbolTable,
    cgp_base: u64,
    id: InputSectionId,
    aux: &mut RelaxAux,
) -> Result<(bool, u32)> {
    let sec = &sections[id.as_usize()];
    let sec_addr = sec.address;

    // Recover each anchored symbol's st_value delta from the previous pass:
    // the cumulative delta of the last relocation preceding its start anchor.
    let mut value_delta: HashMap<SymbolId, u64> = HashMap::new();
    {
        let mut anchors = &aux.anchors[..];
        let mut delta = 0u32;
        for (index, rel) in sec.relocations.iter().enumerate() {
            while let Some((first, rest)) = anchors.split_first() {
                if first.offset > rel.offset {
                    break;
                }
                if !first.end {
                    value_delta.insert(first.symbol, u64::from(delta));
                }
                anchors = rest;
            }
            delta = aux.reloc_deltas[index];
        }
        for anchor in anchors {
            if !anchor.end {
                value_delta.insert(anchor.symbol, u64::from(delta));
            }
        }
    }

    for slot in aux.reloc_types.iter_mut() {
        *slot = object::elf::R_RISCV_NONE;
    }
    aux.writes.clear();

    let mut changed = false;
    let mut anchors = 0usize;
    let mut delta = 0u32;
    for index in 0..sec.relocations.len() {
        let rel = &sec.relocations[index];
        let loc = sec_addr
            .wrapping_add(rel.offset)
            .wrapping_sub(u64::from(delta));
        let mut remove = 0u32;
        match rel.r_type {
            object::elf::R_RISCV_ALIGN => {
                remove = relax_align(loc, rel)?;
            }
            object::elf::R_RISCV_CALL
            | object::elf::R_RISCV_CALL_PLT
            | cheri::R_RISCV_CHERI_CCALL
                if followed_by_relax(&sec.relocations, index) =>
            {
                remove = relax_call(config, sections, symbols, &sec.data, aux, index, loc, rel)?;
            }
            cheri::R_RISCV_CHERIOT_COMPARTMENT_HI
            | cheri::R_RISCV_CHERIOT_COMPARTMENT_LO_I
            | cheri::R_RISCV_CHERIOT_COMPARTMENT_LO_S
                if followed_by_relax(&sec.relocations, index) =>
            {
                remove = relax_cgp(sections, symbols, cgp_base, &sec.data, aux, index, rel)?;
            }
            _ => {}
        }

        // Anchors at or before this relocation sit after the previous
        // relocation, whose cumulative delta is `delta`. Adjust them before
        // accounting for this site's removal.
        while let Some(anchor) = aux.anchors.get(anchors) {
            if anchor.offset > rel.offset {
                break;
            }
            drain_anchor(symbols, *anchor, delta, &value_delta);
            anchors += 1;
        }

        delta += remove;
        if delta != aux.reloc_deltas[index] {
            aux.reloc_deltas[index] = delta;
            changed = true;
        }
    }

    while let Some(anchor) = aux.anchors.get(anchors) {
        drain_anchor(symbols, *anchor, delta, &value_delta);
        anchors += 1;
    }

    crate::ensure!(
        delta <= u32::from(u16::MAX),
        "section size decrease is too large ({} bytes in `{}`)",
        delta,
        sec.name
    );
    Ok((changed, delta))
}

fn drain_anchor(
    symbols: &mut SymbolTable,
    anchor: SymbolAnchor,
    delta: u32,
    value_delta: &HashMap<SymbolId, u64>,
) {
    let delta = u64::from(delta);
    if anchor.end {
        let value = symbols[anchor.symbol].value;
        symbols[anchor.symbol].size = anchor.offset.wrapping_sub(delta).wrapping_sub(value);
    } else {
        let previous = value_delta.get(&anchor.symbol).copied().unwrap_or(0);
        let symbol = &mut symbols[anchor.symbol];
        symbol.value = symbol.value.wrapping_sub(delta.wrapping_sub(previous));
    }
}

/// One relaxation pass over every executable input section. The relocations
/// must already be classified; pass 0 also installs the symbol anchors and
/// runs the CHERIoT low-relocation rewrite.
pub(crate) fn relax_once(ctx: &mut LinkContext, pass: u32) -> Result<bool> {
    if ctx.config.relocatable {
        return Ok(false);
    }

    let mut changed = false;
    if pass == 0 {
        init_symbol_anchors(ctx);
        changed |= rewrite_cheriot_low_relocs(ctx)?;
    }

    let ids = executable_section_ids(ctx);
    for id in ids {
        let LinkContext {
            config,
            sections,
            symbols,
            cgp_base,
            ..
        } = &mut *ctx;
        changed |= relax_section(config, sections, symbols, *cgp_base, id)?;
    }
    Ok(changed)
}

/// Rebuilds each relaxed section's body and rebases its relocations once the
/// fixed point is reached. Consumes the relax aux, so a second call is a
/// no-op.
pub(crate) fn finalize_relax(ctx: &mut LinkContext, passes: u32) -> Result {
    tracing::debug!("relaxation passes: {passes}");
    let ids = executable_section_ids(ctx);
    for id in ids {
        finalize_section(&mut ctx.sections[id.as_usize()])?;
    }
    Ok(())
}

fn finalize_section(sec: &mut InputSection) -> Result {
    let Some(aux) = sec.relax_aux.take() else {
        return Ok(());
    };
    if aux.reloc_deltas.is_empty() {
        return Ok(());
    }

    let old = std::mem::take(&mut sec.data);
    let total_removed = aux.reloc_deltas.last().copied().unwrap_or(0);
    let new_size = old.len() - total_removed as usize;
    let mut out = Vec::with_capacity(new_size);
    let mut writes = aux.writes.iter().copied();

    // Remove the dropped padding and splice in rewritten instructions.
    let mut offset = 0usize;
    let mut delta = 0u32;
    for index in 0..sec.relocations.len() {
        let remove = aux.reloc_deltas[index] - delta;
        delta = aux.reloc_deltas[index];
        let new_type = aux.reloc_types[index];
        if remove == 0 && new_type == object::elf::R_RISCV_NONE {
            continue;
        }

        let rel = &sec.relocations[index];
        let rel_offset = rel.offset as usize;
        out.extend_from_slice(&old[offset..rel_offset]);

        let mut skip = 0usize;
        if rel.r_type == object::elf::R_RISCV_ALIGN {
            // When both the removal and the original padding are multiples of
            // four, the surviving NOPs are copied through unchanged.
            // Otherwise we land mid-NOP and must rewrite the sequence.
            if remove % 4 != 0 || rel.addend % 4 != 0 {
                skip = rel.addend as usize - remove as usize;
                let mut filled = 0;
                while filled + 4 <= skip {
                    out.extend_from_slice(&NOP.to_le_bytes());
                    filled += 4;
                }
                if filled != skip {
                    crate::ensure!(
                        filled + 2 == skip,
                        "internal error: NOP fill of {} bytes in `{}`",
                        skip,
                        sec.name
                    );
                    out.extend_from_slice(&C_NOP.to_le_bytes());
                }
            }
        } else if new_type != object::elf::R_RISCV_NONE {
            match new_type {
                object::elf::R_RISCV_RELAX => {}
                object::elf::R_RISCV_RVC_JUMP | cheri::R_RISCV_CHERI_RVC_CJUMP => {
                    skip = 2;
                    let word = next_write(&mut writes, sec)?;
                    out.extend_from_slice(&(word as u16).to_le_bytes());
                }
                object::elf::R_RISCV_JAL
                | cheri::R_RISCV_CHERI_CJAL
                | cheri::R_RISCV_CHERIOT_COMPARTMENT_LO_I
                | cheri::R_RISCV_CHERIOT_COMPARTMENT_LO_S => {
                    skip = 4;
                    let word = next_write(&mut writes, sec)?;
                    out.extend_from_slice(&word.to_le_bytes());
                }
                _ => crate::bail!(
                    "internal error: unexpected relaxed relocation type {} in `{}`",
                    new_type,
                    sec.name
                ),
            }
        }

        offset = rel_offset + skip + remove as usize;
    }
    out.extend_from_slice(&old[offset..]);
    crate::ensure!(
        out.len() == new_size,
        "internal error: relaxed `{}` to {} bytes, expected {}",
        sec.name,
        out.len(),
        new_size
    );
    sec.data = out;
    sec.bytes_dropped = 0;

    // Rebase each relocation's offset by the cumulative delta before it.
    // Relocations sharing a pre-shrink offset (a site and its relaxation
    // hint) move by the same delta. Rewritten types land at the same time.
    let mut delta = 0u64;
    let mut index = 0;
    let count = sec.relocations.len();
    while index < count {
        let shared_offset = sec.relocations[index].offset;
        loop {
            sec.relocations[index].offset -= delta;
            if aux.reloc_types[index] != object::elf::R_RISCV_NONE {
                sec.relocations[index].r_type = aux.reloc_types[index];
            }
            index += 1;
            if index == count || sec.relocations[index].offset != shared_offset {
                break;
            }
        }
        delta = u64::from(aux.reloc_deltas[index - 1]);
    }

    Ok(())
}

fn next_write(writes: &mut impl Iterator<Item = u32>, sec: &InputSection) -> Result<u32> {
    writes
        .next()
        .ok_or_else(|| crate::error!("internal error: exhausted rewrite list in `{}`", sec.name))
}

/// Runs relaxation to a fixed point: repeat [`Arch::relax_once`], reassigning
/// section addresses after every pass that changed something, until quiescent
/// or the configured pass cap is exhausted (which is an error, not a silent
/// acceptance of a stale shrink). Finishes with [`Arch::finalize_relax`] and
/// returns the number of passes that made progress. Relocations must have
/// been classified first.
pub fn run_relaxation<A: Arch>(ctx: &mut LinkContext) -> Result<u32> {
    if !ctx.config.relax || ctx.config.relocatable {
        return Ok(0);
    }
    let mut pass = 0;
    while A::relax_once(ctx, pass)? {
        ctx.reassign_section_addresses();
        pass += 1;
        crate::ensure!(
            pass < ctx.config.max_relax_passes,
            "relaxation did not converge after {pass} passes"
        );
    }
    A::finalize_relax(ctx, pass)?;
    Ok(pass)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::relocation::apply_relocations;
    use crate::relocation::scan_relocations;
    use crate::riscv::read16;
    use crate::riscv::RiscV;
    use crate::section::InputObject;
    use crate::section::OutputSection;
    use crate::symbol::Symbol;
    use linker_utils::elf::shf;
    use linker_utils::riscv::itype;
    use linker_utils::riscv::op;
    use linker_utils::riscv::utype;
    use object::elf::EF_RISCV_RVC;

    struct Fixture {
        ctx: LinkContext,
        text: InputSectionId,
        data: InputSectionId,
    }

    fn fixture(eflags: u32) -> Fixture {
        let mut config = Config::new(false);
        config.eflags = eflags;
        let mut ctx = LinkContext::new(config);
        let obj = ctx.add_object(InputObject {
            name: "main.o".to_owned(),
            eflags,
        });
        let text_out = ctx.add_output_section(OutputSection::new(
            ".text",
            0x1000,
            shf::ALLOC.with(shf::EXECINSTR),
        ));
        let data_out = ctx.add_output_section(OutputSection::new(
            ".data",
            0x8000,
            shf::ALLOC.with(shf::WRITE),
        ));
        let text = ctx.add_section(text_out, {
            let mut sec = InputSection::new(".text", obj, shf::ALLOC.with(shf::EXECINSTR));
            sec.address = 0x1000;
            sec.alignment = 4;
            sec
        });
        let data = ctx.add_section(data_out, {
            let mut sec = InputSection::new(".data", obj, shf::ALLOC.with(shf::WRITE));
            sec.address = 0x8000;
            sec.data = vec![0; 0x100];
            sec
        });
        ctx.cgp_base = 0x8000;
        Fixture { ctx, text, data }
    }

    fn call_pair(rd: u32) -> Vec<u8> {
        let mut bytes = utype(op::AUIPC, 5, 0).to_le_bytes().to_vec();
        bytes.extend_from_slice(&itype(op::JALR, rd, 5, 0).to_le_bytes());
        bytes
    }

    #[test]
    fn test_call_relaxes_to_c_j() {
        let Fixture { mut ctx, text, .. } = fixture(EF_RISCV_RVC);
        let obj = ctx.section(text).object;
        ctx.section_mut(text).data = call_pair(0);
        let caller = ctx.add_symbol(
            Symbol::new("caller", obj, crate::symbol::SymbolPlacement::Section(text))
                .with_size(8),
        );
        let callee = ctx.add_symbol(
            Symbol::new("callee", obj, crate::symbol::SymbolPlacement::Section(text))
                .with_value(8),
        );
        ctx.section_mut(text).relocations = vec![
            Relocation::new(0, object::elf::R_RISCV_CALL_PLT, callee, 0),
            Relocation::new(0, object::elf::R_RISCV_RELAX, callee, 0),
        ];

        scan_relocations::<RiscV>(&mut ctx).unwrap();
        let passes = run_relaxation::<RiscV>(&mut ctx).unwrap();
        assert!(passes >= 1);

        let sec = ctx.section(text);
        assert_eq!(sec.data.len(), 2);
        assert_eq!(sec.relocations[0].r_type, object::elf::R_RISCV_RVC_JUMP);
        assert_eq!(sec.relocations[0].offset, 0);
        assert_eq!(sec.relocations[1].r_type, object::elf::R_RISCV_RELAX);
        assert_eq!(sec.relocations[1].offset, 0);

        // The caller shrank with its body; the callee moved back with it.
        assert_eq!(ctx.symbols[caller].value, 0);
        assert_eq!(ctx.symbols[caller].size, 2);
        assert_eq!(ctx.symbols[callee].value, 2);
        assert_eq!(ctx.symbols[callee].size, 0);

        apply_relocations::<RiscV>(&mut ctx).unwrap();
        // c.j +2
        assert_eq!(read16(&ctx.section(text).data), 0xa009);
    }

    #[test]
    fn test_call_relaxes_to_c_jal_for_ra_on_rv32() {
        let Fixture { mut ctx, text, .. } = fixture(EF_RISCV_RVC);
        let obj = ctx.section(text).object;
        ctx.section_mut(text).data = call_pair(1);
        let callee = ctx.add_symbol(
            Symbol::new("callee", obj, crate::symbol::SymbolPlacement::Section(text))
                .with_value(8),
        );
        ctx.section_mut(text).relocations = vec![
            Relocation::new(0, object::elf::R_RISCV_CALL_PLT, callee, 0),
            Relocation::new(0, object::elf::R_RISCV_RELAX, callee, 0),
        ];

        scan_relocations::<RiscV>(&mut ctx).unwrap();
        run_relaxation::<RiscV>(&mut ctx).unwrap();

        let sec = ctx.section(text);
        assert_eq!(sec.data.len(), 2);
        assert_eq!(sec.relocations[0].r_type, object::elf::R_RISCV_RVC_JUMP);

        apply_relocations::<RiscV>(&mut ctx).unwrap();
        // c.jal +2
        assert_eq!(read16(&ctx.section(text).data), 0x2009);
    }

    #[test]
    fn test_calls_relax_to_jal_without_rvc() {
        let Fixture { mut ctx, text, .. } = fixture(0);
        let obj = ctx.section(text).object;
        let mut bytes = call_pair(0);
        bytes.extend_from_slice(&call_pair(0));
        ctx.section_mut(text).data = bytes;
        let f1 = ctx.add_symbol(
            Symbol::new("f1", obj, crate::symbol::SymbolPlacement::Section(text)).with_size(8),
        );
        let f2 = ctx.add_symbol(
            Symbol::new("f2", obj, crate::symbol::SymbolPlacement::Section(text))
                .with_value(8)
                .with_size(8),
        );
        let callee = ctx.add_symbol(
            Symbol::new("callee", obj, crate::symbol::SymbolPlacement::Section(text))
                .with_value(16),
        );
        ctx.section_mut(text).relocations = vec![
            Relocation::new(0, object::elf::R_RISCV_CALL_PLT, callee, 0),
            Relocation::new(0, object::elf::R_RISCV_RELAX, callee, 0),
            Relocation::new(8, object::elf::R_RISCV_CALL_PLT, callee, 0),
            Relocation::new(8, object::elf::R_RISCV_RELAX, callee, 0),
        ];

        scan_relocations::<RiscV>(&mut ctx).unwrap();
        run_relaxation::<RiscV>(&mut ctx).unwrap();

        let sec = ctx.section(text);
        assert_eq!(sec.data.len(), 8);
        assert_eq!(sec.relocations[0].r_type, object::elf::R_RISCV_JAL);
        assert_eq!(sec.relocations[2].r_type, object::elf::R_RISCV_JAL);
        assert_eq!(sec.relocations[2].offset, 4);

        // Size preservation: each function lost exactly its removed bytes,
        // and anchor order is preserved.
        assert_eq!(ctx.symbols[f1].value, 0);
        assert_eq!(ctx.symbols[f1].size, 4);
        assert_eq!(ctx.symbols[f2].value, 4);
        assert_eq!(ctx.symbols[f2].size, 4);
        assert_eq!(ctx.symbols[callee].value, 8);

        apply_relocations::<RiscV>(&mut ctx).unwrap();
        let out = &ctx.section(text).data;
        // jal x0, +8 and jal x0, +4
        assert_eq!(crate::riscv::read32(out), 0x0080_006f);
        assert_eq!(crate::riscv::read32(&out[4..]), 0x0040_006f);
    }

    #[test]
    fn test_cgp_collapse() {
        let Fixture {
            mut ctx,
            text,
            data,
        } = fixture(0);
        let obj = ctx.section(text).object;
        // auicgp c3, 0 followed by clc ca0, 0(cs5)
        let load = itype(0x3003, 10, 21, 0);
        let mut bytes = utype(op::AUICGP, 3, 0).to_le_bytes().to_vec();
        bytes.extend_from_slice(&load.to_le_bytes());
        ctx.section_mut(text).data = bytes;

        let global = ctx.add_symbol(
            Symbol::new("global", obj, crate::symbol::SymbolPlacement::Section(data))
                .with_value(0x10)
                .with_size(4),
        );
        ctx.section_mut(text).relocations = vec![
            Relocation::new(0, cheri::R_RISCV_CHERIOT_COMPARTMENT_HI, global, 0),
            Relocation::new(0, object::elf::R_RISCV_RELAX, global, 0),
            Relocation::new(4, cheri::R_RISCV_CHERIOT_COMPARTMENT_LO_I, global, 0),
            Relocation::new(4, object::elf::R_RISCV_RELAX, global, 0),
        ];

        scan_relocations::<RiscV>(&mut ctx).unwrap();
        run_relaxation::<RiscV>(&mut ctx).unwrap();

        let sec = ctx.section(text);
        // The auicgp is gone; the load survives with cs1 rewritten to cgp.
        assert_eq!(sec.data.len(), 4);
        assert_eq!(sec.relocations[0].r_type, object::elf::R_RISCV_RELAX);
        assert_eq!(
            sec.relocations[2].r_type,
            cheri::R_RISCV_CHERIOT_COMPARTMENT_LO_I
        );
        assert_eq!(sec.relocations[2].offset, 0);
        let insn = read32(&sec.data);
        assert_eq!((insn >> 15) & 31, u32::from(reg::CGP));

        apply_relocations::<RiscV>(&mut ctx).unwrap();
        let insn = read32(&ctx.section(text).data);
        // Low immediate of global's CGP offset.
        assert_eq!(insn >> 20, 0x10);
        assert_eq!((insn >> 15) & 31, u32::from(reg::CGP));
    }

    #[test]
    fn test_cgp_collapse_skips_out_of_range_globals() {
        let Fixture {
            mut ctx,
            text,
            data,
        } = fixture(0);
        let obj = ctx.section(text).object;
        let mut bytes = utype(op::AUICGP, 3, 0).to_le_bytes().to_vec();
        bytes.extend_from_slice(&itype(0x3003, 10, 21, 0).to_le_bytes());
        ctx.section_mut(text).data = bytes;

        // Too far from cgp for the low immediate alone.
        let far = ctx.add_symbol(
            Symbol::new("far", obj, crate::symbol::SymbolPlacement::Section(data))
                .with_value(0x4000),
        );
        ctx.section_mut(text).relocations = vec![
            Relocation::new(0, cheri::R_RISCV_CHERIOT_COMPARTMENT_HI, far, 0),
            Relocation::new(0, object::elf::R_RISCV_RELAX, far, 0),
        ];

        scan_relocations::<RiscV>(&mut ctx).unwrap();
        run_relaxation::<RiscV>(&mut ctx).unwrap();
        assert_eq!(ctx.section(text).data.len(), 8);
        assert_eq!(
            ctx.section(text).relocations[0].r_type,
            cheri::R_RISCV_CHERIOT_COMPARTMENT_HI
        );
    }

    #[test]
    fn test_align_finalize_writes_nop_sequence() {
        let Fixture { mut ctx, text, .. } = fixture(0);
        let nop = NOP.to_le_bytes();
        let c_nop = C_NOP.to_le_bytes();
        // Six bytes of code, then six bytes of padding for an 8-byte
        // alignment boundary at 0x1008.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&nop);
        bytes.extend_from_slice(&c_nop);
        bytes.extend_from_slice(&nop);
        bytes.extend_from_slice(&c_nop);
        ctx.section_mut(text).data = bytes;
        let obj = ctx.section(text).object;
        let anchor = ctx.add_symbol(Symbol::new(
            "pad",
            obj,
            crate::symbol::SymbolPlacement::Section(text),
        ));
        ctx.section_mut(text).relocations = vec![Relocation::new(
            6,
            object::elf::R_RISCV_ALIGN,
            anchor,
            6,
        )];

        scan_relocations::<RiscV>(&mut ctx).unwrap();
        run_relaxation::<RiscV>(&mut ctx).unwrap();

        let sec = ctx.section(text);
        // Four bytes dropped, a single c.nop reaches the boundary.
        assert_eq!(sec.data.len(), 8);
        let mut expected = Vec::new();
        expected.extend_from_slice(&nop);
        expected.extend_from_slice(&c_nop);
        expected.extend_from_slice(&c_nop);
        assert_eq!(sec.data, expected);
        // The next address after the padding is 8-byte aligned.
        assert_eq!((sec.address + sec.data.len() as u64) % 8, 0);
    }

    #[test]
    fn test_align_with_insufficient_padding_is_an_error() {
        let Fixture { mut ctx, text, .. } = fixture(0);
        ctx.section_mut(text).data = vec![0; 8];
        let obj = ctx.section(text).object;
        let anchor = ctx.add_symbol(Symbol::new(
            "pad",
            obj,
            crate::symbol::SymbolPlacement::Section(text),
        ));
        // Claims 4 bytes of padding but the 8-byte boundary is 6 bytes away.
        ctx.section_mut(text).relocations = vec![Relocation::new(
            2,
            object::elf::R_RISCV_ALIGN,
            anchor,
            4,
        )];

        scan_relocations::<RiscV>(&mut ctx).unwrap();
        let err = run_relaxation::<RiscV>(&mut ctx).unwrap_err().to_string();
        assert!(err.contains("insufficient padding"), "{err}");
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let Fixture { mut ctx, text, .. } = fixture(EF_RISCV_RVC);
        let obj = ctx.section(text).object;
        ctx.section_mut(text).data = call_pair(0);
        let callee = ctx.add_symbol(
            Symbol::new("callee", obj, crate::symbol::SymbolPlacement::Section(text))
                .with_value(8),
        );
        ctx.section_mut(text).relocations = vec![
            Relocation::new(0, object::elf::R_RISCV_CALL_PLT, callee, 0),
            Relocation::new(0, object::elf::R_RISCV_RELAX, callee, 0),
        ];

        scan_relocations::<RiscV>(&mut ctx).unwrap();
        run_relaxation::<RiscV>(&mut ctx).unwrap();
        let data = ctx.section(text).data.clone();
        let offsets: Vec<u64> = ctx.section(text).relocations.iter().map(|r| r.offset).collect();

        // Finalising again with no further passes must change nothing.
        RiscV::finalize_relax(&mut ctx, 0).unwrap();
        assert_eq!(ctx.section(text).data, data);
        let offsets_after: Vec<u64> =
            ctx.section(text).relocations.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, offsets_after);
    }

    #[test]
    fn test_pass_cap_fails_loudly() {
        let Fixture { mut ctx, text, .. } = fixture(EF_RISCV_RVC);
        ctx.config.max_relax_passes = 1;
        let obj = ctx.section(text).object;
        ctx.section_mut(text).data = call_pair(0);
        let callee = ctx.add_symbol(
            Symbol::new("callee", obj, crate::symbol::SymbolPlacement::Section(text))
                .with_value(8),
        );
        ctx.section_mut(text).relocations = vec![
            Relocation::new(0, object::elf::R_RISCV_CALL_PLT, callee, 0),
            Relocation::new(0, object::elf::R_RISCV_RELAX, callee, 0),
        ];

        scan_relocations::<RiscV>(&mut ctx).unwrap();
        let err = run_relaxation::<RiscV>(&mut ctx).unwrap_err().to_string();
        assert!(err.contains("did not converge"), "{err}");
    }

    #[test]
    fn test_relocatable_output_disables_relaxation() {
        let Fixture { mut ctx, text, .. } = fixture(EF_RISCV_RVC);
        ctx.config.relocatable = true;
        let obj = ctx.section(text).object;
        ctx.section_mut(text).data = call_pair(0);
        let callee = ctx.add_symbol(
            Symbol::new("callee", obj, crate::symbol::SymbolPlacement::Section(text))
                .with_value(8),
        );
        ctx.section_mut(text).relocations = vec![
            Relocation::new(0, object::elf::R_RISCV_CALL_PLT, callee, 0),
            Relocation::new(0, object::elf::R_RISCV_RELAX, callee, 0),
        ];

        scan_relocations::<RiscV>(&mut ctx).unwrap();
        assert_eq!(run_relaxation::<RiscV>(&mut ctx).unwrap(), 0);
        assert_eq!(ctx.section(text).data.len(), 8);
    }

    #[test]
    fn test_cheriot_low_reloc_rewrite() {
        let Fixture {
            mut ctx,
            text,
            data,
        } = fixture(0);
        let obj = ctx.section(text).object;
        let mut bytes = utype(op::AUICGP, 3, 0).to_le_bytes().to_vec();
        bytes.extend_from_slice(&itype(0x3003, 10, 21, 0).to_le_bytes());
        ctx.section_mut(text).data = bytes;

        let global = ctx.add_symbol(
            Symbol::new("global", obj, crate::symbol::SymbolPlacement::Section(data))
                .with_value(0x20),
        );
        let marker = ctx.add_symbol(Symbol::new(
            ".Lhi",
            obj,
            crate::symbol::SymbolPlacement::Section(text),
        ));
        ctx.section_mut(text).relocations = vec![
            Relocation::new(0, cheri::R_RISCV_CHERIOT_COMPARTMENT_HI, global, 7),
            Relocation::new(4, cheri::R_RISCV_CHERIOT_COMPARTMENT_LO_I, marker, 0),
        ];

        scan_relocations::<RiscV>(&mut ctx).unwrap();
        run_relaxation::<RiscV>(&mut ctx).unwrap();

        // The LO_I now targets the HI's ultimate symbol so a deleted auicgp
        // can't strand it.
        let rel = &ctx.section(text).relocations[1];
        assert_eq!(rel.symbol, global);
        assert_eq!(rel.addend, 7);
    }

    #[test]
    fn test_cheriot_low_reloc_rewrite_missing_hi() {
        let Fixture { mut ctx, text, .. } = fixture(0);
        let obj = ctx.section(text).object;
        ctx.section_mut(text).data = vec![0; 8];
        let marker = ctx.add_symbol(Symbol::new(
            ".Lhi",
            obj,
            crate::symbol::SymbolPlacement::Section(text),
        ));
        ctx.section_mut(text).relocations = vec![Relocation::new(
            4,
            cheri::R_RISCV_CHERIOT_COMPARTMENT_LO_I,
            marker,
            0,
        )];

        scan_relocations::<RiscV>(&mut ctx).unwrap();
        let err = run_relaxation::<RiscV>(&mut ctx).unwrap_err().to_string();
        assert!(err.contains("paired high relocation"), "{err}");
    }
}
