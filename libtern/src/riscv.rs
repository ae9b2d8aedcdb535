use crate::arch::Arch;
use crate::arch::Architecture;
use crate::config::Config;
use crate::context::LinkContext;
use crate::error::Result;
use crate::relocation::RelExpr;
use crate::relocation::Relocation;
use crate::section::InputObject;
use crate::symbol::SymbolId;
use linker_utils::bit_misc::fits_signed;
use linker_utils::bit_misc::fits_unsigned;
use linker_utils::bit_misc::BitExtraction as _;
use linker_utils::elf::cheri;
use linker_utils::elf::riscv_rel_type_to_string;
use linker_utils::riscv::hi20;
use linker_utils::riscv::itype;
use linker_utils::riscv::lo12;
use linker_utils::riscv::op;
use linker_utils::riscv::reg;
use linker_utils::riscv::rtype;
use linker_utils::riscv::utype;
use object::elf::EF_RISCV_FLOAT_ABI;
use object::elf::EF_RISCV_RVC;
use object::elf::EF_RISCV_RVE;

pub struct RiscV;

/// Offset of the first TLS variable from the start of its module's block, as
/// the dynamic linker's `__tls_get_addr` expects it.
const DTP_OFFSET: u64 = 0x800;

impl Arch for RiscV {
    const KIND: Architecture = Architecture::RiscV;

    const PLT_HEADER_SIZE: usize = 32;
    const PLT_ENTRY_SIZE: usize = 16;

    fn elf_header_arch_magic() -> u16 {
        object::elf::EM_RISCV
    }

    fn rel_type_to_string(r_type: u32) -> std::borrow::Cow<'static, str> {
        riscv_rel_type_to_string(r_type)
    }

    fn calc_eflags(objects: &[InputObject]) -> Result<u32> {
        // With only binary inputs there are no flags to merge.
        let Some(first) = objects.first() else {
            return Ok(0);
        };
        let mut target = first.eflags;

        for object in objects {
            let eflags = object.eflags;
            if eflags & EF_RISCV_RVC != 0 {
                target |= EF_RISCV_RVC;
            }
            crate::ensure!(
                (eflags & EF_RISCV_FLOAT_ABI) == (target & EF_RISCV_FLOAT_ABI),
                "{}: cannot link object files with different floating-point ABI",
                object.name
            );
            crate::ensure!(
                (eflags & EF_RISCV_RVE) == (target & EF_RISCV_RVE),
                "{}: cannot link object files with different EF_RISCV_RVE",
                object.name
            );
            crate::ensure!(
                (eflags & cheri::EF_RISCV_CHERIABI) == (target & cheri::EF_RISCV_CHERIABI),
                "{}: cannot link object files with different EF_RISCV_CHERIABI",
                object.name
            );
            crate::ensure!(
                (eflags & cheri::EF_RISCV_CAP_MODE) == (target & cheri::EF_RISCV_CAP_MODE),
                "{}: cannot link object files with different EF_RISCV_CAP_MODE",
                object.name
            );
        }

        Ok(target)
    }

    fn calc_is_cheri_abi(config: &Config, objects: &[InputObject]) -> Result<bool> {
        let is_cheri_abi = config.eflags & cheri::EF_RISCV_CHERIABI != 0;

        if config.is_cheri_abi && !objects.is_empty() && !is_cheri_abi {
            crate::bail!(
                "{}: object file is non-CheriABI but emulation forces it",
                objects[0].name
            );
        }

        Ok(is_cheri_abi)
    }

    fn capability_size(config: &Config) -> u32 {
        if config.is_64 { 16 } else { 8 }
    }

    fn get_implicit_addend(config: &Config, buf: &[u8], r_type: u32) -> Result<i64> {
        match r_type {
            object::elf::R_RISCV_32
            | object::elf::R_RISCV_TLS_DTPMOD32
            | object::elf::R_RISCV_TLS_DTPREL32 => {
                check_len(buf, 4, r_type)?;
                Ok(i64::from(read32(buf) as i32))
            }
            object::elf::R_RISCV_64 => {
                check_len(buf, 8, r_type)?;
                Ok(read64(buf) as i64)
            }
            object::elf::R_RISCV_RELATIVE | object::elf::R_RISCV_IRELATIVE => {
                if config.is_64 {
                    check_len(buf, 8, r_type)?;
                    Ok(read64(buf) as i64)
                } else {
                    check_len(buf, 4, r_type)?;
                    Ok(i64::from(read32(buf)))
                }
            }
            // Defined as not having an implicit addend.
            object::elf::R_RISCV_NONE | object::elf::R_RISCV_JUMP_SLOT => Ok(0),
            _ => crate::bail!(
                "cannot read addend for relocation {}",
                riscv_rel_type_to_string(r_type)
            ),
        }
    }

    fn get_dyn_rel(config: &Config, r_type: u32) -> u32 {
        let symbolic_rel = if config.is_64 {
            object::elf::R_RISCV_64
        } else {
            object::elf::R_RISCV_32
        };
        if r_type == symbolic_rel {
            r_type
        } else {
            object::elf::R_RISCV_NONE
        }
    }

    fn get_rel_expr(ctx: &LinkContext, rel: &Relocation) -> Result<RelExpr> {
        let expr = match rel.r_type {
            object::elf::R_RISCV_NONE => RelExpr::None,
            object::elf::R_RISCV_32
            | object::elf::R_RISCV_64
            | object::elf::R_RISCV_HI20
            | object::elf::R_RISCV_LO12_I
            | object::elf::R_RISCV_LO12_S
            | object::elf::R_RISCV_RVC_LUI => RelExpr::Abs,
            object::elf::R_RISCV_ADD8
            | object::elf::R_RISCV_ADD16
            | object::elf::R_RISCV_ADD32
            | object::elf::R_RISCV_ADD64
            | object::elf::R_RISCV_SET6
            | object::elf::R_RISCV_SET8
            | object::elf::R_RISCV_SET16
            | object::elf::R_RISCV_SET32
            | object::elf::R_RISCV_SUB6
            | object::elf::R_RISCV_SUB8
            | object::elf::R_RISCV_SUB16
            | object::elf::R_RISCV_SUB32
            | object::elf::R_RISCV_SUB64 => RelExpr::AbsAdd,
            object::elf::R_RISCV_JAL
            | cheri::R_RISCV_CHERI_CJAL
            | object::elf::R_RISCV_BRANCH
            | object::elf::R_RISCV_PCREL_HI20
            | object::elf::R_RISCV_RVC_BRANCH
            | object::elf::R_RISCV_RVC_JUMP
            | cheri::R_RISCV_CHERI_RVC_CJUMP
            | object::elf::R_RISCV_32_PCREL => RelExpr::Pc,
            object::elf::R_RISCV_CALL
            | object::elf::R_RISCV_CALL_PLT
            | cheri::R_RISCV_CHERI_CCALL => RelExpr::PltPc,
            object::elf::R_RISCV_GOT_HI20 => RelExpr::GotPc,
            object::elf::R_RISCV_PCREL_LO12_I | object::elf::R_RISCV_PCREL_LO12_S => {
                RelExpr::PcIndirect
            }
            object::elf::R_RISCV_TLS_GD_HI20 => RelExpr::TlsGdPc,
            object::elf::R_RISCV_TLS_GOT_HI20 => {
                // An initial-exec reference constrains later dynamic-tag
                // emission.
                ctx.has_static_tls_model.set(true);
                RelExpr::GotPc
            }
            object::elf::R_RISCV_TPREL_HI20
            | object::elf::R_RISCV_TPREL_LO12_I
            | object::elf::R_RISCV_TPREL_LO12_S => RelExpr::TpRel,
            object::elf::R_RISCV_TPREL_ADD | cheri::R_RISCV_CHERI_TPREL_CINCOFFSET => {
                RelExpr::None
            }
            object::elf::R_RISCV_ALIGN => RelExpr::RelaxHint,
            cheri::R_RISCV_CHERI_CAPABILITY => RelExpr::CheriCapability,
            cheri::R_RISCV_CHERI_CAPTAB_PCREL_HI20 => RelExpr::CheriCaptabPc,
            cheri::R_RISCV_CHERI_TLS_IE_CAPTAB_PCREL_HI20 => RelExpr::CheriTlsIeCaptabPc,
            cheri::R_RISCV_CHERI_TLS_GD_CAPTAB_PCREL_HI20 => RelExpr::CheriTlsGdCaptabPc,
            cheri::R_RISCV_CHERIOT_COMPARTMENT_HI => {
                if ctx.is_pcc_relative(rel.symbol) {
                    RelExpr::Pc
                } else {
                    RelExpr::CheriotCgpRelHi
                }
            }
            cheri::R_RISCV_CHERIOT_COMPARTMENT_LO_I => RelExpr::CheriotCgpRelLoI,
            cheri::R_RISCV_CHERIOT_COMPARTMENT_LO_S => RelExpr::CheriotCgpRelLoS,
            cheri::R_RISCV_CHERIOT_COMPARTMENT_SIZE => RelExpr::CheriotSize,
            object::elf::R_RISCV_RELAX => {
                if ctx.config.relax {
                    RelExpr::RelaxHint
                } else {
                    RelExpr::None
                }
            }
            _ => crate::bail!(
                "unknown relocation ({}) at offset 0x{:x} against symbol {}",
                rel.r_type,
                rel.offset,
                ctx.symbols[rel.symbol].name
            ),
        };
        Ok(expr)
    }

    fn relocate(ctx: &LinkContext, loc: &mut [u8], rel: &Relocation, value: u64) -> Result {
        match rel.r_type {
            cheri::R_RISCV_CHERIOT_COMPARTMENT_HI => {
                relocate_compartment_hi(ctx, loc, rel, value)
            }
            cheri::R_RISCV_CHERIOT_COMPARTMENT_LO_I => {
                relocate_compartment_lo_i(ctx, loc, rel, value)
            }
            cheri::R_RISCV_CHERI_CAPABILITY => crate::bail!(
                "{} must be written by the capability relocation writer",
                riscv_rel_type_to_string(rel.r_type)
            ),
            _ => patch(&ctx.config, loc, rel.r_type, value),
        }
    }

    fn write_got_header(config: &Config, buf: &mut [u8], dynamic_address: u64) -> Result {
        write_word(config, buf, dynamic_address)
    }

    fn write_got_plt(config: &Config, buf: &mut [u8], plt_address: u64) -> Result {
        write_word(config, buf, plt_address)
    }

    fn write_igot_plt(config: &Config, buf: &mut [u8], symbol_address: u64) -> Result {
        if config.write_addends {
            write_word(config, buf, symbol_address)?;
        }
        Ok(())
    }

    fn write_plt_header(ctx: &LinkContext, buf: &mut [u8]) -> Result {
        let config = &ctx.config;
        check_buf(buf, Self::PLT_HEADER_SIZE, ".plt header")?;

        // There is no CHERI .got.plt or jump-slot relocation yet, so there
        // can be no lazy binding. Emit a header full of trapping instructions
        // so nothing can use it by accident.
        if config.is_cheri_abi {
            buf[..Self::PLT_HEADER_SIZE].fill(0);
            return Ok(());
        }

        // 1: auipc(c) (c)t2, %pcrel_hi(.got.plt)
        // (c)sub t1, (c)t1, (c)t3
        // l[wdc] (c)t3, %pcrel_lo(1b)((c)t2); (c)t3 = _dl_runtime_resolve
        // addi t1, t1, -pltHeaderSize-12; t1 = &.plt[i] - &.plt[0]
        // addi/cincoffset (c)t0, (c)t2, %pcrel_lo(1b)
        // (if shift != 0): srli t1, t1, shift; t1 = &.got.plt[i] - &.got.plt[0]
        // l[wdc] (c)t0, ptrsize((c)t0); (c)t0 = link_map
        // (c)jr (c)t3
        // (if shift == 0): nop
        let offset = ctx.synthetic.got_plt.wrapping_sub(ctx.synthetic.plt) as u32;
        let ptrsub = if config.is_cheri_abi { op::C_SUB } else { op::SUB };
        let ptrload = load_op(config);
        let ptraddi = if config.is_cheri_abi {
            op::C_INC_OFFSET_IMM
        } else {
            op::ADDI
        };
        // log2(pltEntrySize / ptrsize); zero for CHERI-128, in which case the
        // srli is elided.
        let shift = 2 - u32::from(config.is_64) - u32::from(config.is_cheri_abi);
        let ptrsize = if config.is_cheri_abi {
            Self::capability_size(config)
        } else {
            config.wordsize()
        };

        let header_offset = -(Self::PLT_HEADER_SIZE as i32) - 12;
        write32(&mut buf[0..], utype(op::AUIPC, reg::T2, hi20(offset)));
        write32(&mut buf[4..], rtype(ptrsub, reg::T1, reg::T1, reg::T3));
        write32(&mut buf[8..], itype(ptrload, reg::T3, reg::T2, lo12(offset)));
        write32(
            &mut buf[12..],
            itype(op::ADDI, reg::T1, reg::T1, header_offset as u32 & 0xfff),
        );
        write32(&mut buf[16..], itype(ptraddi, reg::T0, reg::T2, lo12(offset)));
        if shift != 0 {
            write32(&mut buf[20..], itype(op::SRLI, reg::T1, reg::T1, shift));
        }
        let tail = if shift == 0 { 20 } else { 24 };
        write32(&mut buf[tail..], itype(ptrload, reg::T0, reg::T0, ptrsize));
        write32(&mut buf[tail + 4..], itype(op::JALR, 0, reg::T3, 0));
        if shift == 0 {
            write32(&mut buf[28..], itype(op::ADDI, 0, 0, 0));
        }
        Ok(())
    }

    fn write_plt(
        ctx: &LinkContext,
        buf: &mut [u8],
        symbol: SymbolId,
        plt_entry_address: u64,
    ) -> Result {
        let config = &ctx.config;
        check_buf(buf, Self::PLT_ENTRY_SIZE, ".plt entry")?;
        let symbol = &ctx.symbols[symbol];
        // The slot the entry loads through is the symbol's capability-table
        // entry under the CHERI ABI and its .got.plt slot otherwise.
        let slot = if config.is_cheri_abi {
            symbol.captable_address.ok_or_else(|| {
                crate::error!(
                    "no capability table entry allocated for PLT symbol `{}`",
                    symbol.name
                )
            })?
        } else {
            symbol.got_plt_address.ok_or_else(|| {
                crate::error!("no .got.plt slot allocated for PLT symbol `{}`", symbol.name)
            })?
        };

        // 1: auipc(c) (c)t3, %pcrel_hi(f@[.got.plt|.captable])
        // l[wdc] (c)t3, %pcrel_lo(1b)((c)t3)
        // (c)jalr (c)t1, (c)t3
        // nop
        let ptrload = load_op(config);
        let offset = slot.wrapping_sub(plt_entry_address) as u32;
        write32(&mut buf[0..], utype(op::AUIPC, reg::T3, hi20(offset)));
        write32(&mut buf[4..], itype(ptrload, reg::T3, reg::T3, lo12(offset)));
        write32(&mut buf[8..], itype(op::JALR, reg::T1, reg::T3, 0));
        write32(&mut buf[12..], itype(op::ADDI, 0, 0, 0));
        Ok(())
    }

    fn relax_once(ctx: &mut LinkContext, pass: u32) -> Result<bool> {
        crate::relaxation::relax_once(ctx, pass)
    }

    fn finalize_relax(ctx: &mut LinkContext, passes: u32) -> Result {
        crate::relaxation::finalize_relax(ctx, passes)
    }

    fn cheri_required_alignment(size: u64) -> u64 {
        // FIXME: non-CHERIoT CHERI capability formats need a different
        // exponent calculation here.
        let mantissa_width = 9u64;
        let mantissa_mask = (1u64 << (mantissa_width - 1)) - 1;
        let msb_index_plus_one = u64::from(u64::BITS - size.leading_zeros());
        let mut e = msb_index_plus_one.saturating_sub(mantissa_width);
        // Very close to the top of the mantissa range: round up once more.
        if ((size >> (e + 1)) & mantissa_mask) == mantissa_mask {
            e += 1;
        }
        1 << e
    }
}

fn load_op(config: &Config) -> u32 {
    if config.is_cheri_abi {
        if config.is_64 { op::CLC_128 } else { op::CLC_64 }
    } else if config.is_64 {
        op::LD
    } else {
        op::LW
    }
}

/// `auicgp`/`auipcc` write rd in the standard position; everything else is
/// rewritten, so only bits 7..=11 of the existing word survive.
fn relocate_compartment_hi(
    ctx: &LinkContext,
    loc: &mut [u8],
    rel: &Relocation,
    value: u64,
) -> Result {
    let mut val = value;
    let mut opcode = op::AUICGP;
    if ctx.is_pcc_relative(rel.symbol) {
        opcode = op::AUIPCC;
        // The PCC upper immediate is in units of 2048 bytes; round negative
        // displacements up to the next boundary before shifting.
        if (val as i64) < 0 {
            val = val.wrapping_add(0x7ff) & !0x7ff;
        }
        val = ((val as i64) >> 11) as u64;
    }
    check_len(loc, 4, rel.r_type)?;
    let existing_opcode = read32(loc) & 0x7f;
    if existing_opcode != op::AUIPCC && existing_opcode != op::AUICGP {
        tracing::warn!(
            "R_RISCV_CHERIOT_COMPARTMENT_HI relocation applied to instruction \
             with unexpected opcode {existing_opcode:#x}"
        );
    }
    check_int(rel.r_type, val as i64, 20)?;
    let insn = read32(loc) & 0x0000_0f80;
    write32(loc, insn | ((val << 12) as u32) | opcode);
    Ok(())
}

fn relocate_compartment_lo_i(
    ctx: &LinkContext,
    loc: &mut [u8],
    rel: &Relocation,
    value: u64,
) -> Result {
    let mut val = value;
    if ctx.is_pcc_relative(rel.symbol) {
        // Attach a negative sign bit to the low immediate when the offset is
        // negative, unless the upper immediate alone reaches the target, in
        // which case the low part stays zero regardless.
        if (val as i64) >= 0 || (val & 0x7ff) == 0 {
            val &= 0x7ff;
        } else {
            val = (u64::MAX & !0x7ff) | (val & 0x7ff);
        }
    }
    check_int(rel.r_type, val as i64, 12)?;
    check_len(loc, 4, rel.r_type)?;
    write32(loc, (read32(loc) & 0x000f_ffff) | ((val << 20) as u32));
    Ok(())
}

/// Patches one relocated location. Kinds whose application depends on the
/// target symbol are handled in [`RiscV::relocate`]; everything here needs
/// only the computed value.
fn patch(config: &Config, loc: &mut [u8], r_type: u32, val: u64) -> Result {
    match r_type {
        object::elf::R_RISCV_NONE | object::elf::R_RISCV_RELAX => {}

        object::elf::R_RISCV_32 => {
            check_len(loc, 4, r_type)?;
            write32(loc, val as u32);
        }
        object::elf::R_RISCV_64 => {
            check_len(loc, 8, r_type)?;
            write64(loc, val);
        }

        object::elf::R_RISCV_RVC_BRANCH => {
            check_int(r_type, (val as i64) >> 1, 8)?;
            check_alignment(r_type, val, 2)?;
            check_len(loc, 2, r_type)?;
            let insn = read16(loc) & 0xe383;
            let imm8 = (val.extract_bits(8, 8) << 12) as u16;
            let imm4_3 = (val.extract_bits(4, 3) << 10) as u16;
            let imm7_6 = (val.extract_bits(7, 6) << 5) as u16;
            let imm2_1 = (val.extract_bits(2, 1) << 3) as u16;
            let imm5 = (val.extract_bits(5, 5) << 2) as u16;
            write16(loc, insn | imm8 | imm4_3 | imm7_6 | imm2_1 | imm5);
        }

        object::elf::R_RISCV_RVC_JUMP | cheri::R_RISCV_CHERI_RVC_CJUMP => {
            check_int(r_type, (val as i64) >> 1, 11)?;
            check_alignment(r_type, val, 2)?;
            check_len(loc, 2, r_type)?;
            let insn = read16(loc) & 0xe003;
            let imm11 = (val.extract_bits(11, 11) << 12) as u16;
            let imm4 = (val.extract_bits(4, 4) << 11) as u16;
            let imm9_8 = (val.extract_bits(9, 8) << 9) as u16;
            let imm10 = (val.extract_bits(10, 10) << 8) as u16;
            let imm6 = (val.extract_bits(6, 6) << 7) as u16;
            let imm7 = (val.extract_bits(7, 7) << 6) as u16;
            let imm3_1 = (val.extract_bits(3, 1) << 3) as u16;
            let imm5 = (val.extract_bits(5, 5) << 2) as u16;
            write16(
                loc,
                insn | imm11 | imm4 | imm9_8 | imm10 | imm6 | imm7 | imm3_1 | imm5,
            );
        }

        object::elf::R_RISCV_RVC_LUI => {
            let imm = sign_extend_word(config, val.wrapping_add(0x800)) >> 12;
            check_int(r_type, imm, 6)?;
            check_len(loc, 2, r_type)?;
            if imm == 0 {
                // `c.lui rd, 0` is illegal; rewrite to `c.li rd, 0`.
                write16(loc, (read16(loc) & 0x0f83) | 0x4000);
            } else {
                let biased = val.wrapping_add(0x800);
                let imm17 = (biased.extract_bits(17, 17) << 12) as u16;
                let imm16_12 = (biased.extract_bits(16, 12) << 2) as u16;
                write16(loc, (read16(loc) & 0xef83) | imm17 | imm16_12);
            }
        }

        object::elf::R_RISCV_JAL | cheri::R_RISCV_CHERI_CJAL => {
            check_int(r_type, (val as i64) >> 1, 20)?;
            check_alignment(r_type, val, 2)?;
            check_len(loc, 4, r_type)?;
            let insn = read32(loc) & 0xfff;
            let imm20 = (val.extract_bits(20, 20) << 31) as u32;
            let imm10_1 = (val.extract_bits(10, 1) << 21) as u32;
            let imm11 = (val.extract_bits(11, 11) << 20) as u32;
            let imm19_12 = (val.extract_bits(19, 12) << 12) as u32;
            write32(loc, insn | imm20 | imm10_1 | imm11 | imm19_12);
        }

        object::elf::R_RISCV_BRANCH => {
            check_int(r_type, (val as i64) >> 1, 12)?;
            check_alignment(r_type, val, 2)?;
            check_len(loc, 4, r_type)?;
            let insn = read32(loc) & 0x1fff07f;
            let imm12 = (val.extract_bits(12, 12) << 31) as u32;
            let imm10_5 = (val.extract_bits(10, 5) << 25) as u32;
            let imm4_1 = (val.extract_bits(4, 1) << 8) as u32;
            let imm11 = (val.extract_bits(11, 11) << 7) as u32;
            write32(loc, insn | imm12 | imm10_5 | imm4_1 | imm11);
        }

        // auipc[c] + [c]jalr pair; delegates to the hi/lo pair at the same
        // value.
        object::elf::R_RISCV_CALL | object::elf::R_RISCV_CALL_PLT | cheri::R_RISCV_CHERI_CCALL => {
            let hi = sign_extend_word(config, val.wrapping_add(0x800)) >> 12;
            check_int(r_type, hi, 20)?;
            check_len(loc, 8, r_type)?;
            patch(config, loc, object::elf::R_RISCV_PCREL_HI20, val)?;
            patch(config, &mut loc[4..], object::elf::R_RISCV_PCREL_LO12_I, val)?;
        }

        cheri::R_RISCV_CHERI_CAPTAB_PCREL_HI20
        | cheri::R_RISCV_CHERI_TLS_IE_CAPTAB_PCREL_HI20
        | cheri::R_RISCV_CHERI_TLS_GD_CAPTAB_PCREL_HI20
        | object::elf::R_RISCV_GOT_HI20
        | object::elf::R_RISCV_PCREL_HI20
        | object::elf::R_RISCV_TLS_GD_HI20
        | object::elf::R_RISCV_TLS_GOT_HI20
        | object::elf::R_RISCV_TPREL_HI20
        | object::elf::R_RISCV_HI20 => {
            let hi = val.wrapping_add(0x800);
            check_int(r_type, sign_extend_word(config, hi) >> 12, 20)?;
            check_len(loc, 4, r_type)?;
            write32(loc, (read32(loc) & 0xfff) | (hi as u32 & 0xffff_f000));
        }

        object::elf::R_RISCV_PCREL_LO12_I
        | object::elf::R_RISCV_TPREL_LO12_I
        | object::elf::R_RISCV_LO12_I => {
            let hi = val.wrapping_add(0x800) >> 12;
            let lo = val.wrapping_sub(hi << 12);
            check_len(loc, 4, r_type)?;
            write32(loc, (read32(loc) & 0xf_ffff) | (((lo & 0xfff) << 20) as u32));
        }

        object::elf::R_RISCV_PCREL_LO12_S
        | object::elf::R_RISCV_TPREL_LO12_S
        | object::elf::R_RISCV_LO12_S => {
            let hi = val.wrapping_add(0x800) >> 12;
            let lo = val.wrapping_sub(hi << 12);
            check_len(loc, 4, r_type)?;
            let imm11_5 = (lo.extract_bits(11, 5) << 25) as u32;
            let imm4_0 = (lo.extract_bits(4, 0) << 7) as u32;
            write32(loc, (read32(loc) & 0x1fff07f) | imm11_5 | imm4_0);
        }

        object::elf::R_RISCV_ADD8 => {
            check_len(loc, 1, r_type)?;
            loc[0] = loc[0].wrapping_add(val as u8);
        }
        object::elf::R_RISCV_ADD16 => {
            check_len(loc, 2, r_type)?;
            write16(loc, read16(loc).wrapping_add(val as u16));
        }
        object::elf::R_RISCV_ADD32 => {
            check_len(loc, 4, r_type)?;
            write32(loc, read32(loc).wrapping_add(val as u32));
        }
        object::elf::R_RISCV_ADD64 => {
            check_len(loc, 8, r_type)?;
            write64(loc, read64(loc).wrapping_add(val));
        }
        object::elf::R_RISCV_SUB6 => {
            check_len(loc, 1, r_type)?;
            loc[0] = (loc[0] & 0xc0) | ((loc[0] & 0x3f).wrapping_sub(val as u8) & 0x3f);
        }
        object::elf::R_RISCV_SUB8 => {
            check_len(loc, 1, r_type)?;
            loc[0] = loc[0].wrapping_sub(val as u8);
        }
        object::elf::R_RISCV_SUB16 => {
            check_len(loc, 2, r_type)?;
            write16(loc, read16(loc).wrapping_sub(val as u16));
        }
        object::elf::R_RISCV_SUB32 => {
            check_len(loc, 4, r_type)?;
            write32(loc, read32(loc).wrapping_sub(val as u32));
        }
        object::elf::R_RISCV_SUB64 => {
            check_len(loc, 8, r_type)?;
            write64(loc, read64(loc).wrapping_sub(val));
        }
        object::elf::R_RISCV_SET6 => {
            check_len(loc, 1, r_type)?;
            loc[0] = (loc[0] & 0xc0) | (val as u8 & 0x3f);
        }
        object::elf::R_RISCV_SET8 => {
            check_len(loc, 1, r_type)?;
            loc[0] = val as u8;
        }
        object::elf::R_RISCV_SET16 => {
            check_len(loc, 2, r_type)?;
            write16(loc, val as u16);
        }
        object::elf::R_RISCV_SET32 | object::elf::R_RISCV_32_PCREL => {
            check_len(loc, 4, r_type)?;
            write32(loc, val as u32);
        }

        object::elf::R_RISCV_TLS_DTPREL32 => {
            check_len(loc, 4, r_type)?;
            if config.is_cheri_abi {
                write32(loc, val as u32);
            } else {
                write32(loc, val.wrapping_sub(DTP_OFFSET) as u32);
            }
        }
        object::elf::R_RISCV_TLS_DTPREL64 => {
            check_len(loc, 8, r_type)?;
            if config.is_cheri_abi {
                write64(loc, val);
            } else {
                write64(loc, val.wrapping_sub(DTP_OFFSET));
            }
        }

        cheri::R_RISCV_CHERIOT_COMPARTMENT_SIZE => {
            check_uint(r_type, val, 12)?;
            check_len(loc, 4, r_type)?;
            write32(loc, (read32(loc) & 0x000f_ffff) | ((val << 20) as u32));
        }

        cheri::R_RISCV_CHERIOT_COMPARTMENT_LO_S => {
            // Store immediates are split across the word.
            check_len(loc, 4, r_type)?;
            let insn = read32(loc) & 0x1fff07f;
            let val_high = (val & 0xfe0) as u32;
            let val_low = (val & 0x1f) as u32;
            write32(loc, insn | (val_high << 20) | (val_low << 7));
        }

        _ => crate::bail!(
            "cannot apply relocation {}",
            riscv_rel_type_to_string(r_type)
        ),
    }
    Ok(())
}

fn sign_extend_word(config: &Config, value: u64) -> i64 {
    if config.is_64 {
        value as i64
    } else {
        i64::from(value as u32 as i32)
    }
}

fn check_int(r_type: u32, value: i64, bits: u32) -> Result {
    crate::ensure!(
        fits_signed(value, bits),
        "relocation {} out of range: {} is not a signed {}-bit value",
        riscv_rel_type_to_string(r_type),
        value,
        bits
    );
    Ok(())
}

fn check_uint(r_type: u32, value: u64, bits: u32) -> Result {
    crate::ensure!(
        fits_unsigned(value, bits),
        "relocation {} out of range: {} is not an unsigned {}-bit value",
        riscv_rel_type_to_string(r_type),
        value,
        bits
    );
    Ok(())
}

fn check_alignment(r_type: u32, value: u64, alignment: u64) -> Result {
    crate::ensure!(
        value & (alignment - 1) == 0,
        "relocation {} improperly aligned: 0x{:x} is not aligned to {} bytes",
        riscv_rel_type_to_string(r_type),
        value,
        alignment
    );
    Ok(())
}

fn check_len(loc: &[u8], size: usize, r_type: u32) -> Result {
    crate::ensure!(
        loc.len() >= size,
        "relocation {} runs past the end of its section",
        riscv_rel_type_to_string(r_type)
    );
    Ok(())
}

fn check_buf(buf: &[u8], size: usize, what: &str) -> Result {
    crate::ensure!(buf.len() >= size, "insufficient space allocated for {what}");
    Ok(())
}

fn write_word(config: &Config, buf: &mut [u8], value: u64) -> Result {
    if config.is_64 {
        check_buf(buf, 8, "a GOT entry")?;
        write64(buf, value);
    } else {
        check_buf(buf, 4, "a GOT entry")?;
        write32(buf, value as u32);
    }
    Ok(())
}

pub(crate) fn read16(loc: &[u8]) -> u16 {
    u16::from_le_bytes([loc[0], loc[1]])
}

pub(crate) fn read32(loc: &[u8]) -> u32 {
    u32::from_le_bytes([loc[0], loc[1], loc[2], loc[3]])
}

pub(crate) fn read64(loc: &[u8]) -> u64 {
    u64::from_le_bytes([
        loc[0], loc[1], loc[2], loc[3], loc[4], loc[5], loc[6], loc[7],
    ])
}

pub(crate) fn write16(loc: &mut [u8], value: u16) {
    loc[..2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write32(loc: &mut [u8], value: u32) {
    loc[..4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write64(loc: &mut [u8], value: u64) {
    loc[..8].copy_from_slice(&value.to_le_bytes());
}
