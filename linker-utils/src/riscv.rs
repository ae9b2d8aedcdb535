//! RISC-V instruction encoding primitives shared by the PLT writer and the
//! relocation appliers.

/// Base opcodes / funct fields, pre-shifted so that an instruction word is
/// built by OR-ing the register and immediate fields in.
#[allow(unused)]
pub mod op {
    pub const ADDI: u32 = 0x13;
    pub const AUIPC: u32 = 0x17;
    pub const JALR: u32 = 0x67;
    pub const LD: u32 = 0x3003;
    pub const LW: u32 = 0x2003;
    pub const SRLI: u32 = 0x5013;
    pub const SUB: u32 = 0x4000_0033;

    pub const C_INC_OFFSET_IMM: u32 = 0x105b;
    pub const CLC_64: u32 = 0x3003;
    pub const CLC_128: u32 = 0x200f;
    pub const C_SUB: u32 = 0x2800_005b;

    /// Add upper immediate to the program-counter capability.
    pub const AUIPCC: u32 = 0x17;
    /// Add upper immediate to the compartment-globals capability (CHERIoT).
    pub const AUICGP: u32 = 0x7b;
}

#[allow(unused)]
pub mod reg {
    pub const RA: u32 = 1;
    /// CHERIoT compartment globals pointer.
    pub const CGP: u32 = 3;
    pub const T0: u32 = 5;
    pub const T1: u32 = 6;
    pub const T2: u32 = 7;
    pub const T3: u32 = 28;
}

/// A 4-byte `nop` (`addi x0, x0, 0`).
pub const NOP: u32 = 0x0000_0013;
/// A 2-byte `c.nop`.
pub const C_NOP: u16 = 0x0001;

/// Biased upper 20 bits of a 32-bit displacement. The bias compensates for the
/// sign extension of the paired [`lo12`] immediate, so that
/// `(hi20(v) << 12) + sign_extend(lo12(v))` reproduces `v`.
#[must_use]
pub const fn hi20(val: u32) -> u32 {
    val.wrapping_add(0x800) >> 12
}

/// Low 12 bits of a 32-bit displacement, interpreted as signed by the CPU.
#[must_use]
pub const fn lo12(val: u32) -> u32 {
    val & 0xfff
}

#[must_use]
pub const fn itype(op: u32, rd: u32, rs1: u32, imm: u32) -> u32 {
    op | (rd << 7) | (rs1 << 15) | (imm << 20)
}

#[must_use]
pub const fn rtype(op: u32, rd: u32, rs1: u32, rs2: u32) -> u32 {
    op | (rd << 7) | (rs1 << 15) | (rs2 << 20)
}

#[must_use]
pub const fn utype(op: u32, rd: u32, imm: u32) -> u32 {
    op | (rd << 7) | (imm << 12)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign_extend_12(value: u32) -> i32 {
        ((value << 20) as i32) >> 20
    }

    #[test]
    fn test_hi20_lo12_round_trip() {
        for &v in &[
            0u32,
            1,
            0x7ff,
            0x800,
            0x801,
            0xfff,
            0x1000,
            0x7fff_f800,
            0x1234_5678,
            0xffff_ffff, // -1
            0x8000_0000,
            0xdead_beef,
        ] {
            let recombined = (hi20(v) << 12).wrapping_add(sign_extend_12(lo12(v)) as u32);
            assert_eq!(recombined, v, "hi/lo split must round-trip 0x{v:x}");
        }
    }

    #[test]
    fn test_itype() {
        // addi t1, t1, -44
        let imm = (-44i32 as u32) & 0xfff;
        assert_eq!(itype(op::ADDI, reg::T1, reg::T1, imm), 0xfd43_0313);
        // jalr x0, t3, 0
        assert_eq!(itype(op::JALR, 0, reg::T3, 0), 0x000e_0067);
    }

    #[test]
    fn test_utype() {
        // auipc t2, 0x2000
        assert_eq!(utype(op::AUIPC, reg::T2, 0x2000), 0x0200_0397);
    }

    #[test]
    fn test_rtype() {
        // sub t1, t1, t3
        assert_eq!(rtype(op::SUB, reg::T1, reg::T1, reg::T3), 0x41c3_0333);
    }
}
