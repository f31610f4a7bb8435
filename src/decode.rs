//! Recovery of the memory operand behind a faulting probe, and instruction
//! lengths for the benign re-execution path.
//!
//! The probe is always a VEX-encoded scalar single-precision add, so
//! [`fault_operand`] only speaks that dialect: a two- or three-byte VEX
//! prefix, opcode `0x58`, and a ModR/M-described memory operand. Anything
//! else is reported as "not ours" and handled as a generic underflow,
//! whose length comes from [`insn_len`]'s full decoder instead.

use iced_x86::{Decoder, DecoderOptions};

use crate::arch::MContext;

const RSP: u8 = 4;
const RBP: u8 = 5;
const R13: u8 = 13;
/// "No register" marker for suppressed base/index.
const RNONE: u8 = 16;

/// What a ModR/M row says about the memory operand: the base register
/// (before SIB replaces it), whether a SIB byte follows, and the
/// displacement width in bytes.
#[derive(Clone, Copy)]
struct ModRm {
    base: u8,
    sib: bool,
    disp: u8,
}

const fn m(base: u8, sib: bool, disp: u8) -> Option<ModRm> {
    Some(ModRm { base, sib, disp })
}

/// Rows are `mod` 0..=2 (register-direct `mod == 11` is rejected before
/// lookup); columns are the REX-extended `rm`. `None` marks the
/// RIP-relative encodings the probe never uses.
#[rustfmt::skip]
static MODRM: [[Option<ModRm>; 16]; 3] = [
    // mod 00: no displacement; rm 5/13 would be RIP-relative.
    [
        m(0, false, 0), m(1, false, 0), m(2, false, 0), m(3, false, 0),
        m(4, true, 0),  None,           m(6, false, 0), m(7, false, 0),
        m(8, false, 0), m(9, false, 0), m(10, false, 0), m(11, false, 0),
        m(12, true, 0), None,           m(14, false, 0), m(15, false, 0),
    ],
    // mod 01: 8-bit displacement.
    [
        m(0, false, 1), m(1, false, 1), m(2, false, 1), m(3, false, 1),
        m(4, true, 1),  m(5, false, 1), m(6, false, 1), m(7, false, 1),
        m(8, false, 1), m(9, false, 1), m(10, false, 1), m(11, false, 1),
        m(12, true, 1), m(13, false, 1), m(14, false, 1), m(15, false, 1),
    ],
    // mod 10: 32-bit displacement.
    [
        m(0, false, 4), m(1, false, 4), m(2, false, 4), m(3, false, 4),
        m(4, true, 4),  m(5, false, 4), m(6, false, 4), m(7, false, 4),
        m(8, false, 4), m(9, false, 4), m(10, false, 4), m(11, false, 4),
        m(12, true, 4), m(13, false, 4), m(14, false, 4), m(15, false, 4),
    ],
];

const SCALES: [u64; 4] = [1, 2, 4, 8];

/// Decode the VEX ADDSS at `op` and compute the address of its memory
/// operand from the saved register file. Returns the address and the
/// instruction length, or `None` when the instruction is not a probe
/// (wrong opcode, register-direct form, RIP-relative operand).
///
/// # Safety
///
/// `op` must point at the bytes of a complete instruction.
pub unsafe fn fault_operand(op: *const u8, ctx: &MContext) -> Option<(usize, usize)> {
    let byte = |i: usize| *op.add(i);

    let rex_x: u8;
    let rex_b: u8;
    let mut pos: usize;
    match byte(0) {
        // Two-byte VEX: X and B are implied zero.
        0xc5 => {
            if byte(2) != 0x58 {
                return None;
            }
            rex_x = 0;
            rex_b = 0;
            pos = 3;
        }
        // Three-byte VEX carries inverted X and B.
        0xc4 => {
            if byte(3) != 0x58 {
                return None;
            }
            rex_x = 1 ^ ((byte(1) >> 6) & 1);
            rex_b = 1 ^ ((byte(1) >> 5) & 1);
            pos = 4;
        }
        _ => return None,
    }

    let modrm = byte(pos);
    let mode = modrm >> 6;
    let rm = (rex_b << 3) | (modrm & 0x7);
    pos += 1;

    if mode == 3 {
        // Register-to-register adds carry no memory operand.
        return None;
    }
    let entry = MODRM[mode as usize][rm as usize]?;

    let mut base = entry.base;
    let mut index = RNONE;
    let mut scale = 0u64;
    let mut disp_width = entry.disp;

    if entry.sib {
        let sib = byte(pos);
        scale = SCALES[((sib >> 6) & 0x3) as usize];
        index = (rex_x << 3) | ((sib >> 3) & 0x7);
        base = (rex_b << 3) | (sib & 0x7);
        if mode == 0 {
            if index == RSP && (base == RBP || base == R13) {
                return None;
            }
            if index == RSP {
                index = RNONE;
            }
            if base == RBP || base == R13 {
                // Base suppressed; the ISA puts a 32-bit displacement here.
                base = RNONE;
                disp_width = 4;
            }
        } else if index == RSP {
            index = RNONE;
        }
        pos += 1;
    }

    let mut disp: i64 = 0;
    match disp_width {
        1 => {
            disp = byte(pos) as i8 as i64;
            pos += 1;
        }
        4 => {
            let raw = u32::from_le_bytes([byte(pos), byte(pos + 1), byte(pos + 2), byte(pos + 3)]);
            disp = raw as i32 as i64;
            pos += 4;
        }
        _ => {}
    }

    let mut addr: u64 = 0;
    if base != RNONE {
        addr = addr.wrapping_add(ctx.gpr(base));
    }
    if index != RNONE {
        addr = addr.wrapping_add(ctx.gpr(index).wrapping_mul(scale));
    }
    addr = addr.wrapping_add(disp as u64);

    Some((addr as usize, pos))
}

/// Longest legal x86-64 instruction.
pub const MAX_INSN_BYTES: usize = 15;

/// Length of the instruction at `op`, or `None` if the bytes do not
/// decode.
///
/// Unlike [`fault_operand`], which only ever sees the one instruction the
/// instrumentation emits, the re-execution path can meet any
/// underflow-raising instruction the program or its libraries contain, so
/// the length comes from a full decoder rather than more tables.
///
/// # Safety
///
/// `op` must be readable for [`MAX_INSN_BYTES`] bytes.
pub unsafe fn insn_len(op: *const u8) -> Option<usize> {
    let window = core::slice::from_raw_parts(op, MAX_INSN_BYTES);
    let mut decoder = Decoder::with_ip(64, window, op as u64, DecoderOptions::NONE);
    let instruction = decoder.decode();
    if instruction.is_invalid() {
        return None;
    }
    Some(instruction.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::MContext;

    fn ctx() -> MContext {
        let mut c: MContext = unsafe { core::mem::zeroed() };
        c.rax = 0x10000;
        c.rcx = 0x400;
        c.rbp = 0x7fff_0000;
        c.r8 = 0x20000;
        c.r13 = 0x30000;
        c.rsp = 0x5000;
        c
    }

    fn operand(bytes: &[u8]) -> Option<(usize, usize)> {
        unsafe { fault_operand(bytes.as_ptr(), &ctx()) }
    }

    fn len(bytes: &[u8]) -> Option<usize> {
        // `insn_len` reads a full decode window; pad short encodings out
        // with nops.
        let mut window = [0x90u8; MAX_INSN_BYTES];
        window[..bytes.len()].copy_from_slice(bytes);
        unsafe { insn_len(window.as_ptr()) }
    }

    #[test]
    fn vex2_plain_base() {
        // vaddss xmm0, xmm1, [rax]
        assert_eq!(operand(&[0xc5, 0xf2, 0x58, 0x00]), Some((0x10000, 4)));
    }

    #[test]
    fn vex2_disp8_and_disp32() {
        // vaddss xmm0, xmm1, [rax + 0x10]
        assert_eq!(operand(&[0xc5, 0xf2, 0x58, 0x40, 0x10]), Some((0x10010, 5)));
        // vaddss xmm0, xmm1, [rax - 0x10]
        assert_eq!(operand(&[0xc5, 0xf2, 0x58, 0x40, 0xf0]), Some((0xfff0, 5)));
        // vaddss xmm0, xmm1, [rax + 0x12345]
        assert_eq!(
            operand(&[0xc5, 0xf2, 0x58, 0x80, 0x45, 0x23, 0x01, 0x00]),
            Some((0x10000 + 0x12345, 8))
        );
    }

    #[test]
    fn vex2_sib_scaled_index() {
        // vaddss xmm0, xmm1, [rax + rcx*4]
        assert_eq!(
            operand(&[0xc5, 0xf2, 0x58, 0x04, 0x88]),
            Some((0x10000 + 0x400 * 4, 5))
        );
        // vaddss xmm0, xmm1, [rax + rcx*8 + 0x20]
        assert_eq!(
            operand(&[0xc5, 0xf2, 0x58, 0x44, 0xc8, 0x20]),
            Some((0x10000 + 0x400 * 8 + 0x20, 6))
        );
    }

    #[test]
    fn sib_index_rsp_is_suppressed() {
        // SIB index field 100 means "no index" regardless of scale.
        assert_eq!(operand(&[0xc5, 0xf2, 0x58, 0x04, 0xa0]), Some((0x10000, 5)));
        assert_eq!(
            operand(&[0xc5, 0xf2, 0x58, 0x44, 0x60, 0x08]),
            Some((0x10008, 6))
        );
    }

    #[test]
    fn sib_base_rbp_at_mod0_takes_disp32() {
        // vaddss xmm0, xmm1, [rcx*4 + 0x40]: base 101 with mod 00 is
        // suppressed and a 32-bit displacement follows.
        assert_eq!(
            operand(&[0xc5, 0xf2, 0x58, 0x04, 0x8d, 0x40, 0x00, 0x00, 0x00]),
            Some((0x400 * 4 + 0x40, 9))
        );
    }

    #[test]
    fn vex3_reaches_high_registers() {
        // vaddss xmm0, xmm1, [r8] (VEX.B set)
        assert_eq!(
            operand(&[0xc4, 0xc1, 0x72, 0x58, 0x00]),
            Some((0x20000, 5))
        );
        // vaddss xmm0, xmm1, [r8 + rcx*2] via SIB with VEX.B
        assert_eq!(
            operand(&[0xc4, 0xc1, 0x72, 0x58, 0x04, 0x48]),
            Some((0x20000 + 0x400 * 2, 6))
        );
    }

    #[test]
    fn rejects_non_probe_forms() {
        // Not VEX at all.
        assert_eq!(operand(&[0x0f, 0x58, 0x00]), None);
        // VEX but not ADDSS.
        assert_eq!(operand(&[0xc5, 0xf2, 0x59, 0x00]), None);
        // Register-direct.
        assert_eq!(operand(&[0xc5, 0xf2, 0x58, 0xc1]), None);
        // RIP-relative.
        assert_eq!(
            operand(&[0xc5, 0xf2, 0x58, 0x05, 0x00, 0x00, 0x00, 0x00]),
            None
        );
        // mod 00, SIB with index RSP and base RBP.
        assert_eq!(
            operand(&[0xc5, 0xf2, 0x58, 0x04, 0x25, 0x00, 0x00, 0x00, 0x00]),
            None
        );
    }

    #[test]
    fn lengths_for_legacy_sse() {
        // movss xmm0, [rax + rcx*4]
        assert_eq!(len(&[0xf3, 0x0f, 0x10, 0x04, 0x88]), Some(5));
        // addsd xmm0, [rdx + 0x10]
        assert_eq!(len(&[0xf2, 0x0f, 0x58, 0x42, 0x10]), Some(5));
        // addps xmm2, xmm3 (register form)
        assert_eq!(len(&[0x0f, 0x58, 0xd3]), Some(3));
        // cmpss xmm0, [rax], 7 carries an immediate
        assert_eq!(len(&[0xf3, 0x0f, 0xc2, 0x00, 0x07]), Some(5));
        // REX-prefixed mulsd xmm9, [rax]
        assert_eq!(len(&[0xf2, 0x44, 0x0f, 0x59, 0x08]), Some(5));
    }

    #[test]
    fn lengths_for_vex_and_evex() {
        // vaddss xmm0, xmm1, [rax]
        assert_eq!(len(&[0xc5, 0xf2, 0x58, 0x00]), Some(4));
        // vfmadd231ss xmm0, xmm1, [rcx] (map 0F38 via three-byte VEX)
        assert_eq!(len(&[0xc4, 0xe2, 0x71, 0xb9, 0x01]), Some(5));
        // vroundss xmm0, xmm1, [rax], 1 (map 0F3A, immediate)
        assert_eq!(len(&[0xc4, 0xe3, 0x71, 0x0a, 0x00, 0x01]), Some(6));
        // EVEX vaddss xmm0, xmm1, [rax]
        assert_eq!(len(&[0x62, 0xf1, 0x76, 0x08, 0x58, 0x00]), Some(6));
        // EVEX with compressed disp8
        assert_eq!(len(&[0x62, 0xf1, 0x76, 0x08, 0x58, 0x40, 0x01]), Some(7));
    }

    #[test]
    fn length_covers_arbitrary_code() {
        // The re-execution path is not limited to SIMD shapes.
        // add eax, ebx
        assert_eq!(len(&[0x01, 0xd8]), Some(2));
        // mov rax, [rax]
        assert_eq!(len(&[0x48, 0x8b, 0x00]), Some(3));
        // movabs r15, imm64
        assert_eq!(
            len(&[0x49, 0xbf, 1, 2, 3, 4, 5, 6, 7, 8]),
            Some(10)
        );
    }

    #[test]
    fn length_rejects_undecodable_bytes() {
        // 0x06 (push es) does not exist in 64-bit mode.
        assert_eq!(len(&[0x06]), None);
    }
}
