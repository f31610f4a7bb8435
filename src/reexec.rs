//! Benign re-execution of an underflowing instruction that is not a probe.
//!
//! When the trap turns out to come from ordinary floating-point code, the
//! program must observe the IEEE result it would have produced without
//! flush-to-zero. The faulting instruction is copied onto a
//! writable-and-executable scratch page between a prolog that reloads the
//! fifteen general registers from the saved context and an epilog that
//! restores the caller's, and run once with flush-to-zero off. The XMM
//! register file is shuttled in and out of the saved frame around the
//! call, so the instruction's real inputs and outputs flow through the
//! signal context.
//!
//! This path is not safe against a reentrant fault on the same thread
//! (one process-wide page, rewritten per fault); SIGFPE stays blocked
//! while the handler runs, which covers the probe-free window here.

use core::arch::asm;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicPtr, Ordering::Relaxed};

use rustix::mm::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::arch::{self, MContext, Mxcsr};
use crate::decode;
use crate::host;

const PAGE_SIZE: usize = 4096;

// push rax/rbx/rcx/rdx/rdi/rsi/rbp/r8..r15, then movabs each of them with
// a placeholder immediate that run() patches from the saved context.
#[rustfmt::skip]
const PROLOG: [u8; 173] = [
    0x50, 0x53, 0x51, 0x52, 0x57, 0x56, 0x55,
    0x41, 0x50, 0x41, 0x51, 0x41, 0x52, 0x41, 0x53,
    0x41, 0x54, 0x41, 0x55, 0x41, 0x56, 0x41, 0x57,
    0x48, 0xb8, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11, // rax
    0x48, 0xbb, 0x22, 0x22, 0x22, 0x22, 0x22, 0x22, 0x22, 0x22, // rbx
    0x48, 0xb9, 0x33, 0x33, 0x33, 0x33, 0x33, 0x33, 0x33, 0x33, // rcx
    0x48, 0xba, 0x44, 0x44, 0x44, 0x44, 0x44, 0x44, 0x44, 0x44, // rdx
    0x48, 0xbf, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, // rdi
    0x48, 0xbe, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, // rsi
    0x48, 0xbd, 0x77, 0x77, 0x77, 0x77, 0x77, 0x77, 0x77, 0x77, // rbp
    0x49, 0xb8, 0x88, 0x88, 0x88, 0x88, 0x88, 0x88, 0x88, 0x88, // r8
    0x49, 0xb9, 0x99, 0x99, 0x99, 0x99, 0x99, 0x99, 0x99, 0x99, // r9
    0x49, 0xba, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, // r10
    0x49, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb, // r11
    0x49, 0xbc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, // r12
    0x49, 0xbd, 0xdd, 0xdd, 0xdd, 0xdd, 0xdd, 0xdd, 0xdd, 0xdd, // r13
    0x49, 0xbe, 0xee, 0xee, 0xee, 0xee, 0xee, 0xee, 0xee, 0xee, // r14
    0x49, 0xbf, 0xfe, 0xfe, 0xfe, 0xfe, 0xfe, 0xfe, 0xfe, 0xfe, // r15
];

// pop r15..r8, rbp, rsi, rdi, rdx, rcx, rbx, rax; ret.
#[rustfmt::skip]
const EPILOG: [u8; 24] = [
    0x41, 0x5f, 0x41, 0x5e, 0x41, 0x5d, 0x41, 0x5c,
    0x41, 0x5b, 0x41, 0x5a, 0x41, 0x59, 0x41, 0x58,
    0x5d, 0x5e, 0x5f, 0x5a, 0x59, 0x5b, 0x58, 0xc3,
];

/// Offset of the first movabs (past the pushes).
const FIRST_MOVABS: usize = 23;
/// Bytes per movabs, immediate at +2.
const MOVABS_LEN: usize = 10;

static SCRATCH: AtomicPtr<u8> = AtomicPtr::new(null_mut());

fn scratch_page() -> Option<*mut u8> {
    let page = SCRATCH.load(Relaxed);
    if !page.is_null() {
        return Some(page);
    }
    // SAFETY: fresh anonymous mapping.
    let mapped = unsafe {
        mmap_anonymous(
            null_mut(),
            PAGE_SIZE,
            ProtFlags::READ | ProtFlags::WRITE | ProtFlags::EXEC,
            MapFlags::PRIVATE,
        )
    }
    .ok()? as *mut u8;

    match SCRATCH.compare_exchange(null_mut(), mapped, Relaxed, Relaxed) {
        Ok(_) => Some(mapped),
        Err(winner) => {
            // SAFETY: we mapped `mapped` above and lost the race to publish.
            let _ = unsafe { munmap(mapped as *mut _, PAGE_SIZE) };
            Some(winner)
        }
    }
}

/// Write prolog + instruction + epilog into `buf` and patch the prolog
/// immediates from the saved register file. Returns the harness length.
///
/// # Safety
///
/// `buf` must hold at least `PROLOG + insn_len + EPILOG` bytes and `rip`
/// must point at `insn_len` instruction bytes.
unsafe fn assemble(buf: *mut u8, rip: *const u8, insn_len: usize, ctx: &MContext) -> usize {
    host::memcpy_uninterposed(buf, PROLOG.as_ptr(), PROLOG.len());
    host::memcpy_uninterposed(buf.add(PROLOG.len()), rip, insn_len);
    host::memcpy_uninterposed(
        buf.add(PROLOG.len() + insn_len),
        EPILOG.as_ptr(),
        EPILOG.len(),
    );

    let saved = [
        ctx.rax, ctx.rbx, ctx.rcx, ctx.rdx, ctx.rdi, ctx.rsi, ctx.rbp, ctx.r8, ctx.r9, ctx.r10,
        ctx.r11, ctx.r12, ctx.r13, ctx.r14, ctx.r15,
    ];
    for (k, value) in saved.iter().enumerate() {
        (buf.add(FIRST_MOVABS + k * MOVABS_LEN + 2) as *mut u64).write_unaligned(*value);
    }

    PROLOG.len() + insn_len + EPILOG.len()
}

/// Load the saved XMM file, call the harness, and store the XMM file
/// back. One asm block, so nothing the compiler schedules can touch the
/// vector registers between the loads and the call.
unsafe fn call_with_xmm(code: *const u8, xmm: *mut u8) {
    asm!(
        "movdqu xmm0,  xmmword ptr [{x} + 0x00]",
        "movdqu xmm1,  xmmword ptr [{x} + 0x10]",
        "movdqu xmm2,  xmmword ptr [{x} + 0x20]",
        "movdqu xmm3,  xmmword ptr [{x} + 0x30]",
        "movdqu xmm4,  xmmword ptr [{x} + 0x40]",
        "movdqu xmm5,  xmmword ptr [{x} + 0x50]",
        "movdqu xmm6,  xmmword ptr [{x} + 0x60]",
        "movdqu xmm7,  xmmword ptr [{x} + 0x70]",
        "movdqu xmm8,  xmmword ptr [{x} + 0x80]",
        "movdqu xmm9,  xmmword ptr [{x} + 0x90]",
        "movdqu xmm10, xmmword ptr [{x} + 0xa0]",
        "movdqu xmm11, xmmword ptr [{x} + 0xb0]",
        "movdqu xmm12, xmmword ptr [{x} + 0xc0]",
        "movdqu xmm13, xmmword ptr [{x} + 0xd0]",
        "movdqu xmm14, xmmword ptr [{x} + 0xe0]",
        "movdqu xmm15, xmmword ptr [{x} + 0xf0]",
        "call {c}",
        "movdqu xmmword ptr [{x} + 0x00], xmm0",
        "movdqu xmmword ptr [{x} + 0x10], xmm1",
        "movdqu xmmword ptr [{x} + 0x20], xmm2",
        "movdqu xmmword ptr [{x} + 0x30], xmm3",
        "movdqu xmmword ptr [{x} + 0x40], xmm4",
        "movdqu xmmword ptr [{x} + 0x50], xmm5",
        "movdqu xmmword ptr [{x} + 0x60], xmm6",
        "movdqu xmmword ptr [{x} + 0x70], xmm7",
        "movdqu xmmword ptr [{x} + 0x80], xmm8",
        "movdqu xmmword ptr [{x} + 0x90], xmm9",
        "movdqu xmmword ptr [{x} + 0xa0], xmm10",
        "movdqu xmmword ptr [{x} + 0xb0], xmm11",
        "movdqu xmmword ptr [{x} + 0xc0], xmm12",
        "movdqu xmmword ptr [{x} + 0xd0], xmm13",
        "movdqu xmmword ptr [{x} + 0xe0], xmm14",
        "movdqu xmmword ptr [{x} + 0xf0], xmm15",
        x = in(reg) xmm,
        c = in(reg) code,
        out("xmm0") _, out("xmm1") _, out("xmm2") _, out("xmm3") _,
        out("xmm4") _, out("xmm5") _, out("xmm6") _, out("xmm7") _,
        out("xmm8") _, out("xmm9") _, out("xmm10") _, out("xmm11") _,
        out("xmm12") _, out("xmm13") _, out("xmm14") _, out("xmm15") _,
    );
}

/// Re-execute the instruction at `rip` under relaxed floating-point flags
/// and return its length so the handler can step over it. `None` means
/// the harness is unavailable (unmappable page, undecodable instruction).
///
/// # Safety
///
/// Must be called from the SIGFPE handler with `ctx` the saved context of
/// the faulting thread.
pub unsafe fn run(rip: *const u8, ctx: &mut MContext) -> Option<usize> {
    let len = decode::insn_len(rip)?;
    let page = scratch_page()?;
    if ctx.fpstate.is_null() {
        return None;
    }

    assemble(page, rip, len, ctx);
    arch::fence_code();

    let xmm = (*ctx.fpstate).xmm_space.as_mut_ptr() as *mut u8;
    let saved_mxcsr = arch::mxcsr();
    // No flush-to-zero, and underflow masked, so the replay itself cannot
    // trap; the saved MXCSR comes back afterwards, exception flags and all.
    arch::set_mxcsr((saved_mxcsr - Mxcsr::FLUSH_TO_ZERO) | Mxcsr::UNDERFLOW_MASK);
    call_with_xmm(page, xmm);
    arch::set_mxcsr(saved_mxcsr);

    Some(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_are_symmetric() {
        // Fifteen registers saved, reloaded, and restored.
        assert_eq!(PROLOG.len(), FIRST_MOVABS + 15 * MOVABS_LEN);
        assert_eq!(EPILOG.len(), 15 + 8 + 1);
        assert_eq!(EPILOG[EPILOG.len() - 1], 0xc3);

        // Every patch slot sits inside a movabs of the expected register.
        let regs: [(u8, u8); 15] = [
            (0x48, 0xb8), // rax
            (0x48, 0xbb), // rbx
            (0x48, 0xb9), // rcx
            (0x48, 0xba), // rdx
            (0x48, 0xbf), // rdi
            (0x48, 0xbe), // rsi
            (0x48, 0xbd), // rbp
            (0x49, 0xb8), // r8
            (0x49, 0xb9), // r9
            (0x49, 0xba), // r10
            (0x49, 0xbb), // r11
            (0x49, 0xbc), // r12
            (0x49, 0xbd), // r13
            (0x49, 0xbe), // r14
            (0x49, 0xbf), // r15
        ];
        for (k, (rex, opcode)) in regs.iter().enumerate() {
            let at = FIRST_MOVABS + k * MOVABS_LEN;
            assert_eq!(PROLOG[at], *rex, "movabs {k}");
            assert_eq!(PROLOG[at + 1], *opcode, "movabs {k}");
        }
    }

    #[test]
    fn assemble_patches_saved_registers() {
        let insn = [0xc5u8, 0xf2, 0x58, 0x00]; // vaddss xmm0, xmm1, [rax]
        let mut ctx: MContext = unsafe { core::mem::zeroed() };
        ctx.rax = 0x1111_2222_3333_4444;
        ctx.r15 = 0xaaaa_bbbb_cccc_dddd;

        let mut buf = [0u8; 256];
        let len = unsafe { assemble(buf.as_mut_ptr(), insn.as_ptr(), insn.len(), &ctx) };
        assert_eq!(len, PROLOG.len() + insn.len() + EPILOG.len());

        let imm = |k: usize| {
            let at = FIRST_MOVABS + k * MOVABS_LEN + 2;
            u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
        };
        assert_eq!(imm(0), ctx.rax);
        assert_eq!(imm(14), ctx.r15);
        assert_eq!(imm(3), 0); // rdx was zero in the saved file

        assert_eq!(&buf[PROLOG.len()..PROLOG.len() + 4], &insn);
        assert_eq!(buf[len - 1], 0xc3);
    }

    #[test]
    fn replay_produces_ieee_results() {
        if !std::arch::is_x86_feature_detected!("avx") {
            return;
        }
        // addss xmm0, xmm1 on two tiny values: flushed to zero under FTZ,
        // subnormal under the replay's relaxed flags. The buffer is padded
        // out to the decoder's read window.
        let mut insn = [0x90u8; 16];
        insn[..4].copy_from_slice(&[0xf3, 0x0f, 0x58, 0xc1]);
        let mut ctx: MContext = unsafe { core::mem::zeroed() };
        let mut fp: crate::arch::FpState = unsafe { core::mem::zeroed() };
        let tiny = f32::from_bits(0x0080_0001); // just above the subnormal range
        let minus_almost = f32::from_bits(0x8080_0000u32); // -MIN_POSITIVE
        fp.set_xmm(0, [tiny.to_bits(), 0, 0, 0]);
        fp.set_xmm(1, [minus_almost.to_bits(), 0, 0, 0]);
        ctx.fpstate = &mut fp;

        let len = unsafe { run(insn.as_ptr(), &mut ctx) };
        assert_eq!(len, Some(4));

        let sum = f32::from_bits(fp.xmm(0)[0]);
        assert!(sum.is_subnormal(), "{sum:e}");
        assert_eq!(sum, tiny - f32::MIN_POSITIVE);
        // The other registers came back untouched.
        assert_eq!(fp.xmm(1)[0], minus_almost.to_bits());
        assert_eq!(fp.xmm(5), [0; 4]);
    }
}
