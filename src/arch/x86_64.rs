//! Architecture-specific code: the probe instruction, MXCSR control, and
//! the kernel signal-frame layout.
//!
//! Everything the rest of the crate knows about x86-64 lives here or in
//! [`crate::decode`]: probe emission, faulting-address recovery, and
//! instruction lengths. A port starts by replacing these.

use bitflags::bitflags;
use core::arch::asm;

use crate::redzone;

bitflags! {
    /// The SSE control and status register.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Mxcsr: u32 {
        /// Underflow exception mask; clearing it makes underflow trap.
        const UNDERFLOW_MASK = 1 << 11;
        /// Flush-to-zero. Denormal results are squashed to zero, which is
        /// what turns the probe's denormal sum into an underflow exception
        /// in the first place.
        const FLUSH_TO_ZERO = 1 << 15;
    }
}

/// Read MXCSR.
#[inline]
pub fn mxcsr() -> Mxcsr {
    let mut raw: u32 = 0;
    // SAFETY: `stmxcsr` stores to the 4-byte slot we point it at.
    unsafe {
        asm!(
            "stmxcsr [{}]",
            in(reg) core::ptr::addr_of_mut!(raw),
            options(nostack, preserves_flags),
        );
    }
    Mxcsr::from_bits_retain(raw)
}

/// Write MXCSR.
#[inline]
pub fn set_mxcsr(value: Mxcsr) {
    let raw = value.bits();
    // SAFETY: `ldmxcsr` loads from the 4-byte slot we point it at. Reserved
    // bits are only ever round-tripped from a previous `stmxcsr`.
    unsafe {
        asm!(
            "ldmxcsr [{}]",
            in(reg) core::ptr::addr_of!(raw),
            options(nostack, readonly),
        );
    }
}

/// Emit one probe: a scalar single-precision add of the magic addend
/// against the four bytes at `addr`.
///
/// The result is discarded; the only observable effect is the underflow
/// trap raised when the bytes at `addr` encode the poison pattern (and
/// flush-to-zero plus the unmasked underflow exception are in effect).
///
/// # Safety
///
/// `addr` must be readable. The probe never writes memory.
#[inline(always)]
pub unsafe fn fp_probe(addr: *const u8) {
    asm!(
        "vaddss xmm15, {addend}, dword ptr [{ptr}]",
        ptr = in(reg) addr,
        addend = in(xmm_reg) redzone::PROBE_ADDEND,
        out("xmm15") _,
        options(nostack),
    );
}

/// Read the current stack pointer.
#[inline(always)]
pub fn stack_pointer() -> usize {
    let sp: usize;
    // SAFETY: reading `rsp` has no side effects.
    unsafe {
        asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack, preserves_flags));
    }
    sp
}

/// Serialize instruction fetch after writing code that is about to be
/// executed.
#[inline]
pub fn fence_code() {
    // SAFETY: `lfence` has no operands.
    unsafe {
        asm!("lfence", options(nostack, preserves_flags));
    }
}

// Kernel signal-frame ABI.
//
// The kernel builds the handler's third argument as a `struct ucontext`
// whose `uc_mcontext` is `struct sigcontext_64` (the layout glibc's
// `REG_*` indices overlay). Only the fields the handler touches are given
// accessors; the rest are carried for layout.

/// `stack_t`.
#[repr(C)]
pub struct SignalStack {
    pub ss_sp: *mut u8,
    pub ss_flags: i32,
    pub ss_size: usize,
}

/// `struct sigcontext_64`.
#[repr(C)]
pub struct MContext {
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rsp: u64,
    pub rip: u64,
    pub eflags: u64,
    pub cs: u16,
    pub gs: u16,
    pub fs: u16,
    pub ss: u16,
    pub err: u64,
    pub trapno: u64,
    pub oldmask: u64,
    pub cr2: u64,
    pub fpstate: *mut FpState,
    reserved: [u64; 8],
}

impl MContext {
    /// Value of the general register with the given hardware encoding
    /// (0 = RAX … 15 = R15).
    pub fn gpr(&self, index: u8) -> u64 {
        match index {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self.rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            15 => self.r15,
            _ => 0,
        }
    }
}

/// `struct ucontext`, as far as the handler needs it.
#[repr(C)]
pub struct UContext {
    pub uc_flags: u64,
    pub uc_link: *mut UContext,
    pub uc_stack: SignalStack,
    pub uc_mcontext: MContext,
    pub uc_sigmask: u64,
}

/// The legacy FXSAVE area the kernel points `fpstate` at.
#[repr(C)]
pub struct FpState {
    pub cwd: u16,
    pub swd: u16,
    pub ftw: u16,
    pub fop: u16,
    pub rip: u64,
    pub rdp: u64,
    pub mxcsr: u32,
    pub mxcsr_mask: u32,
    pub st_space: [u32; 32],
    pub xmm_space: [u32; 64],
    reserved2: [u32; 12],
    reserved3: [u32; 12],
}

impl FpState {
    /// The saved XMM register `i` as four little-endian words.
    pub fn xmm(&self, i: usize) -> [u32; 4] {
        let b = i * 4;
        [
            self.xmm_space[b],
            self.xmm_space[b + 1],
            self.xmm_space[b + 2],
            self.xmm_space[b + 3],
        ]
    }

    pub fn set_xmm(&mut self, i: usize, value: [u32; 4]) {
        self.xmm_space[i * 4..i * 4 + 4].copy_from_slice(&value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn frame_layout_matches_kernel() {
        // Offsets per asm/sigcontext.h; glibc's REG_RIP (gregs[16]) and
        // friends overlay the same words.
        assert_eq!(offset_of!(MContext, r8), 0);
        assert_eq!(offset_of!(MContext, rip), 16 * 8);
        assert_eq!(offset_of!(MContext, cr2), 22 * 8);
        assert_eq!(offset_of!(MContext, fpstate), 23 * 8);
        assert_eq!(size_of::<FpState>(), 512);
        assert_eq!(offset_of!(FpState, xmm_space), 160);
        assert_eq!(offset_of!(UContext, uc_mcontext), 40);
    }

    #[test]
    fn gpr_follows_hardware_encoding() {
        let mut ctx: MContext = unsafe { core::mem::zeroed() };
        ctx.rax = 1;
        ctx.rsp = 2;
        ctx.r13 = 3;
        assert_eq!(ctx.gpr(0), 1);
        assert_eq!(ctx.gpr(4), 2);
        assert_eq!(ctx.gpr(13), 3);
    }

    #[test]
    fn mxcsr_roundtrip() {
        let saved = mxcsr();
        set_mxcsr(saved | Mxcsr::FLUSH_TO_ZERO);
        assert!(mxcsr().contains(Mxcsr::FLUSH_TO_ZERO));
        set_mxcsr(saved);
        assert_eq!(mxcsr(), saved);
    }
}
