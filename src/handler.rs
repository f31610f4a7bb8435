//! The underflow trap handler and the signal-registration interposition
//! that keeps it installed.

use core::ffi::{c_int, c_void};

use linux_raw_sys::general::{SA_SIGINFO, SIGFPE};

use crate::arch::{MContext, UContext};
use crate::decode;
use crate::diag;
use crate::host::{self, SigHandler};
use crate::program;
use crate::redzone;
use crate::reexec;

/// glibc's `struct sigaction`. The handler slot leads, which is also what
/// the registration interposition peeks at.
#[repr(C)]
struct Sigaction {
    handler: usize,
    mask: [u64; 16],
    flags: c_int,
    restorer: usize,
}

/// The SIGFPE handler.
///
/// Everything on the resume path is allocation-free and lock-free; the
/// fatal path is allowed to do real work because the process is about to
/// end.
///
/// # Safety
///
/// Invoked by the kernel with a `ucontext` third argument.
pub unsafe extern "C" fn on_underflow(_signum: c_int, _info: *mut c_void, context: *mut c_void) {
    let uc = &mut *(context as *mut UContext);
    let rip = uc.uc_mcontext.rip as *const u8;

    let advance;
    match decode::fault_operand(rip, &uc.uc_mcontext) {
        None => {
            // Not a probe: some other instruction underflowed. Re-run it
            // with flush-to-zero off so the program sees the IEEE result,
            // then skip it.
            program::count_generic_underflow();
            match reexec::run(rip, &mut uc.uc_mcontext) {
                Some(len) => advance = len,
                None => diag::fail_init(diag::InitError::ScratchPage),
            }
        }
        Some((addr, len)) => {
            advance = len;
            let fault = addr as *const u8;
            if redzone::confirm(fault) {
                program::count_confirmed();
                #[cfg(not(feature = "survive"))]
                diag::report_fault(fault, rip as usize);
            } else {
                program::count_unconfirmed();
            }
        }
    }

    // False positive (or survive mode): step past the instruction and
    // scrub any transient poison a probe left in a vector register.
    uc.uc_mcontext.rip += advance as u64;
    scrub_xmm(&mut uc.uc_mcontext);
}

/// Zero every saved XMM register holding the canonical pattern, so a
/// poison word loaded by a probe cannot be read back out of a register
/// after the handler returns.
fn scrub_xmm(ctx: &mut MContext) {
    if ctx.fpstate.is_null() {
        return;
    }
    // SAFETY: the kernel's frame points `fpstate` at a valid FXSAVE area.
    let fp = unsafe { &mut *ctx.fpstate };
    for i in 0..16 {
        if fp.xmm(i) == redzone::PATTERN_WORDS {
            fp.set_xmm(i, [0; 4]);
        }
    }
}

/// Install [`on_underflow`] for SIGFPE through the real `sigaction`.
pub fn install_underflow_handler() -> Result<(), diag::InitError> {
    let action = Sigaction {
        handler: on_underflow as usize,
        mask: [0; 16],
        flags: SA_SIGINFO as c_int,
        restorer: 0,
    };
    // SAFETY: `action` is a complete glibc sigaction record.
    let rc = unsafe {
        (host::SIGACTION.get())(
            SIGFPE as c_int,
            &action as *const Sigaction as *const c_void,
            core::ptr::null_mut(),
        )
    };
    if rc != 0 {
        return Err(diag::InitError::Symbol("sigaction(SIGFPE)"));
    }
    Ok(())
}

/// Terminate on SIGSEGV the same way a confirmed fault does. Some test
/// suites deliberately run off the heap entirely; this turns those into
/// clean verdicts instead of kernel-default core dumps.
#[cfg(feature = "catch-segfault")]
unsafe extern "C" fn on_segfault(_signum: c_int, _info: *mut c_void, _context: *mut c_void) {
    diag::terminate()
}

#[cfg(feature = "catch-segfault")]
pub fn install_segfault_handler() -> Result<(), diag::InitError> {
    use linux_raw_sys::general::{SA_NODEFER, SIGSEGV};

    let action = Sigaction {
        handler: on_segfault as usize,
        mask: [0; 16],
        flags: (SA_SIGINFO | SA_NODEFER) as c_int,
        restorer: 0,
    };
    // SAFETY: `action` is a complete glibc sigaction record.
    let rc = unsafe {
        (host::SIGACTION.get())(
            SIGSEGV as c_int,
            &action as *const Sigaction as *const c_void,
            core::ptr::null_mut(),
        )
    };
    if rc != 0 {
        return Err(diag::InitError::Symbol("sigaction(SIGSEGV)"));
    }
    Ok(())
}

// Registration interposition. While the sanitizer is armed, application
// attempts to take over SIGFPE are swallowed: the call reports success
// and registers nothing, so the trap keeps funneling here.

/// # Safety
///
/// `signal` contract.
pub unsafe fn signal(signum: c_int, handler_fn: SigHandler) -> SigHandler {
    if program::enabled() && signum == SIGFPE as c_int {
        return 0;
    }
    (host::SIGNAL.get())(signum, handler_fn)
}

/// # Safety
///
/// `__sysv_signal` contract. Some programs reach SIGFPE through this
/// glibc-specific entry point depending on how they were built.
pub unsafe fn sysv_signal(signum: c_int, handler_fn: SigHandler) -> SigHandler {
    if program::enabled() && signum == SIGFPE as c_int {
        return 0;
    }
    (host::SYSV_SIGNAL.get())(signum, handler_fn)
}

/// # Safety
///
/// `sigaction` contract.
pub unsafe fn sigaction(signum: c_int, act: *const c_void, oldact: *mut c_void) -> c_int {
    if program::enabled() && signum == SIGFPE as c_int && !act.is_null() {
        // Re-registering our own handler is the one thing allowed through.
        let registered = *(act as *const usize);
        if registered != on_underflow as usize {
            return 0;
        }
    }
    (host::SIGACTION.get())(signum, act, oldact)
}
