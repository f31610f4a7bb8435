//! Runtime of a heap memory-error sanitizer whose check instruction is a
//! scalar floating-point add.
//!
//! Every heap object handed out by the interposed allocator is bracketed by
//! 16-byte "redzones" holding a fixed poison pattern. Instrumented code (and
//! the byte-routine shims in this crate) issue `vaddss` probes against the
//! addresses they are about to touch; the poison bytes, read as a float and
//! added to a matching magic addend, produce a denormal that the CPU turns
//! into an underflow trap once flush-to-zero is enabled and the underflow
//! exception is unmasked. The SIGFPE handler at the other end of that trap
//! confirms whether the address really lies in a redzone, reports and
//! terminates if so, and otherwise resumes the program as if nothing
//! happened.
//!
//! The crate is meant to be preloaded into the target process (or linked in
//! as a static library by the instrumentation harness). It interposes the
//! allocator entry points, a set of byte-oriented libc routines, signal
//! registration for SIGFPE, the non-local jump routines, and
//! `__libc_start_main`, where it decides from the image path whether to arm
//! itself at all.
#![cfg_attr(not(test), no_std)]
// The exported symbol surface is absent from the unit-test harness, which
// leaves much of the crate reachable only from tests.
#![cfg_attr(test, allow(dead_code))]
#![feature(c_variadic)]
#![feature(thread_local)]

#[cfg_attr(target_arch = "x86_64", path = "arch/x86_64.rs")]
mod arch;

mod decode;
mod diag;
mod handler;
mod heap;
mod host;
mod jump;
mod program;
mod quarantine;
mod redzone;
mod reexec;
mod shims;

// The interposed C ABI surface. Not compiled into the unit-test harness,
// which must keep its own libc.
#[cfg(not(test))]
mod exports;

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo<'_>) -> ! {
    // SAFETY: `abort` is provided by the host C runtime and never returns.
    unsafe { host::abort() }
}

// The decoder crate pulls in `alloc`; back it with the host allocator's
// uninterposed entry points so the padded paths never see our own
// allocations. Nothing in this crate allocates on the trap fast path.
#[cfg(not(test))]
struct HostAlloc;

#[cfg(not(test))]
// SAFETY: delegates to the host C allocator, which satisfies `GlobalAlloc`'s
// contract for the alignments `Layout` can carry here (≤ 16).
unsafe impl core::alloc::GlobalAlloc for HostAlloc {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        host::__libc_malloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: core::alloc::Layout) {
        host::__libc_free(ptr)
    }
}

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: HostAlloc = HostAlloc;
