//! Non-local transfer hooks: `longjmp`, `siglongjmp`, and the C++ throw
//! lowering, plus the stack scrub that runs at the landing site.
//!
//! A probe can leave the canonical pattern in a stack slot of a frame
//! that a jump then abandons; when the stack grows back over it, the
//! stale poison reads as a redzone. So each transfer records the stack
//! pointer it leaves from, and the landing site zeroes everything between
//! that mark and wherever the stack ends up.

use core::cell::Cell;
use core::ffi::{c_int, c_void};

use crate::arch;
use crate::host;
use crate::program;

// Per-thread: concurrent jumps on different threads each consume their
// own mark.
#[thread_local]
static STORED_SP: Cell<usize> = Cell::new(0);

#[inline]
fn record_sp() {
    STORED_SP.set(arch::stack_pointer());
}

/// # Safety
///
/// `longjmp` contract: `env` must come from a matching `setjmp`.
pub unsafe fn longjmp(env: *mut c_void, val: c_int) -> ! {
    if program::enabled() {
        record_sp();
    }
    (host::LONGJMP.get())(env, val)
}

/// # Safety
///
/// `siglongjmp` contract: `env` must come from a matching `sigsetjmp`.
pub unsafe fn siglongjmp(env: *mut c_void, val: c_int) -> ! {
    if program::enabled() {
        record_sp();
    }
    (host::SIGLONGJMP.get())(env, val)
}

/// # Safety
///
/// `__cxa_throw` contract.
pub unsafe fn cxa_throw(
    exception: *mut c_void,
    tinfo: *mut c_void,
    dest: Option<unsafe extern "C" fn(*mut c_void)>,
) -> ! {
    if program::enabled() {
        record_sp();
    }
    (host::CXA_THROW.get())(exception, tinfo, dest)
}

/// Zero the abandoned stack between the recorded mark and `current_sp`.
/// The top 8 bytes stay, so the caller's return address survives the
/// scrub.
///
/// # Safety
///
/// `current_sp` must be the caller's stack pointer on the thread that
/// recorded the mark, above the recorded value.
pub unsafe fn clear_stack_on_jump(current_sp: usize) {
    let low = STORED_SP.get();
    if low == 0 || current_sp <= low + 8 {
        return;
    }
    host::memset_uninterposed(low as *mut u8, 0, current_sp - low - 8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrub_covers_the_abandoned_range() {
        let mut frame = [0x8bu8; 128];
        let low = frame.as_mut_ptr() as usize;
        STORED_SP.set(low);
        unsafe { clear_stack_on_jump(low + 128) };

        assert!(frame[..120].iter().all(|&b| b == 0));
        assert!(frame[120..].iter().all(|&b| b == 0x8b));
        STORED_SP.set(0);
    }

    #[test]
    fn scrub_without_a_mark_is_a_no_op() {
        STORED_SP.set(0);
        unsafe { clear_stack_on_jump(arch::stack_pointer()) };

        // A mark above the current position is also left alone.
        let buf = [0xffu8; 16];
        let at = buf.as_ptr() as usize;
        STORED_SP.set(at);
        unsafe { clear_stack_on_jump(at) };
        unsafe { clear_stack_on_jump(at + 8) };
        assert!(buf.iter().all(|&b| b == 0xff));
        STORED_SP.set(0);
    }

    #[test]
    fn marks_are_recorded_from_the_running_stack() {
        record_sp();
        let sp = STORED_SP.get();
        assert_ne!(sp, 0);
        // The recorded mark is below (or at) any later reading on this
        // thread's stack while we are still in the recording frame.
        assert!(sp <= arch::stack_pointer() + 4096);
        STORED_SP.set(0);
    }
}
