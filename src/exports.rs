//! The interposed symbol surface of the preloaded object.
//!
//! Every routine the runtime takes over is exported here under its libc
//! name, and the wrapped byte routines additionally under an `fpsan_`
//! synonym the compiler pass targets when it rewrites calls at emission
//! time. Both names share the implementations in [`crate::shims`],
//! [`crate::heap`], [`crate::handler`], and [`crate::jump`].

use core::ffi::{c_char, c_int, c_void};

use crate::handler;
use crate::heap;
use crate::host::{HookFn, MainFn, SigHandler, WChar};
use crate::jump;
use crate::program;
use crate::redzone;
use crate::shims;

// Allocator entry points.

#[no_mangle]
unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
    heap::malloc(size)
}

#[no_mangle]
unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    heap::calloc(nmemb, size)
}

#[no_mangle]
unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    heap::realloc(ptr, size)
}

#[no_mangle]
unsafe extern "C" fn free(ptr: *mut u8) {
    heap::free(ptr)
}

#[no_mangle]
unsafe extern "C" fn posix_memalign(memptr: *mut *mut u8, alignment: usize, size: usize) -> c_int {
    heap::posix_memalign(memptr, alignment, size)
}

// Signal registration. The runtime owns SIGFPE; see `handler`.

#[no_mangle]
unsafe extern "C" fn signal(signum: c_int, handler_fn: SigHandler) -> SigHandler {
    handler::signal(signum, handler_fn)
}

#[no_mangle]
unsafe extern "C" fn sigaction(
    signum: c_int,
    act: *const c_void,
    oldact: *mut c_void,
) -> c_int {
    handler::sigaction(signum, act, oldact)
}

#[no_mangle]
unsafe extern "C" fn __sysv_signal(signum: c_int, handler_fn: SigHandler) -> SigHandler {
    handler::sysv_signal(signum, handler_fn)
}

// Non-local transfers.

#[no_mangle]
unsafe extern "C" fn longjmp(env: *mut c_void, val: c_int) -> ! {
    jump::longjmp(env, val)
}

#[no_mangle]
unsafe extern "C" fn siglongjmp(env: *mut c_void, val: c_int) -> ! {
    jump::siglongjmp(env, val)
}

#[no_mangle]
unsafe extern "C" fn __cxa_throw(
    exception: *mut c_void,
    tinfo: *mut c_void,
    dest: Option<unsafe extern "C" fn(*mut c_void)>,
) -> ! {
    jump::cxa_throw(exception, tinfo, dest)
}

/// Scrub the stack abandoned by the last recorded non-local jump on this
/// thread. The instrumentation pass plants calls to this at landing sites.
#[no_mangle]
unsafe extern "C" fn fpsan_clear_stack_on_jump(current_sp: usize) {
    jump::clear_stack_on_jump(current_sp)
}

/// The range probe, for instrumented call sites that check a buffer
/// without going through a shim.
#[no_mangle]
unsafe extern "C" fn fpsan_check_poison(src: *const u8, size: usize) {
    redzone::probe(src, size)
}

// Program entry.

#[no_mangle]
unsafe extern "C" fn __libc_start_main(
    main: MainFn,
    argc: c_int,
    ubp_av: *mut *mut c_char,
    init: HookFn,
    fini: HookFn,
    rtld_fini: HookFn,
    stack_end: *mut c_void,
) -> c_int {
    program::start_main(main, argc, ubp_av, init, fini, rtld_fini, stack_end)
}

// Wrapped byte routines, under both the libc name and the instrumentation
// synonym.

macro_rules! wrapped {
    ($libc:ident, $synonym:ident => fn($($arg:ident: $ty:ty),*) -> $ret:ty) => {
        #[no_mangle]
        unsafe extern "C" fn $libc($($arg: $ty),*) -> $ret {
            shims::$libc($($arg),*)
        }

        #[no_mangle]
        unsafe extern "C" fn $synonym($($arg: $ty),*) -> $ret {
            shims::$libc($($arg),*)
        }
    };
}

wrapped!(memcpy, fpsan_memcpy => fn(dest: *mut u8, src: *const u8, n: usize) -> *mut u8);
wrapped!(memmove, fpsan_memmove => fn(dest: *mut u8, src: *const u8, n: usize) -> *mut u8);
wrapped!(memset, fpsan_memset => fn(s: *mut u8, c: c_int, n: usize) -> *mut u8);
wrapped!(memcmp, fpsan_memcmp => fn(s1: *const u8, s2: *const u8, n: usize) -> c_int);
wrapped!(strlen, fpsan_strlen => fn(s: *const c_char) -> usize);
wrapped!(strnlen, fpsan_strnlen => fn(s: *const c_char, maxlen: usize) -> usize);
wrapped!(strcmp, fpsan_strcmp => fn(s1: *const c_char, s2: *const c_char) -> c_int);
wrapped!(strncmp, fpsan_strncmp => fn(s1: *const c_char, s2: *const c_char, n: usize) -> c_int);
wrapped!(strcpy, fpsan_strcpy => fn(dest: *mut c_char, src: *const c_char) -> *mut c_char);
wrapped!(strncpy, fpsan_strncpy => fn(dest: *mut c_char, src: *const c_char, n: usize) -> *mut c_char);
wrapped!(strcat, fpsan_strcat => fn(dest: *mut c_char, src: *const c_char) -> *mut c_char);
wrapped!(strncat, fpsan_strncat => fn(dest: *mut c_char, src: *const c_char, n: usize) -> *mut c_char);
wrapped!(wcscpy, fpsan_wcscpy => fn(dest: *mut WChar, src: *const WChar) -> *mut WChar);
wrapped!(puts, fpsan_puts => fn(s: *const c_char) -> c_int);

#[no_mangle]
unsafe extern "C" fn snprintf(
    s: *mut c_char,
    maxlen: usize,
    format: *const c_char,
    mut args: ...
) -> c_int {
    shims::snprintf(s, maxlen, format, &mut args)
}

#[no_mangle]
unsafe extern "C" fn fpsan_snprintf(
    s: *mut c_char,
    maxlen: usize,
    format: *const c_char,
    mut args: ...
) -> c_int {
    shims::snprintf(s, maxlen, format, &mut args)
}

#[no_mangle]
unsafe extern "C" fn printf(format: *const c_char, mut args: ...) -> c_int {
    shims::printf(format, &mut args)
}

#[no_mangle]
unsafe extern "C" fn fpsan_printf(format: *const c_char, mut args: ...) -> c_int {
    shims::printf(format, &mut args)
}
