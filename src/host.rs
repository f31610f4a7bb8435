//! Bindings to the uninterposed host C library.
//!
//! The crate interposes a good slice of glibc, so everything it delegates
//! to must reach the *next* definition in the lookup chain, not its own.
//! Allocator internals have dedicated `__libc_*` entry points and are
//! linked directly; the rest are resolved through `dlsym(RTLD_NEXT, …)` on
//! first use, because shims can run (from other preloaded objects'
//! constructors) before our startup hook does.

use core::ffi::{c_char, c_int, c_void, CStr, VaList};
use core::marker::PhantomData;
use core::mem;
use core::sync::atomic::{AtomicPtr, Ordering::Relaxed};

/// `RTLD_NEXT`: resolve to the next occurrence of the symbol after the
/// calling object.
const RTLD_NEXT: *mut c_void = usize::MAX as *mut c_void;

/// `wchar_t`.
pub type WChar = i32;

extern "C" {
    pub fn __libc_malloc(size: usize) -> *mut u8;
    pub fn __libc_calloc(nmemb: usize, size: usize) -> *mut u8;
    pub fn __libc_realloc(ptr: *mut u8, size: usize) -> *mut u8;
    pub fn __libc_free(ptr: *mut u8);
    pub fn malloc_usable_size(ptr: *mut u8) -> usize;

    fn dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void;

    pub fn atexit(callback: unsafe extern "C" fn()) -> c_int;
    pub fn abort() -> !;
    pub fn exit(status: c_int) -> !;

    pub fn backtrace(buffer: *mut *mut c_void, size: c_int) -> c_int;
    pub fn backtrace_symbols_fd(buffer: *const *mut c_void, size: c_int, fd: c_int);

    pub fn wcslen(s: *const WChar) -> usize;

    /// glibc's `stdout` stream.
    #[link_name = "stdout"]
    pub static mut STDOUT: *mut c_void;
    pub fn vfprintf(stream: *mut c_void, format: *const c_char, ap: VaList) -> c_int;
    pub fn vsnprintf(s: *mut c_char, maxlen: usize, format: *const c_char, ap: VaList) -> c_int;
}

/// A next-in-chain libc entry point, resolved on first use.
///
/// A symbol that cannot be resolved when it is actually needed means the
/// process lacks a definition we delegate to; that is a startup-class
/// failure and terminates with the runtime's internal exit code rather
/// than leaving the interposition half-wired.
pub struct LateFn<F> {
    ptr: AtomicPtr<c_void>,
    name: &'static CStr,
    signature: PhantomData<F>,
}

// The stored pointer is written once with the resolved address and read
// concurrently; `F` is always a `fn` pointer type.
unsafe impl<F> Sync for LateFn<F> {}

impl<F: Copy> LateFn<F> {
    pub const fn new(name: &'static CStr) -> Self {
        Self {
            ptr: AtomicPtr::new(core::ptr::null_mut()),
            name,
            signature: PhantomData,
        }
    }

    fn resolve(&self) -> *mut c_void {
        // SAFETY: `name` is a NUL-terminated symbol name.
        let p = unsafe { dlsym(RTLD_NEXT, self.name.as_ptr()) };
        if !p.is_null() {
            self.ptr.store(p, Relaxed);
        }
        p
    }

    /// The resolved function. Terminates if the symbol does not exist.
    pub fn get(&self) -> F {
        let mut p = self.ptr.load(Relaxed);
        if p.is_null() {
            p = self.resolve();
            if p.is_null() {
                crate::diag::missing_symbol(self.name);
            }
        }
        // SAFETY: `F` is a function pointer type of the same width as the
        // resolved address.
        unsafe { mem::transmute_copy(&p) }
    }

    /// Resolve eagerly; `false` if the symbol is absent from the process.
    pub fn prefetch(&self) -> bool {
        !self.ptr.load(Relaxed).is_null() || !self.resolve().is_null()
    }
}

pub type MemcpyFn = unsafe extern "C" fn(*mut u8, *const u8, usize) -> *mut u8;
pub type MemsetFn = unsafe extern "C" fn(*mut u8, c_int, usize) -> *mut u8;
pub type MemcmpFn = unsafe extern "C" fn(*const u8, *const u8, usize) -> c_int;
pub type StrlenFn = unsafe extern "C" fn(*const c_char) -> usize;
pub type StrnlenFn = unsafe extern "C" fn(*const c_char, usize) -> usize;
pub type StrcmpFn = unsafe extern "C" fn(*const c_char, *const c_char) -> c_int;
pub type StrncmpFn = unsafe extern "C" fn(*const c_char, *const c_char, usize) -> c_int;
pub type StrcpyFn = unsafe extern "C" fn(*mut c_char, *const c_char) -> *mut c_char;
pub type StrncpyFn = unsafe extern "C" fn(*mut c_char, *const c_char, usize) -> *mut c_char;
pub type WcscpyFn = unsafe extern "C" fn(*mut WChar, *const WChar) -> *mut WChar;
pub type PutsFn = unsafe extern "C" fn(*const c_char) -> c_int;

/// `sighandler_t`, kept opaque.
pub type SigHandler = usize;
pub type SignalFn = unsafe extern "C" fn(c_int, SigHandler) -> SigHandler;
pub type SigactionFn = unsafe extern "C" fn(c_int, *const c_void, *mut c_void) -> c_int;

pub type LongjmpFn = unsafe extern "C" fn(*mut c_void, c_int) -> !;
pub type CxaThrowFn =
    unsafe extern "C" fn(*mut c_void, *mut c_void, Option<unsafe extern "C" fn(*mut c_void)>) -> !;
pub type MemalignFn = unsafe extern "C" fn(*mut *mut u8, usize, usize) -> c_int;

pub type MainFn = unsafe extern "C" fn(c_int, *mut *mut c_char, *mut *mut c_char) -> c_int;
pub type HookFn = Option<unsafe extern "C" fn()>;
pub type StartMainFn = unsafe extern "C" fn(
    MainFn,
    c_int,
    *mut *mut c_char,
    HookFn,
    HookFn,
    HookFn,
    *mut c_void,
) -> c_int;

pub static MEMCPY: LateFn<MemcpyFn> = LateFn::new(c"memcpy");
pub static MEMMOVE: LateFn<MemcpyFn> = LateFn::new(c"memmove");
pub static MEMSET: LateFn<MemsetFn> = LateFn::new(c"memset");
pub static MEMCMP: LateFn<MemcmpFn> = LateFn::new(c"memcmp");
pub static STRLEN: LateFn<StrlenFn> = LateFn::new(c"strlen");
pub static STRNLEN: LateFn<StrnlenFn> = LateFn::new(c"strnlen");
pub static STRCMP: LateFn<StrcmpFn> = LateFn::new(c"strcmp");
pub static STRNCMP: LateFn<StrncmpFn> = LateFn::new(c"strncmp");
pub static STRCPY: LateFn<StrcpyFn> = LateFn::new(c"strcpy");
pub static STRNCPY: LateFn<StrncpyFn> = LateFn::new(c"strncpy");
pub static STRCAT: LateFn<StrcpyFn> = LateFn::new(c"strcat");
pub static STRNCAT: LateFn<StrncpyFn> = LateFn::new(c"strncat");
pub static WCSCPY: LateFn<WcscpyFn> = LateFn::new(c"wcscpy");
pub static PUTS: LateFn<PutsFn> = LateFn::new(c"puts");

pub static SIGNAL: LateFn<SignalFn> = LateFn::new(c"signal");
pub static SIGACTION: LateFn<SigactionFn> = LateFn::new(c"sigaction");
pub static SYSV_SIGNAL: LateFn<SignalFn> = LateFn::new(c"__sysv_signal");

pub static LONGJMP: LateFn<LongjmpFn> = LateFn::new(c"longjmp");
pub static SIGLONGJMP: LateFn<LongjmpFn> = LateFn::new(c"siglongjmp");
pub static CXA_THROW: LateFn<CxaThrowFn> = LateFn::new(c"__cxa_throw");
pub static POSIX_MEMALIGN: LateFn<MemalignFn> = LateFn::new(c"posix_memalign");
pub static LIBC_START_MAIN: LateFn<StartMainFn> = LateFn::new(c"__libc_start_main");

/// Fill through the real `memset`.
///
/// The crate's own bulk fills must not go through the interposed symbol:
/// poisoning a freed payload through the `memset` shim would probe bytes
/// that already hold poison.
///
/// # Safety
///
/// `p` must be valid for `len` bytes of writes.
#[inline]
pub unsafe fn memset_uninterposed(p: *mut u8, byte: u8, len: usize) {
    if len != 0 {
        (MEMSET.get())(p, byte as c_int, len);
    }
}

/// Copy through the real `memcpy`.
///
/// # Safety
///
/// The ranges must be valid and non-overlapping.
#[inline]
pub unsafe fn memcpy_uninterposed(dst: *mut u8, src: *const u8, len: usize) {
    if len != 0 {
        (MEMCPY.get())(dst, src, len);
    }
}

/// Resolve the delegation chain up front, so nothing has to hit `dlsym`
/// once the program is running under the sanitizer. Only the entry-point
/// chain is a hard requirement this early; `__cxa_throw` in particular is
/// absent from pure-C processes and stays lazy.
pub fn prefetch() -> Result<(), crate::diag::InitError> {
    if !LIBC_START_MAIN.prefetch() {
        return Err(crate::diag::InitError::Symbol("__libc_start_main"));
    }
    if !SIGACTION.prefetch() {
        return Err(crate::diag::InitError::Symbol("sigaction"));
    }

    for ok in [
        MEMCPY.prefetch(),
        MEMMOVE.prefetch(),
        MEMSET.prefetch(),
        MEMCMP.prefetch(),
        STRLEN.prefetch(),
        STRNLEN.prefetch(),
        STRCMP.prefetch(),
        STRNCMP.prefetch(),
        STRCPY.prefetch(),
        STRNCPY.prefetch(),
        STRCAT.prefetch(),
        STRNCAT.prefetch(),
        WCSCPY.prefetch(),
        PUTS.prefetch(),
        SIGNAL.prefetch(),
        SYSV_SIGNAL.prefetch(),
        LONGJMP.prefetch(),
        SIGLONGJMP.prefetch(),
        POSIX_MEMALIGN.prefetch(),
    ] {
        if !ok {
            return Err(crate::diag::InitError::Symbol("libc delegation chain"));
        }
    }
    let _ = CXA_THROW.prefetch();
    Ok(())
}
