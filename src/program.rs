//! Program startup: the `__libc_start_main` interposition, the enable
//! gate, and process teardown.

use core::ffi::{c_char, c_int, c_void, CStr};
use core::sync::atomic::{AtomicBool, Ordering::Relaxed};

use crate::diag;
#[cfg(any(feature = "traps", feature = "catch-segfault"))]
use crate::handler;
use crate::host::{self, HookFn, MainFn};

#[cfg(feature = "traps")]
use crate::arch::{self, Mxcsr};

/// The process-wide enable flag: false until startup decides this image
/// is a sanitization target, false again once teardown begins. While
/// false, every wrapper and shim is a transparent pass-through, which
/// keeps the dynamic linker's and libc's own early allocations out of the
/// sanitizer's view.
static ENABLED: AtomicBool = AtomicBool::new(false);

/// Whether the sanitizer is armed. Hot; read by every shim.
#[inline(always)]
pub fn enabled() -> bool {
    ENABLED.load(Relaxed)
}

/// Substrings of the image path that arm the sanitizer. Overridable at
/// build time; the defaults match benchmark and test-suite layouts.
const TARGET: &str = match option_env!("FPSAN_TARGET") {
    Some(s) => s,
    None => "run_base",
};
const TARGET_ALT: &str = match option_env!("FPSAN_TARGET_ALT") {
    Some(s) => s,
    None => "CWE",
};

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// Whether the image at `arg0` should run sanitized.
fn image_matches(arg0: &CStr) -> bool {
    let path = arg0.to_bytes();
    contains(path, TARGET.as_bytes()) || contains(path, TARGET_ALT.as_bytes())
}

/// Teardown hook: once exit processing starts, libc frees memory the
/// sanitizer never saw, so everything must pass through untouched.
unsafe extern "C" fn disarm() {
    ENABLED.store(false, Relaxed);
}

/// Arm the trap machinery: flush-to-zero so the probe's denormal sum is
/// squashed, the SIGFPE handler, and only then the unmasked underflow
/// exception. Threads created from here on inherit the MXCSR setup.
fn install() -> Result<(), diag::InitError> {
    #[cfg(feature = "traps")]
    {
        arch::set_mxcsr(arch::mxcsr() | Mxcsr::FLUSH_TO_ZERO);
        handler::install_underflow_handler()?;
        arch::set_mxcsr(arch::mxcsr() - Mxcsr::UNDERFLOW_MASK);
    }

    #[cfg(feature = "catch-segfault")]
    handler::install_segfault_handler()?;

    Ok(())
}

/// The interposed `__libc_start_main`: wire up the delegation chain,
/// decide from the image path whether to arm, and hand control to the
/// real entry.
///
/// # Safety
///
/// Called once by the process startup code with its usual arguments.
pub unsafe fn start_main(
    main: MainFn,
    argc: c_int,
    ubp_av: *mut *mut c_char,
    init: HookFn,
    fini: HookFn,
    rtld_fini: HookFn,
    stack_end: *mut c_void,
) -> c_int {
    if let Err(err) = host::prefetch() {
        diag::fail_init(err);
    }
    if host::atexit(disarm) != 0 {
        diag::fail_init(diag::InitError::Hook("atexit"));
    }

    let arg0 = *ubp_av;
    if argc > 0 && !arg0.is_null() {
        #[cfg(feature = "count-exceptions")]
        counters::set_progname(arg0);

        let arg0 = CStr::from_ptr(arg0);
        if image_matches(arg0) {
            if let Err(err) = install() {
                diag::fail_init(err);
            }
            ENABLED.store(true, Relaxed);

            #[cfg(feature = "log")]
            log::trace!(
                target: "fpsan::program",
                "sanitizer armed for {:?}",
                core::str::from_utf8(arg0.to_bytes()).unwrap_or("<image>")
            );
        } else {
            #[cfg(feature = "log")]
            log::trace!(target: "fpsan::program", "image path not a target; staying passive");
        }
    }

    (host::LIBC_START_MAIN.get())(main, argc, ubp_av, init, fini, rtld_fini, stack_end)
}

// Trap accounting, flushed at teardown. One line per process, appended,
// so batched runs accumulate into a single file.

#[cfg(feature = "count-exceptions")]
pub mod counters {
    use core::ffi::c_char;
    use core::fmt::{self, Write as _};
    use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering::Relaxed};

    /// Underflows from instructions that are not probes.
    pub static GENERIC: AtomicU32 = AtomicU32::new(0);
    /// Probe traps whose address failed confirmation.
    pub static UNCONFIRMED: AtomicU32 = AtomicU32::new(0);
    /// Confirmed redzone hits (only reachable under `survive`).
    pub static CONFIRMED: AtomicU32 = AtomicU32::new(0);

    static PROGNAME: AtomicPtr<c_char> = AtomicPtr::new(core::ptr::null_mut());

    pub(super) fn set_progname(arg0: *mut c_char) {
        PROGNAME.store(arg0, Relaxed);
    }

    const COUNTS_PATH: &str = "/tmp/fpsan_exceptions.txt";

    struct LineBuf {
        bytes: [u8; 256],
        len: usize,
    }

    impl fmt::Write for LineBuf {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            let take = s.len().min(self.bytes.len() - self.len);
            self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
            self.len += take;
            Ok(())
        }
    }

    /// `.fini_array` hook: stop probing, then append the counters.
    #[link_section = ".fini_array.00099"]
    #[used]
    static FLUSH_COUNTERS: unsafe extern "C" fn() = {
        unsafe extern "C" fn flush() {
            super::disarm();

            let mut line = LineBuf {
                bytes: [0; 256],
                len: 0,
            };
            let name = PROGNAME.load(Relaxed);
            let name = if name.is_null() {
                "<unknown>"
            } else {
                // SAFETY: set from argv[0], which outlives the process.
                core::str::from_utf8(core::ffi::CStr::from_ptr(name).to_bytes())
                    .unwrap_or("<non-utf8>")
            };
            let _ = writeln!(
                line,
                "{name}\t{}\t{}\t{}",
                UNCONFIRMED.load(Relaxed),
                GENERIC.load(Relaxed),
                CONFIRMED.load(Relaxed),
            );

            use rustix::fs::{Mode, OFlags};
            if let Ok(fd) = rustix::fs::open(
                COUNTS_PATH,
                OFlags::WRONLY | OFlags::CREATE | OFlags::APPEND,
                Mode::from_raw_mode(0o644),
            ) {
                let _ = rustix::io::write(fd, &line.bytes[..line.len]);
            }
        }
        flush
    };
}

/// Note an underflow from a non-probe instruction.
#[inline]
pub fn count_generic_underflow() {
    #[cfg(feature = "count-exceptions")]
    counters::GENERIC.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
}

/// Note a probe trap that failed confirmation.
#[inline]
pub fn count_unconfirmed() {
    #[cfg(feature = "count-exceptions")]
    counters::UNCONFIRMED.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
}

/// Note a confirmed redzone hit.
#[inline]
pub fn count_confirmed() {
    #[cfg(feature = "count-exceptions")]
    counters::CONFIRMED.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
}
