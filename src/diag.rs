//! Diagnostics: the signal-safe stderr writer, the fault report, and the
//! ways out of the process.

use core::ffi::CStr;
use core::fmt::{self, Write as _};

use crate::host;

/// Exit status for a confirmed fault when not aborting.
#[cfg(not(feature = "fuzz"))]
pub const FAULT_EXIT_CODE: i32 = 1;

/// Exit status for internal runtime failures; distinct from anything the
/// sanitized program would produce.
pub const INTERNAL_EXIT_CODE: i32 = 37;

/// Startup-class failures. None of these leave the runtime partially
/// installed; they all end the process.
#[derive(Clone, Copy, Debug)]
pub enum InitError {
    /// A delegation symbol could not be resolved.
    Symbol(&'static str),
    /// A process-lifecycle hook could not be registered.
    Hook(&'static str),
    /// The re-execution scratch page could not be mapped.
    ScratchPage,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Symbol(name) => write!(f, "cannot resolve `{name}`"),
            Self::Hook(name) => write!(f, "cannot register `{name}` hook"),
            Self::ScratchPage => f.write_str("cannot map scratch page"),
        }
    }
}

/// Writes straight to fd 2. No buffering, no allocation; usable from the
/// signal handler.
pub struct Stderr;

impl fmt::Write for Stderr {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut bytes = s.as_bytes();
        while !bytes.is_empty() {
            match rustix::io::write(unsafe { rustix::stdio::stderr() }, bytes) {
                Ok(0) | Err(_) => break,
                Ok(n) => bytes = &bytes[n..],
            }
        }
        Ok(())
    }
}

/// A 128-byte hexdump window centered on `fault`, four bytes per line,
/// with a marker on the line holding the fault address itself.
pub fn hexdump(out: &mut dyn fmt::Write, fault: *const u8) {
    let mut off: isize = -64;
    while off < 64 {
        // SAFETY: per the reporting contract the window around a confirmed
        // fault address is readable; it sits inside or next to a live heap
        // block.
        let b = unsafe { core::slice::from_raw_parts(fault.offset(off), 4) };
        let _ = write!(
            out,
            "{:#016x}: {:02x} {:02x} {:02x} {:02x} ",
            (fault as usize).wrapping_add_signed(off),
            b[0],
            b[1],
            b[2],
            b[3]
        );
        if off == 0 {
            let _ = out.write_str(" <-----");
        }
        let _ = out.write_str("\n");
        off += 4;
    }
}

/// Report a confirmed redzone hit and terminate.
pub fn report_fault(fault: *const u8, rip: usize) -> ! {
    let mut out = Stderr;
    let _ = write!(
        out,
        "\n!!!! [fpsan] fault address = {:#x} !!!!\n\n",
        fault as usize
    );
    hexdump(&mut out, fault);
    let _ = write!(out, "\nfault rip = {rip:#x}\nbacktrace:\n");

    let mut frames = [core::ptr::null_mut(); 128];
    // SAFETY: `frames` has room for the requested depth.
    let depth = unsafe { host::backtrace(frames.as_mut_ptr(), frames.len() as i32) };
    if depth > 2 {
        // Skip the handler and this reporter.
        unsafe { host::backtrace_symbols_fd(frames.as_ptr().add(2), depth - 2, 2) };
    }

    terminate()
}

/// Die the way the build was configured to: `abort` so fuzzers see the
/// crash signal, or a plain exit status.
pub fn terminate() -> ! {
    #[cfg(feature = "fuzz")]
    // SAFETY: host `abort` never returns.
    unsafe {
        host::abort()
    }
    #[cfg(not(feature = "fuzz"))]
    // SAFETY: host `exit` never returns.
    unsafe {
        host::exit(FAULT_EXIT_CODE)
    }
}

/// A startup failure: report and leave with the internal exit code.
pub fn fail_init(err: InitError) -> ! {
    let mut out = Stderr;
    let _ = write!(out, "[fpsan] startup failed: {err}\n");
    // SAFETY: host `exit` never returns.
    unsafe { host::exit(INTERNAL_EXIT_CODE) }
}

/// A delegation symbol turned out to be missing at the moment it was
/// needed.
pub fn missing_symbol(name: &'static CStr) -> ! {
    let printable = core::str::from_utf8(name.to_bytes()).unwrap_or("<symbol>");
    fail_init(InitError::Symbol(printable))
}
