//! Stand-ins for the byte-oriented libc routines.
//!
//! The probe is a floating-point add the compiler pass can only plant in
//! instrumented code; a `memcpy` running inside an uninstrumented libc
//! would walk straight over a redzone without trapping. So every
//! byte-touching routine the sanitizer cares about is replaced with a shim
//! that probes the buffers it is about to read or write over their full
//! length, then delegates to the real routine. Lengths are never changed.

use core::ffi::{c_char, c_int, VaList};

use crate::host::{self, WChar};
use crate::program;
use crate::redzone::probe;

/// # Safety
///
/// `memcpy` contract.
pub unsafe fn memcpy(dest: *mut u8, src: *const u8, n: usize) -> *mut u8 {
    if program::enabled() && n != 0 {
        probe(src, n);
        probe(dest, n);
    }
    (host::MEMCPY.get())(dest, src, n)
}

/// # Safety
///
/// `memmove` contract.
pub unsafe fn memmove(dest: *mut u8, src: *const u8, n: usize) -> *mut u8 {
    if program::enabled() && n != 0 {
        probe(src, n);
        probe(dest, n);
    }
    (host::MEMMOVE.get())(dest, src, n)
}

/// # Safety
///
/// `memset` contract.
pub unsafe fn memset(s: *mut u8, c: c_int, n: usize) -> *mut u8 {
    if program::enabled() && n != 0 {
        probe(s, n);
    }
    (host::MEMSET.get())(s, c, n)
}

/// # Safety
///
/// `memcmp` contract.
pub unsafe fn memcmp(s1: *const u8, s2: *const u8, n: usize) -> c_int {
    if program::enabled() && n != 0 {
        probe(s1, n);
        probe(s2, n);
    }
    (host::MEMCMP.get())(s1, s2, n)
}

/// # Safety
///
/// `strlen` contract.
pub unsafe fn strlen(s: *const c_char) -> usize {
    if program::enabled() {
        let len = (host::STRLEN.get())(s);
        if len != 0 {
            probe(s as *const u8, len);
        }
        return len;
    }
    (host::STRLEN.get())(s)
}

/// # Safety
///
/// `strnlen` contract.
pub unsafe fn strnlen(s: *const c_char, maxlen: usize) -> usize {
    if program::enabled() && maxlen != 0 {
        probe(s as *const u8, maxlen);
    }
    (host::STRNLEN.get())(s, maxlen)
}

/// Index of the first position where the strings differ or terminate.
unsafe fn first_difference(s1: *const c_char, s2: *const c_char, limit: usize) -> usize {
    let mut i = 0;
    while i < limit {
        let c1 = *s1.add(i) as u8;
        let c2 = *s2.add(i) as u8;
        if c1 != c2 || c1 == 0 {
            break;
        }
        i += 1;
    }
    i
}

/// # Safety
///
/// `strcmp` contract.
pub unsafe fn strcmp(s1: *const c_char, s2: *const c_char) -> c_int {
    if program::enabled() {
        // Probe only up to the first differing or terminating byte, so a
        // short string sitting right before a redzone does not read as a
        // violation.
        let i = first_difference(s1, s2, usize::MAX);
        if i != 0 {
            probe(s1 as *const u8, i);
            probe(s2 as *const u8, i);
        }
    }
    (host::STRCMP.get())(s1, s2)
}

/// # Safety
///
/// `strncmp` contract.
pub unsafe fn strncmp(s1: *const c_char, s2: *const c_char, n: usize) -> c_int {
    if program::enabled() {
        let i = first_difference(s1, s2, n);
        let span = if i + 1 < n { i + 1 } else { n };
        if n != 0 {
            probe(s1 as *const u8, span);
            probe(s2 as *const u8, span);
        }
    }
    (host::STRNCMP.get())(s1, s2, n)
}

/// # Safety
///
/// `strcpy` contract.
pub unsafe fn strcpy(dest: *mut c_char, src: *const c_char) -> *mut c_char {
    if program::enabled() {
        let len = (host::STRLEN.get())(src);
        return memcpy(dest as *mut u8, src as *const u8, len + 1) as *mut c_char;
    }
    (host::STRCPY.get())(dest, src)
}

/// # Safety
///
/// `strncpy` contract.
pub unsafe fn strncpy(dest: *mut c_char, src: *const c_char, n: usize) -> *mut c_char {
    if program::enabled() {
        let len = (host::STRNLEN.get())(src, n);
        if len != n {
            memset(dest.add(len) as *mut u8, 0, n - len);
        }
        return memcpy(dest as *mut u8, src as *const u8, len) as *mut c_char;
    }
    (host::STRNCPY.get())(dest, src, n)
}

/// # Safety
///
/// `strcat` contract.
pub unsafe fn strcat(dest: *mut c_char, src: *const c_char) -> *mut c_char {
    if program::enabled() {
        let dest_len = (host::STRLEN.get())(dest);
        let src_len = (host::STRLEN.get())(src);
        memcpy(
            dest.add(dest_len) as *mut u8,
            src as *const u8,
            src_len + 1,
        );
        return dest;
    }
    (host::STRCAT.get())(dest, src)
}

/// # Safety
///
/// `strncat` contract.
pub unsafe fn strncat(dest: *mut c_char, src: *const c_char, n: usize) -> *mut c_char {
    if program::enabled() {
        let dest_len = (host::STRLEN.get())(dest);
        let src_len = (host::STRNLEN.get())(src, n);
        let tail = dest.add(dest_len);
        *tail.add(src_len) = 0;
        memcpy(tail as *mut u8, src as *const u8, src_len);
        return dest;
    }
    (host::STRNCAT.get())(dest, src, n)
}

/// # Safety
///
/// `wcscpy` contract.
pub unsafe fn wcscpy(dest: *mut WChar, src: *const WChar) -> *mut WChar {
    if program::enabled() {
        let bytes = (host::wcslen(src) + 1) * core::mem::size_of::<WChar>();
        return memcpy(dest as *mut u8, src as *const u8, bytes) as *mut WChar;
    }
    (host::WCSCPY.get())(dest, src)
}

/// # Safety
///
/// `puts` contract.
pub unsafe fn puts(s: *const c_char) -> c_int {
    if program::enabled() {
        let len = (host::STRLEN.get())(s);
        if len != 0 {
            probe(s as *const u8, len);
        }
    }
    (host::PUTS.get())(s)
}

/// # Safety
///
/// `snprintf` contract; `args` must match the format.
pub unsafe fn snprintf(
    s: *mut c_char,
    maxlen: usize,
    format: *const c_char,
    args: &mut VaList<'_>,
) -> c_int {
    if program::enabled() && maxlen != 0 {
        probe(s as *const u8, maxlen);
    }
    host::vsnprintf(s, maxlen, format, args.clone())
}

/// Whether a format string qualifies for the `printf` probe: exactly one
/// conversion, and it is `%s`. Anything fancier is passed through
/// unprobed; the only conversion that makes `printf` dereference caller
/// memory is `%s`, and full varargs parsing is out of scope.
fn probes_format(format: &[u8]) -> bool {
    format.windows(2).any(|w| w == b"%s")
        && format.iter().filter(|&&b| b == b'%').count() == 1
}

/// # Safety
///
/// `printf` contract; `args` must match the format.
pub unsafe fn printf(format: *const c_char, args: &mut VaList<'_>) -> c_int {
    if program::enabled() {
        let fmt = core::ffi::CStr::from_ptr(format).to_bytes();
        if probes_format(fmt) {
            let s: *const c_char = args.clone().next_arg::<*const c_char>();
            let len = (host::STRLEN.get())(s);
            if len != 0 {
                probe(s as *const u8, len);
            }
        }
    }
    host::vfprintf(host::STDOUT, format, args.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_difference_finds_the_split() {
        let a = c"redzone".as_ptr();
        let b = c"redzXne".as_ptr();
        unsafe {
            assert_eq!(first_difference(a, b, usize::MAX), 4);
            assert_eq!(first_difference(a, a, usize::MAX), 7);
            assert_eq!(first_difference(a, b, 2), 2);
            assert_eq!(first_difference(c"".as_ptr(), c"x".as_ptr(), 8), 0);
        }
    }

    #[test]
    fn printf_gate_wants_exactly_one_string_conversion() {
        assert!(probes_format(b"%s"));
        assert!(probes_format(b"value: %s\n"));
        assert!(!probes_format(b"%d"));
        assert!(!probes_format(b"%s %s"));
        assert!(!probes_format(b"%d %s"));
        assert!(!probes_format(b"plain text"));
        assert!(!probes_format(b""));
    }

    #[test]
    fn shims_delegate_when_disabled() {
        // The enable flag is never set in the test harness, so the shims
        // are pass-throughs over the real routines.
        let mut dst = [0u8; 8];
        unsafe {
            memcpy(dst.as_mut_ptr(), b"redzone\0".as_ptr(), 8);
            assert_eq!(&dst, b"redzone\0");
            assert_eq!(strlen(dst.as_ptr() as *const c_char), 7);
            assert_eq!(strnlen(dst.as_ptr() as *const c_char, 4), 4);
            assert_eq!(
                strcmp(dst.as_ptr() as *const c_char, c"redzone".as_ptr()),
                0
            );
            memset(dst.as_mut_ptr(), 0, 8);
            assert_eq!(dst, [0u8; 8]);
        }
    }

    #[test]
    fn wide_copy_counts_bytes() {
        let src: [WChar; 4] = ['a' as WChar, 'b' as WChar, 'c' as WChar, 0];
        let mut dst: [WChar; 4] = [0x7f7f; 4];
        unsafe {
            wcscpy(dst.as_mut_ptr(), src.as_ptr());
        }
        assert_eq!(dst, src);
    }
}
