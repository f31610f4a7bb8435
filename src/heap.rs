//! The allocator wrapper: redzone padding around every heap object, and the
//! quarantine routing for freed blocks.
//!
//! Layout of a padded allocation of requested size `n`:
//!
//! ```text
//! base                base+16            base+16+n        base+usable
//! | underflow guard | user payload ...  | overflow guard + fill |
//! ```
//!
//! The user pointer is `base + 16`; the overflow guard always reaches the
//! end of whatever the underlying allocator actually handed out, so a probe
//! landing anywhere in the slack still hits poison.

use core::ffi::c_int;

use crate::arch;
use crate::host;
use crate::program;
#[cfg(feature = "quarantine")]
use crate::quarantine::{self, Record};
use crate::redzone::{self, REDZONE_SIZE};

/// Bytes added around every request: one guard on each side.
pub const PADDING: usize = 2 * REDZONE_SIZE;

/// `malloc`.
///
/// # Safety
///
/// C allocator contract.
pub unsafe fn malloc(size: usize) -> *mut u8 {
    if !program::enabled() {
        return host::__libc_malloc(size);
    }
    padded_malloc(size)
}

/// `calloc`.
///
/// # Safety
///
/// C allocator contract.
pub unsafe fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    if !program::enabled() {
        return host::__libc_calloc(nmemb, size);
    }
    padded_calloc(nmemb, size)
}

/// `realloc`.
///
/// # Safety
///
/// C allocator contract; a non-null `ptr` must have come from the padded
/// paths below.
pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    if !program::enabled() {
        return host::__libc_realloc(ptr, size);
    }
    padded_realloc(ptr, size)
}

/// `free`.
///
/// # Safety
///
/// C allocator contract; a non-null `ptr` must have come from the padded
/// paths below.
pub unsafe fn free(ptr: *mut u8) {
    if !program::enabled() {
        return host::__libc_free(ptr);
    }
    release(ptr);
}

/// `posix_memalign`. Alignment is satisfied by the underlying allocator's
/// own guarantee once the guard shift is applied; requests beyond that ride
/// on the plain padded path.
///
/// # Safety
///
/// C allocator contract; `memptr` must be valid for writes.
pub unsafe fn posix_memalign(memptr: *mut *mut u8, alignment: usize, size: usize) -> c_int {
    if !program::enabled() {
        return (host::POSIX_MEMALIGN.get())(memptr, alignment, size);
    }
    let p = padded_malloc(size);
    *memptr = p;
    if p.is_null() {
        rustix::io::Errno::NOMEM.raw_os_error()
    } else {
        0
    }
}

/// Allocate `size` bytes bracketed by both guards. Zero-size requests
/// return null.
///
/// # Safety
///
/// Must only run once the process allocator is usable.
pub unsafe fn padded_malloc(size: usize) -> *mut u8 {
    if size == 0 {
        return core::ptr::null_mut();
    }
    let padded = size + PADDING;
    let base = host::__libc_malloc(padded);
    if base.is_null() {
        return base;
    }

    redzone::apply_underflow(base);
    let usable = host::malloc_usable_size(base);
    let user = base.add(REDZONE_SIZE);
    redzone::apply_overflow(user, size, usable - padded);
    user
}

/// Allocate a zeroed array bracketed by both guards. The element-count
/// product is overflow-checked.
///
/// # Safety
///
/// Must only run once the process allocator is usable.
pub unsafe fn padded_calloc(nmemb: usize, size: usize) -> *mut u8 {
    let Some(total) = nmemb.checked_mul(size) else {
        return core::ptr::null_mut();
    };

    let padded = total + PADDING;
    let base = host::__libc_malloc(padded);
    if base.is_null() {
        return base;
    }

    redzone::apply_underflow(base);
    let usable = host::malloc_usable_size(base);
    let user = base.add(REDZONE_SIZE);
    host::memset_uninterposed(user, 0, total);
    redzone::apply_overflow(user, total, usable - padded);
    user
}

/// Resize a padded allocation. The old guards are stripped first so they
/// are not copied into the new block, then both guards are applied to the
/// result.
///
/// # Safety
///
/// A non-null `ptr` must be a live padded user pointer.
pub unsafe fn padded_realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    if ptr.is_null() {
        return padded_malloc(size);
    }
    if size == 0 {
        release(ptr);
        return core::ptr::null_mut();
    }

    let base = ptr.sub(REDZONE_SIZE);
    redzone::strip(base, host::malloc_usable_size(base));

    let padded = size + PADDING;
    let new_base = host::__libc_realloc(base, padded);
    if new_base.is_null() {
        return new_base;
    }

    redzone::apply_underflow(new_base);
    let usable = host::malloc_usable_size(new_base);
    let user = new_base.add(REDZONE_SIZE);
    redzone::apply_overflow(user, size, usable - padded);
    user
}

/// Free a padded allocation: one probe on the user pointer (a block freed
/// earlier is poisoned there, so a double free traps), then into the
/// quarantine, or straight back to the allocator when quarantine is
/// compiled out.
///
/// # Safety
///
/// A non-null `ptr` must be a live padded user pointer.
pub unsafe fn release(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }

    arch::fp_probe(ptr);

    let base = ptr.sub(REDZONE_SIZE);

    #[cfg(feature = "quarantine")]
    {
        let usable = host::malloc_usable_size(base);
        quarantine_insert(base, usable);
    }
    #[cfg(not(feature = "quarantine"))]
    {
        redzone::strip(base, host::malloc_usable_size(base));
        host::__libc_free(base);
    }
}

/// Poison the payload, enqueue the block, and evict past the byte budget.
/// The fills and the final frees run outside the ring lock.
#[cfg(feature = "quarantine")]
unsafe fn quarantine_insert(base: *mut u8, usable: usize) {
    quarantine::push(Record { base, usable });

    // The lead guard and the last 15 bytes already hold poison from the
    // allocation; only the payload in between needs the fill.
    host::memset_uninterposed(
        base.add(REDZONE_SIZE),
        redzone::POISON_BYTE,
        usable - REDZONE_SIZE - (REDZONE_SIZE - 1),
    );

    while let Some(victim) = quarantine::pop_over_budget() {
        host::memset_uninterposed(victim.base, 0, victim.usable);
        host::__libc_free(victim.base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redzone::{PATTERN, POISON_BYTE};

    unsafe fn usable_of(user: *mut u8) -> usize {
        host::malloc_usable_size(user.sub(REDZONE_SIZE))
    }

    #[test]
    fn zero_size_is_null() {
        assert!(unsafe { padded_malloc(0) }.is_null());
    }

    #[test]
    fn calloc_overflow_is_null() {
        assert!(unsafe { padded_calloc(usize::MAX, 2) }.is_null());
    }

    #[test]
    fn guards_bracket_the_payload() {
        let size = 40;
        let user = unsafe { padded_malloc(size) };
        assert!(!user.is_null());
        let usable = unsafe { usable_of(user) };

        unsafe {
            let lead = core::slice::from_raw_parts(user.sub(REDZONE_SIZE), REDZONE_SIZE);
            assert_eq!(lead, &PATTERN);
            let guard = core::slice::from_raw_parts(user.add(size), REDZONE_SIZE);
            assert_eq!(guard, &PATTERN);
            // Fill out to the usable end is interior poison.
            let tail = core::slice::from_raw_parts(
                user.add(size + REDZONE_SIZE),
                usable - PADDING - size,
            );
            assert!(tail.iter().all(|&b| b == POISON_BYTE));

            // Leave the block stripped and freed without the probe path so
            // this test does not depend on AVX.
            let base = user.sub(REDZONE_SIZE);
            redzone::strip(base, usable);
            host::__libc_free(base);
        }
    }

    #[test]
    fn calloc_payload_is_zero() {
        let user = unsafe { padded_calloc(7, 9) };
        assert!(!user.is_null());
        unsafe {
            let payload = core::slice::from_raw_parts(user, 63);
            assert!(payload.iter().all(|&b| b == 0));
            assert_eq!(
                core::slice::from_raw_parts(user.add(63), REDZONE_SIZE),
                &PATTERN
            );
            let base = user.sub(REDZONE_SIZE);
            redzone::strip(base, host::malloc_usable_size(base));
            host::__libc_free(base);
        }
    }

    #[test]
    fn realloc_preserves_payload_and_guards() {
        unsafe {
            let user = padded_malloc(40);
            assert!(!user.is_null());
            core::slice::from_raw_parts_mut(user, 40).fill(0xaa);

            let grown = padded_realloc(user, 120);
            assert!(!grown.is_null());
            let payload = core::slice::from_raw_parts(grown, 120);
            // Old payload intact, and no guard bytes leaked into the copy.
            assert!(payload[..40].iter().all(|&b| b == 0xaa));

            let lead = core::slice::from_raw_parts(grown.sub(REDZONE_SIZE), REDZONE_SIZE);
            assert_eq!(lead, &PATTERN);
            let guard = core::slice::from_raw_parts(grown.add(120), REDZONE_SIZE);
            assert_eq!(guard, &PATTERN);

            let base = grown.sub(REDZONE_SIZE);
            redzone::strip(base, host::malloc_usable_size(base));
            host::__libc_free(base);
        }
    }

    #[test]
    fn realloc_null_and_zero_edges() {
        unsafe {
            let p = padded_realloc(core::ptr::null_mut(), 24);
            assert!(!p.is_null());

            if std::arch::is_x86_feature_detected!("avx") {
                // realloc(p, 0) frees through the quarantine path, which
                // probes; only run it where the probe can execute.
                assert!(padded_realloc(p, 0).is_null());
            } else {
                let base = p.sub(REDZONE_SIZE);
                redzone::strip(base, host::malloc_usable_size(base));
                host::__libc_free(base);
            }
        }
    }

    #[cfg(feature = "quarantine")]
    #[test]
    fn release_poisons_and_enqueues() {
        if !std::arch::is_x86_feature_detected!("avx") {
            return;
        }
        unsafe {
            let size = 40;
            let user = padded_malloc(size);
            assert!(!user.is_null());
            core::slice::from_raw_parts_mut(user, size).fill(0x42);
            let usable = usable_of(user);

            let before = crate::quarantine::resident_bytes();
            release(user);
            let after = crate::quarantine::resident_bytes();
            assert!(after >= before + usable as u64);

            // The whole padded block now reads as poison: lead guard,
            // payload fill, and trailing guard.
            let base = user.sub(REDZONE_SIZE);
            assert_eq!(*base, 0x89);
            let body = core::slice::from_raw_parts(base.add(1), usable - 1);
            assert!(body.iter().all(|&b| b == POISON_BYTE));
        }
    }
}
