//! The canonical poison pattern and the operations that place, probe,
//! recognize, and remove it.
//!
//! A redzone is 16 bytes: one lead byte `0x89` followed by fifteen `0x8b`.
//! Any aligned-or-not quadruplet of those bytes, read as an `f32` and added
//! to [`PROBE_ADDEND`], yields a subnormal sum, which flush-to-zero turns
//! into an underflow trap. The lead byte tells "start of redzone" apart
//! from "interior of redzone" and anchors the scans in [`confirm`] and
//! [`strip`].

use crate::arch;
use crate::host;

/// Redzone width in bytes.
pub const REDZONE_SIZE: usize = 16;

/// Probe stride. Any full redzone overlapping a probed range is hit by at
/// least one probe at this stride.
pub const PROBE_STRIDE: usize = REDZONE_SIZE / 2;

/// Interior poison byte.
pub const POISON_BYTE: u8 = 0x8b;

/// Lead poison byte, marking the start of a redzone.
pub const POISON_LEAD_BYTE: u8 = 0x89;

/// Four interior bytes, as the little-endian word a probe reads.
pub const POISON_WORD: u32 = 0x8b8b_8b8b;

/// The lead quadruplet.
pub const POISON_LEAD_WORD: u32 = 0x8b8b_8b89;

/// The full 16-byte pattern.
pub const PATTERN: [u8; REDZONE_SIZE] = [
    0x89, 0x8b, 0x8b, 0x8b, 0x8b, 0x8b, 0x8b, 0x8b, 0x8b, 0x8b, 0x8b, 0x8b, 0x8b, 0x8b, 0x8b,
    0x8b,
];

/// The pattern as the four words saved XMM registers are compared against.
pub const PATTERN_WORDS: [u32; 4] = [POISON_LEAD_WORD, POISON_WORD, POISON_WORD, POISON_WORD];

/// The probe addend. Chosen so that `addend + f32::from_bits(POISON_WORD)`
/// and `addend + f32::from_bits(POISON_LEAD_WORD)` are subnormal.
pub const PROBE_ADDEND: f32 = f32::from_bits(0x0b8b_8b8a);

/// Write the pattern at `p` (the underflow guard of an allocation).
///
/// # Safety
///
/// `p` must be valid for 16 bytes of writes.
#[inline]
pub unsafe fn apply_underflow(p: *mut u8) {
    (p as *mut [u8; REDZONE_SIZE]).write_unaligned(PATTERN);
}

/// Write the pattern at `p + size` and extend it with `delta` bytes of
/// interior poison, so the overflow guard reaches the end of whatever the
/// underlying allocator actually handed out.
///
/// # Safety
///
/// `p + size` must be valid for `16 + delta` bytes of writes.
#[inline]
pub unsafe fn apply_overflow(p: *mut u8, size: usize, delta: usize) {
    let guard = p.add(size);
    (guard as *mut [u8; REDZONE_SIZE]).write_unaligned(PATTERN);
    host::memset_uninterposed(guard.add(REDZONE_SIZE), POISON_BYTE, delta);
}

/// Probe `[p, p + n)`: one probe every [`PROBE_STRIDE`] bytes starting at
/// `p`, plus one on the last byte. Returns without probing for `n == 0`.
///
/// Probes never branch on memory contents and never write; detection is
/// entirely the trap's business.
///
/// # Safety
///
/// The range must be readable.
#[inline]
pub unsafe fn probe(p: *const u8, n: usize) {
    if n == 0 {
        return;
    }
    let start = p as usize;
    let mut at = start;
    while at < start + n {
        arch::fp_probe(at as *const u8);
        at += PROBE_STRIDE;
    }
    arch::fp_probe((start + n - 1) as *const u8);
}

/// Remove both guards from the padded allocation starting at `p`, whose
/// usable size is `usable`: zero the 16 lead bytes, then walk back from the
/// usable end over interior poison and zero the overflow guard found there.
///
/// # Safety
///
/// `p` must be the base of a padded allocation with both guards intact and
/// `usable` bytes accessible.
pub unsafe fn strip(p: *mut u8, usable: usize) {
    host::memset_uninterposed(p, 0, REDZONE_SIZE);

    // Find the start of the overflow guard. The final 15 bytes are interior
    // poison by construction, so the walk starts one full zone in.
    let end = p.add(usable);
    let mut i = REDZONE_SIZE;
    while i < usable && *end.sub(i) == POISON_BYTE {
        i += 1;
    }
    // `end - i` is the lead byte.
    host::memset_uninterposed(end.sub(i), 0, i);
}

/// Decide whether a trapping address really lies inside a redzone.
///
/// The trapping word must be the lead or interior quadruplet; a lead word
/// must be followed by the rest of the zone, and an interior word must scan
/// left to a lead byte carrying a complete zone. Anything else is an
/// incidental underflow.
///
/// # Safety
///
/// `fault` must be readable, as must the bytes of any redzone it sits in.
/// The left scan reads below `fault` until a non-poison byte appears.
pub unsafe fn confirm(fault: *const u8) -> bool {
    let word = (fault as *const u32).read_unaligned();
    if word != POISON_WORD && word != POISON_LEAD_WORD {
        return false;
    }

    if word == POISON_LEAD_WORD {
        // The lead byte marks the start of a zone; the remaining 12 bytes
        // must complete it. Scanning right here avoids reading into a
        // neighboring underflow guard.
        for i in 4..REDZONE_SIZE {
            if *fault.add(i) != POISON_BYTE {
                return false;
            }
        }
        true
    } else {
        // Walk left to the first byte that is not interior poison; a true
        // zone puts the lead byte there, with a complete zone after it.
        let mut p = fault;
        while *p == POISON_BYTE {
            p = p.sub(1);
        }
        if *p != POISON_LEAD_BYTE {
            return false;
        }
        for i in 1..REDZONE_SIZE {
            if *p.add(i) != POISON_BYTE {
                return false;
            }
        }
        true
    }
}
