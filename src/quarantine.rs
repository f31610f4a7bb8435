//! The quarantine ring: freed-but-still-poisoned blocks, held back from the
//! underlying allocator until the ring's byte budget forces them out.

use core::ptr::null_mut;

use rustix_futex_sync::Mutex;

/// Upper bound on the bytes held in quarantine.
pub const QUARANTINE_BYTES: u64 = 256 * 1024 * 1024;

// The smallest padded allocation the wrapper produces occupies at least
// this many usable bytes, which bounds the record count.
const MIN_ALLOC_SIZE: usize = 40;

/// Capacity of the process-wide ring.
pub const RING_CAPACITY: usize = QUARANTINE_BYTES as usize / MIN_ALLOC_SIZE;

/// One quarantined block: the padded base pointer and the usable size the
/// underlying allocator reported for it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Record {
    pub base: *mut u8,
    pub usable: usize,
}

impl Record {
    const EMPTY: Self = Self {
        base: null_mut(),
        usable: 0,
    };
}

// Records are inert addresses while they sit in the ring; nothing
// dereferences them under the lock.
unsafe impl Send for Record {}

/// A fixed-capacity ring of records plus the byte counter. The counter
/// equals the sum of the sizes of the records between `front` and `rear`
/// whenever the lock is released.
pub struct Ring<const CAP: usize> {
    slots: [Record; CAP],
    front: usize,
    rear: usize,
    bytes: u64,
}

impl<const CAP: usize> Ring<CAP> {
    pub const fn new() -> Self {
        Self {
            slots: [Record::EMPTY; CAP],
            front: 0,
            rear: 0,
            bytes: 0,
        }
    }

    /// Append at `rear` and grow the counter.
    pub fn push(&mut self, record: Record) {
        self.slots[self.rear] = record;
        self.rear += 1;
        if self.rear == CAP {
            self.rear = 0;
        }
        self.bytes += record.usable as u64;
    }

    /// Dequeue the oldest record if the counter is above `bound`. The
    /// caller owns the returned block and is expected to release it
    /// outside the lock.
    pub fn pop_over(&mut self, bound: u64) -> Option<Record> {
        if self.bytes <= bound {
            return None;
        }
        // A nonzero counter implies at least one record.
        let record = self.slots[self.front];
        self.front += 1;
        if self.front == CAP {
            self.front = 0;
        }
        self.bytes -= record.usable as u64;
        Some(record)
    }

    #[cfg(test)]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    #[cfg(test)]
    pub fn records(&self) -> usize {
        (self.rear + CAP - self.front) % CAP
    }
}

static RING: Mutex<Ring<RING_CAPACITY>> = Mutex::new(Ring::new());

/// Enqueue a freed block into the process-wide ring.
pub fn push(record: Record) {
    RING.lock().push(record);
}

/// Dequeue the oldest block if the process-wide ring is over budget.
pub fn pop_over_budget() -> Option<Record> {
    RING.lock().pop_over(QUARANTINE_BYTES)
}

/// Bytes currently quarantined.
#[cfg(test)]
pub fn resident_bytes() -> u64 {
    RING.lock().bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(addr: usize, usable: usize) -> Record {
        Record {
            base: addr as *mut u8,
            usable,
        }
    }

    #[test]
    fn counter_tracks_record_sum() {
        let mut ring: Ring<8> = Ring::new();
        ring.push(record(0x1000, 64));
        ring.push(record(0x2000, 96));
        assert_eq!(ring.bytes(), 160);
        assert_eq!(ring.records(), 2);

        assert_eq!(ring.pop_over(1000), None);
        assert_eq!(ring.pop_over(100), Some(record(0x1000, 64)));
        assert_eq!(ring.bytes(), 96);
        assert_eq!(ring.pop_over(0), Some(record(0x2000, 96)));
        assert_eq!(ring.bytes(), 0);
        assert_eq!(ring.pop_over(0), None);
    }

    #[test]
    fn eviction_is_fifo_and_restores_budget() {
        let mut ring: Ring<8> = Ring::new();
        for i in 0..5 {
            ring.push(record(0x1000 * (i + 1), 100));
        }
        // Budget 250: evict until at or below.
        let mut evicted = Vec::new();
        while let Some(r) = ring.pop_over(250) {
            evicted.push(r.base as usize);
        }
        assert_eq!(evicted, vec![0x1000, 0x2000, 0x3000]);
        assert_eq!(ring.bytes(), 200);
    }

    #[test]
    fn indices_wrap() {
        let mut ring: Ring<4> = Ring::new();
        for round in 0..3usize {
            for i in 0..4usize {
                ring.push(record(0x100 + round * 16 + i, 10));
            }
            while ring.pop_over(0).is_some() {}
            assert_eq!(ring.bytes(), 0);
            assert_eq!(ring.records(), 0);
        }
    }
}
