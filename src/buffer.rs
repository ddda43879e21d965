use std::collections::BTreeMap;
use std::time::Instant;

use crate::config::BaseType;

/// Staging area for host writes. The intake thread appends at `host_cursor`,
/// cores account what they have programmed in `drained`.
pub struct WriteBuffer {
    data: Vec<u8>,
    sector_size: BaseType,
    capacity: BaseType,
    host_cursor: BaseType,
    drained: BaseType,
    full: bool,
    last_flush: Instant,
}

impl WriteBuffer {
    pub fn new(capacity: BaseType, sector_size: BaseType) -> Self {
        WriteBuffer {
            data: vec![0; capacity * sector_size],
            sector_size,
            capacity,
            host_cursor: 0,
            drained: 0,
            full: false,
            last_flush: Instant::now(),
        }
    }

    pub fn capacity(&self) -> BaseType {
        self.capacity
    }

    pub fn free_sectors(&self) -> BaseType {
        if self.full {
            0
        } else {
            self.capacity - self.host_cursor
        }
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Sectors appended and not yet programmed.
    pub fn pending(&self) -> BaseType {
        self.host_cursor - self.drained
    }

    pub fn is_empty(&self) -> bool {
        self.host_cursor == 0
    }

    /// Copy `sectors` in at the host cursor. Returns the sector offset used, or `None` if it does not fit.
    pub fn append(&mut self, sectors: &[u8]) -> Option<BaseType> {
        let n = sectors.len() / self.sector_size;
        if self.full || n > self.capacity - self.host_cursor {
            return None;
        }
        if self.pending() == 0 {
            self.last_flush = Instant::now();
        }
        let offset = self.host_cursor;
        let start = offset * self.sector_size;
        self.data[start..start + sectors.len()].copy_from_slice(sectors);
        self.host_cursor += n;
        if self.host_cursor == self.capacity {
            self.full = true;
        }
        Some(offset)
    }

    /// No more appends until drained.
    pub fn seal(&mut self) {
        if self.host_cursor > 0 {
            self.full = true;
        }
    }

    pub fn sectors(&self, offset: BaseType, count: BaseType) -> &[u8] {
        &self.data[offset * self.sector_size..(offset + count) * self.sector_size]
    }

    /// Account `count` sectors as programmed. Returns true when that emptied the buffer,
    /// which then starts over from sector 0.
    pub fn drain(&mut self, count: BaseType) -> bool {
        self.drained = (self.drained + count).min(self.host_cursor);
        self.last_flush = Instant::now();
        if self.drained == self.host_cursor {
            self.host_cursor = 0;
            self.drained = 0;
            self.full = false;
            return true;
        }
        false
    }

    pub fn idle_since(&self) -> Instant {
        self.last_flush
    }
}

/// A reservation in a [`RingBuffer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    pub start: u64,
    pub len: BaseType,
}

/// FIFO space accounting for the read and discard staging areas.
///
/// `tail` is where the host side reserves next, `head` where the device side has released up to.
/// `tail - head` never exceeds the capacity. Releases may come back out of order; `head` only
/// moves over a contiguous released prefix.
pub struct RingBuffer {
    capacity: BaseType,
    head: u64,
    tail: u64,
    released: BTreeMap<u64, BaseType>,
}

impl RingBuffer {
    pub fn new(capacity: BaseType) -> Self {
        RingBuffer { capacity, head: 0, tail: 0, released: BTreeMap::new() }
    }

    pub fn capacity(&self) -> BaseType {
        self.capacity
    }

    pub fn in_use(&self) -> BaseType {
        (self.tail - self.head) as BaseType
    }

    pub fn reserve(&mut self, len: BaseType) -> Option<Slot> {
        if len > self.capacity - self.in_use() {
            return None;
        }
        let slot = Slot { start: self.tail, len };
        self.tail += len as u64;
        Some(slot)
    }

    pub fn release(&mut self, slot: Slot) {
        self.released.insert(slot.start, slot.len);
        while let Some(len) = self.released.remove(&self.head) {
            self.head += len as u64;
        }
    }
}
