//! Frame buffer ring shared by the DMA producer and the capture consumer
//!
//! Slots are written at the tail by DMA and read at the head by the
//! capture call. Ring pointers and slot states live behind one mutex (the
//! critical section); pixel data lives in per-slot mutexes so a consumer
//! holding its slot never blocks the producer writing another one.
//!
//! The pool also owns one overlay buffer for preview encoding. It is never
//! part of the ring, so DMA can't reach it.

use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tracing::{debug, trace};

use crate::error::BufferError;
use crate::utils::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailMode {
    /// Look at the current DMA destination without changing anything
    Peek,
    /// Commit the tail as a complete frame and move to the next slot
    Advance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadMode {
    Plain,
    /// Make DMA writes visible before the consumer reads the slot
    Invalidate,
}

/// DMA destination inside the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaAddr {
    pub slot: usize,
    pub offset: usize,
    stride: usize,
}

impl DmaAddr {
    /// Byte offset from the start of the pool's backing region.
    pub fn address(&self) -> usize {
        self.slot * self.stride + self.offset
    }

    pub fn offset_by(self, bytes: usize) -> Self {
        Self {
            offset: self.offset + bytes,
            ..self
        }
    }
}

/// Recorded when the producer commits a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMeta {
    pub sequence: u64,
    /// Bytes the producer wrote
    pub len: usize,
    pub captured_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Ready,
    Reading,
}

struct Ring {
    slot_len: usize,
    count: usize,
    requested: usize,
    state: Vec<SlotState>,
    enabled: Vec<bool>,
    meta: Vec<Option<SlotMeta>>,
    tail: usize,
    /// Committed slots, oldest first
    ready: HeapRb<usize>,
    reading: Option<usize>,
    /// High-water mark of DMA writes into the tail
    written: usize,
    sequence: u64,
}

impl Ring {
    fn new(max_slots: usize) -> Self {
        Self {
            slot_len: 0,
            count: 0,
            requested: 1,
            state: vec![SlotState::Free; max_slots],
            enabled: vec![false; max_slots],
            meta: vec![None; max_slots],
            tail: 0,
            ready: HeapRb::new(max_slots),
            reading: None,
            written: 0,
            sequence: 0,
        }
    }

    fn next_enabled(&self, from: usize) -> usize {
        let n = self.enabled.len();
        (1..=n)
            .map(|step| (from + step) % n)
            .find(|&i| self.enabled[i])
            .unwrap_or(from)
    }

    fn release(&mut self, id: usize) {
        self.state[id] = SlotState::Free;
        self.meta[id] = None;
    }

    fn remove_ready(&mut self, id: usize) {
        let mut kept = Vec::with_capacity(self.ready.occupied_len());
        while let Some(slot) = self.ready.try_pop() {
            if slot != id {
                kept.push(slot);
            }
        }
        for slot in kept {
            self.ready.push_overwrite(slot);
        }
        self.release(id);
    }

    fn drain_ready(&mut self) -> usize {
        let mut drained = 0;
        while let Some(id) = self.ready.try_pop() {
            self.release(id);
            drained += 1;
        }
        drained
    }

    fn hard_reset(&mut self) {
        self.drain_ready();
        for id in 0..self.state.len() {
            self.release(id);
        }
        self.reading = None;
        self.written = 0;
        self.tail = self.enabled.iter().position(|&e| e).unwrap_or(0);
    }
}

#[derive(Default)]
struct Stats {
    committed: AtomicU64,
    consumed: AtomicU64,
    dropped: AtomicU64,
    flushes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub committed: u64,
    pub consumed: u64,
    pub dropped: u64,
    pub flushes: u64,
}

/// Fixed byte budget carved into K frame slots.
///
/// K = 1 is single buffering, K = 2 double buffering, K >= 3 a FIFO that
/// overwrites the oldest undelivered frame when the producer catches up.
pub struct FrameBufferPool {
    capacity: usize,
    ring: Mutex<Ring>,
    slots: Vec<Mutex<Vec<u8>>>,
    overlay: Mutex<Vec<u8>>,
    stats: CachePadded<Stats>,
}

impl FrameBufferPool {
    pub fn new(capacity: usize, max_slots: usize) -> Self {
        let max_slots = max_slots.max(1);
        Self {
            capacity,
            ring: Mutex::new(Ring::new(max_slots)),
            slots: (0..max_slots).map(|_| Mutex::new(Vec::new())).collect(),
            overlay: Mutex::new(Vec::new()),
            stats: CachePadded::new(Stats::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_len(&self) -> usize {
        lock(&self.ring).slot_len
    }

    /// Number of enabled slots.
    pub fn count(&self) -> usize {
        lock(&self.ring).count
    }

    /// Slot count asked for through [`set_buffer_count`](Self::set_buffer_count).
    pub fn requested_count(&self) -> usize {
        lock(&self.ring).requested
    }

    /// Carves the budget into `count` slots of `slot_len` bytes and resets
    /// the ring. Returns how many slots fit.
    pub fn setup(&self, slot_len: usize, count: usize) -> Result<usize, BufferError> {
        let max = self.max_slots();
        if count == 0 || count > max {
            return Err(BufferError::InvalidCount {
                requested: count,
                max,
            });
        }
        if slot_len == 0 || slot_len > self.capacity {
            return Err(BufferError::OutOfMemory {
                required: slot_len,
                capacity: self.capacity,
            });
        }

        let k = count.min(self.capacity / slot_len);
        let mut ring = lock(&self.ring);
        for (id, slot) in self.slots.iter().enumerate() {
            let mut data = lock(slot);
            if id < k {
                data.resize(slot_len, 0);
            } else {
                data.clear();
                data.shrink_to_fit();
            }
            ring.enabled[id] = id < k;
        }
        ring.slot_len = slot_len;
        ring.count = k;
        ring.requested = count;
        ring.hard_reset();

        debug!(slot_len, requested = count, slots = k, "frame buffer pool set up");
        Ok(k)
    }

    /// Changes the ring depth, keeping the current slot size.
    pub fn set_buffer_count(&self, count: usize) -> Result<usize, BufferError> {
        let slot_len = {
            let mut ring = lock(&self.ring);
            let max = ring.enabled.len();
            if count == 0 || count > max {
                return Err(BufferError::InvalidCount {
                    requested: count,
                    max,
                });
            }
            if ring.slot_len == 0 {
                ring.requested = count;
                return Ok(count);
            }
            ring.slot_len
        };
        self.setup(slot_len, count)
    }

    /// Returns the tail slot if DMA may write it; `Advance` commits it first.
    ///
    /// With three or more slots, advancing onto a completed frame that
    /// nobody has read evicts that frame.
    pub fn get_tail(&self, mode: TailMode) -> Option<DmaAddr> {
        self.get_tail_if(mode, || true)
    }

    /// [`get_tail`](Self::get_tail) gated on `live`, which is evaluated
    /// inside the ring's critical section. A flush either runs entirely
    /// before the check or entirely after the commit.
    pub fn get_tail_if(&self, mode: TailMode, live: impl FnOnce() -> bool) -> Option<DmaAddr> {
        let mut ring = lock(&self.ring);
        if !live() {
            return None;
        }
        let tail = ring.tail;
        if ring.count == 0 || ring.state[tail] != SlotState::Free {
            return None;
        }
        let addr = DmaAddr {
            slot: tail,
            offset: 0,
            stride: ring.slot_len,
        };
        if mode == TailMode::Peek {
            return Some(addr);
        }

        ring.sequence += 1;
        ring.meta[tail] = Some(SlotMeta {
            sequence: ring.sequence,
            len: ring.written,
            captured_at: Instant::now(),
        });
        ring.state[tail] = SlotState::Ready;
        if let Some(evicted) = ring.ready.push_overwrite(tail) {
            ring.release(evicted);
        }
        ring.written = 0;
        self.stats.committed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("pool_frames_committed").increment(1);

        let mut next = ring.next_enabled(tail);
        if ring.count >= 3 {
            if ring.state[next] == SlotState::Reading {
                next = ring.next_enabled(next);
            }
            if ring.state[next] == SlotState::Ready {
                ring.remove_ready(next);
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("pool_frames_dropped").increment(1);
                trace!(slot = next, "overwriting oldest undelivered frame");
            }
        }
        ring.tail = next;
        Some(addr)
    }

    /// Checks out the oldest complete frame. Only one slot can be checked
    /// out at a time.
    pub fn get_head(&self, mode: HeadMode) -> Option<(usize, SlotMeta)> {
        let mut ring = lock(&self.ring);
        if ring.reading.is_some() {
            return None;
        }
        let id = ring.ready.try_pop()?;
        let Some(meta) = ring.meta[id] else {
            ring.release(id);
            return None;
        };
        ring.state[id] = SlotState::Reading;
        ring.reading = Some(id);
        drop(ring);

        self.stats.consumed.fetch_add(1, Ordering::Relaxed);
        if mode == HeadMode::Invalidate {
            fence(Ordering::Acquire);
        }
        Some((id, meta))
    }

    /// Releases the checked-out slot, if any.
    pub fn free_current(&self) {
        let mut ring = lock(&self.ring);
        if let Some(id) = ring.reading.take() {
            ring.release(id);
        }
    }

    /// Soft flush drops completed frames; hard flush also releases the
    /// checked-out slot and rewinds the tail.
    pub fn flush(&self, hard: bool) {
        let mut ring = lock(&self.ring);
        if hard {
            ring.hard_reset();
        } else {
            ring.drain_ready();
        }
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("pool_flushes_total", "hard" => hard.to_string()).increment(1);
        trace!(hard, "frame buffer pool flushed");
    }

    /// Forgets a partially written tail frame.
    pub fn discard_tail(&self) {
        lock(&self.ring).written = 0;
    }

    /// Copies `data` into the pool at `addr`. Only the free tail slot
    /// accepts writes.
    pub fn dma_write(&self, addr: DmaAddr, data: &[u8]) -> Result<(), BufferError> {
        let end = self.claim(addr.slot, addr.offset, data.len())?;
        lock(&self.slots[addr.slot])[addr.offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Lets `fill` write the tail slot directly; it returns the bytes written.
    pub fn write_slot<F>(&self, slot: usize, fill: F) -> Result<usize, BufferError>
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        let slot_len = self.claim(slot, 0, 0)?;
        let written = fill(&mut lock(&self.slots[slot])[..]).min(slot_len);
        let mut ring = lock(&self.ring);
        ring.written = ring.written.max(written);
        Ok(written)
    }

    // Validates a write and bumps the high-water mark, returning its end.
    fn claim(&self, slot: usize, offset: usize, len: usize) -> Result<usize, BufferError> {
        let mut ring = lock(&self.ring);
        if slot >= ring.count || slot != ring.tail || ring.state[slot] != SlotState::Free {
            return Err(BufferError::SlotBusy(slot));
        }
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= ring.slot_len)
            .ok_or(BufferError::OutOfBounds {
                offset,
                len,
                slot_len: ring.slot_len,
            })?;
        if len == 0 {
            return Ok(ring.slot_len);
        }
        ring.written = ring.written.max(end);
        Ok(end)
    }

    pub fn lock_slot(&self, id: usize) -> MutexGuard<'_, Vec<u8>> {
        lock(&self.slots[id])
    }

    /// Scratch buffer for preview/JPEG work; sized by whoever uses it.
    pub fn overlay(&self) -> MutexGuard<'_, Vec<u8>> {
        lock(&self.overlay)
    }

    pub fn meta(&self, id: usize) -> Option<SlotMeta> {
        lock(&self.ring).meta.get(id).copied().flatten()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            committed: self.stats.committed.load(Ordering::Relaxed),
            consumed: self.stats.consumed.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            flushes: self.stats.flushes.load(Ordering::Relaxed),
        }
    }
}
