//! Variable-size block ops (§4.5): carving allocations out of a zone's
//! free space, and coalescing them back on free.
//!
//! The reference implementation's prose describes this path without a
//! concrete function body (unlike the fixed-size path, which btmalloc.c
//! implements directly), so the bookkeeping below is this crate's own,
//! internally-consistent synthesis of §4.5's rules rather than a line-for-
//! line port. See the design notes for why.
//!
//! Rather than a single shared sorted boundary list (which would need
//! mid-array insertion to split an interval — awkward under a single-word
//! CAS), each interval gets its own dedicated pair of slots: slot `2k`
//! holds its start address, slot `2k+1` its end. Bit `k` of the bitmap
//! marks record `k` used (`1`) or free (`0`); an all-zero record pair is
//! "blank" (never allocated). This makes `free(addr)` a linear scan for
//! the used record whose start equals `addr` — no size parameter needed,
//! matching the public `free(address)` contract — and a split just claims
//! a blank record instead of shifting anything. Slot 61 is the immovable
//! zone-end pointer (the resolved "reserved slot" design note); bit 62 is
//! the imaginary lock slot. Addresses are stored raw, not rotated through
//! [`crate::word`] — see `navigator.rs` for why.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::block::BlockRef;
use crate::config::{BLOCK_SIZE, VARIABLE_SLOT_COUNT, WORD_SIZE};
use crate::error::AllocError;
use crate::sync::load;

/// Number of independent interval records a block can track.
const RECORD_COUNT: usize = 30;
const ZONE_END_SLOT: usize = VARIABLE_SLOT_COUNT - 1;
const LOCK_BIT: u32 = 62;

/// A variable-size allocation block: a 512-byte block whose tail word is
/// the interval-record bitmap and whose preceding words hold the records.
#[derive(Clone, Copy)]
pub struct VariableBlock(BlockRef);

impl VariableBlock {
  /// Wraps an existing variable block.
  ///
  /// # Safety
  /// `base` must be a live, `BLOCK_SIZE`-aligned block whose tail word
  /// already classifies as [`crate::class::SlotClass::Variable`].
  #[inline]
  pub unsafe fn from_base(base: *mut u8) -> Self {
    VariableBlock(unsafe { BlockRef::from_base(base) })
  }

  /// Initializes a fresh variable block covering `[base + BLOCK_SIZE,
  /// zone_end)` as one free record — the layout produced when a new zone
  /// is carved from the OS collaborator (§4.6).
  ///
  /// # Safety
  /// `base` must be the start of a freshly reserved, otherwise untouched
  /// 512-aligned block, and `zone_end` must not exceed the reserved
  /// region's end.
  pub unsafe fn init(base: *mut u8, zone_end: usize) -> Self {
    let block = unsafe { VariableBlock::from_base(base) };
    for i in 0..VARIABLE_SLOT_COUNT {
      block.slot(i).store(0, Ordering::SeqCst);
    }
    block.slot(ZONE_END_SLOT).store(zone_end as u64, Ordering::SeqCst);
    block.set_record(0, base as usize + BLOCK_SIZE, zone_end);
    block.bitmap().store(0, Ordering::SeqCst);
    unsafe { block.stamp_indirection(base as usize + BLOCK_SIZE, zone_end) };
    block
  }

  /// Installs the §3 memory-range invariant across the zone's whole raw
  /// data region: the last 8 bytes of every 512-byte block from
  /// `zone_start` to `zone_end` are set to this variable block's own
  /// base address (tag byte clear, since a block-aligned address already
  /// has a zero low byte — see the navigator's raw-storage note).
  ///
  /// A zone never changes owner or shrinks once carved (`ZoneRegistry`
  /// only ever appends whole new zones), so writing this once at init
  /// covers every allocation this block will ever hand out, including
  /// ones that straddle one or more of these boundaries — there is no
  /// separate per-allocation write to get right or to undo on free.
  ///
  /// # Safety
  /// `zone_start..zone_end` must be live, block-aligned memory not
  /// otherwise in use (the same precondition as [`VariableBlock::init`]).
  unsafe fn stamp_indirection(&self, zone_start: usize, zone_end: usize) {
    let owner = self.base_addr() as u64;
    let mut block_start = zone_start;
    while block_start < zone_end {
      let tail_addr = block_start + BLOCK_SIZE - WORD_SIZE;
      let tail = unsafe { &*(tail_addr as *const AtomicU64) };
      tail.store(owner, Ordering::SeqCst);
      block_start += BLOCK_SIZE;
    }
  }

  fn bitmap(&self) -> &'static AtomicU64 {
    unsafe { self.0.tail_word() }
  }

  fn slot(&self, index: usize) -> &'static AtomicU64 {
    debug_assert!(index < VARIABLE_SLOT_COUNT);
    unsafe { self.0.word_at(index * WORD_SIZE) }
  }

  fn record(&self, k: usize) -> (usize, usize) {
    (load(self.slot(2 * k)) as usize, load(self.slot(2 * k + 1)) as usize)
  }

  fn set_record(&self, k: usize, start: usize, end: usize) {
    self.slot(2 * k).store(start as u64, Ordering::SeqCst);
    self.slot(2 * k + 1).store(end as u64, Ordering::SeqCst);
  }

  fn clear_record(&self, k: usize) {
    self.set_record(k, 0, 0);
  }

  pub fn base_addr(&self) -> usize {
    self.0.base_addr()
  }

  /// The zone-end address held in the reserved slot.
  pub fn zone_end(&self) -> usize {
    load(self.slot(ZONE_END_SLOT)) as usize
  }

  /// Length in bytes of the currently-used record starting at `addr`, if
  /// one exists in this block. Used by `reallocate` to learn how much of
  /// an existing allocation needs copying without a per-allocation header.
  pub fn allocated_len(&self, addr: usize) -> Option<usize> {
    let bitmap = load(self.bitmap());
    (0..RECORD_COUNT).find_map(|k| {
      let (start, end) = self.record(k);
      (bitmap & (1 << k) != 0 && start == addr).then_some(end - start)
    })
  }

  fn find_free_record(&self, bitmap: u64, size: usize) -> Option<usize> {
    (0..RECORD_COUNT).find(|&k| {
      bitmap & (1 << k) == 0 && {
        let (start, end) = self.record(k);
        end > start && end - start >= size
      }
    })
  }

  fn find_blank_record(&self, bitmap: u64) -> Option<usize> {
    (0..RECORD_COUNT).find(|&k| bitmap & (1 << k) == 0 && self.record(k) == (0, 0))
  }

  fn acquire_lock(&self) -> u64 {
    loop {
      let bitmap = load(self.bitmap());
      if bitmap & (1 << LOCK_BIT) != 0 {
        continue;
      }
      let locked = bitmap | (1 << LOCK_BIT);
      if self.bitmap().compare_exchange(bitmap, locked, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
        return locked;
      }
    }
  }

  fn release_lock(&self, final_value: u64) {
    self.bitmap().store(final_value & !(1u64 << LOCK_BIT), Ordering::SeqCst);
  }

  /// Carves `size` bytes off the front of the lowest free record that
  /// fits, returning the carved span's start address. If the record is
  /// larger than needed, the remainder becomes its own record (claiming
  /// a blank slot) rather than shifting any other record — §4.5's
  /// "additional slot must be inserted" case, here always satisfiable
  /// without reordering. Fails over to another block if no blank record
  /// is available for the split.
  pub fn allocate(&self, size: usize) -> Result<usize, AllocError> {
    let snapshot = load(self.bitmap());
    if snapshot & (1 << LOCK_BIT) != 0 {
      return Err(AllocError::OutOfMemory); // contended; caller tries another block
    }
    let Some(k) = self.find_free_record(snapshot, size) else {
      return Err(AllocError::OutOfMemory);
    };

    let locked = self.acquire_lock();
    let (start, end) = self.record(k);
    if locked & (1 << k) != 0 || end - start < size {
      // Another thread claimed record `k` between the snapshot read
      // and acquiring the lock; bail out and let the caller retry.
      self.release_lock(locked);
      return Err(AllocError::OutOfMemory);
    }

    let exact_fit = end - start == size;
    let mut final_value = locked | (1 << k);

    if !exact_fit {
      let Some(spare) = self.find_blank_record(locked) else {
        self.release_lock(locked);
        return Err(AllocError::OutOfMemory);
      };
      self.set_record(spare, start + size, end);
      self.set_record(k, start, start + size);
      // spare stays free (bit already 0 in `locked`).
      final_value = locked | (1 << k);
    }

    self.release_lock(final_value);
    Ok(start)
  }

  /// Returns the allocation starting at `addr` to the free pool,
  /// coalescing with an address-adjacent free record when one exists.
  pub fn free(&self, addr: usize) {
    let locked = self.acquire_lock();
    let Some(k) = (0..RECORD_COUNT).find(|&k| locked & (1 << k) != 0 && self.record(k).0 == addr) else {
      self.release_lock(locked);
      crate::error::corrupt("variable block free did not find a used record starting at the given address");
    };

    let (start, end) = self.record(k);
    let mut final_value = locked & !(1u64 << k);

    let left = (0..RECORD_COUNT).find(|&j| j != k && locked & (1 << j) == 0 && self.record(j).1 == start);
    let right = (0..RECORD_COUNT).find(|&j| j != k && locked & (1 << j) == 0 && self.record(j).0 == end);

    match (left, right) {
      (Some(l), Some(r)) => {
        let (new_start, _) = self.record(l);
        let (_, new_end) = self.record(r);
        self.set_record(l, new_start, new_end);
        self.clear_record(r);
        self.clear_record(k);
        final_value &= !(1u64 << r);
      }
      (Some(l), None) => {
        let (new_start, _) = self.record(l);
        self.set_record(l, new_start, end);
        self.clear_record(k);
      }
      (None, Some(r)) => {
        let (_, new_end) = self.record(r);
        self.set_record(r, start, new_end);
        self.clear_record(k);
      }
      (None, None) => {
        self.set_record(k, start, end);
      }
    }

    self.release_lock(final_value);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::alloc::{alloc, dealloc, Layout};

  fn fresh_block(zone_blocks: usize) -> (*mut u8, Layout, VariableBlock) {
    let total = BLOCK_SIZE * zone_blocks;
    let layout = Layout::from_size_align(total, BLOCK_SIZE).unwrap();
    let base = unsafe { alloc(layout) };
    assert!(!base.is_null());
    let block = unsafe { VariableBlock::init(base, base as usize + total) };
    (base, layout, block)
  }

  #[test]
  fn allocate_carves_a_new_record_for_the_remainder() {
    let (base, layout, block) = fresh_block(8);
    let zone_start = base as usize + BLOCK_SIZE;

    let addr = block.allocate(256).unwrap();
    assert_eq!(addr, zone_start);
    assert_eq!(block.record(0), (zone_start, zone_start + 256));
    assert_eq!(load(block.bitmap()) & 1, 1, "the carved allocation's own record is marked used");

    unsafe { dealloc(base, layout) };
  }

  #[test]
  fn allocate_then_free_restores_a_single_free_record() {
    let (base, layout, block) = fresh_block(8);
    let zone_start = base as usize + BLOCK_SIZE;
    let zone_end = block.zone_end();

    let addr = block.allocate(512).unwrap();
    block.free(addr);

    let free_record = (0..RECORD_COUNT)
      .map(|k| block.record(k))
      .find(|&(s, e)| s == zone_start && e == zone_end);
    assert_eq!(free_record, Some((zone_start, zone_end)));

    unsafe { dealloc(base, layout) };
  }

  #[test]
  fn exact_fit_allocation_reuses_the_record_in_place() {
    let (base, layout, block) = fresh_block(8);
    let whole = block.zone_end() - (base as usize + BLOCK_SIZE);

    let addr = block.allocate(whole).unwrap();
    assert_eq!(addr, base as usize + BLOCK_SIZE);
    assert_eq!(load(block.bitmap()) & 1, 1);

    unsafe { dealloc(base, layout) };
  }

  #[test]
  fn allocate_fails_when_no_record_is_large_enough() {
    let (base, layout, block) = fresh_block(2);
    let whole = block.zone_end() - (base as usize + BLOCK_SIZE);

    assert_eq!(block.allocate(whole + 1), Err(AllocError::OutOfMemory));

    unsafe { dealloc(base, layout) };
  }

  #[test]
  fn spanning_allocation_resolves_through_the_navigator_after_free() {
    // §8 scenario 5: an allocation crossing one or more 512-byte
    // boundaries must remain locatable (and freeable) via the
    // indirection stamped across the zone at init time.
    let (base, layout, block) = fresh_block(4);
    let zone_start = base as usize + BLOCK_SIZE;

    let addr = block.allocate(600).unwrap();
    assert_eq!(addr, zone_start);

    let crossed_boundary = zone_start + BLOCK_SIZE; // inside [addr, addr+600)
    let tail_addr = crossed_boundary - WORD_SIZE;
    let tail = unsafe { &*(tail_addr as *const AtomicU64) };
    assert_eq!(load(tail), block.base_addr() as u64);
    assert_eq!(load(tail) & 0xFF, 0, "indirection must not alias the self-describing tag test");

    let located = crate::navigator::locate(crossed_boundary + 40);
    assert_eq!(located.class, crate::class::SlotClass::Variable);
    assert_eq!(located.bitmap as *const AtomicU64 as usize, block.bitmap() as *const AtomicU64 as usize);

    block.free(addr);

    unsafe { dealloc(base, layout) };
  }

  #[test]
  fn two_adjacent_allocations_coalesce_when_both_freed() {
    let (base, layout, block) = fresh_block(8);
    let zone_start = base as usize + BLOCK_SIZE;
    let zone_end = block.zone_end();

    let a = block.allocate(256).unwrap();
    let b = block.allocate(256).unwrap();
    assert_eq!(b, a + 256);

    block.free(a);
    block.free(b);

    let free_record = (0..RECORD_COUNT)
      .map(|k| block.record(k))
      .find(|&(s, e)| s == zone_start && e == zone_end);
    assert_eq!(free_record, Some((zone_start, zone_end)));

    unsafe { dealloc(base, layout) };
  }
}
