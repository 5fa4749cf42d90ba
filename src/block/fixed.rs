//! Fixed-size block allocate/free (§4.4).
//!
//! Each fixed-size sub-block is a run of `stride`-byte user slots packed
//! against one 8-byte bitmap word (for fixed-1, bitmap and the single
//! 8-byte word are one and the same). Slot 0 begins at the bit position
//! equal to the class's tag width; CAS-ing a bit in or out of the bitmap
//! atomically transfers the corresponding slot between the free pool and
//! the caller.

use std::sync::atomic::AtomicU64;

use crate::cache::hoard_push;
use crate::class::SlotClass;
use crate::error::corrupt;
use crate::sync::{load, try_clear_bit, try_set_bit};

/// Computes the bit index in `bitmap` that governs the slot at address `p`.
///
/// `bitmap_addr` is the address of the bitmap word itself — for fixed-1
/// that's the same address as the sub-block's single word; for the other
/// classes it's the address immediately after the last data byte.
pub fn bit_index(class: SlotClass, bitmap_addr: usize, p: usize) -> u32 {
  match class {
    SlotClass::Fixed1 => {
      // The tag/bitmap byte is the leftmost (lowest-address) byte of
      // the word on little-endian hosts, the rightmost on
      // big-endian; data bytes fill the other 7. Ported from
      // btmalloc.c's `get_shift` with `offset = 8 - (LE ? 0 : 1)`.
      let offset_const: usize = if cfg!(target_endian = "little") { 8 } else { 7 };
      let memory_offset = p - bitmap_addr;
      (offset_const - memory_offset) as u32
    }
    _ => {
      // Slot 0 sits one stride *below* the bitmap word, not at it: the
      // bitmap word is itself 8 bytes the user area must not overlap,
      // so the nearest slot (bit == slot0_bit) occupies
      // `[bitmap_addr - stride, bitmap_addr)`.
      let stride = class.stride();
      class.slot0_bit() - 1 + ((bitmap_addr - p) / stride) as u32
    }
  }
}

/// Inverse of [`bit_index`]: the slot address for a given bit.
pub fn address_for_bit(class: SlotClass, bitmap_addr: usize, bit: u32) -> usize {
  match class {
    SlotClass::Fixed1 => {
      let offset_const: usize = if cfg!(target_endian = "little") { 8 } else { 7 };
      bitmap_addr + offset_const - bit as usize
    }
    _ => {
      let stride = class.stride();
      bitmap_addr - (bit - class.slot0_bit() + 1) as usize * stride
    }
  }
}

/// Searches `bitmap` for the lowest free bit in this class's slot range
/// and attempts to claim it via CAS. Returns the slot's bit index on
/// success.
///
/// Mirrors the allocate half of §4.4: "find the lowest zero bit at an
/// index >= the class's slot-0 offset. CAS `B -> B | (1<<i)`."
pub fn try_allocate_bit(bitmap: &AtomicU64, class: SlotClass) -> Option<u32> {
  let lo = class.slot0_bit();
  let hi = lo + class.bitmap_width();
  loop {
    let current = load(bitmap);
    let mut candidate = None;
    for i in lo..hi {
      if current & (1u64 << i) == 0 {
        candidate = Some(i);
        break;
      }
    }
    let i = candidate?;
    if try_set_bit(bitmap, i) {
      return Some(i);
    }
    // Lost the race to another thread; loop and re-scan the fresh word.
  }
}

/// Frees the slot at address `p`, given the bitmap word that governs it.
///
/// On a losing CAS (concurrent bitmap update), tries to hoard the freed
/// slot (§4.7) before falling back to a busy-retry of the clear — matching
/// btmalloc.c's `free_fixed_size_memory`.
pub fn free(allocated: *mut u8, bitmap: &'static AtomicU64, class: SlotClass) {
  let word = load(bitmap);
  if crate::class::classify(word) != class {
    corrupt("fixed-size free target's bitmap word no longer matches its expected class");
  }

  let bitmap_addr = bitmap as *const AtomicU64 as usize;
  let i = bit_index(class, bitmap_addr, allocated as usize);

  if try_clear_bit(bitmap, i) {
    return;
  }

  if hoard_push(class.stride(), allocated) {
    return;
  }

  // Hoard is full and the slot is too small to hold a pointer anyway;
  // try harder (bounded busy retry, per §5's permitted exception).
  for _ in 0..crate::sync::MAX_CAS_ATTEMPTS {
    if try_clear_bit(bitmap, i) {
      return;
    }
  }
  corrupt("fixed-size free could not clear its bit after exhausting retries");
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::Ordering;

  #[test]
  fn fixed1_free_matches_scenario() {
    // Tail word `...0x19` (binary 0001 1001): tag bit0, slots 3 and 4 used.
    let word = AtomicU64::new(0x19);
    let word_addr = &word as *const AtomicU64 as usize;
    let allocated_addr = word_addr + 4; // the "4-byte-offset slot"
    let i = bit_index(SlotClass::Fixed1, word_addr, allocated_addr);
    assert_eq!(i, 4);
    assert!(try_clear_bit(&word, i));
    assert_eq!(word.load(Ordering::SeqCst), 0x09);
  }

  #[test]
  fn fixed8_allocate_picks_first_free_bit_above_tag() {
    let bitmap = AtomicU64::new(0b10); // tag only, all 62 slots free
    let i = try_allocate_bit(&bitmap, SlotClass::Fixed8).unwrap();
    assert_eq!(i, SlotClass::Fixed8.slot0_bit());
    assert_eq!(bitmap.load(Ordering::SeqCst), 0b10 | (1 << i));

    // The slot this bit governs must not alias the bitmap word itself.
    let bitmap_addr = &bitmap as *const AtomicU64 as usize;
    let addr = address_for_bit(SlotClass::Fixed8, bitmap_addr, i);
    assert_ne!(addr, bitmap_addr);
    assert_eq!(addr, bitmap_addr - SlotClass::Fixed8.stride());
  }

  #[test]
  fn address_and_bit_index_round_trip() {
    for class in [SlotClass::Fixed8, SlotClass::Fixed4, SlotClass::Fixed2] {
      let bitmap_addr = 0x10000usize;
      for bit in class.slot0_bit()..class.slot0_bit() + class.bitmap_width() {
        let addr = address_for_bit(class, bitmap_addr, bit);
        assert_eq!(bit_index(class, bitmap_addr, addr), bit);
      }
    }
  }
}
