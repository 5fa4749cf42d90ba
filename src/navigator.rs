//! Region navigator (§4.3): recovers an allocation's owning control word
//! from the user address alone, without any per-address index.

use std::sync::atomic::AtomicU64;

use crate::block::BlockRef;
use crate::class::{self, SlotClass};
use crate::config::BLOCK_SIZE;
use crate::error::corrupt;

/// The control word found to own some user address, together with its class.
pub struct Located {
  pub bitmap: &'static AtomicU64,
  pub class: SlotClass,
}

#[inline]
unsafe fn atomic_at(addr: usize) -> &'static AtomicU64 {
  debug_assert_eq!(addr % 8, 0, "control word address must be 8-aligned");
  unsafe { &*(addr as *const AtomicU64) }
}

/// Finds the control word that owns `p`.
///
/// Mirrors `allocation_block` followed by `fixedsize_block` from the
/// reference implementation: first resolve which block owns `p` by
/// inspecting the tail word of the preceding 512-byte boundary (raw, never
/// rotated through [`crate::word`] — see the design notes on why
/// block-aligned indirection addresses are stored as-is), then, for fixed
/// classes, walk backwards through that block's subblocks until the one
/// whose user region contains `p` is found.
pub fn locate(p: usize) -> Located {
  let base = p & !(BLOCK_SIZE - 1);
  let preceding_tail = unsafe { atomic_at(base - 8) };
  let tail_value = crate::sync::load(preceding_tail);

  let block_base = if tail_value & 0xFF != 0 {
    base
  } else {
    let indirect = tail_value as usize;
    if indirect == 0 || indirect >= base {
      corrupt("region navigator indirection does not point strictly before the block it precedes");
    }
    indirect
  };

  let control = unsafe { atomic_at(block_base + BLOCK_SIZE - 8) };
  let control_value = crate::sync::load(control);
  let class = class::classify(control_value);

  match class {
    SlotClass::Variable => Located { bitmap: control, class },
    fixed => walk_fixed(control, fixed, p),
  }
}

/// Walks backwards through a block's fixed-size subblocks starting from
/// `bitmap`, re-classifying at each step, until the subblock whose user
/// region contains `p` is found.
fn walk_fixed(mut bitmap: &'static AtomicU64, mut class: SlotClass, p: usize) -> Located {
  loop {
    let bitmap_addr = bitmap as *const AtomicU64 as usize;
    let span = class.span();
    let subblock_start = bitmap_addr + 8 - span;

    if p >= subblock_start {
      return Located { bitmap, class };
    }

    let block_base = BlockRef::containing(bitmap_addr).base_addr();
    let next_addr = bitmap_addr - span;
    if next_addr < block_base {
      corrupt("region navigator walked past the start of the block without locating the owning subblock");
    }

    bitmap = unsafe { atomic_at(next_addr) };
    let value = crate::sync::load(bitmap);
    class = class::classify_fixed(value);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::alloc::{alloc, dealloc, Layout};
  use std::sync::atomic::Ordering;

  /// Lays out a synthetic 512-aligned block with a single fixed-8
  /// subblock occupying the whole span and verifies the navigator
  /// resolves any address inside its user region back to the tail word.
  #[test]
  fn resolves_address_within_a_single_fixed8_subblock() {
    // Two contiguous 512-byte blocks so the preceding block's tail word
    // (read at `base - 8`) lives inside the allocation.
    let layout = Layout::from_size_align(BLOCK_SIZE * 2, BLOCK_SIZE).unwrap();
    let region = unsafe { alloc(layout) };
    assert!(!region.is_null());
    let base = unsafe { region.add(BLOCK_SIZE) };

    unsafe {
      // Preceding block's tail: self-describing (non-zero low byte).
      (*(base.sub(8) as *const AtomicU64)).store(0xFF, Ordering::SeqCst);

      let tail = &*(base.add(BLOCK_SIZE - 8) as *const AtomicU64);
      tail.store(0x02, Ordering::SeqCst); // fixed-8 tag, no slots used

      let user_addr = base as usize + 100; // somewhere in the 496 user bytes
      let located = locate(user_addr);
      assert_eq!(located.class, SlotClass::Fixed8);
      assert_eq!(located.bitmap as *const AtomicU64 as usize, tail as *const AtomicU64 as usize);

      dealloc(region, layout);
    }
  }

  /// §8 scenario 5: a large allocation straddles a 512-byte block
  /// boundary, so the crossed boundary's tail word must decode to the
  /// base of the variable block that owns it, rather than being
  /// self-describing. Any address inside that allocation must resolve
  /// back to the same control word.
  #[test]
  fn indirection_resolves_a_block_boundary_straddled_by_one_allocation() {
    let layout = Layout::from_size_align(BLOCK_SIZE * 3, BLOCK_SIZE).unwrap();
    let region = unsafe { alloc(layout) };
    assert!(!region.is_null());
    let variable_base = region;

    unsafe {
      let straddled_boundary = variable_base.add(BLOCK_SIZE);
      // Tail word of the block immediately preceding the boundary
      // now holds the owning variable block's base, tag byte clear.
      (*(straddled_boundary.sub(8) as *const AtomicU64))
        .store(variable_base as usize as u64, Ordering::SeqCst);

      let tail = &*(variable_base.add(BLOCK_SIZE * 2 - 8) as *const AtomicU64);
      tail.store(0, Ordering::SeqCst); // variable-block tag

      // A pointer inside the allocation, past the crossed boundary.
      let inside_allocation = straddled_boundary as usize + 40;
      let located = locate(inside_allocation);
      assert_eq!(located.class, SlotClass::Variable);
      assert_eq!(located.bitmap as *const AtomicU64 as usize, tail as *const AtomicU64 as usize);

      dealloc(region, layout);
    }
  }
}
