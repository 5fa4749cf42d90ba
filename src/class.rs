//! Control-word classifier (§4.2).
//!
//! Classifies the tail word of a 512-byte block (or a bitmap word within
//! it) as one of the fixed-size slot classes or as "variable/address".
//! Ported directly from btmalloc.c's `bitmap_slot_type`, which tests
//! `fixedsize_mask`/`fixedsize_test` in array order and returns the first
//! match.

use crate::config::{
  FIXEDSIZE_ALIGNMENT, FIXEDSIZE_BITMAP_WIDTH, FIXEDSIZE_BLOCK_SIZE, FIXEDSIZE_MASK,
  FIXEDSIZE_SLOT0_BIT, FIXEDSIZE_TEST, FIXEDSIZE_USER_BYTES, SLOT_TYPE_COUNT,
};

/// The class of a 512-byte block's tail word, or of a fixed-size
/// sub-block's bitmap word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotClass {
  /// 1-byte unaligned slots, stride 1, 7 slots packed into the tail word.
  Fixed1,
  /// 8-byte aligned slots, stride 8, 62 slots.
  Fixed8,
  /// 4-byte aligned slots, stride 4, 60 slots.
  Fixed4,
  /// 2-byte aligned slots, stride 2, 60 slots.
  Fixed2,
  /// Variable-size allocation block, master block, or raw 8-aligned
  /// address indirection — distinguished by context, not by this word
  /// alone (see §4.6: a master block's own tail word still has its
  /// lowest bit set to 1, which the classifier never sees directly since
  /// master/zone disambiguation happens one level up, on the referenced
  /// block's tail word rather than the slot holding its address).
  Variable,
}

/// slot_type index matching btmalloc.c's arrays (0=Fixed1, 1=Fixed8,
/// 2=Fixed4, 3=Fixed2).
impl SlotClass {
  fn index(self) -> Option<usize> {
    match self {
      SlotClass::Fixed1 => Some(0),
      SlotClass::Fixed8 => Some(1),
      SlotClass::Fixed4 => Some(2),
      SlotClass::Fixed2 => Some(3),
      SlotClass::Variable => None,
    }
  }

  /// Bytes per slot (1, 2, 4, or 8). Panics for [`SlotClass::Variable`],
  /// which has no fixed stride.
  pub fn stride(self) -> usize {
    FIXEDSIZE_ALIGNMENT[self.index().expect("variable class has no stride")]
  }

  /// Total span in bytes this class's sub-block occupies within its
  /// owning 512-byte block, bitmap word included.
  pub fn span(self) -> usize {
    FIXEDSIZE_BLOCK_SIZE[self.index().expect("variable class has no span")]
  }

  /// User-addressable bytes available in one sub-block of this class.
  pub fn user_bytes(self) -> usize {
    FIXEDSIZE_USER_BYTES[self.index().expect("variable class has no user region")]
  }

  /// Bit index of slot 0 — equivalently, the width in bits of this
  /// class's tag (the low bits that must stay fixed to keep the word
  /// classifying the same way).
  pub fn slot0_bit(self) -> u32 {
    FIXEDSIZE_SLOT0_BIT[self.index().expect("variable class has no slot0 bit")]
  }

  /// Number of bitmap bits used to track slots in this class.
  pub fn bitmap_width(self) -> u32 {
    FIXEDSIZE_BITMAP_WIDTH[self.index().expect("variable class has no bitmap width")]
  }
}

/// Classifies a control word by its lowest byte, testing in the fixed
/// order fixed-1, fixed-8, fixed-4, fixed-2, falling back to variable.
///
/// Mirrors `bitmap_slot_type`, generalized to also recognize the
/// `0x00`-tagged "no fixed class" word as [`SlotClass::Variable`] (the C
/// original treats that as "no class found", asserting `slot_type != -1`
/// only after confirming by other means this word is a variable/master
/// block rather than a corrupt fixed-size one; here callers that expect a
/// fixed class reject [`SlotClass::Variable`] explicitly, see
/// [`classify_fixed`]).
#[inline]
pub fn classify(word: u64) -> SlotClass {
  for i in 0..SLOT_TYPE_COUNT {
    if word & FIXEDSIZE_MASK[i] == FIXEDSIZE_TEST[i] {
      return match i {
        0 => SlotClass::Fixed1,
        1 => SlotClass::Fixed8,
        2 => SlotClass::Fixed4,
        3 => SlotClass::Fixed2,
        _ => unreachable!(),
      };
    }
  }
  SlotClass::Variable
}

/// Classifies a word that must be a fixed-size class, aborting on
/// corruption (word's lowest byte is `0x00`, meaning this is a
/// variable/address word, not a fixed-size bitmap).
#[inline]
pub fn classify_fixed(word: u64) -> SlotClass {
  match classify(word) {
    SlotClass::Variable => crate::error::corrupt(
      "expected a fixed-size bitmap word but found a variable/address tag",
    ),
    class => class,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn classifies_each_fixed_class() {
    assert_eq!(classify(0b0001), SlotClass::Fixed1);
    assert_eq!(classify(0b0010), SlotClass::Fixed8);
    assert_eq!(classify(0b0100), SlotClass::Fixed4);
    assert_eq!(classify(0b1100), SlotClass::Fixed2);
    assert_eq!(classify(0b0000), SlotClass::Variable);
  }

  #[test]
  fn boundary_bytes_route_to_expected_class() {
    // Exactly 7, 120, 240, 496 bytes route to the corresponding fixed class.
    assert_eq!(SlotClass::Fixed1.user_bytes(), 7);
    assert_eq!(SlotClass::Fixed2.user_bytes(), 120);
    assert_eq!(SlotClass::Fixed4.user_bytes(), 240);
    assert_eq!(SlotClass::Fixed8.user_bytes(), 496);
  }

  #[test]
  fn test_order_matches_original_priority() {
    // A word matching both the fixed-2 mask (0xF) and, spuriously, a
    // wider mask must resolve via the documented array order: fixed-1
    // is tested first, so any word with bit 0 set is fixed-1 even if
    // it would also satisfy a later mask/test pair numerically.
    assert_eq!(classify(0xFD), SlotClass::Fixed1);
  }
}
