//! Address codec (§4.1).
//!
//! Every slot and tail word stores an 8-aligned address with its tag bits
//! in the lowest byte of the word, so the classifier can read one byte
//! regardless of host endianness. A raw 8-aligned address cannot be tagged
//! directly: its own low byte still carries real address bits (only the
//! low 3 bits are guaranteed zero), and overwriting it would corrupt the
//! address. [`encode`] rotates the address right by 8 bits first, moving
//! those low-byte address bits up into the word's second-lowest byte and
//! leaving a byte free (whatever previously occupied the top byte, now
//! rotated to the bottom) for tag bits in classes that need them — the
//! address itself is then reconstructed losslessly by the left-rotate in
//! [`decode`] once the tag byte has been cleared back to zero.

/// Rotates an 8-aligned address into a control word ready to receive a tag
/// in its low byte.
///
/// # Preconditions
/// `addr` must be aligned to 8 bytes (its low 3 bits, and in practice its
/// low byte, are zero).
///
/// On a 64-bit little-endian host this is a right rotate by 8 bits. On a
/// 64-bit big-endian host the tag byte is already the physically-lowest
/// byte of a normal address representation, so the word is the address
/// unchanged. Hosts where pointers are narrower than 64 bits are treated
/// the same as big-endian (no rotation needed, the value is simply widened).
#[inline]
pub fn encode(addr: u64) -> u64 {
  debug_assert_eq!(addr & 0x7, 0, "address must be 8-aligned");
  if cfg!(all(target_endian = "little", target_pointer_width = "64")) {
    (addr >> 8) | ((addr & 0xFF) << 56)
  } else {
    addr
  }
}

/// Inverse of [`encode`].
///
/// # Preconditions
/// The word's tag byte (the byte `encode` moved the address's low byte
/// into) must be `0x00` — i.e. this word does not currently carry a live
/// tag. Callers must classify first and only decode words that classify as
/// "variable/address" (§4.2).
#[inline]
pub fn decode(word: u64) -> u64 {
  if cfg!(all(target_endian = "little", target_pointer_width = "64")) {
    debug_assert_eq!(word & 0xFF, 0, "tag byte must be clear before decoding");
    (word << 8) | (word >> 56)
  } else {
    word
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn round_trip() {
    for addr in [0u64, 8, 512, 0x1000, 0x7FFF_FFFF_FFFF_FFF8] {
      assert_eq!(decode(encode(addr)), addr);
    }
  }

  #[test]
  #[cfg(all(target_endian = "little", target_pointer_width = "64"))]
  fn little_endian_moves_low_byte_to_tag_position() {
    let addr = 0x1234_5678_9ABC_DEF0u64;
    let word = encode(addr);
    assert_eq!(word, 0xF012_3456_789A_BCDE);
    assert_eq!(word >> 56, 0xF0);
    assert_eq!(word & 0x00FF_FFFF_FFFF_FFFF, addr >> 8);
  }
}
