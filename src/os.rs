//! OS collaborator: supplies large 512-aligned regions via `sbrk`.
//!
//! Kept behind a trait so the core allocator logic never names `sbrk`
//! directly — ported from the teacher's `bump.rs`, which used `libc::sbrk`
//! the same way, just without the alignment/rounding this layout requires.

use std::ffi::c_void;

use crate::config::BLOCK_ALIGNMENT;

/// A source of coarse, 512-aligned memory regions.
pub trait OsSource {
  /// Reserves at least `min_bytes` of fresh, zero-initialized memory and
  /// returns its base (aligned to [`BLOCK_ALIGNMENT`]) and actual length.
  /// Returns `None` if the OS refused to extend the heap.
  fn reserve(&self, min_bytes: usize) -> Option<(*mut u8, usize)>;
}

/// `sbrk`-backed collaborator (POSIX only, matching the teacher's sole
/// supported platform).
pub struct SbrkSource;

impl OsSource for SbrkSource {
  fn reserve(&self, min_bytes: usize) -> Option<(*mut u8, usize)> {
    // Round up so the region both starts and ends on a block boundary;
    // an over-sized `sbrk` request is harmless, an unaligned base is not.
    let current_break = unsafe { libc::sbrk(0) };
    if current_break == usize::MAX as *mut c_void {
      return None;
    }

    let misalignment = (current_break as usize) % BLOCK_ALIGNMENT;
    let padding = if misalignment == 0 { 0 } else { BLOCK_ALIGNMENT - misalignment };
    let requested = padding + crate::align_to!(min_bytes, BLOCK_ALIGNMENT);

    let old_break = unsafe { libc::sbrk(requested as libc::intptr_t) };
    if old_break == usize::MAX as *mut c_void {
      log::error!("sbrk refused to extend the heap by {requested} bytes");
      return None;
    }

    let base = (old_break as usize + padding) as *mut u8;
    debug_assert_eq!(base as usize % BLOCK_ALIGNMENT, 0);
    log::debug!("reserved region base={base:p} len={requested}");
    Some((base, requested - padding))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn reserve_returns_block_aligned_base() {
    let source = SbrkSource;
    let (base, len) = source.reserve(BLOCK_ALIGNMENT).expect("sbrk should succeed in test environment");
    assert_eq!(base as usize % BLOCK_ALIGNMENT, 0);
    assert!(len >= BLOCK_ALIGNMENT);
  }
}
