//! Allocation block machinery (§4.4, §4.5): a single 512-byte block viewed
//! either as a collection of fixed-size sub-blocks or as one variable-size
//! block.

pub mod fixed;
pub mod variable;

use std::sync::atomic::AtomicU64;

use crate::config::BLOCK_SIZE;

/// A raw handle to the base of a 512-byte, 512-aligned block.
///
/// This is a thin pointer wrapper, not an owning type: blocks live for the
/// lifetime of the heap and are never individually freed back to the OS
/// (§3 "Lifecycle"), so a `Copy` handle is all call sites need.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlockRef(*mut u8);

impl BlockRef {
  /// Wraps an existing 512-aligned base address.
  ///
  /// # Safety
  /// `base` must point to a live, `BLOCK_SIZE`-aligned, `BLOCK_SIZE`-byte
  /// region owned by this allocator.
  #[inline]
  pub unsafe fn from_base(base: *mut u8) -> Self {
    debug_assert_eq!(base as usize % BLOCK_SIZE, 0, "block base must be 512-aligned");
    BlockRef(base)
  }

  /// Wraps the block containing `addr`, rounding down to the enclosing
  /// 512-byte boundary.
  #[inline]
  pub fn containing(addr: usize) -> Self {
    BlockRef((addr & !(BLOCK_SIZE - 1)) as *mut u8)
  }

  #[inline]
  pub fn base(self) -> *mut u8 {
    self.0
  }

  #[inline]
  pub fn base_addr(self) -> usize {
    self.0 as usize
  }

  /// Reference to the atomic word at `byte_offset` within this block.
  ///
  /// # Safety
  /// `byte_offset` must be 8-aligned and `< BLOCK_SIZE`, and the returned
  /// reference must not outlive the heap.
  #[inline]
  pub unsafe fn word_at(self, byte_offset: usize) -> &'static AtomicU64 {
    debug_assert!(byte_offset < BLOCK_SIZE && byte_offset % 8 == 0);
    unsafe { &*(self.0.add(byte_offset) as *const AtomicU64) }
  }

  /// The block's tail word (final 8 bytes), the control word per §3.
  ///
  /// # Safety
  /// Same as [`Self::word_at`].
  #[inline]
  pub unsafe fn tail_word(self) -> &'static AtomicU64 {
    unsafe { self.word_at(BLOCK_SIZE - 8) }
  }
}

// SAFETY: BlockRef is a plain address; all aliasing is mediated by the
// CAS discipline in `crate::sync`, the same as the raw pointers this
// allocator hands to arbitrary threads via `allocate`.
unsafe impl Send for BlockRef {}
unsafe impl Sync for BlockRef {}
