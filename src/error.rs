//! Error taxonomy (§7).
//!
//! `Corruption` is deliberately absent from [`AllocError`]: per the spec it
//! is fatal and never surfaced to a caller. A corrupted heap means a prior
//! unsafe misuse already happened, so the right move is to abort loudly via
//! [`corrupt`] rather than give calling code a `Result` to mishandle.

use thiserror::Error;

/// Errors returned across the public allocate/free/reallocate surface.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
  /// The OS collaborator refused to grow the heap further and no reuse
  /// avenue (hoard, cache, master-block scan) could satisfy the request.
  #[error("out of memory")]
  OutOfMemory,

  /// `alignment` was zero, not a power of two, or exceeded
  /// [`crate::config::BLOCK_ALIGNMENT`].
  #[error("invalid alignment: {0}")]
  InvalidAlignment(usize),

  /// The requested size could not be represented (e.g. overflowed when
  /// padded for alignment or header bookkeeping).
  #[error("invalid size: {0}")]
  InvalidSize(usize),
}

/// Reports heap corruption and aborts the process.
///
/// Called when a control word classifies as "no class", a tail-word
/// indirection points outside the heap, or a free cannot locate its owning
/// block. All three are signs of prior memory corruption or misuse by the
/// caller (double free, wild pointer); there is no recovery, so this
/// function never returns.
#[cold]
#[inline(never)]
pub fn corrupt(msg: &str) -> ! {
  log::error!("heap corruption detected: {msg}");
  panic!("heap corruption detected: {msg}");
}
