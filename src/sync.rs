//! Wait-free CAS discipline shared by fixed- and variable-size block code
//! (§5, ported from btmalloc.c's `clear_bit`/`compare_and_set`).
//!
//! Every control word and bitmap is a plain [`AtomicU64`] with
//! `Ordering::SeqCst` on every access — the direct equivalent of the
//! original's `__sync_bool_compare_and_swap`, which is a full barrier.
//! There is no weaker-ordering fast path: contention is handled by
//! migrating to a different block or deferring to the per-thread hoard,
//! never by relaxing memory order.

use std::sync::atomic::{AtomicU64, Ordering};

/// Loads the current value of a control/bitmap word.
#[inline]
pub fn load(word: &AtomicU64) -> u64 {
  word.load(Ordering::SeqCst)
}

/// Attempts to set the given bit. Returns `true` on success, `false` if a
/// concurrent mutation changed the word first (the caller's candidate read
/// is now stale).
#[inline]
pub fn try_set_bit(word: &AtomicU64, bit: u32) -> bool {
  let current = load(word);
  let updated = current | (1u64 << bit);
  word.compare_exchange(current, updated, Ordering::SeqCst, Ordering::SeqCst)
    .is_ok()
}

/// Attempts to clear the given bit. Returns `true` on success.
///
/// Mirrors `clear_bit`: the original asserts the cleared value actually
/// differs from the read value (i.e. the bit was set going in) since no
/// other thread should ever concurrently clear a bit this thread owns.
#[inline]
pub fn try_clear_bit(word: &AtomicU64, bit: u32) -> bool {
  let current = load(word);
  let updated = current & !(1u64 << bit);
  debug_assert_ne!(current, updated, "bit was already clear");
  word.compare_exchange(current, updated, Ordering::SeqCst, Ordering::SeqCst)
    .is_ok()
}

/// Attempts a general word transform identified by the caller, retrying
/// the read-modify-write from a freshly observed value whenever a
/// concurrent writer interferes, until the given limit of attempts is
/// exhausted.
///
/// Used by the variable-size block's multi-bit "mark used then continue"
/// protocol (§4.5, §5's "imaginary 63rd slot" lock), where a single
/// `compare_exchange` attempt is too brittle under contention and a
/// bounded busy-retry loop is explicitly permitted by the spec.
pub fn retry_cas(word: &AtomicU64, attempts: usize, mut transform: impl FnMut(u64) -> Option<u64>) -> bool {
  for _ in 0..attempts {
    let current = load(word);
    let Some(updated) = transform(current) else {
      return false;
    };
    if word
      .compare_exchange(current, updated, Ordering::SeqCst, Ordering::SeqCst)
      .is_ok()
    {
      return true;
    }
  }
  false
}

/// Upper bound on busy-retry iterations before a CAS loop gives up and
/// falls back to hoarding or migrating to another block. Not part of the
/// public configuration surface — purely an anti-livelock backstop, since
/// the spec guarantees system-wide (not per-thread) progress.
pub const MAX_CAS_ATTEMPTS: usize = 64;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn set_then_clear_round_trips() {
    let word = AtomicU64::new(0b0001);
    assert!(try_set_bit(&word, 3));
    assert_eq!(load(&word), 0b1001);
    assert!(try_clear_bit(&word, 3));
    assert_eq!(load(&word), 0b0001);
  }

  #[test]
  fn stale_read_fails_cas() {
    let word = AtomicU64::new(0b0001);
    // Simulate interference between read and compare_exchange by
    // mutating the word through a second handle first.
    word.store(0b0011, Ordering::SeqCst);
    // try_set_bit reads fresh each call, so this alone cannot be made to
    // fail without real concurrency; instead verify retry_cas gives up
    // when the transform reports no viable update.
    assert!(!retry_cas(&word, 4, |_| None));
  }
}
