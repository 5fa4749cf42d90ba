//! Per-thread most-recently-used block cache and freed-slot hoard (§4.7).
//!
//! Both structures are thread-local: no synchronization is needed because
//! no other thread ever observes or mutates them. Ported from btmalloc.c's
//! `cached_block` linked list and `freed_list`/`hoard_size` pair.

use std::cell::RefCell;

use crate::class::SlotClass;
use crate::config::MAX_HOARD;

/// One entry in the MRU cache: a known control word address and the class
/// it last classified as.
#[derive(Clone, Copy)]
struct CachedBlock {
  bitmap_addr: usize,
  class: SlotClass,
}

/// Cache bound. The spec calls this "≈ 8 entries, implementation may
/// vary"; 8 matches the original's linked-list depth in practice.
const CACHE_CAPACITY: usize = 8;

#[derive(Default)]
struct HoardEntry {
  addr: usize,
  size: usize,
}

struct ThreadState {
  /// Most-recently-used first.
  cache: Vec<CachedBlock>,
  hoard: Vec<HoardEntry>,
  hoard_size: usize,
}

impl ThreadState {
  fn new() -> Self {
    ThreadState { cache: Vec::with_capacity(CACHE_CAPACITY), hoard: Vec::new(), hoard_size: 0 }
  }
}

thread_local! {
  static STATE: RefCell<ThreadState> = RefCell::new(ThreadState::new());
}

/// Records that `bitmap_addr` classified as `class`, promoting it to the
/// front of the MRU list (or inserting it, evicting the least-recently-used
/// entry if the cache is full).
pub fn touch(bitmap_addr: usize, class: SlotClass) {
  STATE.with(|state| {
    let mut state = state.borrow_mut();
    state.cache.retain(|entry| entry.bitmap_addr != bitmap_addr);
    state.cache.insert(0, CachedBlock { bitmap_addr, class });
    if state.cache.len() > CACHE_CAPACITY {
      state.cache.pop();
    }
  });
}

/// Calls `f` with each cached `(bitmap_addr, class)` pair, most-recent
/// first, stopping early if `f` returns `Some`.
pub fn find_cached<T>(mut f: impl FnMut(usize, SlotClass) -> Option<T>) -> Option<T> {
  STATE.with(|state| {
    let state = state.borrow();
    for entry in &state.cache {
      if let Some(result) = f(entry.bitmap_addr, entry.class) {
        return Some(result);
      }
    }
    None
  })
}

/// Deposits a freed slot into this thread's hoard.
///
/// Mirrors `hoard_freed`: only hoards slots at least pointer-wide, and only
/// while the running byte total stays within [`MAX_HOARD`]. Returns `false`
/// when neither condition holds, signalling the caller should fall back to
/// a busy-retry of the bitmap clear instead.
pub fn hoard_push(size: usize, addr: *mut u8) -> bool {
  if size < std::mem::size_of::<usize>() {
    return false;
  }
  STATE.with(|state| {
    let mut state = state.borrow_mut();
    if state.hoard_size + size > MAX_HOARD {
      return false;
    }
    state.hoard.push(HoardEntry { addr: addr as usize, size });
    state.hoard_size += size;
    true
  })
}

/// Removes and returns a hoarded slot of exactly `size` bytes, if one
/// exists. Mirrors `unhoard`, consulted first in allocate when a request's
/// size exactly matches a hoarded block (§4.7).
pub fn hoard_pop(size: usize) -> Option<*mut u8> {
  STATE.with(|state| {
    let mut state = state.borrow_mut();
    let index = state.hoard.iter().position(|entry| entry.size == size)?;
    let entry = state.hoard.swap_remove(index);
    state.hoard_size -= entry.size;
    Some(entry.addr as *mut u8)
  })
}
