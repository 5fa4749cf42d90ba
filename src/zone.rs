//! Region & master-block topology (§4.6): creating zones from the OS
//! collaborator and linking them into the master-block chain that allocate
//! scans when no cached or hoarded block satisfies a request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::block::variable::VariableBlock;
use crate::block::BlockRef;
use crate::config::{BLOCK_SIZE, VARIABLE_SLOT_COUNT, WORD_SIZE};
use crate::error::AllocError;
use crate::os::OsSource;
use crate::predictor;

const MAX_MASTER_SLOT: usize = VARIABLE_SLOT_COUNT - 2;
const LOCK_BIT: u32 = 62;

/// A master block: same physical geometry as a variable block, but its
/// slots hold the bases of other master blocks or allocation zones rather
/// than interval boundaries.
#[derive(Clone, Copy)]
pub struct MasterBlock(BlockRef);

impl MasterBlock {
  /// # Safety
  /// `base` must be a live, `BLOCK_SIZE`-aligned block whose tail word's
  /// lowest bit is set (the master/zone disambiguation bit, §3).
  unsafe fn from_base(base: *mut u8) -> Self {
    MasterBlock(unsafe { BlockRef::from_base(base) })
  }

  /// # Safety
  /// `base` must point to a freshly reserved, otherwise untouched block.
  unsafe fn init(base: *mut u8) -> Self {
    let block = unsafe { MasterBlock::from_base(base) };
    for i in 0..VARIABLE_SLOT_COUNT {
      block.slot(i).store(0, Ordering::SeqCst);
    }
    // Lowest bit set distinguishes a master block from an allocation
    // block when referenced from another master block's slot (§3).
    block.tail().store(0x1, Ordering::SeqCst);
    block
  }

  fn tail(&self) -> &'static AtomicU64 {
    unsafe { self.0.tail_word() }
  }

  fn slot(&self, index: usize) -> &'static AtomicU64 {
    debug_assert!(index < VARIABLE_SLOT_COUNT);
    unsafe { self.0.word_at(index * WORD_SIZE) }
  }

  /// Attempts to install `child_base` into the first free slot, using the
  /// same mark-used CAS discipline as a variable block's interval bits.
  /// Returns `false` if every slot is occupied.
  fn try_install(&self, child_base: usize) -> bool {
    loop {
      let bitmap = crate::sync::load(self.tail());
      if bitmap & (1 << LOCK_BIT) != 0 {
        continue;
      }
      let Some(i) = (0..=MAX_MASTER_SLOT).find(|&i| bitmap & (1 << i) == 0) else {
        return false;
      };
      let locked = bitmap | (1 << i) | (1 << LOCK_BIT);
      if self
        .tail()
        .compare_exchange(bitmap, locked, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
      {
        continue;
      }
      self.slot(i).store(child_base as u64, Ordering::SeqCst);
      let released = crate::sync::load(self.tail()) & !(1u64 << LOCK_BIT);
      self.tail().store(released, Ordering::SeqCst);
      return true;
    }
  }

  fn children(&self) -> impl Iterator<Item = usize> + '_ {
    (0..=MAX_MASTER_SLOT).filter_map(move |i| {
      let addr = self.slot(i).load(Ordering::SeqCst) as usize;
      (addr != 0).then_some(addr)
    })
  }
}

/// Owns the heap's master-block chain and hands out freshly carved zones.
///
/// Cyclic references can't arise: growth only ever appends a brand new
/// block, obtained from the OS collaborator, as either a fresh root master
/// block or a child of the current root — never a link back to an
/// ancestor (§9 "cyclic references").
pub struct ZoneRegistry<O> {
  os: O,
  root: Mutex<Option<MasterBlock>>,
}

impl<O: OsSource> ZoneRegistry<O> {
  pub const fn new(os: O) -> Self {
    ZoneRegistry { os, root: Mutex::new(None) }
  }

  /// Visits every reachable variable block (zone head) in the chain,
  /// depth-first, stopping early if `f` returns `Some`.
  pub fn for_each_zone<T>(&self, mut f: impl FnMut(VariableBlock) -> Option<T>) -> Option<T> {
    let root = self.root.lock().unwrap();
    let root = (*root)?;
    self.walk(root, &mut f)
  }

  /// Disambiguates each child by its own tail word's lowest bit (§3):
  /// `1` means the child is itself a master block, `0` means it's a
  /// zone's variable-size head block. This test happens *before* anything
  /// resembling [`crate::class::classify`] — a master block's tail word
  /// deliberately overlaps the fixed-1 tag, which is harmless because
  /// `classify` is only ever called on blocks already known (via the
  /// navigator or this traversal) to be allocation blocks, never on a
  /// master block's own tail word.
  fn walk<T>(&self, master: MasterBlock, f: &mut impl FnMut(VariableBlock) -> Option<T>) -> Option<T> {
    for child_addr in master.children() {
      let tail = unsafe { BlockRef::from_base(child_addr as *mut u8).tail_word() };
      let value = crate::sync::load(tail);
      if value & 0x1 == 1 {
        let nested = unsafe { MasterBlock::from_base(child_addr as *mut u8) };
        if let Some(result) = self.walk(nested, f) {
          return Some(result);
        }
      } else {
        let zone_head = unsafe { VariableBlock::from_base(child_addr as *mut u8) };
        if let Some(result) = f(zone_head) {
          return Some(result);
        }
      }
    }
    None
  }

  /// Carves a new zone sized by the predictor's current median (falling
  /// back to `min_bytes` when that's larger) and links it into the
  /// master-block chain, allocating a new root master block first if
  /// none exists or the current one has no free slot.
  pub fn grow(&self, min_bytes: usize) -> Result<VariableBlock, AllocError> {
    let hint = predictor::median_size().max(1) * 64;
    let request = min_bytes.max(hint).max(BLOCK_SIZE * 2);

    let (base, len) = self.os.reserve(request).ok_or(AllocError::OutOfMemory)?;
    let zone = unsafe { VariableBlock::init(base, base as usize + len) };
    log::debug!("grew zone base={base:p} len={len}");
    predictor::record(len);

    let mut root = self.root.lock().unwrap();
    let master = match *root {
      Some(master) if master.try_install(base as usize) => master,
      _ => {
        let (master_base, master_len) =
          self.os.reserve(BLOCK_SIZE).ok_or(AllocError::OutOfMemory)?;
        debug_assert!(master_len >= BLOCK_SIZE);
        let fresh = unsafe { MasterBlock::init(master_base) };
        let installed = fresh.try_install(base as usize);
        debug_assert!(installed, "a freshly initialized master block always has a free slot");
        fresh
      }
    };
    *root = Some(master);

    Ok(zone)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  struct FakeOs {
    next: AtomicUsize,
    backing: Mutex<Vec<(*mut u8, std::alloc::Layout)>>,
  }

  impl FakeOs {
    fn new() -> Self {
      FakeOs { next: AtomicUsize::new(0), backing: Mutex::new(Vec::new()) }
    }
  }

  impl OsSource for FakeOs {
    fn reserve(&self, min_bytes: usize) -> Option<(*mut u8, usize)> {
      let len = crate::align_to!(min_bytes, BLOCK_SIZE);
      let layout = std::alloc::Layout::from_size_align(len, BLOCK_SIZE).unwrap();
      let base = unsafe { std::alloc::alloc(layout) };
      self.backing.lock().unwrap().push((base, layout));
      self.next.fetch_add(1, Ordering::SeqCst);
      Some((base, len))
    }
  }

  impl Drop for FakeOs {
    fn drop(&mut self) {
      for (base, layout) in self.backing.lock().unwrap().drain(..) {
        unsafe { std::alloc::dealloc(base, layout) };
      }
    }
  }

  #[test]
  fn grow_links_a_reachable_zone() {
    let registry = ZoneRegistry::new(FakeOs::new());
    let zone = registry.grow(BLOCK_SIZE * 4).unwrap();

    let found = registry.for_each_zone(|z| (z.base_addr() == zone.base_addr()).then_some(()));
    assert!(found.is_some());
  }

  #[test]
  fn second_growth_reuses_the_existing_master_block() {
    let registry = ZoneRegistry::new(FakeOs::new());
    registry.grow(BLOCK_SIZE * 2).unwrap();
    registry.grow(BLOCK_SIZE * 2).unwrap();

    let mut count = 0;
    registry.for_each_zone(|_| {
      count += 1;
      None::<()>
    });
    assert_eq!(count, 2);
  }
}
