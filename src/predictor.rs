//! Predictor (§4.8): a bounded per-thread histogram over allocation sizes,
//! used to size new zones and decide whether to pre-carve fixed-size
//! subblocks. Ported from btmalloc.c's `predictor`/`p_count`/`p_total`
//! thread-locals.

use std::cell::RefCell;

use crate::config::{PREDICTOR_FUZZ, PREDICTOR_SIZE, P_COMPRESS_THRESHOLD, SLOT_TYPE_COUNT};

struct Histogram {
  /// Tracked allocation sizes, ascending. The first `SLOT_TYPE_COUNT`
  /// entries are the fixed-size strides and are never evicted.
  sizes: [usize; PREDICTOR_SIZE],
  counts: [u32; PREDICTOR_SIZE],
  total: u32,
}

impl Histogram {
  fn new() -> Self {
    let mut sizes = [0usize; PREDICTOR_SIZE];
    // Seed with the fixed-size strides (1, 2, 4, 8), matching the
    // original's `{1, 2, 4, 8}` initializer.
    sizes[0] = 1;
    sizes[1] = 2;
    sizes[2] = 4;
    sizes[3] = 8;
    for (i, slot) in sizes.iter_mut().enumerate().skip(SLOT_TYPE_COUNT) {
      *slot = 8 * (i - SLOT_TYPE_COUNT + 2);
    }
    Histogram { sizes, counts: [0; PREDICTOR_SIZE], total: 0 }
  }

  fn median_index(&self) -> usize {
    let half = self.total / 2;
    let mut running = 0u32;
    for i in 0..PREDICTOR_SIZE {
      running += self.counts[i];
      if running > half {
        return i;
      }
    }
    PREDICTOR_SIZE - 1
  }

  /// Window `[median - FUZZ/2, median + FUZZ/2]`, clamped to bounds.
  fn fuzz_zone(&self) -> std::ops::RangeInclusive<usize> {
    let median = self.median_index();
    let half_fuzz = PREDICTOR_FUZZ / 2;
    let lo = median.saturating_sub(half_fuzz);
    let hi = (median + half_fuzz).min(PREDICTOR_SIZE - 1);
    lo..=hi
  }

  fn nearest_entry(&self, size: usize) -> usize {
    // "An allocation size falling between two entries counts toward
    // the larger" (§4.8): first entry whose tracked size is >= size,
    // or the last entry if none is large enough.
    for (i, &tracked) in self.sizes.iter().enumerate() {
      if tracked >= size {
        return i;
      }
    }
    PREDICTOR_SIZE - 1
  }

  fn record(&mut self, size: usize) {
    let fuzz = self.fuzz_zone();
    let i = self.nearest_entry(size);

    if self.sizes[i] == size || i < SLOT_TYPE_COUNT {
      self.counts[i] += 1;
    } else if fuzz.contains(&i) {
      self.promote(size);
    } else {
      self.counts[i] += 1;
    }
    self.total += 1;

    if self.total > P_COMPRESS_THRESHOLD {
      self.age();
    }
  }

  /// Evicts the lowest-count entry outside the fuzz zone (never a
  /// fixed-size entry, never the last entry), folding its count into its
  /// right neighbour, then installs `size` in its place with half the
  /// new neighbour's count.
  fn promote(&mut self, size: usize) {
    let fuzz = self.fuzz_zone();
    let victim = (SLOT_TYPE_COUNT..PREDICTOR_SIZE - 1)
      .filter(|i| !fuzz.contains(i))
      .min_by_key(|&i| self.counts[i]);

    let Some(victim) = victim else {
      // No eligible eviction target; fall back to a plain increment
      // of the nearest entry rather than losing the observation.
      let i = self.nearest_entry(size);
      self.counts[i] += 1;
      return;
    };

    self.counts[victim + 1] += self.counts[victim];
    self.sizes[victim] = size;
    self.counts[victim] = self.counts[victim + 1] / 2;
  }

  fn age(&mut self) {
    let mut total = 0u32;
    for count in &mut self.counts {
      *count /= 2;
      total += *count;
    }
    self.total = total;
  }
}

thread_local! {
  static HISTOGRAM: RefCell<Histogram> = RefCell::new(Histogram::new());
}

/// Records a cache-miss or zone-growth observation of `size` bytes.
pub fn record(size: usize) {
  HISTOGRAM.with(|h| h.borrow_mut().record(size));
}

/// Returns the predictor's current median-bucket size estimate.
pub fn median_size() -> usize {
  HISTOGRAM.with(|h| {
    let h = h.borrow();
    h.sizes[h.median_index()]
  })
}

/// Returns the sum of all tracked counts (exposed for tests and
/// diagnostics; not part of the allocate/free hot path).
pub fn total_count() -> u32 {
  HISTOGRAM.with(|h| h.borrow().total)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ages_once_threshold_exceeded() {
    for _ in 0..=P_COMPRESS_THRESHOLD {
      record(8);
    }
    record(1024);
    assert!(total_count() <= P_COMPRESS_THRESHOLD / 2 + 2);
    assert_eq!(median_size(), 8);
  }

  #[test]
  fn fixed_size_entries_are_never_evicted() {
    for _ in 0..50 {
      record(1);
      record(2);
      record(4);
      record(8);
    }
    HISTOGRAM.with(|h| {
      let h = h.borrow();
      assert_eq!(h.sizes[0], 1);
      assert_eq!(h.sizes[1], 2);
      assert_eq!(h.sizes[2], 4);
      assert_eq!(h.sizes[3], 8);
    });
  }
}
