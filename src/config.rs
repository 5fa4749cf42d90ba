//! Build-time tunables.
//!
//! Every constant here is fixed at compile time, matching the original
//! `btmalloc.c` tunables (`block_size`, `MAX_HOARD`, `predictor_size`, ...).
//! There is no runtime configuration surface: the layout math throughout
//! the crate (bitmap widths, bit offsets) is derived from these values at
//! compile time and would need re-deriving if they changed.

/// Partition granularity: every region is divided into blocks of this size.
pub const BLOCK_SIZE: usize = 512;

/// Base alignment of a region obtained from the OS collaborator. Must be a
/// multiple of [`BLOCK_SIZE`].
pub const BLOCK_ALIGNMENT: usize = 512;

/// Per-thread hoard byte cap (§4.7).
pub const MAX_HOARD: usize = 3_000;

/// Predictor histogram width. Must be at least `slot class count + fuzz + 2`.
pub const PREDICTOR_SIZE: usize = 12;

/// Width of the precisely-tracked fuzz zone around the predictor median.
pub const PREDICTOR_FUZZ: usize = 4;

/// Sum-of-counts threshold that triggers predictor aging (halving).
pub const P_COMPRESS_THRESHOLD: u32 = 1_000;

/// Number of fixed-size slot classes (1, 2, 4, 8 byte strides).
pub const SLOT_TYPE_COUNT: usize = 4;

/// `word & mask == test` identifies each fixed-size class; tested in this
/// order, first match wins. Ported verbatim from btmalloc.c's
/// `fixedsize_mask`/`fixedsize_test`.
pub const FIXEDSIZE_MASK: [u64; SLOT_TYPE_COUNT] = [0x1, 0x3, 0xF, 0xF];
pub const FIXEDSIZE_TEST: [u64; SLOT_TYPE_COUNT] = [0x1, 0x2, 0x4, 0xC];

/// Width of the tag in bits, i.e. the bit index where slot 0 begins for
/// each class (§4.2: "user slot 0 therefore starts at bit position equal
/// to the class's tag width").
pub const FIXEDSIZE_SLOT0_BIT: [u32; SLOT_TYPE_COUNT] = [1, 2, 4, 4];

/// Stride (bytes per slot) for each class.
pub const FIXEDSIZE_ALIGNMENT: [usize; SLOT_TYPE_COUNT] = [1, 8, 4, 2];

/// Total span in bytes consumed within the 512-byte block by a sub-block of
/// each class, bitmap word included.
pub const FIXEDSIZE_BLOCK_SIZE: [usize; SLOT_TYPE_COUNT] = [8, 504, 248, 128];

/// User-addressable bytes available in a sub-block of each class (the span
/// above, minus the bitmap word for classes 1-3, and minus nothing for
/// fixed-1 which folds bitmap and data into the same word).
pub const FIXEDSIZE_USER_BYTES: [usize; SLOT_TYPE_COUNT] = [7, 496, 240, 120];

/// Number of bitmap bits actually used to track slots in each class (the
/// "Bitmap width" column of §3's tag table).
pub const FIXEDSIZE_BITMAP_WIDTH: [u32; SLOT_TYPE_COUNT] = [7, 62, 60, 60];

/// Number of real slots in a variable-size block's bitmap (slot 61 is the
/// reserved zone-end pointer, not tracked here).
pub const VARIABLE_SLOT_COUNT: usize = 62;

/// Size in bytes of a single word (control word, slot, or bitmap unit).
pub const WORD_SIZE: usize = 8;
