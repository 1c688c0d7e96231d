//! Architecture constants and allocation policy.
//!
//! Everything that shapes memory layout is a compile-time constant. Cache
//! depths are a [`Policy`] chosen when an [`Arena`](crate::Arena) is built, so
//! independent arenas can run with different limits.

use core::mem::size_of;

use crate::block::PageBlock;

// =============================================================================
// Architecture
// =============================================================================

pub const PAGE_BITS: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_BITS; // 4KB

pub const SUPERPAGE_BITS: usize = 23;
pub const SUPERPAGE_SIZE: usize = 1 << SUPERPAGE_BITS; // 8MB
pub const PAGES_PER_SUPERPAGE: usize = SUPERPAGE_SIZE / PAGE_SIZE;

/// Number of buddy orders. The top order (`BUDDY_ORDER_MAX - 1`) is a whole superpage.
pub const BUDDY_ORDER_MAX: usize = PAGES_PER_SUPERPAGE.trailing_zeros() as usize + 1;

/// Smallest alignment every returned pointer satisfies.
pub const MIN_ALIGN: usize = 16;

// =============================================================================
// PageBlocks
// =============================================================================

pub const MIN_PAGEBLOCK_SIZE: usize = 4 * PAGE_SIZE; // 16KB
pub const MAX_PAGEBLOCK_SIZE: usize = 64 * PAGE_SIZE; // 256KB
pub const MIN_PAGEBLOCK_ORDER: usize = (MIN_PAGEBLOCK_SIZE / PAGE_SIZE).trailing_zeros() as usize;
pub const MAX_PAGEBLOCK_ORDER: usize = (MAX_PAGEBLOCK_SIZE / PAGE_SIZE).trailing_zeros() as usize;
/// Distinct pageblock sizes (one cache per size).
pub const PAGEBLOCK_SIZES: usize = MAX_PAGEBLOCK_ORDER - MIN_PAGEBLOCK_ORDER + 1;

/// Target slot count used to size a class's pageblock.
pub const OBJECTS_PER_PAGEBLOCK: usize = 1024;

/// Bytes at the start of a pageblock taken by its header.
pub const PAGEBLOCK_HEADER: usize = size_of::<PageBlock>();

/// Largest request served from a pageblock slot.
pub const MAX_SMALL_OBJECT: usize = 16 * 1024;

/// Upper bound on slots in any pageblock. The deferred chain counts slots in 16 bits.
pub const MAX_SLOTS: usize = MAX_PAGEBLOCK_SIZE / MIN_ALIGN;

// =============================================================================
// Flat table window
// =============================================================================

/// Address window covered by the flat page table. Every superpage and large
/// mapping of a flat-table build lives inside it.
pub const FLAT_WINDOW_SIZE: usize = 1 << 31; // 2GB

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(SUPERPAGE_SIZE.is_power_of_two());
const _: () = assert!(PAGES_PER_SUPERPAGE <= u16::MAX as usize);
const _: () = assert!(BUDDY_ORDER_MAX == 12);
const _: () = assert!(MIN_PAGEBLOCK_SIZE.is_power_of_two());
const _: () = assert!(MAX_PAGEBLOCK_SIZE.is_power_of_two());
const _: () = assert!(MAX_PAGEBLOCK_SIZE < SUPERPAGE_SIZE);
const _: () = assert!(PAGEBLOCK_HEADER == 128); // 2 cache lines
const _: () = assert!(MAX_SMALL_OBJECT <= (MAX_PAGEBLOCK_SIZE - PAGEBLOCK_HEADER) / 8);
// Leave headroom below the 16-bit chain counter (and its 1-based head index).
const _: () = assert!(MAX_SLOTS < u16::MAX as usize / 2);
const _: () = assert!(FLAT_WINDOW_SIZE % SUPERPAGE_SIZE == 0);

// =============================================================================
// Policy
// =============================================================================

/// Cache limits of an arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Policy {
  /// Fully free pageblocks a thread keeps per pageblock size.
  pub max_private_inactive: usize,
  /// Fully free pageblocks kept globally per pageblock size before pages go back to the buddy.
  pub max_global_free: usize,
  /// Partially used pageblocks kept globally per size class.
  pub max_global_partial: usize,
  /// Fully free superpages kept mapped and ready before they are retired.
  pub idle_superpages: usize,
}

impl Policy {
  pub const DEFAULT: Policy = Policy {
    max_private_inactive: 4,
    max_global_free: 8,
    max_global_partial: 64,
    idle_superpages: 1,
  };
}

impl Default for Policy {
  fn default() -> Self {
    Self::DEFAULT
  }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[inline(always)]
pub const fn align_down(x: usize, align: usize) -> usize {
  x & !(align - 1)
}

/// Pages needed for `bytes`, rounded up to a power of two and returned as a buddy order.
#[inline]
pub const fn order_for(bytes: usize) -> usize {
  let pages = bytes.div_ceil(PAGE_SIZE);
  pages.next_power_of_two().trailing_zeros() as usize
}
