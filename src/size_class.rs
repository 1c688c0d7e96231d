//! Size classes for small objects.
//!
//! Sizes up to [`LINEAR_MAX`] use 16-byte steps. Above that every doubling is
//! split into [`CLASSES_PER_DOUBLING`] equal steps, so rounding waste stays
//! under 1/8 of the request. Both directions are plain arithmetic; the derived
//! pageblock tables are computed at compile time.

use crate::config::{
  MAX_PAGEBLOCK_ORDER, MAX_SMALL_OBJECT, MIN_ALIGN, MIN_PAGEBLOCK_ORDER, OBJECTS_PER_PAGEBLOCK,
  PAGE_SIZE, PAGEBLOCK_HEADER,
};

/// Step of the linear range.
const LINEAR_STEP: usize = MIN_ALIGN;
/// Largest size in the linear range.
const LINEAR_MAX: usize = 512;
const CLASSES_LINEAR: usize = LINEAR_MAX / LINEAR_STEP;

/// Classes per doubling in the geometric range.
const CLASSES_PER_DOUBLING: usize = 8;
const DOUBLING_BITS: u32 = CLASSES_PER_DOUBLING.trailing_zeros();
const LINEAR_MAX_BITS: u32 = LINEAR_MAX.trailing_zeros();

/// Total number of size classes for small allocations.
pub const CLASSES_COUNT: usize = CLASSES_LINEAR
  + CLASSES_PER_DOUBLING * (MAX_SMALL_OBJECT / LINEAR_MAX).trailing_zeros() as usize;

const _: () = assert!(class_to_size(0) == MIN_ALIGN);
const _: () = assert!(class_to_size(CLASSES_COUNT - 1) == MAX_SMALL_OBJECT);
const _: () = assert!(CLASSES_COUNT <= u8::MAX as usize);
const _: () = assert!(MAX_SMALL_OBJECT.is_power_of_two());

/// Convert class index to object size (inverse of `size_to_class`).
#[inline(always)]
pub const fn class_to_size(class: usize) -> usize {
  if class < CLASSES_LINEAR {
    (class + 1) * LINEAR_STEP
  } else {
    let geo = class - CLASSES_LINEAR;
    let doubling = geo >> DOUBLING_BITS;
    let step = (geo & (CLASSES_PER_DOUBLING - 1)) + 1;
    let base = LINEAR_MAX << doubling;
    base + step * (base >> DOUBLING_BITS)
  }
}

/// Convert a request size to the smallest class holding it.
///
/// `size` must be at most [`MAX_SMALL_OBJECT`]; zero maps to the first class.
#[inline(always)]
pub fn size_to_class(size: usize) -> usize {
  debug_assert!(size <= MAX_SMALL_OBJECT);
  if size <= LINEAR_MAX {
    return size.saturating_sub(1) / LINEAR_STEP;
  }

  // (512 << d, 1024 << d] belongs to doubling d.
  let log2 = (usize::BITS - 1 - (size - 1).leading_zeros()) as usize;
  let doubling = log2 - LINEAR_MAX_BITS as usize;
  let base = LINEAR_MAX << doubling;
  let step = (size - base).div_ceil(base >> DOUBLING_BITS);
  CLASSES_LINEAR + (doubling << DOUBLING_BITS) + step - 1
}

// =============================================================================
// Pageblock geometry
// =============================================================================

/// Buddy order of the pageblock backing `class`: about `OBJECTS_PER_PAGEBLOCK`
/// objects, clamped to the configured pageblock sizes.
const fn compute_pageblock_order(class: usize) -> usize {
  let pages = (class_to_size(class) * OBJECTS_PER_PAGEBLOCK).div_ceil(PAGE_SIZE);
  let order = pages.next_power_of_two().trailing_zeros() as usize;
  if order < MIN_PAGEBLOCK_ORDER {
    MIN_PAGEBLOCK_ORDER
  } else if order > MAX_PAGEBLOCK_ORDER {
    MAX_PAGEBLOCK_ORDER
  } else {
    order
  }
}

const PAGEBLOCK_ORDERS: [u8; CLASSES_COUNT] = {
  let mut table = [0u8; CLASSES_COUNT];
  let mut class = 0;
  while class < CLASSES_COUNT {
    table[class] = compute_pageblock_order(class) as u8;
    class += 1;
  }
  table
};

const SLOTS: [u16; CLASSES_COUNT] = {
  let mut table = [0u16; CLASSES_COUNT];
  let mut class = 0;
  while class < CLASSES_COUNT {
    let bytes = PAGE_SIZE << PAGEBLOCK_ORDERS[class];
    table[class] = ((bytes - PAGEBLOCK_HEADER) / class_to_size(class)) as u16;
    class += 1;
  }
  table
};

/// Buddy order (in pages) of the pageblocks used for `class`.
#[inline]
pub fn pageblock_order(class: usize) -> usize {
  PAGEBLOCK_ORDERS[class] as usize
}

/// Bytes of the pageblocks used for `class`.
#[inline]
pub fn pageblock_size(class: usize) -> usize {
  PAGE_SIZE << PAGEBLOCK_ORDERS[class]
}

/// Index of a pageblock order among the pageblock sizes.
#[inline]
pub fn pageblock_size_index(order: usize) -> usize {
  order - MIN_PAGEBLOCK_ORDER
}

/// Slots in one pageblock of `class`.
#[inline]
pub fn objects_per_pageblock(class: usize) -> usize {
  SLOTS[class] as usize
}
