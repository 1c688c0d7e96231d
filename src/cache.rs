//! Global pageblock caches shared by all thread heaps.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::{
  block::{BlockRef, PageBlock},
  config::{MIN_PAGEBLOCK_SIZE, PAGEBLOCK_SIZES},
  size_class::CLASSES_COUNT,
};

/// Pageblocks are aligned to at least their minimum size; the spare low bits
/// carry an ABA tag.
const TAG_MASK: u64 = MIN_PAGEBLOCK_SIZE as u64 - 1;

/// Lock-free LIFO of pageblocks, linked through `cache_next`.
///
/// `count` is taken before a block is published and given back after it is
/// unlinked, so it never drops below the number of linked blocks.
pub struct BlockStack {
  head: AtomicU64,
  count: AtomicUsize,
}

impl BlockStack {
  pub const fn new() -> Self {
    Self {
      head: AtomicU64::new(0),
      count: AtomicUsize::new(0),
    }
  }

  #[inline]
  fn next_tag(packed: u64) -> u64 {
    (packed + 1) & TAG_MASK
  }

  /// Pushes `block` unless `limit` blocks are already cached.
  pub fn push(&self, block: BlockRef, limit: usize) -> bool {
    let reserved = self
      .count
      .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| (n < limit).then_some(n + 1));
    if reserved.is_err() {
      return false;
    }

    let addr = block.addr() as u64;
    debug_assert_eq!(addr & TAG_MASK, 0);
    let mut packed = self.head.load(Ordering::Relaxed);
    loop {
      block.set_next_cached((packed & !TAG_MASK) as *mut PageBlock);
      match self.head.compare_exchange_weak(
        packed,
        addr | Self::next_tag(packed),
        Ordering::Release,
        Ordering::Relaxed,
      ) {
        Ok(_) => break,
        Err(actual) => packed = actual,
      }
    }
    true
  }

  pub fn pop(&self) -> Option<BlockRef> {
    let mut packed = self.head.load(Ordering::Acquire);
    loop {
      let top = packed & !TAG_MASK;
      if top == 0 {
        return None;
      }
      // May read a stale link if `top` was popped meanwhile; the tag makes
      // the CAS fail then. Pageblock memory stays mapped, so the read is safe.
      let block = unsafe { BlockRef::from_addr(top as usize) };
      let next = block.next_cached() as u64;
      match self.head.compare_exchange_weak(
        packed,
        next | Self::next_tag(packed),
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => {
          self.count.fetch_sub(1, Ordering::Relaxed);
          return Some(block);
        }
        Err(actual) => packed = actual,
      }
    }
  }

  #[cfg(test)]
  pub fn len(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }
}

/// Fully free blocks per pageblock size, partially used blocks per class.
pub struct GlobalCaches {
  pub free: [BlockStack; PAGEBLOCK_SIZES],
  pub partial: [BlockStack; CLASSES_COUNT],
}

impl GlobalCaches {
  pub const fn new() -> Self {
    Self {
      free: [const { BlockStack::new() }; PAGEBLOCK_SIZES],
      partial: [const { BlockStack::new() }; CLASSES_COUNT],
    }
  }
}
