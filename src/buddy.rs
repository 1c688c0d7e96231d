//! Binary buddy allocator over the pages of one superpage.
//!
//! Chunks are named by their first page index. Order `k` chunks span `2^k`
//! pages and start on a multiple of `2^k`, so a chunk's buddy is one bit flip
//! away. Each order has a free list and an occupancy bitmap with one bit per
//! chunk: set iff that chunk is currently free at that order.
//!
//! This structure is not synchronized; the superpage directory serializes it.

use crate::{
  config::{BUDDY_ORDER_MAX, PAGES_PER_SUPERPAGE},
  list::{Link, List},
};

/// Order of a chunk covering the whole superpage.
pub const TOP_ORDER: usize = BUDDY_ORDER_MAX - 1;

const BITMAP_BITS: usize = 2 * PAGES_PER_SUPERPAGE - 1;
const BITMAP_WORDS: usize = BITMAP_BITS.div_ceil(64);

pub struct Buddy {
  lists: [List<u16>; BUDDY_ORDER_MAX],
  links: [Link<u16>; PAGES_PER_SUPERPAGE],
  bitmap: [u64; BITMAP_WORDS],
  /// Never below the largest order with a free chunk. `None` = nothing free.
  largest_free: Option<u8>,
}

impl Buddy {
  /// A buddy with every page free, as a single top-order chunk.
  pub fn new() -> Self {
    let mut buddy = Self {
      lists: [const { List::new() }; BUDDY_ORDER_MAX],
      links: [Link::UNLINKED; PAGES_PER_SUPERPAGE],
      bitmap: [0; BITMAP_WORDS],
      largest_free: None,
    };
    buddy.insert(0, TOP_ORDER);
    buddy
  }

  /// First bit of `order` in the shared bitmap.
  #[inline]
  const fn bit_index(page: u16, order: usize) -> usize {
    let offset = 2 * PAGES_PER_SUPERPAGE - ((2 * PAGES_PER_SUPERPAGE) >> order);
    offset + ((page as usize) >> order)
  }

  #[inline]
  fn test_bit(&self, page: u16, order: usize) -> bool {
    let bit = Self::bit_index(page, order);
    self.bitmap[bit / 64] & (1 << (bit % 64)) != 0
  }

  #[inline]
  fn toggle_bit(&mut self, page: u16, order: usize) {
    let bit = Self::bit_index(page, order);
    self.bitmap[bit / 64] ^= 1 << (bit % 64);
  }

  fn insert(&mut self, page: u16, order: usize) {
    debug_assert!(!self.test_bit(page, order));
    self.toggle_bit(page, order);
    self.lists[order].push_front(&mut self.links[..], page);
    if self.largest_free.is_none_or(|largest| order > largest as usize) {
      self.largest_free = Some(order as u8);
    }
  }

  fn take(&mut self, page: u16, order: usize) {
    debug_assert!(self.test_bit(page, order));
    self.toggle_bit(page, order);
    self.lists[order].remove(&mut self.links[..], page);
  }

  /// Cached largest order that may have a free chunk.
  #[inline]
  pub fn largest_free_order(&self) -> Option<usize> {
    self.largest_free.map(usize::from)
  }

  #[inline]
  pub fn can_satisfy(&self, order: usize) -> bool {
    self.largest_free_order().is_some_and(|largest| largest >= order)
  }

  /// True when the whole superpage is one free chunk.
  #[inline]
  pub fn is_whole(&self) -> bool {
    !self.lists[TOP_ORDER].is_empty()
  }

  /// Takes a free chunk of `order` pages, splitting a larger one if needed.
  /// Returns the chunk's first page.
  pub fn alloc(&mut self, order: usize) -> Option<u16> {
    if !self.can_satisfy(order) {
      return None;
    }

    let found = (order..BUDDY_ORDER_MAX).find(|&o| !self.lists[o].is_empty())?;
    let page = self.lists[found].head()?;
    self.take(page, found);

    // Keep the lower half, free the upper half at each level down.
    for split in (order..found).rev() {
      self.insert(page + (1 << split), split);
    }

    self.refresh_largest();
    Some(page)
  }

  /// Returns a chunk, merging with free buddies on the way up.
  /// Returns true if the superpage is now entirely free.
  pub fn free(&mut self, mut page: u16, mut order: usize) -> bool {
    debug_assert!(page as usize % (1 << order) == 0);

    while order < TOP_ORDER {
      let buddy = page ^ (1 << order);
      if !self.test_bit(buddy, order) {
        break;
      }
      self.take(buddy, order);
      page = page.min(buddy);
      order += 1;
    }

    self.insert(page, order);
    order == TOP_ORDER
  }

  /// Lowers the cached largest order once its list ran dry.
  fn refresh_largest(&mut self) {
    let Some(largest) = self.largest_free_order() else {
      return;
    };
    if !self.lists[largest].is_empty() {
      return;
    }
    self.largest_free = (0..largest)
      .rev()
      .find(|&o| !self.lists[o].is_empty())
      .map(|o| o as u8);
  }

  #[cfg(test)]
  pub fn free_pages(&self) -> usize {
    (0..BUDDY_ORDER_MAX)
      .map(|order| self.lists[order].len() << order)
      .sum()
  }
}
