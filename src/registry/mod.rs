//! Address to owner lookup.
//!
//! Each build links exactly one strategy, chosen by cargo feature:
//! a radix tree over page numbers, a flat table over the reserved window, or
//! a tag written in front of every object.

use core::ptr::NonNull;

use crate::{block::BlockRef, config::PAGE_SIZE, error::Result, superpage::SuperpageRef};

#[cfg(any(feature = "meta-flat", test))]
mod flat;
#[cfg(any(feature = "meta-header", test))]
mod header;
#[cfg(any(feature = "meta-radix", test))]
mod radix;

#[cfg(not(any(feature = "meta-radix", feature = "meta-flat", feature = "meta-header")))]
compile_error!("enable one of the features meta-radix, meta-flat or meta-header");

#[cfg(any(
  all(feature = "meta-radix", feature = "meta-flat"),
  all(feature = "meta-radix", feature = "meta-header"),
  all(feature = "meta-flat", feature = "meta-header"),
))]
compile_error!("meta-radix, meta-flat and meta-header are mutually exclusive");

#[cfg(feature = "meta-radix")]
pub type Registry = radix::RadixTree;
#[cfg(feature = "meta-flat")]
pub type Registry = flat::FlatTable;
#[cfg(feature = "meta-header")]
pub type Registry = header::HeaderTags;

/// What an object address belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Record {
  /// A slot of a pageblock.
  Small(BlockRef),
  /// A buddy chunk of `2^order` pages.
  Medium { superpage: SuperpageRef, order: u8 },
  /// A dedicated mapping of `len` bytes.
  Large { len: usize },
}

const TAG_BITS: u32 = 2;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;
const TAG_SMALL: u64 = 1;
const TAG_MEDIUM: u64 = 2;
const TAG_LARGE: u64 = 3;
const ORDER_MASK: u64 = 0xF;

const _: () = assert!(SuperpageRef::ADDR_ALIGN >= 1 << (TAG_BITS + 4));

impl Record {
  /// Packs the record into one word. 0 never encodes a record.
  #[inline]
  pub fn encode(self) -> u64 {
    match self {
      Record::Small(block) => block.addr() as u64 | TAG_SMALL,
      Record::Medium { superpage, order } => {
        superpage.addr() as u64 | (order as u64 & ORDER_MASK) << TAG_BITS | TAG_MEDIUM
      }
      Record::Large { len } => (len as u64) << TAG_BITS | TAG_LARGE,
    }
  }

  /// # Safety
  /// `word` must be 0 or come from [`Record::encode`] of a live record.
  #[inline]
  pub unsafe fn decode(word: u64) -> Option<Self> {
    match word & TAG_MASK {
      TAG_SMALL => Some(Record::Small(unsafe {
        BlockRef::from_addr((word & !TAG_MASK) as usize)
      })),
      TAG_MEDIUM => {
        let addr = word & !(SuperpageRef::ADDR_ALIGN as u64 - 1);
        Some(Record::Medium {
          superpage: unsafe { SuperpageRef::from_addr(addr as usize) },
          order: ((word >> TAG_BITS) & ORDER_MASK) as u8,
        })
      }
      TAG_LARGE => Some(Record::Large {
        len: (word >> TAG_BITS) as usize,
      }),
      _ => None,
    }
  }
}

/// Strategy for recording and recovering [`Record`]s.
pub trait PageMap {
  /// Bytes reserved in front of every object.
  const HEADER: usize;

  /// Records `record` for the page starting at `page`.
  fn register(&self, page: usize, record: Record) -> Result<()>;

  fn unregister(&self, page: usize);

  /// Records `record` for one object, for strategies that keep it inline.
  ///
  /// # Safety
  /// `object` must have `HEADER` writable bytes in front of it.
  unsafe fn tag(&self, object: NonNull<u8>, record: Record);

  /// Finds the record of a live object.
  ///
  /// # Safety
  /// `object` must be null-free and, for inline strategies, returned by this
  /// allocator.
  unsafe fn lookup(&self, object: *const u8) -> Option<Record>;

  fn register_pages(&self, start: usize, pages: usize, record: Record) -> Result<()> {
    for page in 0..pages {
      if let Err(err) = self.register(start + page * PAGE_SIZE, record) {
        self.unregister_pages(start, page);
        return Err(err);
      }
    }
    Ok(())
  }

  fn unregister_pages(&self, start: usize, pages: usize) {
    for page in 0..pages {
      self.unregister(start + page * PAGE_SIZE);
    }
  }
}
