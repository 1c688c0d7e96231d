use core::{
  mem::size_of,
  ptr::NonNull,
  sync::atomic::{AtomicU64, Ordering},
};

use super::{PageMap, Record};
use crate::{
  config::PAGE_BITS,
  error::{AllocError, Result},
  os,
};

const LEVEL_BITS: usize = 12;
const FANOUT: usize = 1 << LEVEL_BITS;
const ADDRESS_BITS: usize = 48;

const _: () = assert!(PAGE_BITS + 3 * LEVEL_BITS == ADDRESS_BITS);

/// One level of the tree: child node addresses, or encoded records at the
/// leaves. 0 = empty.
struct Node {
  slots: [AtomicU64; FANOUT],
}

const NODE_LEN: usize = size_of::<Node>();

/// Three-level radix tree keyed by page number. Nodes are mapped on demand
/// and never freed before the tree itself.
pub struct RadixTree {
  root: AtomicU64,
}

impl RadixTree {
  pub const fn new() -> Self {
    Self {
      root: AtomicU64::new(0),
    }
  }

  #[inline]
  fn indices(addr: usize) -> Option<[usize; 3]> {
    let page = addr >> PAGE_BITS;
    if page >> (3 * LEVEL_BITS) != 0 {
      return None;
    }
    Some([
      page >> (2 * LEVEL_BITS),
      (page >> LEVEL_BITS) & (FANOUT - 1),
      page & (FANOUT - 1),
    ])
  }

  #[inline]
  fn child(slot: &AtomicU64) -> Option<&Node> {
    match slot.load(Ordering::Acquire) {
      0 => None,
      addr => Some(unsafe { &*(addr as *const Node) }),
    }
  }

  /// Returns the child behind `slot`, installing a zeroed node if empty.
  /// Racing installers agree on the first one to land; the others unmap.
  fn child_or_install(slot: &AtomicU64) -> Result<&Node> {
    if let Some(node) = Self::child(slot) {
      return Ok(node);
    }

    let fresh = os::map(NODE_LEN)?;
    match slot.compare_exchange(
      0,
      fresh.as_ptr() as u64,
      Ordering::AcqRel,
      Ordering::Acquire,
    ) {
      Ok(_) => Ok(unsafe { fresh.cast::<Node>().as_ref() }),
      Err(winner) => {
        unsafe { os::unmap(fresh, NODE_LEN) };
        Ok(unsafe { &*(winner as *const Node) })
      }
    }
  }

  fn leaf(&self, addr: usize) -> Option<&AtomicU64> {
    let [top, mid, low] = Self::indices(addr)?;
    let upper = Self::child(&self.root)?;
    let lower = Self::child(&upper.slots[top])?;
    let leaf = Self::child(&lower.slots[mid])?;
    Some(&leaf.slots[low])
  }

  fn leaf_or_install(&self, addr: usize) -> Result<&AtomicU64> {
    let [top, mid, low] = Self::indices(addr).ok_or(AllocError::Overflow)?;
    let upper = Self::child_or_install(&self.root)?;
    let lower = Self::child_or_install(&upper.slots[top])?;
    let leaf = Self::child_or_install(&lower.slots[mid])?;
    Ok(&leaf.slots[low])
  }
}

impl PageMap for RadixTree {
  const HEADER: usize = 0;

  fn register(&self, page: usize, record: Record) -> Result<()> {
    self
      .leaf_or_install(page)?
      .store(record.encode(), Ordering::Release);
    Ok(())
  }

  fn unregister(&self, page: usize) {
    if let Some(entry) = self.leaf(page) {
      entry.store(0, Ordering::Release);
    }
  }

  #[inline]
  unsafe fn tag(&self, _object: NonNull<u8>, _record: Record) {}

  #[inline]
  unsafe fn lookup(&self, object: *const u8) -> Option<Record> {
    let word = self.leaf(object as usize)?.load(Ordering::Acquire);
    unsafe { Record::decode(word) }
  }
}

impl Drop for RadixTree {
  fn drop(&mut self) {
    let Some(upper) = Self::child(&self.root) else {
      return;
    };
    for top in &upper.slots {
      let Some(lower) = Self::child(top) else {
        continue;
      };
      for mid in &lower.slots {
        if let Some(leaf) = Self::child(mid) {
          unsafe { os::unmap(NonNull::from(leaf).cast(), NODE_LEN) };
        }
      }
      unsafe { os::unmap(NonNull::from(lower).cast(), NODE_LEN) };
    }
    unsafe { os::unmap(NonNull::from(upper).cast(), NODE_LEN) };
  }
}

#[cfg(test)]
mod tests {
  use std::{sync::Arc, thread};

  use super::*;
  use crate::{config::PAGE_SIZE, registry::tests::sample_records};

  #[test]
  fn lookup_finds_any_address_in_a_registered_page() {
    let tree = RadixTree::new();
    let [small, medium, _] = sample_records();
    let page = 0x7f00_1234_5000;

    assert_eq!(unsafe { tree.lookup(page as *const u8) }, None);
    tree.register(page, small).unwrap();
    tree.register(page + PAGE_SIZE, medium).unwrap();

    assert_eq!(unsafe { tree.lookup((page + 17) as *const u8) }, Some(small));
    assert_eq!(unsafe { tree.lookup((page + 2 * PAGE_SIZE - 1) as *const u8) }, Some(medium));
    assert_eq!(unsafe { tree.lookup((page + 2 * PAGE_SIZE) as *const u8) }, None);

    // Registration is idempotent.
    tree.register(page, small).unwrap();
    assert_eq!(unsafe { tree.lookup(page as *const u8) }, Some(small));

    tree.unregister(page);
    assert_eq!(unsafe { tree.lookup(page as *const u8) }, None);
    assert_eq!(unsafe { tree.lookup((page + PAGE_SIZE) as *const u8) }, Some(medium));
  }

  #[test]
  fn addresses_beyond_48_bits_are_rejected() {
    let tree = RadixTree::new();
    let [_, _, large] = sample_records();
    assert_eq!(tree.register(1 << 48, large), Err(AllocError::Overflow));
    assert_eq!(unsafe { tree.lookup((1usize << 48) as *const u8) }, None);
  }

  #[test]
  fn concurrent_installs_lose_nothing() {
    let tree = Arc::new(RadixTree::new());
    let large = || Record::Large { len: 24 << 20 };
    let base = 0x5500_0000_0000usize;

    let handles: Vec<_> = (0..8)
      .map(|t| {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
          let large = Record::Large { len: 24 << 20 };
          for i in 0..64 {
            let page = base + (i * 8 + t) * PAGE_SIZE;
            tree.register(page, large).unwrap();
          }
        })
      })
      .collect();
    for handle in handles {
      handle.join().unwrap();
    }

    for page in 0..512 {
      let addr = base + page * PAGE_SIZE;
      assert_eq!(unsafe { tree.lookup(addr as *const u8) }, Some(large()));
    }
  }
}
