use core::{
  mem::size_of,
  ptr::{self, NonNull},
  sync::atomic::{AtomicPtr, AtomicU64, Ordering},
};

use super::{PageMap, Record};
use crate::{
  config::{FLAT_WINDOW_SIZE, PAGE_BITS},
  error::{AllocError, Result},
  os,
  source::window,
};

const ENTRIES: usize = FLAT_WINDOW_SIZE >> PAGE_BITS;
const TABLE_LEN: usize = ENTRIES * size_of::<AtomicU64>();

/// One record per page of the reserved window, indexed by page offset.
pub struct FlatTable {
  table: AtomicPtr<AtomicU64>,
}

impl FlatTable {
  pub const fn new() -> Self {
    Self {
      table: AtomicPtr::new(ptr::null_mut()),
    }
  }

  #[inline]
  fn index(addr: usize) -> Option<usize> {
    window().offset_of(addr).map(|offset| offset >> PAGE_BITS)
  }

  fn entry(&self, addr: usize) -> Option<&AtomicU64> {
    let index = Self::index(addr)?;
    let table = self.table.load(Ordering::Acquire);
    if table.is_null() {
      return None;
    }
    Some(unsafe { &*table.add(index) })
  }

  fn entry_or_install(&self, addr: usize) -> Result<&AtomicU64> {
    let index = Self::index(addr).ok_or(AllocError::Exhausted)?;
    let mut table = self.table.load(Ordering::Acquire);
    if table.is_null() {
      let fresh = os::map(TABLE_LEN)?.cast::<AtomicU64>();
      table = match self.table.compare_exchange(
        ptr::null_mut(),
        fresh.as_ptr(),
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => fresh.as_ptr(),
        Err(winner) => {
          unsafe { os::unmap(fresh.cast(), TABLE_LEN) };
          winner
        }
      };
    }
    Ok(unsafe { &*table.add(index) })
  }
}

impl PageMap for FlatTable {
  const HEADER: usize = 0;

  fn register(&self, page: usize, record: Record) -> Result<()> {
    self
      .entry_or_install(page)?
      .store(record.encode(), Ordering::Release);
    Ok(())
  }

  fn unregister(&self, page: usize) {
    if let Some(entry) = self.entry(page) {
      entry.store(0, Ordering::Release);
    }
  }

  #[inline]
  unsafe fn tag(&self, _object: NonNull<u8>, _record: Record) {}

  #[inline]
  unsafe fn lookup(&self, object: *const u8) -> Option<Record> {
    let word = self.entry(object as usize)?.load(Ordering::Acquire);
    unsafe { Record::decode(word) }
  }
}

impl Drop for FlatTable {
  fn drop(&mut self) {
    if let Some(table) = NonNull::new(*self.table.get_mut()) {
      unsafe { os::unmap(table.cast(), TABLE_LEN) };
    }
  }
}
