//! Thin layer over the platform's anonymous mappings.

use core::{
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicU32, Ordering},
};

use crate::{
  config::{PAGE_SIZE, align_up},
  error::{AllocError, Result},
};

/// Owner id for orphaned pageblocks (no owning thread heap).
pub const OWNER_ORPHAN: u32 = 0;

pub fn map(len: usize) -> Result<NonNull<u8>> {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      len,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    log::warn!("mmap of {len} bytes failed");
    Err(AllocError::OutOfMemory { bytes: len })
  } else {
    NonNull::new(ptr.cast()).ok_or(AllocError::OutOfMemory { bytes: len })
  }
}

pub unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
  unsafe { libc::munmap(ptr.as_ptr().cast(), len) };
}

/// Maps `len` bytes so that `base + lead` is a multiple of `align`.
///
/// Over-maps by `align` and trims the slack on both sides. `len` and `lead`
/// must be page multiples.
pub fn map_aligned(len: usize, align: usize, lead: usize) -> Result<NonNull<u8>> {
  debug_assert!(len % PAGE_SIZE == 0 && lead % PAGE_SIZE == 0);
  if align <= PAGE_SIZE {
    return map(len);
  }

  let total = len.checked_add(align).ok_or(AllocError::Overflow)?;
  let raw = map(total)?;
  let raw_addr = raw.as_ptr() as usize;
  let base = align_up(raw_addr + lead, align) - lead;

  unsafe {
    let head = base - raw_addr;
    if head > 0 {
      unmap(raw, head);
    }
    let tail = raw_addr + total - (base + len);
    if tail > 0 {
      unmap(NonNull::new_unchecked((base + len) as *mut u8), tail);
    }
    Ok(NonNull::new_unchecked(base as *mut u8))
  }
}

/// Drops the physical pages behind a mapping while keeping the addresses valid.
pub unsafe fn decommit(ptr: NonNull<u8>, len: usize) {
  unsafe { libc::madvise(ptr.as_ptr().cast(), len, libc::MADV_DONTNEED) };
}

/// Like [`decommit`], but only in builds that return memory to the OS.
pub unsafe fn purge(ptr: NonNull<u8>, len: usize) {
  #[cfg(feature = "release-mem")]
  unsafe {
    decommit(ptr, len)
  };
  #[cfg(not(feature = "release-mem"))]
  let _ = (ptr, len);
}

/// Hands out a fresh owner id for every thread heap. `OWNER_ORPHAN` is
/// skipped, including after the counter wraps.
pub fn next_owner_id() -> u32 {
  static NEXT_OWNER: AtomicU32 = AtomicU32::new(OWNER_ORPHAN + 1);
  loop {
    let id = NEXT_OWNER.fetch_add(1, Ordering::Relaxed);
    if id != OWNER_ORPHAN {
      return id;
    }
  }
}
