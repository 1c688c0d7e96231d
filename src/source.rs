//! Where superpages and large objects get their address space.

use core::ptr::NonNull;
#[cfg(any(feature = "meta-flat", test))]
use core::{
  cell::UnsafeCell,
  sync::atomic::{AtomicUsize, Ordering},
};

use crate::{error::Result, os};
#[cfg(any(feature = "meta-flat", test))]
use crate::{
  config::{FLAT_WINDOW_SIZE, SUPERPAGE_SIZE, align_down, align_up},
  error::AllocError,
  sync::SpinLock,
};

/// Supplier of page-granular mappings.
pub trait PageSource: Sync {
  /// Maps `len` bytes such that `base + lead` is a multiple of `align`.
  /// `len` and `lead` are page multiples, `align` a power of two.
  fn map(&self, len: usize, align: usize, lead: usize) -> Result<NonNull<u8>>;

  /// # Safety
  /// `ptr`/`len` must be exactly a region returned by [`PageSource::map`].
  unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize);

  /// Drops physical backing, keeping the range mapped.
  ///
  /// # Safety
  /// The range must lie inside a live mapping of this source.
  unsafe fn purge(&self, ptr: NonNull<u8>, len: usize) {
    unsafe { os::purge(ptr, len) }
  }
}

/// Fresh anonymous mappings straight from the OS.
pub struct OsPages;

impl PageSource for OsPages {
  fn map(&self, len: usize, align: usize, lead: usize) -> Result<NonNull<u8>> {
    os::map_aligned(len, align, lead)
  }

  unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) {
    unsafe { os::unmap(ptr, len) }
  }
}

// =============================================================================
// Reserved window (flat page table builds)
// =============================================================================

#[cfg(any(feature = "meta-flat", test))]
const WINDOW_SLOTS: usize = FLAT_WINDOW_SIZE / SUPERPAGE_SIZE;
#[cfg(any(feature = "meta-flat", test))]
const WINDOW_WORDS: usize = WINDOW_SLOTS.div_ceil(64);

/// A contiguous address range reserved once and carved in superpage slots.
///
/// A page-indexed table only has to cover this range.
#[cfg(any(feature = "meta-flat", test))]
pub struct Window {
  lock: SpinLock,
  /// Start of the reservation, 0 until first use.
  base: AtomicUsize,
  used: UnsafeCell<[u64; WINDOW_WORDS]>,
}

#[cfg(any(feature = "meta-flat", test))]
unsafe impl Sync for Window {}

#[cfg(any(feature = "meta-flat", test))]
static WINDOW: Window = Window::new();

/// The process-wide window shared by [`WindowPages`] and the flat table.
#[cfg(any(feature = "meta-flat", test))]
pub fn window() -> &'static Window {
  &WINDOW
}

#[cfg(any(feature = "meta-flat", test))]
impl Window {
  pub const fn new() -> Self {
    Self {
      lock: SpinLock::new(),
      base: AtomicUsize::new(0),
      used: UnsafeCell::new([0; WINDOW_WORDS]),
    }
  }

  #[inline]
  pub fn base(&self) -> Option<usize> {
    match self.base.load(Ordering::Acquire) {
      0 => None,
      base => Some(base),
    }
  }

  /// Byte offset of `addr` from the window start, if it lies inside.
  #[inline]
  pub fn offset_of(&self, addr: usize) -> Option<usize> {
    let base = self.base()?;
    let offset = addr.checked_sub(base)?;
    (offset < FLAT_WINDOW_SIZE).then_some(offset)
  }

  fn take(&self, len: usize, align: usize, lead: usize) -> Result<NonNull<u8>> {
    // Slots are superpage aligned, so larger alignments cannot be placed.
    if align > SUPERPAGE_SIZE {
      return Err(AllocError::BadAlignment(align));
    }
    let offset = align_up(lead, align) - lead;
    let span = offset.checked_add(len).ok_or(AllocError::Overflow)?;
    let count = span.div_ceil(SUPERPAGE_SIZE);
    if count > WINDOW_SLOTS {
      return Err(AllocError::Exhausted);
    }

    let _guard = self.lock.lock();
    let base = match self.base() {
      Some(base) => base,
      None => {
        let base = os::map_aligned(FLAT_WINDOW_SIZE, SUPERPAGE_SIZE, 0)?.as_ptr() as usize;
        log::debug!("reserved {FLAT_WINDOW_SIZE} byte window at {base:#x}");
        self.base.store(base, Ordering::Release);
        base
      }
    };

    let used = unsafe { &mut *self.used.get() };
    let first = find_run(used, count).ok_or_else(|| {
      log::warn!("window has no run of {count} free slots");
      AllocError::Exhausted
    })?;
    for slot in first..first + count {
      used[slot / 64] |= 1 << (slot % 64);
    }

    let addr = base + first * SUPERPAGE_SIZE + offset;
    Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) })
  }

  unsafe fn give_back(&self, ptr: NonNull<u8>, len: usize) {
    let Some(offset) = self.offset_of(ptr.as_ptr() as usize) else {
      return;
    };
    let start = align_down(offset, SUPERPAGE_SIZE);
    let count = (offset + len - start).div_ceil(SUPERPAGE_SIZE);
    let first = start / SUPERPAGE_SIZE;

    let _guard = self.lock.lock();
    unsafe {
      let region = NonNull::new_unchecked((ptr.as_ptr() as usize - (offset - start)) as *mut u8);
      os::decommit(region, count * SUPERPAGE_SIZE);
    }
    let used = unsafe { &mut *self.used.get() };
    for slot in first..first + count {
      used[slot / 64] &= !(1 << (slot % 64));
    }
  }
}

#[cfg(any(feature = "meta-flat", test))]
impl Drop for Window {
  fn drop(&mut self) {
    if let Some(base) = self.base() {
      unsafe { os::unmap(NonNull::new_unchecked(base as *mut u8), FLAT_WINDOW_SIZE) };
    }
  }
}

/// First-fit search for `count` consecutive clear bits.
#[cfg(any(feature = "meta-flat", test))]
fn find_run(used: &[u64; WINDOW_WORDS], count: usize) -> Option<usize> {
  let mut run = 0;
  for slot in 0..WINDOW_SLOTS {
    if used[slot / 64] & (1 << (slot % 64)) == 0 {
      run += 1;
      if run == count {
        return Some(slot + 1 - count);
      }
    } else {
      run = 0;
    }
  }
  None
}

/// Page source drawing from the process-wide [`Window`].
#[cfg(any(feature = "meta-flat", test))]
pub struct WindowPages;

#[cfg(any(feature = "meta-flat", test))]
impl PageSource for WindowPages {
  fn map(&self, len: usize, align: usize, lead: usize) -> Result<NonNull<u8>> {
    window().take(len, align, lead)
  }

  unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) {
    unsafe { window().give_back(ptr, len) }
  }
}
