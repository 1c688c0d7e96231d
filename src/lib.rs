#![allow(clippy::missing_safety_doc)]
//! Slab-and-buddy memory allocator for multi-threaded programs.
//!
//! Small objects live in pageblocks owned by one [`ThreadHeap`] each; other
//! threads release into a lock-free deferred chain the owner reclaims in
//! bulk. Pageblocks and medium objects come from per-superpage buddy
//! allocators, large objects get their own mapping.
//!
//! [`Arena`] and [`ThreadHeap`] can be used directly. [`SlabFlow`] and the
//! free functions run on a process-wide arena with one heap per thread, and
//! the `c_api` feature exports the C allocation symbols on top of them.

mod arena;
mod block;
mod buddy;
mod cache;
pub mod config;
pub mod error;
mod heap;
mod list;
mod os;
mod registry;
pub mod size_class;
mod source;
mod stats;
mod superpage;
mod sync;

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::{Cell, UnsafeCell},
  ptr::{self, NonNull, null_mut},
};
#[cfg(feature = "dynamic")]
use core::mem::ManuallyDrop;

pub use crate::{
  arena::Arena,
  block::BlockInfo,
  config::Policy,
  error::{AllocError, Result},
  heap::ThreadHeap,
  stats::Stats,
};
use crate::config::MIN_ALIGN;

static ARENA: Arena = Arena::new();

// =============================================================================
// TLS
// =============================================================================

// With `dynamic` the heap has no TLS destructor: a preloaded allocator can be
// called after the thread's TLS is torn down, so finalization only happens
// through `on_thread_exit`.
#[cfg(feature = "dynamic")]
type HeapSlot = ManuallyDrop<ThreadHeap<'static>>;
#[cfg(not(feature = "dynamic"))]
type HeapSlot = ThreadHeap<'static>;

fn new_heap() -> HeapSlot {
  #[cfg(feature = "dynamic")]
  {
    ManuallyDrop::new(ThreadHeap::new(&ARENA))
  }
  #[cfg(not(feature = "dynamic"))]
  {
    ThreadHeap::new(&ARENA)
  }
}

thread_local! {
  static HEAP: UnsafeCell<HeapSlot> = UnsafeCell::new(new_heap());
  static IN_ALLOC: Cell<bool> = const { Cell::new(false) };
}

/// Runs `f` on this thread's heap. `None` when there is no usable heap: TLS
/// is gone, or the call re-entered the allocator (e.g. from TLS setup).
fn with_heap<R>(f: impl FnOnce(&mut ThreadHeap<'static>) -> R) -> Option<R> {
  let Ok(reentered) = IN_ALLOC.try_with(|flag| flag.replace(true)) else {
    return None;
  };
  if reentered {
    return None;
  }

  let result = HEAP.try_with(|slot| f(unsafe { &mut *slot.get() })).ok();

  let _ = IN_ALLOC.try_with(|flag| flag.set(false));
  result
}

// =============================================================================
// Process-wide allocation
// =============================================================================

/// Allocates `size` bytes aligned to 16.
pub fn allocate(size: usize) -> Result<NonNull<u8>> {
  with_heap(|heap| heap.allocate(size)).unwrap_or_else(|| ARENA.allocate_detached(size))
}

/// Allocates `count * elem_size` zeroed bytes.
pub fn zero_allocate(count: usize, elem_size: usize) -> Result<NonNull<u8>> {
  with_heap(|heap| heap.zero_allocate(count, elem_size)).unwrap_or_else(|| {
    let size = count.checked_mul(elem_size).ok_or(AllocError::Overflow)?;
    let ptr = ARENA.allocate_detached(size)?;
    unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
    Ok(ptr)
  })
}

/// Allocates `size` bytes at a multiple of `align`.
pub fn aligned_allocate(align: usize, size: usize) -> Result<NonNull<u8>> {
  with_heap(|heap| heap.aligned_allocate(align, size))
    .unwrap_or_else(|| ARENA.aligned_allocate_detached(align, size))
}

/// Releases memory from any of the allocation functions. Null is a no-op.
pub unsafe fn release(ptr: *mut u8) {
  if with_heap(|heap| unsafe { heap.release(ptr) }).is_none() {
    unsafe { ARENA.release_detached(ptr) };
  }
}

/// Resizes an allocation. `resize(null, n)` allocates; `resize(ptr, 0)`
/// releases and returns `Ok(None)`.
pub unsafe fn resize(ptr: *mut u8, new_size: usize) -> Result<Option<NonNull<u8>>> {
  match with_heap(|heap| unsafe { heap.resize(ptr, new_size) }) {
    Some(result) => result,
    None => unsafe { resize_detached(ptr, new_size) },
  }
}

unsafe fn resize_detached(ptr: *mut u8, new_size: usize) -> Result<Option<NonNull<u8>>> {
  if ptr.is_null() {
    return ARENA.allocate_detached(new_size).map(Some);
  }
  if new_size == 0 {
    unsafe { ARENA.release_detached(ptr) };
    return Ok(None);
  }

  let usable = unsafe { ARENA.usable_size(ptr) };
  let fresh = ARENA.allocate_detached(new_size)?;
  unsafe {
    ptr::copy_nonoverlapping(ptr, fresh.as_ptr(), usable.min(new_size));
    ARENA.release_detached(ptr);
  }
  Ok(Some(fresh))
}

/// Bytes usable at `ptr` (at least the requested size), 0 for null.
pub unsafe fn usable_size(ptr: *const u8) -> usize {
  unsafe { ARENA.usable_size(ptr) }
}

/// Hands the calling thread's pageblocks back to the process-wide arena.
///
/// Must run once when a thread ends in `dynamic` builds; otherwise the TLS
/// destructor does it. The thread may keep allocating afterwards.
pub fn on_thread_exit() {
  let _ = with_heap(|heap| heap.finalize());
}

/// Counters of the process-wide arena.
pub fn stats() -> Stats {
  ARENA.stats()
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// `GlobalAlloc` over the process-wide arena.
///
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: slabflow::SlabFlow = slabflow::SlabFlow;
/// ```
pub struct SlabFlow;

impl SlabFlow {
  fn allocate_layout(layout: Layout) -> Result<NonNull<u8>> {
    if layout.align() <= MIN_ALIGN {
      allocate(layout.size())
    } else {
      aligned_allocate(layout.align(), layout.size())
    }
  }
}

unsafe impl GlobalAlloc for SlabFlow {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    Self::allocate_layout(layout).map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { release(ptr) };
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let result = if layout.align() <= MIN_ALIGN {
      zero_allocate(1, layout.size())
    } else {
      aligned_allocate(layout.align(), layout.size()).inspect(|ptr| unsafe {
        ptr::write_bytes(ptr.as_ptr(), 0, layout.size());
      })
    };
    result.map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() <= MIN_ALIGN {
      return match unsafe { resize(ptr, new_size) } {
        Ok(Some(fresh)) => fresh.as_ptr(),
        _ => null_mut(),
      };
    }

    // Over-aligned: a move has to keep the alignment.
    if new_size <= unsafe { usable_size(ptr) } {
      return ptr;
    }
    match aligned_allocate(layout.align(), new_size) {
      Ok(fresh) => unsafe {
        ptr::copy_nonoverlapping(ptr, fresh.as_ptr(), layout.size().min(new_size));
        release(ptr);
        fresh.as_ptr()
      },
      Err(_) => null_mut(),
    }
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
mod c_api {
  use core::{
    ffi::c_int,
    ptr::{NonNull, null_mut},
  };

  use crate::{AllocError, Result, config::PAGE_SIZE};

  fn into_raw(result: Result<NonNull<u8>>) -> *mut u8 {
    match result {
      Ok(ptr) => ptr.as_ptr(),
      Err(err) => {
        unsafe { *libc::__errno_location() = err.errno() };
        null_mut()
      }
    }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
    into_raw(crate::allocate(size))
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn free(ptr: *mut u8) {
    unsafe { crate::release(ptr) };
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    into_raw(crate::zero_allocate(nmemb, size))
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    match unsafe { crate::resize(ptr, size) } {
      Ok(Some(fresh)) => fresh.as_ptr(),
      Ok(None) => null_mut(),
      Err(err) => into_raw(Err(err)),
    }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut u8,
    alignment: usize,
    size: usize,
  ) -> c_int {
    if alignment % size_of::<*mut u8>() != 0 {
      return AllocError::BadAlignment(alignment).errno();
    }
    match crate::aligned_allocate(alignment, size) {
      Ok(ptr) => {
        unsafe { *memptr = ptr.as_ptr() };
        0
      }
      Err(err) => err.errno(),
    }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut u8 {
    into_raw(crate::aligned_allocate(alignment, size))
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
    into_raw(crate::aligned_allocate(alignment, size))
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn valloc(size: usize) -> *mut u8 {
    into_raw(crate::aligned_allocate(PAGE_SIZE, size))
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
    unsafe { crate::usable_size(ptr) }
  }

  /// Thread-exit hook for runtimes that intercept thread teardown.
  #[unsafe(no_mangle)]
  pub extern "C" fn slabflow_thread_exit() {
    crate::on_thread_exit();
  }
}
