//! Per-thread allocation context.
//!
//! A `ThreadHeap` owns the pageblocks on its lists and is the only one that
//! touches their slot state. Releases from other threads reach a block
//! through its deferred chain or, when the block is orphaned, by adopting it.

use core::ptr::{self, NonNull};

use crate::{
  arena::{Arena, HEADER},
  block::{BlockInfo, BlockLinks, BlockRef},
  config::{MAX_SMALL_OBJECT, MIN_ALIGN, PAGEBLOCK_SIZES, align_up},
  error::{AllocError, Result},
  list::List,
  os::{self, OWNER_ORPHAN},
  registry::Record,
  size_class::{CLASSES_COUNT, class_to_size, pageblock_order, pageblock_size_index, size_to_class},
  stats::Counters,
};

pub struct ThreadHeap<'a> {
  arena: &'a Arena,
  owner: u32,
  /// Blocks in use per class. The head is the one allocations come from.
  lists: [List<BlockRef>; CLASSES_COUNT],
  /// Fully free blocks kept back per pageblock size.
  inactive: [List<BlockRef>; PAGEBLOCK_SIZES],
}

impl<'a> ThreadHeap<'a> {
  pub fn new(arena: &'a Arena) -> Self {
    Self {
      arena,
      owner: os::next_owner_id(),
      lists: [const { List::new() }; CLASSES_COUNT],
      inactive: [const { List::new() }; PAGEBLOCK_SIZES],
    }
  }

  /// Owner id stamped on this heap's pageblocks.
  #[inline]
  pub fn owner(&self) -> u32 {
    self.owner
  }

  // ===========================================================================
  // Allocation
  // ===========================================================================

  /// Allocates `size` bytes, 16-byte aligned. Zero is served as one byte.
  pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
    let size = size.max(1);
    let need = size.checked_add(HEADER).ok_or(AllocError::Overflow)?;
    if need > MAX_SMALL_OBJECT {
      return self.arena.allocate_paged(size);
    }

    let (block, slot) = self.allocate_slot(size_to_class(need))?;
    let object = unsafe { slot.add(HEADER) };
    unsafe { self.arena.tag(object, Record::Small(block)) };
    Ok(object)
  }

  /// Allocates `count * elem_size` zeroed bytes.
  pub fn zero_allocate(&mut self, count: usize, elem_size: usize) -> Result<NonNull<u8>> {
    let size = count.checked_mul(elem_size).ok_or(AllocError::Overflow)?;
    let ptr = self.allocate(size)?;
    unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
    Ok(ptr)
  }

  /// Allocates `size` bytes at a multiple of `align`, a power of two.
  pub fn aligned_allocate(&mut self, align: usize, size: usize) -> Result<NonNull<u8>> {
    if !align.is_power_of_two() {
      return Err(AllocError::BadAlignment(align));
    }
    if align <= MIN_ALIGN {
      return self.allocate(size);
    }

    let size = size.max(1);
    let need = size
      .checked_add(align)
      .and_then(|bytes| bytes.checked_add(HEADER))
      .ok_or(AllocError::Overflow)?;
    if need > MAX_SMALL_OBJECT {
      return self.arena.allocate_large(size, align);
    }

    // Oversized slot, aligned object somewhere inside it.
    let (block, slot) = self.allocate_slot(size_to_class(need))?;
    let object = align_up(slot.as_ptr() as usize + HEADER, align);
    let object = unsafe { NonNull::new_unchecked(object as *mut u8) };
    unsafe { self.arena.tag(object, Record::Small(block)) };
    Ok(object)
  }

  fn allocate_slot(&mut self, class: usize) -> Result<(BlockRef, NonNull<u8>)> {
    let block = match self.lists[class].head() {
      Some(block) if !block.is_saturated() => block,
      Some(block) if unsafe { block.reclaim() } > 0 => block,
      Some(_) => {
        self.lists[class].rotate(&mut BlockLinks);
        self.fresh_block(class)?
      }
      None => self.fresh_block(class)?,
    };

    let slot = unsafe { block.reserve() }.ok_or(AllocError::OutOfMemory {
      bytes: class_to_size(class),
    })?;
    if block.is_saturated() {
      self.lists[class].rotate(&mut BlockLinks);
    }
    Ok((block, slot))
  }

  /// Finds a block with free slots and puts it at the head of the class list:
  /// own inactive blocks first, then the global partial and free caches, then
  /// new pages.
  fn fresh_block(&mut self, class: usize) -> Result<BlockRef> {
    let size_index = pageblock_size_index(pageblock_order(class));
    let caches = &self.arena.caches;

    let block = if let Some(block) = self.inactive[size_index].pop_front(&mut BlockLinks) {
      if block.class() != class {
        unsafe { block.format(class) };
      }
      block
    } else if let Some(block) = caches.partial[class].pop() {
      block.claim(self.owner);
      if block.is_saturated() {
        unsafe { block.reclaim() };
      }
      block
    } else if let Some(block) = caches.free[size_index].pop() {
      block.claim(self.owner);
      if block.class() != class {
        unsafe { block.format(class) };
      }
      block
    } else {
      self.arena.new_block(class, self.owner)?
    };

    self.lists[class].push_front(&mut BlockLinks, block);
    Ok(block)
  }

  // ===========================================================================
  // Release
  // ===========================================================================

  /// Releases an object from any thread's heap (or a detached allocation).
  /// Null and unknown pointers are ignored.
  ///
  /// # Safety
  /// `ptr` is null or a live object of this heap's arena, released once.
  pub unsafe fn release(&mut self, ptr: *mut u8) {
    let Some(ptr) = NonNull::new(ptr) else {
      return;
    };
    match unsafe { self.arena.lookup(ptr.as_ptr()) } {
      Some(Record::Small(block)) => unsafe { self.release_small(block, ptr) },
      Some(record) => unsafe { self.arena.release_paged(ptr, record) },
      None => {}
    }
  }

  unsafe fn release_small(&mut self, block: BlockRef, ptr: NonNull<u8>) {
    let index = block.slot_index(ptr.as_ptr() as usize - HEADER);
    loop {
      let owner = block.owner();
      if owner == self.owner {
        unsafe { self.local_release(block, index) };
        return;
      }

      if owner == OWNER_ORPHAN && block.try_adopt(self.owner) {
        Counters::bump(&self.arena.counters.adoptions);
        unsafe { block.reclaim() };
        self.lists[block.class()].push_front(&mut BlockLinks, block);
        unsafe { self.local_release(block, index) };
        return;
      }

      // Owned elsewhere, or another thread adopted it first.
      if unsafe { block.push_deferred(index) }.is_ok() {
        Counters::bump(&self.arena.counters.deferred_releases);
        return;
      }
    }
  }

  unsafe fn local_release(&mut self, block: BlockRef, index: u16) {
    let free = unsafe { block.local_push(index) };
    let class = block.class();
    if free == block.slots() {
      self.lists[class].remove(&mut BlockLinks, block);
      unsafe { self.retire_free(block) };
    } else if free == 1 {
      self.lists[class].move_to_front(&mut BlockLinks, block);
    }
  }

  /// Keeps a fully free block back for reuse, or hands it to the arena.
  unsafe fn retire_free(&mut self, block: BlockRef) {
    let inactive = &mut self.inactive[block.size_index()];
    if inactive.len() < self.arena.policy().max_private_inactive {
      inactive.push_front(&mut BlockLinks, block);
    } else {
      unsafe { self.arena.release_free_block(block) };
    }
  }

  // ===========================================================================
  // Resize & introspection
  // ===========================================================================

  /// Resizes an allocation, moving it when it no longer fits well.
  /// Returns `None` when `ptr` was released because `new_size` is zero.
  ///
  /// # Safety
  /// `ptr` is null or a live object of this heap's arena.
  pub unsafe fn resize(&mut self, ptr: *mut u8, new_size: usize) -> Result<Option<NonNull<u8>>> {
    let Some(old) = NonNull::new(ptr) else {
      return self.allocate(new_size).map(Some);
    };
    if new_size == 0 {
      unsafe { self.release(ptr) };
      return Ok(None);
    }

    let usable = unsafe { self.usable_size(ptr) };
    if new_size <= usable && new_size > usable / 2 {
      return Ok(Some(old));
    }

    let fresh = self.allocate(new_size)?;
    unsafe {
      ptr::copy_nonoverlapping(ptr, fresh.as_ptr(), usable.min(new_size));
      self.release(ptr);
    }
    Ok(Some(fresh))
  }

  /// Bytes usable at `ptr`, 0 if unknown.
  ///
  /// # Safety
  /// `ptr` is null or a live object of this heap's arena.
  #[inline]
  pub unsafe fn usable_size(&self, ptr: *const u8) -> usize {
    unsafe { self.arena.usable_size(ptr) }
  }

  /// State of the pageblock holding a small object.
  ///
  /// # Safety
  /// `ptr` is a live object, and nothing allocates from its block meanwhile.
  pub unsafe fn inspect(&self, ptr: *const u8) -> Option<BlockInfo> {
    match unsafe { self.arena.lookup(ptr) }? {
      Record::Small(block) => Some(unsafe { block.info() }),
      _ => None,
    }
  }

  // ===========================================================================
  // Finalization
  // ===========================================================================

  /// Hands every block back: free ones to the free cache, partial ones to the
  /// partial cache, full ones become orphans. The heap stays usable and
  /// starts over under a new owner id.
  pub fn finalize(&mut self) {
    let owner = self.owner;
    let arena = self.arena;

    for class in 0..CLASSES_COUNT {
      while let Some(block) = self.lists[class].pop_front(&mut BlockLinks) {
        unsafe { block.reclaim() };
        if block.is_free() {
          unsafe { arena.release_free_block(block) };
        } else if !block.is_saturated() {
          unsafe { arena.park_partial(block, owner) };
        } else if block.try_orphan_full(owner) {
          Counters::bump(&arena.counters.orphaned);
        } else {
          // A release slipped in between reclaim and orphaning.
          unsafe { arena.park_partial(block, owner) };
        }
      }
    }

    for inactive in &mut self.inactive {
      while let Some(block) = inactive.pop_front(&mut BlockLinks) {
        unsafe { arena.release_free_block(block) };
      }
    }

    // Blocks parked above still carry the old id.
    self.owner = os::next_owner_id();
  }
}

impl Drop for ThreadHeap<'_> {
  fn drop(&mut self) {
    self.finalize();
  }
}
