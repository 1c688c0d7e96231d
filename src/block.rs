//! PageBlocks: slabs of equal-size slots carved from one buddy chunk.
//!
//! The header sits at the start of the chunk and slots follow it. Free slots
//! are chained through their first two bytes by 1-based slot index, so 0
//! always means "end of chain".
//!
//! Only the owning thread touches the first cache line. Other threads only
//! see `state`, which packs the owner id with the deferred chain
//! (`owner << 32 | head << 16 | count`) and only ever changes by CAS.

use core::{
  mem::offset_of,
  ptr::{self, NonNull},
  sync::atomic::{AtomicPtr, AtomicU64, Ordering},
};

use crate::{
  config::{PAGE_SIZE, PAGEBLOCK_HEADER},
  list::{Link, Links},
  os::OWNER_ORPHAN,
  size_class::{class_to_size, objects_per_pageblock, pageblock_order, pageblock_size_index},
  superpage::SuperpageRef,
};

/// Header at offset 0 of each pageblock.
#[repr(C, align(128))]
pub struct PageBlock {
  // === Cache line 0: owner-thread fields ===
  /// Position in a heap's active or inactive list.
  link: Link<BlockRef>,
  /// Next block on a global cache stack.
  cache_next: AtomicPtr<PageBlock>,
  superpage: SuperpageRef,
  object_size: u32,
  slots: u16,
  /// Head of the local free list.
  freed: u16,
  /// Next never-used slot, 0 once every slot was handed out once.
  unallocated: u16,
  /// Slots free on the owner's side (local list plus never used).
  free_count: u16,
  class: u8,
  /// Buddy order of the chunk.
  order: u8,
  _pad: [u8; 18],

  // === Cache line 1: shared with releasing threads ===
  state: AtomicU64,
}

const _: () = assert!(offset_of!(PageBlock, state) == 64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct State {
  owner: u32,
  head: u16,
  count: u16,
}

impl State {
  #[inline]
  const fn pack(self) -> u64 {
    (self.owner as u64) << 32 | (self.head as u64) << 16 | self.count as u64
  }

  #[inline]
  const fn unpack(word: u64) -> Self {
    Self {
      owner: (word >> 32) as u32,
      head: (word >> 16) as u16,
      count: word as u16,
    }
  }

  #[inline]
  const fn with_owner(self, owner: u32) -> Self {
    Self {
      owner,
      head: self.head,
      count: self.count,
    }
  }
}

/// The block lost its owner while a deferred push was in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Orphaned;

/// Snapshot of a pageblock for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
  /// Total slots in the block.
  pub slots: usize,
  /// Slots the owner can hand out without reclaiming.
  pub free: usize,
  /// Slots released by other threads and not yet reclaimed.
  pub pending: usize,
  /// Owner id, 0 when orphaned.
  pub owner: u32,
}

#[inline]
unsafe fn read_next(slot: NonNull<u8>) -> u16 {
  unsafe { slot.cast::<u16>().read() }
}

#[inline]
unsafe fn write_next(slot: NonNull<u8>, next: u16) {
  unsafe { slot.cast::<u16>().write(next) }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRef(NonNull<PageBlock>);

impl BlockRef {
  /// Writes a fresh header at `start`, owned by `owner`.
  ///
  /// # Safety
  /// `start` must be the beginning of an unused chunk of `PAGE_SIZE << order`
  /// bytes inside `superpage`.
  pub unsafe fn init(
    start: NonNull<u8>,
    superpage: SuperpageRef,
    class: usize,
    order: usize,
    owner: u32,
  ) -> Self {
    let header = start.cast::<PageBlock>();
    unsafe {
      header.as_ptr().write(PageBlock {
        link: Link::UNLINKED,
        cache_next: AtomicPtr::new(ptr::null_mut()),
        superpage,
        object_size: 0,
        slots: 0,
        freed: 0,
        unallocated: 0,
        free_count: 0,
        class: 0,
        order: order as u8,
        _pad: [0; 18],
        state: AtomicU64::new(
          State {
            owner,
            head: 0,
            count: 0,
          }
          .pack(),
        ),
      });
    }
    let block = Self(header);
    unsafe { block.format(class) };
    block
  }

  /// Lays the block out for `class`, forgetting all slot state.
  ///
  /// # Safety
  /// Caller owns the block and no slot is live or pending.
  pub unsafe fn format(self, class: usize) {
    let b = self.0.as_ptr();
    debug_assert_eq!(unsafe { (*b).order } as usize, pageblock_order(class));
    let slots = objects_per_pageblock(class) as u16;
    unsafe {
      (*b).class = class as u8;
      (*b).object_size = class_to_size(class) as u32;
      (*b).slots = slots;
      (*b).freed = 0;
      (*b).unallocated = if slots > 0 { 1 } else { 0 };
      (*b).free_count = slots;
    }
  }

  #[inline]
  fn state(&self) -> &AtomicU64 {
    unsafe { &(*self.0.as_ptr()).state }
  }

  #[inline]
  pub fn start(self) -> NonNull<u8> {
    self.0.cast()
  }

  #[inline]
  pub(crate) fn addr(self) -> usize {
    self.0.as_ptr() as usize
  }

  /// # Safety
  /// `addr` must be the start of an initialized pageblock.
  #[inline]
  pub(crate) unsafe fn from_addr(addr: usize) -> Self {
    Self(unsafe { NonNull::new_unchecked(addr as *mut PageBlock) })
  }

  #[inline]
  pub fn class(self) -> usize {
    unsafe { (*self.0.as_ptr()).class as usize }
  }

  #[inline]
  pub fn order(self) -> usize {
    unsafe { (*self.0.as_ptr()).order as usize }
  }

  /// Index of this block's size among the pageblock sizes.
  #[inline]
  pub fn size_index(self) -> usize {
    pageblock_size_index(self.order())
  }

  #[inline]
  pub fn pages(self) -> usize {
    1 << self.order()
  }

  #[inline]
  pub fn len(self) -> usize {
    PAGE_SIZE << self.order()
  }

  #[inline]
  pub fn superpage(self) -> SuperpageRef {
    unsafe { (*self.0.as_ptr()).superpage }
  }

  #[inline]
  pub fn object_size(self) -> usize {
    unsafe { (*self.0.as_ptr()).object_size as usize }
  }

  #[inline]
  pub fn slots(self) -> usize {
    unsafe { (*self.0.as_ptr()).slots as usize }
  }

  #[inline]
  pub fn free_count(self) -> usize {
    unsafe { (*self.0.as_ptr()).free_count as usize }
  }

  /// No slot available without reclaiming.
  #[inline]
  pub fn is_saturated(self) -> bool {
    self.free_count() == 0
  }

  /// Every slot free on the owner's side.
  #[inline]
  pub fn is_free(self) -> bool {
    self.free_count() == self.slots()
  }

  #[inline]
  fn pool(self) -> usize {
    self.addr() + PAGEBLOCK_HEADER
  }

  #[inline]
  pub fn slot_ptr(self, index: u16) -> NonNull<u8> {
    let addr = self.pool() + index as usize * self.object_size();
    unsafe { NonNull::new_unchecked(addr as *mut u8) }
  }

  /// Slot holding `addr`, which may point anywhere inside the slot.
  #[inline]
  pub fn slot_index(self, addr: usize) -> u16 {
    debug_assert!(addr >= self.pool() && addr < self.addr() + self.len());
    ((addr - self.pool()) / self.object_size()) as u16
  }

  /// One past the last byte of the slot holding `addr`.
  #[inline]
  pub fn slot_end(self, addr: usize) -> usize {
    self.slot_ptr(self.slot_index(addr)).as_ptr() as usize + self.object_size()
  }

  // ===========================================================================
  // Owner-side slot management
  // ===========================================================================

  /// Hands out a slot: most recently freed first, then the next unused one.
  ///
  /// # Safety
  /// Caller owns the block.
  pub unsafe fn reserve(self) -> Option<NonNull<u8>> {
    let b = self.0.as_ptr();
    unsafe {
      let index = if (*b).freed != 0 {
        let index = (*b).freed - 1;
        (*b).freed = read_next(self.slot_ptr(index));
        index
      } else if (*b).unallocated != 0 {
        let index = (*b).unallocated - 1;
        (*b).unallocated = if index + 1 == (*b).slots { 0 } else { index + 2 };
        index
      } else {
        return None;
      };
      (*b).free_count -= 1;
      Some(self.slot_ptr(index))
    }
  }

  /// Puts a slot on the local free list. Returns the new free count.
  ///
  /// # Safety
  /// Caller owns the block and slot `index` is live.
  pub unsafe fn local_push(self, index: u16) -> usize {
    let b = self.0.as_ptr();
    unsafe {
      write_next(self.slot_ptr(index), (*b).freed);
      (*b).freed = index + 1;
      (*b).free_count += 1;
      (*b).free_count as usize
    }
  }

  /// Moves the deferred chain into the local free list. Returns how many
  /// slots came back.
  ///
  /// # Safety
  /// Caller owns the block.
  pub unsafe fn reclaim(self) -> usize {
    let state = self.state();
    let mut current = state.load(Ordering::Relaxed);
    let taken = loop {
      let seen = State::unpack(current);
      if seen.count == 0 {
        return 0;
      }
      let emptied = State {
        owner: seen.owner,
        head: 0,
        count: 0,
      };
      match state.compare_exchange_weak(
        current,
        emptied.pack(),
        Ordering::Acquire,
        Ordering::Relaxed,
      ) {
        Ok(_) => break seen,
        Err(actual) => current = actual,
      }
    };

    let b = self.0.as_ptr();
    unsafe {
      let mut tail = taken.head;
      for _ in 1..taken.count {
        tail = read_next(self.slot_ptr(tail - 1));
      }
      write_next(self.slot_ptr(tail - 1), (*b).freed);
      (*b).freed = taken.head;
      (*b).free_count += taken.count;
    }
    taken.count as usize
  }

  // ===========================================================================
  // Shared state transitions
  // ===========================================================================

  #[inline]
  pub fn owner(self) -> u32 {
    State::unpack(self.state().load(Ordering::Acquire)).owner
  }

  /// Slots waiting on the deferred chain.
  #[cfg(test)]
  pub fn pending(self) -> usize {
    State::unpack(self.state().load(Ordering::Acquire)).count as usize
  }

  /// Releases slot `index` on behalf of a thread that does not own the block.
  ///
  /// Fails if the block is (or becomes) orphaned, in which case the caller
  /// should try to adopt it instead.
  ///
  /// # Safety
  /// Slot `index` is live and released exactly once.
  pub unsafe fn push_deferred(self, index: u16) -> Result<(), Orphaned> {
    unsafe { self.push_chain(index, false) }
  }

  /// Like [`BlockRef::push_deferred`], but also pushes onto an orphan.
  /// The slot comes back when someone adopts the block.
  ///
  /// # Safety
  /// Same as [`BlockRef::push_deferred`].
  pub unsafe fn push_detached(self, index: u16) {
    let _ = unsafe { self.push_chain(index, true) };
  }

  unsafe fn push_chain(self, index: u16, onto_orphan: bool) -> Result<(), Orphaned> {
    let slot = self.slot_ptr(index);
    let state = self.state();
    let mut current = state.load(Ordering::Relaxed);
    loop {
      let seen = State::unpack(current);
      if seen.owner == OWNER_ORPHAN && !onto_orphan {
        return Err(Orphaned);
      }
      unsafe { write_next(slot, seen.head) };
      let pushed = State {
        owner: seen.owner,
        head: index + 1,
        count: seen.count + 1,
      };
      match state.compare_exchange_weak(
        current,
        pushed.pack(),
        Ordering::Release,
        Ordering::Relaxed,
      ) {
        Ok(_) => return Ok(()),
        Err(actual) => current = actual,
      }
    }
  }

  /// Takes ownership of an orphaned block. At most one contender wins.
  pub fn try_adopt(self, owner: u32) -> bool {
    let state = self.state();
    let mut current = state.load(Ordering::Relaxed);
    loop {
      let seen = State::unpack(current);
      if seen.owner != OWNER_ORPHAN {
        return false;
      }
      match state.compare_exchange_weak(
        current,
        seen.with_owner(owner).pack(),
        Ordering::AcqRel,
        Ordering::Relaxed,
      ) {
        Ok(_) => return true,
        Err(actual) => current = actual,
      }
    }
  }

  /// Takes ownership of a block popped from a global cache, keeping any
  /// pending chain.
  pub fn claim(self, owner: u32) {
    let state = self.state();
    let mut current = state.load(Ordering::Relaxed);
    while let Err(actual) = state.compare_exchange_weak(
      current,
      State::unpack(current).with_owner(owner).pack(),
      Ordering::AcqRel,
      Ordering::Relaxed,
    ) {
      current = actual;
    }
  }

  /// Orphans a block with no pending releases. Fails if one slipped in.
  pub fn try_orphan_full(self, owner: u32) -> bool {
    let owned = State {
      owner,
      head: 0,
      count: 0,
    };
    let orphan = owned.with_owner(OWNER_ORPHAN);
    self
      .state()
      .compare_exchange(owned.pack(), orphan.pack(), Ordering::Release, Ordering::Relaxed)
      .is_ok()
  }

  /// Gives up ownership, leaving the deferred chain in place. Returns the
  /// chain length at the moment ownership went away.
  pub fn disown(self) -> usize {
    let state = self.state();
    let mut current = state.load(Ordering::Relaxed);
    loop {
      let seen = State::unpack(current);
      match state.compare_exchange_weak(
        current,
        seen.with_owner(OWNER_ORPHAN).pack(),
        Ordering::Release,
        Ordering::Relaxed,
      ) {
        Ok(_) => return seen.count as usize,
        Err(actual) => current = actual,
      }
    }
  }

  /// # Safety
  /// Owner-side counters are read without synchronization; only meaningful
  /// while no thread allocates from the block.
  pub unsafe fn info(self) -> BlockInfo {
    let state = State::unpack(self.state().load(Ordering::Acquire));
    BlockInfo {
      slots: self.slots(),
      free: self.free_count(),
      pending: state.count as usize,
      owner: state.owner,
    }
  }

  // ===========================================================================
  // Global cache link
  // ===========================================================================

  #[inline]
  pub(crate) fn next_cached(self) -> *mut PageBlock {
    unsafe { (*self.0.as_ptr()).cache_next.load(Ordering::Relaxed) }
  }

  #[inline]
  pub(crate) fn set_next_cached(self, next: *mut PageBlock) {
    unsafe { (*self.0.as_ptr()).cache_next.store(next, Ordering::Relaxed) }
  }
}

/// Links of blocks live in their headers.
pub struct BlockLinks;

impl Links<BlockRef> for BlockLinks {
  #[inline]
  fn link(&self, id: BlockRef) -> &Link<BlockRef> {
    unsafe { &(*id.0.as_ptr()).link }
  }

  #[inline]
  fn link_mut(&mut self, id: BlockRef) -> &mut Link<BlockRef> {
    unsafe { &mut (*id.0.as_ptr()).link }
  }
}

#[cfg(test)]
mod tests {
  use std::{
    collections::HashSet,
    sync::{Arc, Barrier},
    thread,
  };

  use super::*;
  use crate::{
    os,
    size_class::{pageblock_size, size_to_class},
  };

  const OWNER: u32 = 41;

  fn scratch_block(size: usize) -> BlockRef {
    let class = size_to_class(size);
    let len = pageblock_size(class);
    let mem = os::map_aligned(len, len, 0).unwrap();
    // Never dereferenced by block operations.
    let superpage = unsafe { SuperpageRef::from_addr(PAGE_SIZE) };
    unsafe { BlockRef::init(mem, superpage, class, pageblock_order(class), OWNER) }
  }

  fn release_scratch(block: BlockRef) {
    unsafe { os::unmap(block.start(), block.len()) };
  }

  #[test]
  fn reserve_hands_out_every_slot_once() {
    let block = scratch_block(48);
    let slots = block.slots();
    assert_eq!(slots, (block.len() - PAGEBLOCK_HEADER) / 48);

    let mut seen = HashSet::new();
    while let Some(slot) = unsafe { block.reserve() } {
      let addr = slot.as_ptr() as usize;
      assert!(addr >= block.addr() + PAGEBLOCK_HEADER);
      assert!(addr + 48 <= block.addr() + block.len());
      assert_eq!(addr % 16, 0);
      assert!(seen.insert(addr));
    }
    assert_eq!(seen.len(), slots);
    assert!(block.is_saturated());
    release_scratch(block);
  }

  #[test]
  fn local_free_list_is_lifo() {
    let block = scratch_block(64);
    let a = unsafe { block.reserve() }.unwrap();
    let b = unsafe { block.reserve() }.unwrap();
    let c = unsafe { block.reserve() }.unwrap();
    let free = block.free_count();

    unsafe {
      block.local_push(block.slot_index(b.as_ptr() as usize));
      block.local_push(block.slot_index(a.as_ptr() as usize));
    }
    assert_eq!(block.free_count(), free + 2);
    assert_eq!(unsafe { block.reserve() }, Some(a));
    assert_eq!(unsafe { block.reserve() }, Some(b));
    assert_ne!(unsafe { block.reserve() }, Some(c));
    release_scratch(block);
  }

  #[test]
  fn interior_addresses_map_to_their_slot() {
    let block = scratch_block(96);
    let slot = unsafe { block.reserve() }.unwrap();
    let addr = slot.as_ptr() as usize;
    let index = block.slot_index(addr);
    assert_eq!(block.slot_index(addr + 95), index);
    assert_eq!(block.slot_end(addr + 40), addr + 96);
    release_scratch(block);
  }

  #[test]
  fn deferred_chain_is_reclaimed_by_owner() {
    let block = scratch_block(32);
    let slots: Vec<_> = (0..4).map(|_| unsafe { block.reserve() }.unwrap()).collect();
    let free = block.free_count();

    for slot in &slots[1..3] {
      let index = block.slot_index(slot.as_ptr() as usize);
      assert_eq!(unsafe { block.push_deferred(index) }, Ok(()));
    }
    assert_eq!(block.pending(), 2);
    assert_eq!(block.owner(), OWNER);

    assert_eq!(unsafe { block.reclaim() }, 2);
    assert_eq!(block.pending(), 0);
    assert_eq!(block.free_count(), free + 2);
    assert_eq!(unsafe { block.reclaim() }, 0);

    let again: HashSet<_> = (0..2).map(|_| unsafe { block.reserve() }.unwrap()).collect();
    let expected: HashSet<_> = slots[1..3].iter().copied().collect();
    assert_eq!(again, expected);
    release_scratch(block);
  }

  #[test]
  fn orphaned_blocks_reject_deferred_pushes() {
    let block = scratch_block(16);
    let slot = unsafe { block.reserve() }.unwrap();
    let index = block.slot_index(slot.as_ptr() as usize);

    // Not full: a pending chain survives disowning.
    unsafe { block.push_deferred(index) }.unwrap();
    assert!(!block.try_orphan_full(OWNER));
    assert_eq!(block.disown(), 1);
    assert_eq!(block.owner(), OWNER_ORPHAN);

    let other = unsafe { block.reserve() };
    assert!(other.is_some());
    let other_index = block.slot_index(other.unwrap().as_ptr() as usize);
    assert_eq!(unsafe { block.push_deferred(other_index) }, Err(Orphaned));

    unsafe { block.push_detached(other_index) };
    assert_eq!(block.pending(), 2);
    assert!(block.try_adopt(7));
    assert_eq!(unsafe { block.reclaim() }, 2);
    assert!(block.is_free());
    release_scratch(block);
  }

  #[test]
  fn exactly_one_thread_adopts_an_orphan() {
    let block = scratch_block(4096);
    let slots = block.slots();
    let live: Vec<_> = (0..slots).map(|_| unsafe { block.reserve() }.unwrap()).collect();
    assert!(block.is_saturated());
    assert!(block.try_orphan_full(OWNER));

    let addr = block.addr();
    let targets = [live[0].as_ptr() as usize, live[1].as_ptr() as usize];
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = targets
      .into_iter()
      .enumerate()
      .map(|(i, target)| {
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
          let block = unsafe { BlockRef::from_addr(addr) };
          let me = 100 + i as u32;
          let index = block.slot_index(target);
          barrier.wait();
          if block.try_adopt(me) {
            return true;
          }
          // Lost: the winner owns it now, so the push must go through.
          assert_eq!(unsafe { block.push_deferred(index) }, Ok(()));
          false
        })
      })
      .collect();

    let wins: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(wins.iter().filter(|&&won| won).count(), 1);
    assert!([100, 101].contains(&block.owner()));
    assert_eq!(block.pending(), 1);

    let info = unsafe { block.info() };
    assert_eq!(info.slots, slots);
    assert_eq!(info.free, 0);
    release_scratch(block);
  }
}
