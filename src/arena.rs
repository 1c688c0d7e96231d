//! The shared side of the allocator: superpages, global caches, the registry
//! and everything served straight from pages.

use core::ptr::NonNull;

use crate::{
  block::BlockRef,
  cache::GlobalCaches,
  config::{MIN_ALIGN, PAGE_SIZE, Policy, SUPERPAGE_SIZE, align_down, order_for},
  error::{AllocError, Result},
  registry::{PageMap, Record, Registry},
  size_class::pageblock_order,
  stats::{Counters, Stats},
  superpage::{Directory, SuperpageRef},
};
#[cfg(not(feature = "meta-flat"))]
use crate::source::OsPages as Source;
use crate::source::PageSource;
#[cfg(feature = "meta-flat")]
use crate::source::WindowPages as Source;

/// Bytes in front of every object reserved by the registry strategy.
pub(crate) const HEADER: usize = <Registry as PageMap>::HEADER;

/// Process-wide (or test-local) allocator state shared by thread heaps.
pub struct Arena {
  directory: Directory,
  pub(crate) caches: GlobalCaches,
  registry: Registry,
  source: Source,
  pub(crate) counters: Counters,
  policy: Policy,
}

impl Arena {
  pub const fn new() -> Self {
    Self::with_policy(Policy::DEFAULT)
  }

  pub const fn with_policy(policy: Policy) -> Self {
    Self {
      directory: Directory::new(),
      caches: GlobalCaches::new(),
      registry: Registry::new(),
      source: Source,
      counters: Counters::new(),
      policy,
    }
  }

  #[inline]
  pub fn policy(&self) -> &Policy {
    &self.policy
  }

  pub fn stats(&self) -> Stats {
    self.counters.snapshot()
  }

  /// # Safety
  /// `ptr` must be non-null and, for inline-header builds, come from this arena.
  #[inline]
  pub(crate) unsafe fn lookup(&self, ptr: *const u8) -> Option<Record> {
    unsafe { self.registry.lookup(ptr) }
  }

  #[inline]
  pub(crate) unsafe fn tag(&self, object: NonNull<u8>, record: Record) {
    unsafe { self.registry.tag(object, record) }
  }

  // ===========================================================================
  // Pageblocks
  // ===========================================================================

  /// Carves a new pageblock for `class` out of the buddy allocator.
  pub(crate) fn new_block(&self, class: usize, owner: u32) -> Result<BlockRef> {
    let order = pageblock_order(class);
    let (superpage, page) = self
      .directory
      .alloc_pages(&self.source, order, &self.counters)?;
    let start = superpage.page_addr(page);
    let block = unsafe { BlockRef::init(start, superpage, class, order, owner) };

    let registered = self
      .registry
      .register_pages(block.addr(), block.pages(), Record::Small(block));
    if let Err(err) = registered {
      unsafe { self.free_pages(superpage, page, order) };
      return Err(err);
    }

    Counters::bump(&self.counters.pageblocks_created);
    Ok(block)
  }

  /// Caches a fully free block globally, or gives its pages back.
  ///
  /// # Safety
  /// The caller owns `block` and it has no live or pending slots.
  pub(crate) unsafe fn release_free_block(&self, block: BlockRef) {
    if self.caches.free[block.size_index()].push(block, self.policy.max_global_free) {
      return;
    }

    let superpage = block.superpage();
    let page = superpage.page_of(block.addr());
    let order = block.order();
    self.registry.unregister_pages(block.addr(), block.pages());
    unsafe { self.free_pages(superpage, page, order) };
  }

  /// Parks a partially used block for other threads. If the partial cache is
  /// full the block is orphaned instead; releases of its live slots will
  /// adopt it.
  ///
  /// # Safety
  /// `owner` owns `block`, which is on no list.
  pub(crate) unsafe fn park_partial(&self, block: BlockRef, owner: u32) {
    if self.caches.partial[block.class()].push(block, self.policy.max_global_partial) {
      return;
    }

    let free = block.free_count();
    let slots = block.slots();
    let pending = block.disown();
    Counters::bump(&self.counters.orphaned);
    log::debug!(
      "orphaned pageblock {:p} (class {}, {} live slots)",
      block.start().as_ptr(),
      block.class(),
      slots - free - pending
    );

    // Nothing live means no release can race us for it.
    if free + pending == slots && block.try_adopt(owner) {
      unsafe {
        block.reclaim();
        self.release_free_block(block);
      }
    }
  }

  unsafe fn free_pages(&self, superpage: SuperpageRef, page: u16, order: usize) {
    unsafe {
      self.directory.free_pages(
        &self.source,
        superpage,
        page,
        order,
        self.policy.idle_superpages,
        &self.counters,
      )
    }
  }

  // ===========================================================================
  // Page-backed objects
  // ===========================================================================

  /// Serves `size` bytes from whole pages: a buddy chunk if it fits in a
  /// superpage, else a dedicated mapping.
  pub(crate) fn allocate_paged(&self, size: usize) -> Result<NonNull<u8>> {
    let need = size.checked_add(HEADER).ok_or(AllocError::Overflow)?;
    if need <= SUPERPAGE_SIZE {
      self.allocate_medium(need)
    } else {
      self.allocate_large(size, MIN_ALIGN)
    }
  }

  fn allocate_medium(&self, need: usize) -> Result<NonNull<u8>> {
    let order = order_for(need);
    let (superpage, page) = self
      .directory
      .alloc_pages(&self.source, order, &self.counters)?;
    let chunk = superpage.page_addr(page);
    let record = Record::Medium {
      superpage,
      order: order as u8,
    };

    if let Err(err) = self.registry.register(chunk.as_ptr() as usize, record) {
      unsafe { self.free_pages(superpage, page, order) };
      return Err(err);
    }
    let object = unsafe { chunk.add(HEADER) };
    unsafe { self.tag(object, record) };
    Ok(object)
  }

  /// Maps a dedicated region for `size` bytes aligned to `align`.
  pub(crate) fn allocate_large(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
    debug_assert!(align.is_power_of_two());
    // Inline headers go one page ahead of an over-aligned object.
    let lead = if align > MIN_ALIGN && HEADER > 0 {
      PAGE_SIZE
    } else {
      0
    };
    let offset = lead.max(HEADER);
    let len = size
      .checked_add(offset)
      .and_then(|bytes| bytes.checked_next_multiple_of(PAGE_SIZE))
      .ok_or(AllocError::Overflow)?;

    let base = self.source.map(len, align.max(PAGE_SIZE), lead)?;
    let record = Record::Large { len };
    if let Err(err) = self.registry.register(base.as_ptr() as usize, record) {
      unsafe { self.source.unmap(base, len) };
      return Err(err);
    }
    let object = unsafe { base.add(offset) };
    unsafe { self.tag(object, record) };
    Ok(object)
  }

  /// Releases a medium or large object.
  ///
  /// # Safety
  /// `ptr` is a live object described by `record`.
  pub(crate) unsafe fn release_paged(&self, ptr: NonNull<u8>, record: Record) {
    let base = align_down(ptr.as_ptr() as usize - HEADER, PAGE_SIZE);
    match record {
      Record::Medium { superpage, order } => {
        self.registry.unregister(base);
        unsafe { self.free_pages(superpage, superpage.page_of(base), order as usize) };
      }
      Record::Large { len } => {
        self.registry.unregister(base);
        unsafe {
          self
            .source
            .unmap(NonNull::new_unchecked(base as *mut u8), len)
        };
      }
      Record::Small(_) => debug_assert!(false, "small object routed to the page path"),
    }
  }

  // ===========================================================================
  // Without a thread heap
  // ===========================================================================

  /// Allocates without a thread heap, from whole pages.
  pub fn allocate_detached(&self, size: usize) -> Result<NonNull<u8>> {
    self.allocate_paged(size.max(1))
  }

  pub fn aligned_allocate_detached(&self, align: usize, size: usize) -> Result<NonNull<u8>> {
    if !align.is_power_of_two() {
      return Err(AllocError::BadAlignment(align));
    }
    if align <= MIN_ALIGN {
      self.allocate_detached(size)
    } else {
      self.allocate_large(size.max(1), align)
    }
  }

  /// Releases any object of this arena without a thread heap. Small objects
  /// go onto their block's deferred chain, even when the block is orphaned.
  ///
  /// # Safety
  /// `ptr` is null or a live object of this arena.
  pub unsafe fn release_detached(&self, ptr: *mut u8) {
    let Some(ptr) = NonNull::new(ptr) else {
      return;
    };
    match unsafe { self.lookup(ptr.as_ptr()) } {
      Some(Record::Small(block)) => {
        let index = block.slot_index(ptr.as_ptr() as usize - HEADER);
        unsafe { block.push_detached(index) };
        Counters::bump(&self.counters.deferred_releases);
      }
      Some(record) => unsafe { self.release_paged(ptr, record) },
      None => {}
    }
  }

  /// Bytes usable at `ptr`, 0 for addresses this arena does not know.
  ///
  /// # Safety
  /// `ptr` is null or a live object of this arena.
  pub unsafe fn usable_size(&self, ptr: *const u8) -> usize {
    if ptr.is_null() {
      return 0;
    }
    let addr = ptr as usize;
    let base = align_down(addr - HEADER, PAGE_SIZE);
    match unsafe { self.lookup(ptr) } {
      Some(Record::Small(block)) => block.slot_end(addr - HEADER) - addr,
      Some(Record::Medium { order, .. }) => base + (PAGE_SIZE << order) - addr,
      Some(Record::Large { len }) => base + len - addr,
      None => 0,
    }
  }
}

impl Default for Arena {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for Arena {
  fn drop(&mut self) {
    unsafe { self.directory.release_all(&self.source) };
  }
}
