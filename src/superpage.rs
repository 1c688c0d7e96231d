//! Superpages and the directory that hands out their pages.

use core::{cell::UnsafeCell, mem::size_of, ptr::NonNull};

use crate::{
  buddy::Buddy,
  config::{PAGE_BITS, PAGE_SIZE, SUPERPAGE_SIZE, align_up},
  error::{AllocError, Result},
  list::{Link, Links, List},
  os,
  source::PageSource,
  stats::Counters,
  sync::SpinLock,
};

/// Bookkeeping for one superpage. Lives in its own mapping so the data pages
/// stay fully usable.
pub struct Superpage {
  base: NonNull<u8>,
  link: Link<SuperpageRef>,
  buddy: Buddy,
}

const META_LEN: usize = align_up(size_of::<Superpage>(), PAGE_SIZE);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SuperpageRef(NonNull<Superpage>);

impl SuperpageRef {
  /// Start of the superpage's data.
  #[inline]
  pub fn base(self) -> NonNull<u8> {
    unsafe { (*self.0.as_ptr()).base }
  }

  #[inline]
  pub fn page_addr(self, page: u16) -> NonNull<u8> {
    unsafe { self.base().add((page as usize) << PAGE_BITS) }
  }

  /// Page index of an address inside this superpage.
  #[inline]
  pub fn page_of(self, addr: usize) -> u16 {
    let offset = addr - self.base().as_ptr() as usize;
    debug_assert!(offset < SUPERPAGE_SIZE);
    (offset >> PAGE_BITS) as u16
  }

  #[inline]
  pub(crate) fn addr(self) -> usize {
    self.0.as_ptr() as usize
  }

  /// # Safety
  /// `addr` must come from [`SuperpageRef::addr`] of a live superpage.
  #[inline]
  pub(crate) unsafe fn from_addr(addr: usize) -> Self {
    Self(unsafe { NonNull::new_unchecked(addr as *mut Superpage) })
  }

  /// Metadata pages are page aligned, so the low bits of `addr` are free.
  pub(crate) const ADDR_ALIGN: usize = PAGE_SIZE;

  fn create<S: PageSource>(source: &S, counters: &Counters) -> Result<Self> {
    let data = source.map(SUPERPAGE_SIZE, SUPERPAGE_SIZE, 0)?;
    let meta = match os::map(META_LEN) {
      Ok(meta) => meta.cast::<Superpage>(),
      Err(err) => {
        unsafe { source.unmap(data, SUPERPAGE_SIZE) };
        return Err(err);
      }
    };

    unsafe {
      meta.as_ptr().write(Superpage {
        base: data,
        link: Link::UNLINKED,
        buddy: Buddy::new(),
      })
    };
    Counters::bump(&counters.superpages_mapped);
    log::debug!("mapped superpage {:p}", data.as_ptr());
    Ok(Self(meta))
  }

  /// Unmaps data and metadata.
  unsafe fn destroy<S: PageSource>(self, source: &S) {
    unsafe {
      source.unmap(self.base(), SUPERPAGE_SIZE);
      os::unmap(self.0.cast(), META_LEN);
    }
  }

  /// # Safety
  /// Caller holds the directory lock.
  #[inline]
  unsafe fn buddy<'a>(self) -> &'a mut Buddy {
    unsafe { &mut (*self.0.as_ptr()).buddy }
  }
}

struct SuperpageLinks;

impl Links<SuperpageRef> for SuperpageLinks {
  #[inline]
  fn link(&self, id: SuperpageRef) -> &Link<SuperpageRef> {
    unsafe { &(*id.0.as_ptr()).link }
  }

  #[inline]
  fn link_mut(&mut self, id: SuperpageRef) -> &mut Link<SuperpageRef> {
    unsafe { &mut (*id.0.as_ptr()).link }
  }
}

// =============================================================================
// Directory
// =============================================================================

struct DirectoryState {
  /// Superpages in service, oldest first.
  active: List<SuperpageRef>,
  /// Fully free superpages with purged data, kept mapped for reuse.
  retired: List<SuperpageRef>,
  /// Whole-free superpages still on `active`.
  idle: usize,
}

/// All superpages of an arena. Buddy state is only touched under `lock`.
pub struct Directory {
  lock: SpinLock,
  state: UnsafeCell<DirectoryState>,
}

unsafe impl Sync for Directory {}
unsafe impl Send for Directory {}

impl Directory {
  pub const fn new() -> Self {
    Self {
      lock: SpinLock::new(),
      state: UnsafeCell::new(DirectoryState {
        active: List::new(),
        retired: List::new(),
        idle: 0,
      }),
    }
  }

  /// Takes `2^order` contiguous pages from the first superpage that has them,
  /// bringing in a retired or new superpage if none does.
  pub fn alloc_pages<S: PageSource>(
    &self,
    source: &S,
    order: usize,
    counters: &Counters,
  ) -> Result<(SuperpageRef, u16)> {
    let _guard = self.lock.lock();
    let state = unsafe { &mut *self.state.get() };

    let mut cursor = state.active.head();
    while let Some(superpage) = cursor {
      let buddy = unsafe { superpage.buddy() };
      if buddy.can_satisfy(order) {
        let was_whole = buddy.is_whole();
        if let Some(page) = buddy.alloc(order) {
          if was_whole {
            state.idle -= 1;
          }
          Counters::bump(&counters.page_allocations);
          return Ok((superpage, page));
        }
      }
      cursor = state.active.next(&SuperpageLinks, superpage);
    }

    let superpage = match state.retired.pop_front(&mut SuperpageLinks) {
      Some(superpage) => {
        Counters::bump(&counters.superpages_reused);
        superpage
      }
      None => SuperpageRef::create(source, counters)?,
    };
    state.active.push_back(&mut SuperpageLinks, superpage);

    let page = unsafe { superpage.buddy() }
      .alloc(order)
      .ok_or(AllocError::OutOfMemory {
        bytes: PAGE_SIZE << order,
      })?;
    Counters::bump(&counters.page_allocations);
    Ok((superpage, page))
  }

  /// Returns pages to their superpage. A superpage that becomes entirely free
  /// stays ready while fewer than `idle_limit` others are; otherwise it is
  /// purged and retired.
  ///
  /// # Safety
  /// `page`/`order` must be a chunk previously returned by `alloc_pages` for
  /// `superpage`, and nothing may still use it.
  pub unsafe fn free_pages<S: PageSource>(
    &self,
    source: &S,
    superpage: SuperpageRef,
    page: u16,
    order: usize,
    idle_limit: usize,
    counters: &Counters,
  ) {
    {
      let _guard = self.lock.lock();
      let state = unsafe { &mut *self.state.get() };

      if !unsafe { superpage.buddy() }.free(page, order) {
        return;
      }
      if state.idle < idle_limit {
        state.idle += 1;
        return;
      }
      state.active.remove(&mut SuperpageLinks, superpage);
    }

    // Unlinked and whole: nobody else can reach its pages until it is retired.
    unsafe { source.purge(superpage.base(), SUPERPAGE_SIZE) };

    let _guard = self.lock.lock();
    let state = unsafe { &mut *self.state.get() };
    state.retired.push_front(&mut SuperpageLinks, superpage);
    Counters::bump(&counters.superpages_retired);
    log::debug!("retired superpage {:p}", superpage.base().as_ptr());
  }

  /// Unmaps every superpage, in service or retired.
  ///
  /// # Safety
  /// No memory handed out from this directory may be used afterwards.
  pub unsafe fn release_all<S: PageSource>(&mut self, source: &S) {
    let state = self.state.get_mut();
    for list in [&mut state.active, &mut state.retired] {
      while let Some(superpage) = list.pop_front(&mut SuperpageLinks) {
        unsafe { superpage.destroy(source) };
      }
    }
    state.idle = 0;
  }
}
