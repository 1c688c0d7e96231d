use core::sync::atomic::{AtomicUsize, Ordering};

/// Event counters of an arena. Relaxed: they order nothing.
pub(crate) struct Counters {
  pub superpages_mapped: AtomicUsize,
  pub superpages_retired: AtomicUsize,
  pub superpages_reused: AtomicUsize,
  pub page_allocations: AtomicUsize,
  pub pageblocks_created: AtomicUsize,
  pub adoptions: AtomicUsize,
  pub deferred_releases: AtomicUsize,
  pub orphaned: AtomicUsize,
}

impl Counters {
  pub const fn new() -> Self {
    Self {
      superpages_mapped: AtomicUsize::new(0),
      superpages_retired: AtomicUsize::new(0),
      superpages_reused: AtomicUsize::new(0),
      page_allocations: AtomicUsize::new(0),
      pageblocks_created: AtomicUsize::new(0),
      adoptions: AtomicUsize::new(0),
      deferred_releases: AtomicUsize::new(0),
      orphaned: AtomicUsize::new(0),
    }
  }

  #[inline]
  pub fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> Stats {
    let read = |counter: &AtomicUsize| counter.load(Ordering::Relaxed);
    Stats {
      superpages_mapped: read(&self.superpages_mapped),
      superpages_retired: read(&self.superpages_retired),
      superpages_reused: read(&self.superpages_reused),
      page_allocations: read(&self.page_allocations),
      pageblocks_created: read(&self.pageblocks_created),
      adoptions: read(&self.adoptions),
      deferred_releases: read(&self.deferred_releases),
      orphaned: read(&self.orphaned),
    }
  }
}

/// Point-in-time copy of an arena's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
  /// Superpages mapped from the page source.
  pub superpages_mapped: usize,
  /// Fully free superpages purged and parked.
  pub superpages_retired: usize,
  /// Parked superpages brought back into service.
  pub superpages_reused: usize,
  /// Buddy allocations of any order (pageblocks and medium objects).
  pub page_allocations: usize,
  pub pageblocks_created: usize,
  /// Orphaned pageblocks taken over by a releasing thread.
  pub adoptions: usize,
  /// Releases pushed onto another thread's deferred chain.
  pub deferred_releases: usize,
  /// Pageblocks left without an owner by a finalizing thread.
  pub orphaned: usize,
}
