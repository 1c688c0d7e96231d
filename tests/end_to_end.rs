use std::{sync::mpsc, thread};

use slabflow::{
  Arena, Policy, ThreadHeap,
  config::align_down,
  size_class::{objects_per_pageblock, pageblock_size, size_to_class},
};

const HEADER: usize = if cfg!(feature = "meta-header") { 16 } else { 0 };
const OBJECTS: usize = 200;
const SIZE: usize = 48;

fn init_logging() {
  let _ = env_logger::builder().is_test(true).try_init();
}

fn block_of(addr: usize) -> usize {
  align_down(addr, pageblock_size(size_to_class(SIZE + HEADER)))
}

/// Allocates `OBJECTS` objects on a new thread and returns their addresses.
/// The thread's heap lives until `done` fires.
fn allocate_on_thread<'a>(
  s: &'a thread::Scope<'a, '_>,
  arena: &'a Arena,
  done: mpsc::Receiver<()>,
) -> Vec<usize> {
  let (sender, receiver) = mpsc::channel();
  s.spawn(move || {
    let mut heap = ThreadHeap::new(arena);
    let objects: Vec<usize> = (0..OBJECTS)
      .map(|i| {
        let ptr = heap.allocate(SIZE).unwrap();
        unsafe { ptr.as_ptr().write_bytes(i as u8, SIZE) };
        ptr.as_ptr() as usize
      })
      .collect();
    sender.send(objects).unwrap();
    let _ = done.recv();
  });
  receiver.recv().unwrap()
}

#[test]
fn remote_release_then_reuse_from_a_third_thread() {
  init_logging();
  let arena = Arena::new();
  let class = size_to_class(SIZE + HEADER);
  let expected_blocks = OBJECTS.div_ceil(objects_per_pageblock(class));

  let block = thread::scope(|s| {
    let (finish_a, done) = mpsc::channel();
    let objects = allocate_on_thread(s, &arena, done);
    assert_eq!(arena.stats().pageblocks_created, expected_blocks);

    // B releases everything while A still owns the block.
    let released = objects.clone();
    let arena_ref = &arena;
    s.spawn(move || {
      let mut heap = ThreadHeap::new(arena_ref);
      for (i, &addr) in released.iter().enumerate() {
        let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, SIZE) };
        assert!(bytes.iter().all(|&b| b == i as u8));
        unsafe { heap.release(addr as *mut u8) };
      }
    })
    .join()
    .unwrap();
    assert_eq!(arena.stats().deferred_releases, OBJECTS);

    // A exits: its fully free block goes to the global free cache.
    finish_a.send(()).unwrap();
    block_of(objects[0])
  });

  let pages_before = arena.stats().page_allocations;
  let reused = thread::scope(|s| {
    s.spawn(|| {
      let mut heap = ThreadHeap::new(&arena);
      let ptr = heap.allocate(SIZE).unwrap();
      let info = unsafe { heap.inspect(ptr.as_ptr()) }.unwrap();
      assert_eq!(info.owner, heap.owner());
      assert_eq!(info.pending, 0);
      let addr = ptr.as_ptr() as usize;
      unsafe { heap.release(ptr.as_ptr()) };
      addr
    })
    .join()
    .unwrap()
  });

  assert_eq!(block_of(reused), block);
  let stats = arena.stats();
  assert_eq!(stats.page_allocations, pages_before);
  assert_eq!(stats.pageblocks_created, expected_blocks);
}

#[test]
fn release_after_owner_exit_is_reclaimed_by_the_next_owner() {
  init_logging();
  let arena = Arena::new();

  let objects = thread::scope(|s| {
    let (finish_a, done) = mpsc::channel();
    let objects = allocate_on_thread(s, &arena, done);
    finish_a.send(()).unwrap();
    objects
  });
  // The partially used block was parked for other threads, not orphaned.
  assert_eq!(arena.stats().orphaned, 0);

  thread::scope(|s| {
    s.spawn(|| {
      let mut heap = ThreadHeap::new(&arena);
      for &addr in &objects[1..] {
        unsafe { heap.release(addr as *mut u8) };
      }
    });
  });
  assert_eq!(arena.stats().deferred_releases, OBJECTS - 1);

  let mut heap = ThreadHeap::new(&arena);
  let ptr = heap.allocate(SIZE).unwrap();
  assert_eq!(block_of(ptr.as_ptr() as usize), block_of(objects[0]));
  let info = unsafe { heap.inspect(ptr.as_ptr()) }.unwrap();
  assert_eq!(info.owner, heap.owner());
  assert_eq!(info.free + info.pending + 2, info.slots);
  assert_eq!(arena.stats().pageblocks_created, 1);

  unsafe {
    heap.release(ptr.as_ptr());
    heap.release(objects[0] as *mut u8);
  }
}

#[test]
fn orphaned_blocks_are_adopted_by_their_releaser() {
  init_logging();
  let arena = Arena::with_policy(Policy {
    max_global_partial: 0,
    ..Policy::DEFAULT
  });

  let objects = thread::scope(|s| {
    let (finish_a, done) = mpsc::channel();
    let objects = allocate_on_thread(s, &arena, done);
    finish_a.send(()).unwrap();
    objects
  });
  assert_eq!(arena.stats().orphaned, 1);

  let mut heap = ThreadHeap::new(&arena);
  for &addr in &objects {
    unsafe { heap.release(addr as *mut u8) };
  }
  let stats = arena.stats();
  assert_eq!(stats.adoptions, 1);
  assert_eq!(stats.deferred_releases, 0);

  // The adopted block now serves this heap without new pages.
  let ptr = heap.allocate(SIZE).unwrap();
  assert_eq!(block_of(ptr.as_ptr() as usize), block_of(objects[0]));
  assert_eq!(arena.stats().pageblocks_created, 1);
  unsafe { heap.release(ptr.as_ptr()) };
}

#[test]
fn page_backed_objects_round_trip() {
  init_logging();
  let arena = Arena::new();
  let mut heap = ThreadHeap::new(&arena);

  for size in [20_000, 1 << 20, (8 << 20) + 1] {
    let ptr = heap.allocate(size).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 16, 0);
    assert!(unsafe { heap.usable_size(ptr.as_ptr()) } >= size);
    unsafe {
      ptr.as_ptr().write_bytes(0x7E, size);
      heap.release(ptr.as_ptr());
    }
  }

  // Same medium size again: served from the idle superpage.
  let mapped = arena.stats().superpages_mapped;
  let ptr = heap.allocate(20_000).unwrap();
  assert_eq!(arena.stats().superpages_mapped, mapped);
  unsafe { heap.release(ptr.as_ptr()) };
}
