use std::{
  collections::{HashMap, HashSet},
  sync::{Barrier, Mutex, mpsc},
  thread,
};

use rand::{Rng, SeedableRng, rngs::StdRng};
use slabflow::{
  Arena, ThreadHeap,
  config::align_down,
  size_class::{pageblock_size, size_to_class},
};

const HEADER: usize = if cfg!(feature = "meta-header") { 16 } else { 0 };
const THREADS: usize = 4;
const PER_THREAD: usize = 3_000;

#[derive(Clone, Copy)]
struct Object {
  addr: usize,
  size: usize,
  tag: u64,
}

impl Object {
  fn stamp(ptr: *mut u8, size: usize, tag: u64) -> Self {
    unsafe {
      ptr.cast::<u64>().write_unaligned(tag);
      ptr.add(size - 8).cast::<u64>().write_unaligned(!tag);
    }
    Self {
      addr: ptr as usize,
      size,
      tag,
    }
  }

  fn check(&self) {
    let ptr = self.addr as *const u8;
    unsafe {
      assert_eq!(ptr.cast::<u64>().read_unaligned(), self.tag, "slot handed out twice");
      assert_eq!(ptr.add(self.size - 8).cast::<u64>().read_unaligned(), !self.tag);
    }
  }

  fn block(&self) -> usize {
    align_down(self.addr, pageblock_size(size_to_class(self.size + HEADER)))
  }
}

fn init_logging() {
  let _ = env_logger::builder().is_test(true).try_init();
}

/// At a quiescent point every pageblock accounts for all its slots: free on
/// the owner's side, pending on the deferred chain, or live.
fn assert_slot_accounting(arena: &Arena, live: &[Object]) {
  let mut per_block: HashMap<usize, (usize, usize)> = HashMap::new();
  for object in live {
    per_block.entry(object.block()).or_insert((object.addr, 0)).1 += 1;
  }

  let observer = ThreadHeap::new(arena);
  for (sample, count) in per_block.into_values() {
    let info = unsafe { observer.inspect(sample as *const u8) }.unwrap();
    assert_eq!(info.free + info.pending + count, info.slots);
  }

  let unique: HashSet<usize> = live.iter().map(|object| object.addr).collect();
  assert_eq!(unique.len(), live.len());
}

fn allocate_batch(
  heap: &mut ThreadHeap<'_>,
  rng: &mut StdRng,
  thread: usize,
  round: u64,
) -> Vec<Object> {
  (0..PER_THREAD)
    .map(|i| {
      let size = rng.gen_range(16..=2048);
      let ptr = heap.allocate(size).unwrap();
      let tag = (thread as u64) << 48 | round << 32 | i as u64;
      Object::stamp(ptr.as_ptr(), size, tag)
    })
    .collect()
}

#[test]
fn redistributed_releases_keep_slots_consistent() {
  init_logging();
  let arena = Arena::new();
  let barrier = Barrier::new(THREADS + 1);
  let published: Mutex<Vec<Object>> = Mutex::new(Vec::new());

  let (senders, receivers): (Vec<_>, Vec<_>) = (0..THREADS)
    .map(|_| mpsc::channel::<Vec<Object>>())
    .unzip();

  thread::scope(|s| {
    for (id, receiver) in receivers.into_iter().enumerate() {
      let next = senders[(id + 1) % THREADS].clone();
      let (arena, barrier, published) = (&arena, &barrier, &published);
      s.spawn(move || {
        let mut heap = ThreadHeap::new(arena);
        let mut rng = StdRng::seed_from_u64(0x5EED + id as u64);

        // Round 0: allocate, publish, wait for the check.
        let mine = allocate_batch(&mut heap, &mut rng, id, 0);
        published.lock().unwrap().extend_from_slice(&mine);
        barrier.wait();
        barrier.wait();

        // Hand everything to the neighbour, release what comes in.
        next.send(mine).unwrap();
        for object in receiver.recv().unwrap() {
          object.check();
          unsafe { heap.release(object.addr as *mut u8) };
        }
        barrier.wait();

        // Round 1 reuses reclaimed slots.
        let mine = allocate_batch(&mut heap, &mut rng, id, 1);
        published.lock().unwrap().extend_from_slice(&mine);
        barrier.wait();
        barrier.wait();

        for object in mine {
          object.check();
          unsafe { heap.release(object.addr as *mut u8) };
        }
      });
    }
    drop(senders);

    barrier.wait();
    assert_slot_accounting(&arena, &published.lock().unwrap());
    published.lock().unwrap().clear();
    barrier.wait();

    barrier.wait();
    assert_eq!(arena.stats().deferred_releases, THREADS * PER_THREAD);

    barrier.wait();
    assert_slot_accounting(&arena, &published.lock().unwrap());
    barrier.wait();
  });

  let stats = arena.stats();
  assert_eq!(stats.deferred_releases, THREADS * PER_THREAD);
  assert_eq!(stats.orphaned, 0);
}

#[test]
fn random_workload_across_threads() {
  init_logging();
  let arena = Arena::new();
  let (sender, receiver) = mpsc::channel::<Object>();
  let receiver = Mutex::new(receiver);

  thread::scope(|s| {
    for id in 0..THREADS {
      let (arena, sender, receiver) = (&arena, sender.clone(), &receiver);
      s.spawn(move || {
        let mut heap = ThreadHeap::new(arena);
        let mut rng = StdRng::seed_from_u64(0xA110C + id as u64);
        let mut live: Vec<Object> = Vec::new();

        for i in 0..20_000u64 {
          match rng.gen_range(0..10) {
            0..=4 => {
              let size = match rng.gen_range(0..100) {
                0 => rng.gen_range(16_384..300_000),
                _ => rng.gen_range(16..4096),
              };
              let ptr = heap.allocate(size).unwrap();
              live.push(Object::stamp(ptr.as_ptr(), size, (id as u64) << 32 | i));
            }
            5 | 6 if !live.is_empty() => {
              let object = live.swap_remove(rng.gen_range(0..live.len()));
              object.check();
              unsafe { heap.release(object.addr as *mut u8) };
            }
            7 if !live.is_empty() => {
              let at = rng.gen_range(0..live.len());
              let object = live[at];
              object.check();
              let size = rng.gen_range(16..8192);
              let moved = unsafe { heap.resize(object.addr as *mut u8, size) }.unwrap().unwrap();
              let head = unsafe { moved.as_ptr().cast::<u64>().read_unaligned() };
              assert_eq!(head, object.tag);
              live[at] = Object::stamp(moved.as_ptr(), size, (id as u64) << 32 | i);
            }
            8 if !live.is_empty() => {
              let object = live.swap_remove(rng.gen_range(0..live.len()));
              sender.send(object).unwrap();
            }
            _ => {
              let incoming = receiver.lock().unwrap().try_recv();
              if let Ok(object) = incoming {
                object.check();
                unsafe { heap.release(object.addr as *mut u8) };
              }
            }
          }
        }

        for object in live {
          object.check();
          unsafe { heap.release(object.addr as *mut u8) };
        }
      });
    }
  });
  drop(sender);

  // Whatever is still in flight is released after every owner is gone.
  let mut heap = ThreadHeap::new(&arena);
  let receiver = receiver.into_inner().unwrap();
  for object in receiver.try_iter() {
    object.check();
    unsafe { heap.release(object.addr as *mut u8) };
  }
  assert!(arena.stats().pageblocks_created > 0);
}
