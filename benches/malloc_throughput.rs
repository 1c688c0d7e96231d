use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use slabflow::{Arena, ThreadHeap};
use std::{hint::black_box, sync::mpsc, thread};

const OPS: u64 = 100_000;
const BATCH: usize = 1_000;

/// slabflow alloc/free throughput on the calling thread's heap.
fn slabflow_allocate_release(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = slabflow::allocate(size).map_or(core::ptr::null_mut(), |p| p.as_ptr());
      black_box(ptr);
      slabflow::release(ptr);
    }
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

/// One thread allocates batches, another releases them through the deferred chain.
fn slabflow_cross_thread(arena: &Arena, size: usize) {
  let (sender, receiver) = mpsc::sync_channel::<Vec<usize>>(4);
  thread::scope(|s| {
    s.spawn(move || {
      let mut heap = ThreadHeap::new(arena);
      for batch in receiver {
        for addr in batch {
          unsafe { heap.release(addr as *mut u8) };
        }
      }
    });

    let mut heap = ThreadHeap::new(arena);
    for _ in 0..OPS as usize / BATCH {
      let batch = (0..BATCH)
        .map(|_| heap.allocate(size).map_or(0, |p| p.as_ptr() as usize))
        .collect();
      if sender.send(batch).is_err() {
        break;
      }
    }
    drop(sender);
  });
}

fn libc_cross_thread(size: usize) {
  let (sender, receiver) = mpsc::sync_channel::<Vec<usize>>(4);
  thread::scope(|s| {
    s.spawn(move || {
      for batch in receiver {
        for addr in batch {
          unsafe { libc::free(addr as *mut libc::c_void) };
        }
      }
    });

    for _ in 0..OPS as usize / BATCH {
      let batch = (0..BATCH)
        .map(|_| unsafe { libc::malloc(size) } as usize)
        .collect();
      if sender.send(batch).is_err() {
        break;
      }
    }
    drop(sender);
  });
}

fn benchmark_malloc_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("malloc_throughput");

  for size in [16, 64, 256, 1024, 4096, 65_536] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("slabflow", size), &size, |b, &size| {
      b.iter(|| slabflow_allocate_release(size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

fn benchmark_cross_thread(c: &mut Criterion) {
  let mut group = c.benchmark_group("cross_thread_release");
  let arena = Arena::new();

  for size in [32, 256, 2048] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("slabflow", size), &size, |b, &size| {
      b.iter(|| slabflow_cross_thread(&arena, size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_cross_thread(size))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_malloc_throughput, benchmark_cross_thread);
criterion_main!(benches);
