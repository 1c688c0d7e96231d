use core::{
  hint,
  sync::atomic::{AtomicBool, Ordering},
};

/// Test-and-test-and-set lock guarding the superpage directory.
pub struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  pub const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  pub fn lock(&self) -> SpinGuard<'_> {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
    SpinGuard { lock: self }
  }

  #[cfg(test)]
  pub fn is_locked(&self) -> bool {
    self.locked.load(Ordering::Relaxed)
  }
}

pub struct SpinGuard<'a> {
  lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
  #[inline]
  fn drop(&mut self) {
    self.lock.locked.store(false, Ordering::Release);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{cell::UnsafeCell, sync::Arc, thread};

  struct Counter {
    lock: SpinLock,
    value: UnsafeCell<u64>,
  }

  unsafe impl Sync for Counter {}

  #[test]
  fn spinlock_serializes_increments() {
    let counter = Arc::new(Counter {
      lock: SpinLock::new(),
      value: UnsafeCell::new(0),
    });

    let handles: Vec<_> = (0..4)
      .map(|_| {
        let counter = Arc::clone(&counter);
        thread::spawn(move || {
          for _ in 0..10_000 {
            let _guard = counter.lock.lock();
            unsafe { *counter.value.get() += 1 };
          }
        })
      })
      .collect();
    for handle in handles {
      handle.join().unwrap();
    }

    assert_eq!(unsafe { *counter.value.get() }, 40_000);
  }
}
