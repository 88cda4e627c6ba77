use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

/// Counting semaphore for the capture/writer handoff.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(count: usize) -> Semaphore {
        Semaphore { count: Mutex::new(count), cond: Condvar::new() }
    }

    pub fn post(&self) {
        let mut c = self.count.lock();
        *c += 1;
        drop(c);
        self.cond.notify_one();
    }

    pub fn wait(&self) {
        let mut c = self.count.lock();
        while *c == 0 {
            self.cond.wait(&mut c);
        }
        *c -= 1;
    }

    pub fn try_wait(&self) -> bool {
        let mut c = self.count.lock();
        if *c == 0 {
            return false;
        }
        *c -= 1;
        true
    }
}

/// Raw test-and-set spinlock.
///
/// The async-audio fast path must not touch a blocking primitive, so
/// this is plain atomics with a spin hint.
pub struct SpinLock {
    locked: AtomicBool,
}

pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl SpinLock {
    pub const fn new() -> SpinLock {
        SpinLock { locked: AtomicBool::new(false) }
    }

    pub fn lock(&self) -> SpinGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        SpinGuard { lock: self }
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        SpinLock::new()
    }
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
