// SPDX-License-Identifier: MPL-2.0

//! Synchronization primitives used by the cache.
//!
//! Shaped after `framework/aster-frame/src/sync/{wait.rs,mutex.rs,spin.rs}`:
//! a condition-based [`WaitQueue`] with a `wait_until(cond)` entry point,
//! thin [`Mutex`]/[`SpinLock`] wrappers, and an [`Event`] type modeling the
//! kernel's auto-reset/manual-reset `KEvent`. The teacher blocks threads by
//! parking them with the kernel scheduler (`task::schedule`); the scheduler
//! is one of this spec's named external collaborators, so here the same
//! `wait_until`/wake shape is backed by [`std::sync::Condvar`] instead.

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::{Duration, Instant};

/// A condition-variable-backed wait queue.
///
/// Mirrors `aster_frame::sync::WaitQueue::wait_until`: callers pass a
/// closure that tests a condition; the queue only returns once the
/// condition holds (re-testing after every wakeup, so spurious wakeups and
/// missed-wakeup races are both handled by the loop rather than by the
/// caller).
#[derive(Default)]
pub struct WaitQueue {
    state: StdMutex<()>,
    condvar: Condvar,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            state: StdMutex::new(()),
            condvar: Condvar::new(),
        }
    }

    /// Waits until `cond` returns `Some(_)`, returning that value.
    pub fn wait_until<F, R>(&self, mut cond: F) -> R
    where
        F: FnMut() -> Option<R>,
    {
        let mut guard = self.state.lock().unwrap();
        loop {
            if let Some(res) = cond() {
                return res;
            }
            guard = self.condvar.wait(guard).unwrap();
        }
    }

    /// Like [`Self::wait_until`], but gives up after `timeout` and returns
    /// the last condition result (`None` if it never became ready).
    pub fn wait_until_timeout<F, R>(&self, mut cond: F, timeout: Duration) -> Option<R>
    where
        F: FnMut() -> Option<R>,
    {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock().unwrap();
        loop {
            if let Some(res) = cond() {
                return Some(res);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (g, _timed_out) = self.condvar.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
        }
    }

    /// Wakes every waiter; each re-checks its own condition.
    pub fn wake_all(&self) {
        let _guard = self.state.lock().unwrap();
        self.condvar.notify_all();
    }

    /// Wakes a single waiter (which may find the condition still false and
    /// go back to sleep; that's fine, `wake_all` is used where exactly-one
    /// delivery matters less than correctness).
    pub fn wake_one(&self) {
        let _guard = self.state.lock().unwrap();
        self.condvar.notify_one();
    }
}

/// A mutex with an associated wait queue, in the shape of
/// `aster_frame::sync::Mutex`: a thin wrapper that exists so call sites read
/// the same way the teacher's code does (`.lock()` returning a guard).
/// Backed directly by `std::sync::Mutex`, whose blocking wait is exactly the
/// `wait_until`-on-an-atomic-flag pattern the teacher hand-rolls over its own
/// scheduler.
pub struct Mutex<T: ?Sized> {
    inner: StdMutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(val: T) -> Self {
        Self {
            inner: StdMutex::new(val),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        MutexGuard {
            guard: self.inner.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }
}

pub struct MutexGuard<'a, T: ?Sized> {
    guard: StdMutexGuard<'a, T>,
}

impl<'a, T: ?Sized> Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T: ?Sized> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// A short-critical-section lock, in the shape of `aster_frame::sync::SpinLock`.
/// Used for the page-frame database, whose critical sections are meant to
/// be short (spec §5, lock 4). Implemented identically to [`Mutex`]; the
/// distinction is purely documentation of intent, as in the teacher crate
/// (where the split exists to support disabling interrupts, not relevant
/// outside a kernel).
pub struct SpinLock<T: ?Sized> {
    inner: StdMutex<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(val: T) -> Self {
        Self {
            inner: StdMutex::new(val),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        SpinLockGuard {
            guard: self.inner.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }
}

pub struct SpinLockGuard<'a, T: ?Sized> {
    guard: StdMutexGuard<'a, T>,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// An auto-reset or manual-reset event, modeling the original's `KEvent`.
///
/// Auto-reset events (`load-complete`, `write-complete`,
/// `modified-non-empty`) clear themselves the instant a single waiter
/// observes them set; manual-reset events (`modified-non-full`,
/// `available-not-critical`) stay set until explicitly [`Event::reset`].
pub struct Event {
    queue: WaitQueue,
    set: Mutex<bool>,
    auto_reset: bool,
}

impl Event {
    pub fn new(auto_reset: bool) -> Self {
        Self {
            queue: WaitQueue::new(),
            set: Mutex::new(false),
            auto_reset,
        }
    }

    /// Sets the event, waking waiters. If `auto_reset`, at most one waiter
    /// observes the set state before it is cleared again.
    pub fn set(&self) {
        *self.set.lock() = true;
        if self.auto_reset {
            self.queue.wake_one();
        } else {
            self.queue.wake_all();
        }
    }

    pub fn reset(&self) {
        *self.set.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }

    /// Blocks until the event is set. For an auto-reset event, consumes the
    /// set state so only one waiter proceeds per `set()` call.
    pub fn wait(&self) {
        self.queue.wait_until(|| {
            let mut set = self.set.lock();
            if *set {
                if self.auto_reset {
                    *set = false;
                }
                Some(())
            } else {
                None
            }
        })
    }

    /// Like [`Self::wait`], but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.queue
            .wait_until_timeout(
                || {
                    let mut set = self.set.lock();
                    if *set {
                        if self.auto_reset {
                            *set = false;
                        }
                        Some(())
                    } else {
                        None
                    }
                },
                timeout,
            )
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_queue_wakes_on_condition() {
        let queue = Arc::new(WaitQueue::new());
        let flag = Arc::new(Mutex::new(false));

        let q2 = queue.clone();
        let f2 = flag.clone();
        let handle = thread::spawn(move || {
            q2.wait_until(|| if *f2.lock() { Some(()) } else { None });
        });

        thread::sleep(Duration::from_millis(20));
        *flag.lock() = true;
        queue.wake_all();
        handle.join().unwrap();
    }

    #[test]
    fn auto_reset_event_wakes_one() {
        let event = Arc::new(Event::new(true));
        event.set();
        event.wait();
        assert!(!event.is_set());
    }

    #[test]
    fn manual_reset_event_stays_set() {
        let event = Event::new(false);
        event.set();
        event.wait();
        assert!(event.is_set());
        event.reset();
        assert!(!event.is_set());
    }
}
