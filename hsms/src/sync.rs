// Copyright © 2024 Nathaniel Hardesty
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the “Software”), to
// deal in the Software without restriction, including without limitation the
// rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
// sell copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
// IN THE SOFTWARE.

//! # CONCURRENCY PRIMITIVES
//!
//! Small building blocks shared by every layer above the raw connection:
//! a cooperative [`CancellationToken`], a counting [`Semaphore`], and a typed
//! [`EventBus`] for listener registration (an explicit subscribe/unsubscribe
//! token in place of an ad-hoc callback list).
//!
//! None of these wrap an async runtime: this crate's concurrency substrate is
//! OS threads plus `std::sync`, the same substrate its wire-protocol layer
//! already uses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{HsmsError, TimerKind};

/// A cooperative, one-shot cancellation signal shared across threads.
///
/// Cloning shares the same underlying flag: every clone observes the same
/// cancellation. There is no way to "un-cancel" a token.
#[derive(Clone)]
pub struct CancellationToken {
  inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Default for CancellationToken {
  fn default() -> Self {
    Self::new()
  }
}

impl CancellationToken {
  pub fn new() -> Self {
    Self {
      inner: Arc::new((Mutex::new(false), Condvar::new())),
    }
  }

  pub fn cancel(&self) {
    let (lock, cvar) = &*self.inner;
    let mut cancelled = lock.lock().unwrap();
    if !*cancelled {
      *cancelled = true;
      cvar.notify_all();
    }
  }

  pub fn is_cancelled(&self) -> bool {
    *self.inner.0.lock().unwrap()
  }

  /// Blocks the calling thread until either `timeout` elapses or the token is
  /// cancelled. Returns `Err(Canceled)` if cancellation won the race,
  /// `Err(Timeout{which})` if the deadline elapsed first.
  pub fn wait(&self, timeout: Duration, which: TimerKind) -> Result<(), HsmsError> {
    let (lock, cvar) = &*self.inner;
    let guard = lock.lock().unwrap();
    if *guard {
      return Err(HsmsError::Canceled);
    }
    let (guard, result) = cvar.wait_timeout_while(guard, timeout, |cancelled| !*cancelled).unwrap();
    if *guard {
      Err(HsmsError::Canceled)
    } else if result.timed_out() {
      Err(HsmsError::Timeout { which })
    } else {
      // Spurious wake with neither condition true cannot happen because
      // wait_timeout_while only returns when the predicate is false or the
      // deadline elapsed.
      Ok(())
    }
  }
}

/// A classic counting semaphore built on `Mutex` + `Condvar`, the same
/// pairing used throughout this crate's blocking sections.
pub struct Semaphore {
  state: Mutex<usize>,
  cvar: Condvar,
}

impl Semaphore {
  pub fn new(permits: usize) -> Self {
    Self {
      state: Mutex::new(permits),
      cvar: Condvar::new(),
    }
  }

  /// Blocks until a permit is free or `deadline` passes or `cancel` fires.
  pub fn acquire(&self, cancel: &CancellationToken, timeout: Duration) -> Result<SemaphoreGuard<'_>, HsmsError> {
    let deadline = Instant::now() + timeout;
    let mut guard = self.state.lock().unwrap();
    loop {
      if *guard > 0 {
        *guard -= 1;
        return Ok(SemaphoreGuard { sem: self });
      }
      if cancel.is_cancelled() {
        return Err(HsmsError::Canceled);
      }
      let remaining = deadline.saturating_duration_since(Instant::now());
      if remaining.is_zero() {
        return Err(HsmsError::Timeout { which: TimerKind::ConnectionWait });
      }
      let (next_guard, timeout_result) = self.cvar.wait_timeout(guard, remaining.min(Duration::from_millis(100))).unwrap();
      guard = next_guard;
      let _ = timeout_result;
    }
  }

  /// Non-blocking attempt to take a single permit, used by the priority
  /// queue's half-open probe slot.
  pub fn try_acquire(&self) -> Option<SemaphoreGuard<'_>> {
    let mut guard = self.state.lock().unwrap();
    if *guard > 0 {
      *guard -= 1;
      Some(SemaphoreGuard { sem: self })
    } else {
      None
    }
  }

  /// Like [`Semaphore::acquire`], but the returned guard owns an `Arc` clone
  /// of the semaphore instead of borrowing it, so it can live inside a
  /// struct (e.g. a pool's per-loan guard) without tying that struct to the
  /// semaphore's lifetime.
  pub fn acquire_owned(self: &Arc<Self>, cancel: &CancellationToken, timeout: Duration) -> Result<OwnedSemaphoreGuard, HsmsError> {
    let _guard = self.acquire(cancel, timeout)?;
    std::mem::forget(_guard);
    Ok(OwnedSemaphoreGuard { sem: self.clone() })
  }

  fn release(&self) {
    let mut guard = self.state.lock().unwrap();
    *guard += 1;
    self.cvar.notify_one();
  }
}

/// RAII permit; releases back to the semaphore on drop.
pub struct SemaphoreGuard<'a> {
  sem: &'a Semaphore,
}

/// An `Arc`-owning counterpart to [`SemaphoreGuard`], for callers that need
/// the permit to outlive a borrow of the semaphore itself.
pub struct OwnedSemaphoreGuard {
  sem: Arc<Semaphore>,
}

impl Drop for OwnedSemaphoreGuard {
  fn drop(&mut self) {
    self.sem.release();
  }
}

impl Drop for SemaphoreGuard<'_> {
  fn drop(&mut self) {
    self.sem.release();
  }
}

/// Opaque handle returned by [`EventBus::subscribe`], used to
/// [`EventBus::unsubscribe`] later. Replaces a global callback list with
/// explicit, revocable registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A minimal typed publish/subscribe bus. Dispatch happens synchronously on
/// the publishing thread; listeners must not call back into the bus that is
/// currently dispatching to them (non-reentrant).
pub struct EventBus<T: Clone> {
  next_id: AtomicU64,
  listeners: Mutex<HashMap<u64, Box<dyn Fn(&T) + Send + Sync>>>,
}

impl<T: Clone> Default for EventBus<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: Clone> EventBus<T> {
  pub fn new() -> Self {
    Self {
      next_id: AtomicU64::new(1),
      listeners: Mutex::new(HashMap::new()),
    }
  }

  pub fn subscribe<F>(&self, listener: F) -> ListenerId
  where
    F: Fn(&T) + Send + Sync + 'static,
  {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    self.listeners.lock().unwrap().insert(id, Box::new(listener));
    ListenerId(id)
  }

  pub fn unsubscribe(&self, id: ListenerId) {
    self.listeners.lock().unwrap().remove(&id.0);
  }

  pub fn publish(&self, event: &T) {
    // Holds the lock for the duration of dispatch rather than cloning the
    // listener map first; fine as long as listeners never call back into
    // this bus from inside their callback.
    let listeners = self.listeners.lock().unwrap();
    for listener in listeners.values() {
      listener(event);
    }
  }
}
