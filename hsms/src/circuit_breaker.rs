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

//! # CIRCUIT BREAKER
//!
//! Closed/Open/HalfOpen failure isolator. The current state is stored
//! in an `atomic::Atomic<CircuitState>`, the same lock-free enum storage the
//! teacher uses for `SelectionState`, so every caller's fast-path read is a
//! single atomic load. Only an actual state *transition* takes the writer
//! lock, and only for the duration of the transition.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use atomic::Atomic;
use bytemuck::NoUninit;
use rand::Rng;

use crate::error::HsmsError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, NoUninit)]
#[repr(u8)]
pub enum CircuitState {
  Closed = 0,
  Open = 1,
  HalfOpen = 2,
}

/// Tunable thresholds for one breaker instance.
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct CircuitBreakerOptions {
  pub failure_threshold: u32,
  #[serde(with = "crate::config::duration_ms")]
  pub open_duration: Duration,
  #[serde(with = "crate::config::duration_ms")]
  pub half_open_test_delay: Duration,
}

impl Default for CircuitBreakerOptions {
  fn default() -> Self {
    Self {
      failure_threshold: 5,
      open_duration: Duration::from_secs(30),
      half_open_test_delay: Duration::from_secs(1),
    }
  }
}

struct Timestamps {
  opened_at: Option<Instant>,
  last_failure_at: Option<Instant>,
}

/// A point-in-time view of the breaker's counters, for `stats()` and
/// observability.
#[derive(Clone, Copy, Debug)]
pub struct CircuitStats {
  pub state: CircuitState,
  pub failure_count: u32,
  pub success_count: u32,
}

/// Closed/Open/HalfOpen circuit breaker guarding a single resilient
/// connection's outbound operations.
pub struct CircuitBreaker {
  options: CircuitBreakerOptions,
  state: Atomic<CircuitState>,
  failure_count: std::sync::atomic::AtomicU32,
  success_count: std::sync::atomic::AtomicU32,
  transition_lock: Mutex<Timestamps>,
}

impl CircuitBreaker {
  pub fn new(options: CircuitBreakerOptions) -> Self {
    Self {
      options,
      state: Atomic::new(CircuitState::Closed),
      failure_count: std::sync::atomic::AtomicU32::new(0),
      success_count: std::sync::atomic::AtomicU32::new(0),
      transition_lock: Mutex::new(Timestamps { opened_at: None, last_failure_at: None }),
    }
  }

  pub fn state(&self) -> CircuitState {
    self.state.load(atomic::Ordering::Acquire)
  }

  pub fn stats(&self) -> CircuitStats {
    CircuitStats {
      state: self.state(),
      failure_count: self.failure_count.load(std::sync::atomic::Ordering::Relaxed),
      success_count: self.success_count.load(std::sync::atomic::Ordering::Relaxed),
    }
  }

  /// Fast path: `true` if the breaker would currently reject an operation
  /// without running it. Does not itself attempt the HalfOpen transition —
  /// that only happens from inside [`CircuitBreaker::execute`], where the
  /// attempted operation becomes the probe.
  pub fn should_reject_fast(&self) -> bool {
    if self.state() != CircuitState::Open {
      return false;
    }
    let timestamps = self.transition_lock.lock().unwrap();
    match timestamps.opened_at {
      Some(opened_at) => opened_at.elapsed() < self.options.open_duration,
      None => false,
    }
  }

  /// Runs `op` through the breaker: fast-fails if open, otherwise executes it
  /// and records the outcome.
  pub fn execute<T>(&self, op: impl FnOnce() -> Result<T, HsmsError>) -> Result<T, HsmsError> {
    self.maybe_transition_to_half_open();
    if self.should_reject_fast() {
      let retry_after = self.retry_after();
      return Err(HsmsError::CircuitOpen { retry_after });
    }
    match op() {
      Ok(value) => {
        self.record_success();
        Ok(value)
      }
      Err(err) => {
        if err.counts_as_failure() {
          self.record_failure();
        }
        Err(err)
      }
    }
  }

  pub(crate) fn retry_after(&self) -> Duration {
    let timestamps = self.transition_lock.lock().unwrap();
    match timestamps.opened_at {
      Some(opened_at) => self.options.open_duration.saturating_sub(opened_at.elapsed()),
      None => Duration::ZERO,
    }
  }

  /// Re-checks whether enough time has elapsed in Open to move to HalfOpen.
  /// A small jittered delay spaces out concurrent callers that all observe
  /// the elapsed deadline at once, but it happens with the transition lock
  /// released so a sleeping thread never blocks every other caller's
  /// fast-path read for the length of the jitter.
  fn maybe_transition_to_half_open(&self) {
    if self.state() != CircuitState::Open {
      return;
    }
    {
      let timestamps = self.transition_lock.lock().unwrap();
      let Some(opened_at) = timestamps.opened_at else { return };
      if opened_at.elapsed() < self.options.open_duration {
        return;
      }
    }
    let jitter = rand::rng().random_range(0..self.options.half_open_test_delay.as_millis().max(1) as u64 / 4 + 1);
    std::thread::sleep(self.options.half_open_test_delay + Duration::from_millis(jitter));

    let mut timestamps = self.transition_lock.lock().unwrap();
    // Re-check under the lock: another thread may have already transitioned
    // while this one was sleeping.
    if self.state() != CircuitState::Open {
      return;
    }
    self.failure_count.store(0, std::sync::atomic::Ordering::Relaxed);
    self.success_count.store(0, std::sync::atomic::Ordering::Relaxed);
    timestamps.opened_at = None;
    self.state.store(CircuitState::HalfOpen, atomic::Ordering::Release);
  }

  pub fn record_success(&self) {
    match self.state() {
      CircuitState::HalfOpen => {
        let _guard = self.transition_lock.lock().unwrap();
        self.failure_count.store(0, std::sync::atomic::Ordering::Relaxed);
        self.success_count.store(0, std::sync::atomic::Ordering::Relaxed);
        self.state.store(CircuitState::Closed, atomic::Ordering::Release);
      }
      CircuitState::Closed => {
        self.success_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
      }
      CircuitState::Open => {}
    }
  }

  pub fn record_failure(&self) {
    match self.state() {
      CircuitState::HalfOpen => self.trip_open(),
      CircuitState::Closed => {
        let failures = self.failure_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
        let mut timestamps = self.transition_lock.lock().unwrap();
        timestamps.last_failure_at = Some(Instant::now());
        if failures >= self.options.failure_threshold {
          drop(timestamps);
          self.trip_open();
        }
      }
      CircuitState::Open => {
        let mut timestamps = self.transition_lock.lock().unwrap();
        timestamps.last_failure_at = Some(Instant::now());
      }
    }
  }

  fn trip_open(&self) {
    let mut timestamps = self.transition_lock.lock().unwrap();
    timestamps.opened_at = Some(Instant::now());
    timestamps.last_failure_at = Some(Instant::now());
    self.state.store(CircuitState::Open, atomic::Ordering::Release);
  }

  pub fn reset(&self) {
    let mut timestamps = self.transition_lock.lock().unwrap();
    self.failure_count.store(0, std::sync::atomic::Ordering::Relaxed);
    self.success_count.store(0, std::sync::atomic::Ordering::Relaxed);
    timestamps.opened_at = None;
    timestamps.last_failure_at = None;
    self.state.store(CircuitState::Closed, atomic::Ordering::Release);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread;

  fn options() -> CircuitBreakerOptions {
    CircuitBreakerOptions {
      failure_threshold: 3,
      open_duration: Duration::from_millis(100),
      half_open_test_delay: Duration::from_millis(10),
    }
  }

  #[test]
  fn opens_after_threshold_then_half_opens_then_closes() {
    let breaker = CircuitBreaker::new(options());
    for _ in 0..3 {
      let _ = breaker.execute(|| -> Result<(), HsmsError> { Err(HsmsError::Io(std::io::Error::other("boom"))) });
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let rejected = breaker.execute(|| -> Result<(), HsmsError> { Ok(()) });
    assert!(matches!(rejected, Err(HsmsError::CircuitOpen { .. })));

    thread::sleep(Duration::from_millis(130));
    let admitted = breaker.execute(|| -> Result<(), HsmsError> { Ok(()) });
    assert!(admitted.is_ok());
    assert_eq!(breaker.state(), CircuitState::Closed);
  }

  #[test]
  fn half_open_failure_reopens_immediately() {
    let breaker = CircuitBreaker::new(options());
    for _ in 0..3 {
      let _ = breaker.execute(|| -> Result<(), HsmsError> { Err(HsmsError::Io(std::io::Error::other("boom"))) });
    }
    thread::sleep(Duration::from_millis(130));
    let failed = breaker.execute(|| -> Result<(), HsmsError> { Err(HsmsError::Io(std::io::Error::other("still bad"))) });
    assert!(failed.is_err());
    assert_eq!(breaker.state(), CircuitState::Open);
  }

  #[test]
  fn circuit_open_itself_never_counts_as_a_failure() {
    let breaker = CircuitBreaker::new(options());
    for _ in 0..3 {
      let _ = breaker.execute(|| -> Result<(), HsmsError> { Err(HsmsError::Io(std::io::Error::other("boom"))) });
    }
    let stats_before = breaker.stats();
    let _ = breaker.execute(|| -> Result<(), HsmsError> { Ok(()) }); // fast-rejected
    let stats_after = breaker.stats();
    assert_eq!(stats_before.failure_count, stats_after.failure_count);
  }

  #[test]
  fn reset_clears_all_counters_and_state() {
    let breaker = CircuitBreaker::new(options());
    for _ in 0..3 {
      let _ = breaker.execute(|| -> Result<(), HsmsError> { Err(HsmsError::Io(std::io::Error::other("boom"))) });
    }
    breaker.reset();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.stats().failure_count, 0);
  }
}
