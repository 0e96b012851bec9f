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

//! # HEALTH MONITOR
//!
//! Rolling success/failure tally over a capped ring of recent outcomes,
//! collapsed into a coarse [`HealthStatus`] a supervisor or pool can act on
//! without inspecting raw counters.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use atomic::Atomic;
use bytemuck::NoUninit;

const RING_CAPACITY: usize = 100;
const FORCE_CRITICAL_AFTER: Duration = Duration::from_secs(5 * 60);

/// Coarse health classification, derived from the rolling success rate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, NoUninit)]
#[repr(u8)]
pub enum HealthStatus {
  Unknown = 0,
  Healthy = 1,
  Degraded = 2,
  Poor = 3,
  Critical = 4,
}

#[derive(Clone, Copy)]
enum Outcome {
  Success,
  Failure,
}

struct Counters {
  success_count: u64,
  failure_count: u64,
  last_success_at: Option<Instant>,
  last_failure_at: Option<Instant>,
  recent_events: VecDeque<Outcome>,
}

impl Default for Counters {
  fn default() -> Self {
    Self {
      success_count: 0,
      failure_count: 0,
      last_success_at: None,
      last_failure_at: None,
      recent_events: VecDeque::with_capacity(RING_CAPACITY),
    }
  }
}

/// A point-in-time snapshot of the rolling counters, cheap to clone and hand
/// to an `on_health` listener.
#[derive(Clone, Copy, Debug)]
pub struct HealthSnapshot {
  pub success_count: u64,
  pub failure_count: u64,
  pub success_rate: f64,
  pub status: HealthStatus,
}

/// Tracks recent operation outcomes for one connection and derives a
/// [`HealthStatus`] from them.
pub struct HealthMonitor {
  status: Atomic<HealthStatus>,
  counters: Mutex<Counters>,
}

impl Default for HealthMonitor {
  fn default() -> Self {
    Self::new()
  }
}

impl HealthMonitor {
  pub fn new() -> Self {
    Self {
      status: Atomic::new(HealthStatus::Unknown),
      counters: Mutex::new(Counters::default()),
    }
  }

  pub fn status(&self) -> HealthStatus {
    self.status.load(atomic::Ordering::Relaxed)
  }

  /// Records a success, recomputes status, and reports `Some(new_status)` if
  /// and only if the status actually changed.
  pub fn record_success(&self) -> Option<HealthStatus> {
    let mut counters = self.counters.lock().unwrap();
    counters.success_count += 1;
    counters.last_success_at = Some(Instant::now());
    push_event(&mut counters.recent_events, Outcome::Success);
    self.recompute(&counters)
  }

  pub fn record_failure(&self) -> Option<HealthStatus> {
    let mut counters = self.counters.lock().unwrap();
    counters.failure_count += 1;
    counters.last_failure_at = Some(Instant::now());
    push_event(&mut counters.recent_events, Outcome::Failure);
    self.recompute(&counters)
  }

  pub fn snapshot(&self) -> HealthSnapshot {
    let counters = self.counters.lock().unwrap();
    HealthSnapshot {
      success_count: counters.success_count,
      failure_count: counters.failure_count,
      success_rate: rolling_success_rate(&counters.recent_events),
      status: self.status(),
    }
  }

  fn recompute(&self, counters: &Counters) -> Option<HealthStatus> {
    let mut status = classify(rolling_success_rate(&counters.recent_events));
    if let Some(last_success) = counters.last_success_at {
      if last_success.elapsed() > FORCE_CRITICAL_AFTER {
        status = HealthStatus::Critical;
      }
    } else if counters.failure_count > 0 {
      // Never succeeded and has at least one failure: treat silence since
      // the dawn of the connection the same as silence since last success.
      status = HealthStatus::Critical;
    }
    let previous = self.status.swap(status, atomic::Ordering::Relaxed);
    if previous != status {
      Some(status)
    } else {
      None
    }
  }
}

/// Success rate over the ring's current contents, i.e. the most recent
/// `RING_CAPACITY` events — not the connection's all-time totals, which
/// `success_count`/`failure_count` track separately for observability.
fn rolling_success_rate(ring: &VecDeque<Outcome>) -> f64 {
  if ring.is_empty() {
    return 1.0;
  }
  let successes = ring.iter().filter(|o| matches!(o, Outcome::Success)).count();
  successes as f64 / ring.len() as f64
}

fn classify(rate: f64) -> HealthStatus {
  if rate > 0.95 {
    HealthStatus::Healthy
  } else if rate > 0.80 {
    HealthStatus::Degraded
  } else if rate > 0.50 {
    HealthStatus::Poor
  } else {
    HealthStatus::Critical
  }
}

fn push_event(ring: &mut VecDeque<Outcome>, event: Outcome) {
  if ring.len() == RING_CAPACITY {
    ring.pop_front();
  }
  ring.push_back(event);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unknown_until_first_event() {
    let monitor = HealthMonitor::new();
    assert_eq!(monitor.status(), HealthStatus::Unknown);
  }

  #[test]
  fn all_successes_is_healthy() {
    let monitor = HealthMonitor::new();
    for _ in 0..10 {
      monitor.record_success();
    }
    assert_eq!(monitor.status(), HealthStatus::Healthy);
  }

  #[test]
  fn majority_failures_is_critical() {
    let monitor = HealthMonitor::new();
    monitor.record_success();
    for _ in 0..9 {
      monitor.record_failure();
    }
    assert_eq!(monitor.status(), HealthStatus::Critical);
  }

  #[test]
  fn emits_only_on_actual_change() {
    let monitor = HealthMonitor::new();
    assert!(monitor.record_success().is_some(), "Unknown -> Healthy is a change");
    assert!(monitor.record_success().is_none(), "still Healthy, no change");
  }

  #[test]
  fn ring_buffer_caps_at_100_events() {
    let monitor = HealthMonitor::new();
    for _ in 0..250 {
      monitor.record_success();
    }
    let counters = monitor.counters.lock().unwrap();
    assert_eq!(counters.recent_events.len(), RING_CAPACITY);
  }
}
