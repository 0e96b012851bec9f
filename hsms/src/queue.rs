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

//! # PRIORITY EXECUTION QUEUE
//!
//! Dispatches submitted operations across five priority levels
//! (Critical down to Bulk, each FIFO within itself), bounding how many run
//! concurrently and retrying transient failures with exponential backoff.
//! Every dispatched attempt runs through the paired circuit breaker, which
//! records its outcome. While the breaker is HalfOpen, only a single
//! Critical operation is admitted as the probe; everything else is
//! fast-failed with `CircuitOpen` at submission time rather than left
//! queued.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::error::HsmsError;
use crate::sync::Semaphore;

/// Dispatch priority, highest first. Within one level, jobs run FIFO.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
  Critical = 0,
  High = 1,
  Normal = 2,
  Low = 3,
  Bulk = 4,
}

const LEVELS: usize = 5;

fn level_index(priority: Priority) -> usize {
  priority as usize
}

/// Tunables for one [`ExecutionQueue`].
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct QueueOptions {
  pub max_concurrent_operations: usize,
  pub max_attempts: u32,
  #[serde(with = "crate::config::duration_ms")]
  pub base_retry_delay: Duration,
}

impl Default for QueueOptions {
  fn default() -> Self {
    Self {
      max_concurrent_operations: 100,
      max_attempts: 3,
      base_retry_delay: Duration::from_millis(100),
    }
  }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Levels {
  queues: [VecDeque<Job>; LEVELS],
}

impl Levels {
  fn new() -> Self {
    Self {
      queues: Default::default(),
    }
  }

  fn pop_highest(&mut self, critical_only: bool) -> Option<Job> {
    if critical_only {
      return self.queues[level_index(Priority::Critical)].pop_front();
    }
    for q in self.queues.iter_mut() {
      if let Some(job) = q.pop_front() {
        return Some(job);
      }
    }
    None
  }

  fn is_empty(&self) -> bool {
    self.queues.iter().all(|q| q.is_empty())
  }
}

/// Multi-level FIFO dispatcher bounding concurrent work and honoring the
/// paired circuit breaker's HalfOpen single-probe rule.
pub struct ExecutionQueue {
  options: QueueOptions,
  levels: Arc<(Mutex<Levels>, Condvar)>,
  concurrency: Arc<Semaphore>,
  probe: Arc<Semaphore>,
  breaker: Arc<CircuitBreaker>,
}

impl ExecutionQueue {
  pub fn new(options: QueueOptions, breaker: Arc<CircuitBreaker>) -> Arc<Self> {
    let queue = Arc::new(Self {
      concurrency: Arc::new(Semaphore::new(options.max_concurrent_operations)),
      probe: Arc::new(Semaphore::new(1)),
      levels: Arc::new((Mutex::new(Levels::new()), Condvar::new())),
      breaker,
      options,
    });
    let dispatcher = queue.clone();
    thread::spawn(move || dispatcher.dispatch_loop());
    queue
  }

  fn dispatch_loop(self: Arc<Self>) {
    loop {
      let (lock, cvar) = &*self.levels;
      let mut levels = lock.lock().unwrap();
      while levels.is_empty() {
        levels = cvar.wait(levels).unwrap();
      }
      let critical_only = self.breaker.state() == CircuitState::HalfOpen;
      let Some(job) = levels.pop_highest(critical_only) else {
        drop(levels);
        thread::yield_now();
        continue;
      };
      drop(levels);

      if critical_only {
        match self.probe.try_acquire() {
          Some(guard) => {
            thread::spawn(move || {
              job();
              drop(guard);
            });
          }
          None => {
            // The single probe slot is taken; put the job back and wait for
            // the breaker to resolve one way or the other.
            self.levels.0.lock().unwrap().queues[level_index(Priority::Critical)].push_front(job);
            thread::sleep(Duration::from_millis(20));
          }
        }
        continue;
      }

      let concurrency = self.concurrency.clone();
      thread::spawn(move || {
        // The semaphore permit is acquired here, on the worker thread, so a
        // slow job never blocks the dispatcher from examining the next one.
        let cancel = crate::sync::CancellationToken::new();
        if let Ok(guard) = concurrency.acquire(&cancel, Duration::from_secs(60)) {
          job();
          drop(guard);
        }
      });
    }
  }

  /// Enqueues `op` at `priority` and blocks the caller until it has run
  /// (possibly several times, on transient failure) or exhausted its
  /// retry budget. Every attempt runs through the paired breaker, so its
  /// success/failure counters stay current. While the breaker is HalfOpen,
  /// only `Priority::Critical` is admitted as the probe; anything else is
  /// fast-failed with `CircuitOpen` rather than sitting queued.
  pub fn submit<T, F>(&self, priority: Priority, op: F) -> Result<T, HsmsError>
  where
    T: Send + 'static,
    F: Fn() -> Result<T, HsmsError> + Send + 'static,
  {
    if priority != Priority::Critical && self.breaker.state() == CircuitState::HalfOpen {
      return Err(HsmsError::CircuitOpen { retry_after: self.breaker.retry_after() });
    }

    let (result_tx, result_rx) = oneshot::channel();
    let options = self.options;
    let breaker = self.breaker.clone();
    let job: Job = Box::new(move || {
      let mut attempt = 1;
      loop {
        let outcome = breaker.execute(|| op());
        match &outcome {
          Err(err) if err.is_transient() && attempt < options.max_attempts => {
            let delay = options.base_retry_delay * 2u32.pow(attempt - 1);
            thread::sleep(delay);
            attempt += 1;
            continue;
          }
          _ => {
            let _ = result_tx.send(outcome);
            return;
          }
        }
      }
    });

    {
      let (lock, cvar) = &*self.levels;
      let mut levels = lock.lock().unwrap();
      levels.queues[level_index(priority)].push_back(job);
      cvar.notify_one();
    }

    result_rx.recv().map_err(|_| HsmsError::Canceled)?
  }
}
