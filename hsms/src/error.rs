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

//! # ERROR TAXONOMY
//!
//! The full set of failures this crate can report, expressed as one
//! exhaustive [`HsmsError`] rather than a family of ad-hoc string errors.
//!
//! [HsmsError]: HsmsError

use std::time::Duration;
use thiserror::Error;

/// Identifies which SEMI timer expired when an operation reports
/// [`HsmsError::Timeout`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
  /// Reply timeout for a Data Message transaction.
  T3,
  /// Connect-separation timeout bounding one connect attempt.
  T5,
  /// Control-transaction timeout bounding Select/Deselect/Linktest.
  T6,
  /// Not-selected timeout: Connected must reach Selected before this fires.
  T7,
  /// Intercharacter timeout between successive bytes of one frame.
  T8,
  /// Waiting for a pooled connection to become available.
  ConnectionWait,
}

impl std::fmt::Display for TimerKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      TimerKind::T3 => "T3",
      TimerKind::T5 => "T5",
      TimerKind::T6 => "T6",
      TimerKind::T7 => "T7",
      TimerKind::T8 => "T8",
      TimerKind::ConnectionWait => "ConnectionWait",
    };
    f.write_str(name)
  }
}

/// Every failure mode this transport can surface to a caller.
#[derive(Error, Debug)]
pub enum HsmsError {
  /// The operation requires `Connected` or `Selected` and the connection is
  /// in neither.
  #[error("not connected")]
  NotConnected,

  /// The requested transition is not legal from the current state, e.g.
  /// SELECT while not `Connected`.
  #[error("invalid state transition")]
  InvalidState,

  /// A SEMI timer elapsed before the bounded operation completed.
  #[error("timeout waiting on {which}")]
  Timeout {
    which: TimerKind,
  },

  /// A decoded header failed a length or enum-range check.
  #[error("malformed frame: {reason}")]
  MalformedFrame {
    reason: &'static str,
  },

  /// A decoded `total_length` exceeded the configured `max_frame_bytes`.
  #[error("frame of {declared} bytes exceeds max_frame_bytes ({max})")]
  FrameTooLarge {
    declared: u32,
    max: u32,
  },

  /// The caller-supplied encode destination was smaller than the frame.
  #[error("buffer too small: need {needed} bytes, have {available}")]
  BufferTooSmall {
    needed: usize,
    available: usize,
  },

  /// The peer closed the socket mid-read.
  #[error("peer closed the connection")]
  EndOfStream,

  /// A socket-level I/O error.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  /// The operation was cancelled by its caller; never retried.
  #[error("operation canceled")]
  Canceled,

  /// The circuit breaker's fast path rejected the operation.
  #[error("circuit open, retry after {retry_after:?}")]
  CircuitOpen {
    retry_after: Duration,
  },

  /// A Select attempt was answered with `RejectReq`.
  #[error("selection rejected by remote entity")]
  SelectionRejected,

  /// The connection pool could not produce a connection before its
  /// `connection_timeout` elapsed.
  #[error("pool exhausted")]
  PoolExhausted,
}

impl HsmsError {
  /// Transient failures (the ones a retry has a real chance of curing) are
  /// eligible for the retry policy; everything else is surfaced immediately.
  pub fn is_transient(&self) -> bool {
    matches!(self, HsmsError::Timeout { .. } | HsmsError::Io(_))
  }

  /// Connection-fatal failures trigger the supervisor's link-lost signal.
  pub fn is_connection_fatal(&self) -> bool {
    matches!(
      self,
      HsmsError::Io(_) | HsmsError::EndOfStream | HsmsError::MalformedFrame { .. } | HsmsError::FrameTooLarge { .. }
    )
  }

  /// Whether the circuit breaker should count this as a failure. `CircuitOpen`
  /// itself never counts, and neither does a caller-initiated cancellation.
  pub fn counts_as_failure(&self) -> bool {
    !matches!(self, HsmsError::CircuitOpen { .. } | HsmsError::Canceled)
  }
}

pub type Result<T> = std::result::Result<T, HsmsError>;
