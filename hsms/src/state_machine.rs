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

//! # CONNECTION STATE MACHINE
//!
//! The named states and events the session moves through, with a single
//! authoritative transition table. `ConnectionState` is stored the same way
//! [`crate::circuit_breaker::CircuitState`] is: an `atomic::Atomic` for
//! lock-free reads, with an exclusive transition lock guarding the actual
//! move plus the `retry_count` it's coupled to.

use std::sync::Mutex;

use atomic::Atomic;
use bytemuck::NoUninit;

use crate::sync::EventBus;

/// Named connection states. `Selected` is a refinement of `Connected`
/// reached only via a successful Select handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, NoUninit)]
#[repr(u8)]
pub enum ConnectionState {
  NotConnected = 0,
  Connecting = 1,
  Connected = 2,
  Selected = 3,
  Disconnecting = 4,
  WaitingRetry = 5,
  Error = 6,
}

/// Named transition triggers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
  Connect,
  Connected,
  ConnectFailed,
  Cancel,
  Select,
  Deselect,
  Disconnect,
  ConnectionLost,
  Error,
  Reconnect,
  Reset,
  Disconnected,
}

/// Emitted on every accepted transition, for the supervisor's `on_state`
/// listeners and the `conn.state` tracing event.
#[derive(Clone, Copy, Debug)]
pub struct StateChange {
  pub from: ConnectionState,
  pub to: ConnectionState,
  pub event: Event,
}

/// How many consecutive connect failures are tolerated before the machine
/// gives up and moves to `Error` instead of `WaitingRetry`.
const DEFAULT_MAX_RETRIES: u32 = 3;

struct Guarded {
  retry_count: u32,
  max_retries: u32,
}

/// Drives [`ConnectionState`] transitions for one connection and publishes
/// [`StateChange`] events on every accepted move.
pub struct StateMachine {
  state: Atomic<ConnectionState>,
  guarded: Mutex<Guarded>,
  pub on_state: EventBus<StateChange>,
}

impl Default for StateMachine {
  fn default() -> Self {
    Self::new(DEFAULT_MAX_RETRIES)
  }
}

impl StateMachine {
  pub fn new(max_retries: u32) -> Self {
    Self {
      state: Atomic::new(ConnectionState::NotConnected),
      guarded: Mutex::new(Guarded { retry_count: 0, max_retries }),
      on_state: EventBus::new(),
    }
  }

  pub fn state(&self) -> ConnectionState {
    self.state.load(atomic::Ordering::Acquire)
  }

  pub fn retry_count(&self) -> u32 {
    self.guarded.lock().unwrap().retry_count
  }

  /// Attempts `event` against the current state. Returns the resulting state
  /// on success, or the unchanged current state (no-op, no event published)
  /// if `event` is not legal from here.
  pub fn apply(&self, event: Event) -> ConnectionState {
    let mut guarded = self.guarded.lock().unwrap();
    let from = self.state();
    let Some(to) = next_state(from, event, &guarded) else {
      return from;
    };

    match event {
      Event::Connect => guarded.retry_count = 0,
      Event::ConnectFailed | Event::ConnectionLost => guarded.retry_count += 1,
      Event::Connected | Event::Reset => guarded.retry_count = 0,
      _ => {}
    }

    self.state.store(to, atomic::Ordering::Release);
    drop(guarded);
    self.on_state.publish(&StateChange { from, to, event });
    to
  }
}

/// The transition table itself, isolated from locking/publishing so
/// it can be read and audited as a flat decision table.
fn next_state(from: ConnectionState, event: Event, guarded: &Guarded) -> Option<ConnectionState> {
  use ConnectionState::*;
  use Event::*;

  match (from, event) {
    (NotConnected, Connect) => Some(Connecting),

    (Connecting, Connected) => Some(ConnectionState::Connected),
    (Connecting, ConnectFailed) => {
      if guarded.retry_count + 1 >= guarded.max_retries {
        Some(Error)
      } else {
        Some(WaitingRetry)
      }
    }
    (Connecting, Cancel) => Some(NotConnected),

    (ConnectionState::Connected, Select) => Some(Selected),
    (ConnectionState::Connected, Disconnect) => Some(Disconnecting),
    (ConnectionState::Connected, ConnectionLost) => Some(ConnectionState::Error),
    (ConnectionState::Connected, Error) => Some(ConnectionState::Error),

    (Selected, Deselect) => Some(ConnectionState::Connected),
    (Selected, Disconnect) => Some(Disconnecting),
    (Selected, ConnectionLost) => Some(ConnectionState::Error),
    (Selected, Error) => Some(ConnectionState::Error),

    (Disconnecting, Disconnected) => Some(NotConnected),

    (WaitingRetry, Reconnect) => Some(Connecting),
    (WaitingRetry, Disconnect) => Some(NotConnected),

    (ConnectionState::Error, Reconnect) => Some(Connecting),
    (ConnectionState::Error, Reset) => Some(NotConnected),

    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn happy_path_connect_select_deselect_disconnect() {
    let sm = StateMachine::default();
    assert_eq!(sm.apply(Event::Connect), ConnectionState::Connecting);
    assert_eq!(sm.apply(Event::Connected), ConnectionState::Connected);
    assert_eq!(sm.apply(Event::Select), ConnectionState::Selected);
    assert_eq!(sm.apply(Event::Deselect), ConnectionState::Connected);
    assert_eq!(sm.apply(Event::Disconnect), ConnectionState::Disconnecting);
    assert_eq!(sm.apply(Event::Disconnected), ConnectionState::NotConnected);
  }

  #[test]
  fn illegal_event_is_a_no_op() {
    let sm = StateMachine::default();
    assert_eq!(sm.apply(Event::Select), ConnectionState::NotConnected);
  }

  #[test]
  fn retries_exhaust_into_error_instead_of_waiting_retry() {
    let sm = StateMachine::new(2);
    sm.apply(Event::Connect);
    assert_eq!(sm.apply(Event::ConnectFailed), ConnectionState::WaitingRetry);
    sm.apply(Event::Reconnect);
    assert_eq!(sm.apply(Event::ConnectFailed), ConnectionState::Error);
  }

  #[test]
  fn successful_connect_resets_retry_count() {
    let sm = StateMachine::new(3);
    sm.apply(Event::Connect);
    sm.apply(Event::ConnectFailed);
    sm.apply(Event::Reconnect);
    sm.apply(Event::Connected);
    assert_eq!(sm.retry_count(), 0);
  }

  #[test]
  fn state_change_is_published_with_from_to_and_event() {
    let sm = StateMachine::default();
    let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    sm.on_state.subscribe(move |change: &StateChange| {
      seen2.lock().unwrap().push((change.from, change.to));
    });
    sm.apply(Event::Connect);
    let recorded = seen.lock().unwrap();
    assert_eq!(recorded[0], (ConnectionState::NotConnected, ConnectionState::Connecting));
  }

  #[test]
  fn connection_lost_from_selected_goes_to_error_not_waiting_retry() {
    let sm = StateMachine::default();
    sm.apply(Event::Connect);
    sm.apply(Event::Connected);
    sm.apply(Event::Select);
    assert_eq!(sm.apply(Event::ConnectionLost), ConnectionState::Error);
  }

  #[test]
  fn error_recovers_via_reconnect() {
    let sm = StateMachine::default();
    sm.apply(Event::Connect);
    sm.apply(Event::Connected);
    sm.apply(Event::Select);
    sm.apply(Event::ConnectionLost);
    assert_eq!(sm.state(), ConnectionState::Error);
    assert_eq!(sm.apply(Event::Reconnect), ConnectionState::Connecting);
  }

  #[test]
  fn reset_returns_error_to_not_connected() {
    let sm = StateMachine::default();
    sm.apply(Event::Connect);
    sm.apply(Event::Connected);
    sm.apply(Event::Error);
    assert_eq!(sm.state(), ConnectionState::Error);
    assert_eq!(sm.apply(Event::Reset), ConnectionState::NotConnected);
  }

  #[test]
  fn no_op_transition_publishes_nothing() {
    let sm = StateMachine::default();
    let count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let count2 = count.clone();
    sm.on_state.subscribe(move |_: &StateChange| {
      count2.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    });
    sm.apply(Event::Deselect); // illegal from NotConnected
    assert_eq!(count.load(std::sync::atomic::Ordering::Relaxed), 0);
  }
}
