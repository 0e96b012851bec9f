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

//! # RESILIENT CONNECTION
//! **Based on SEMI E37-1109§6-7**
//!
//! The supervisor that ties the raw transport, the session state machine,
//! the circuit breaker, the health monitor, and the priority queue together
//! into the one object application code actually holds: connect, Select,
//! send/request, a linktest heartbeat, and automatic reconnection with
//! backoff, all wrapped by the breaker so a flapping peer can't be hammered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreaker;
use crate::config::{ResilientOptions, SystemBytesWidth};
use crate::connection::{ConnectionMode, ConnectionOptions, RawConnection};
use crate::error::{HsmsError, TimerKind};
use crate::frame::{HsmsFrame, MessageType, CONTROL_SESSION_ID};
use crate::health::{HealthMonitor, HealthStatus};
use crate::queue::{ExecutionQueue, Priority};
use crate::state_machine::{ConnectionState, Event, StateChange, StateMachine};
use crate::sync::{CancellationToken, EventBus};

/// Fired whenever the reconnect loop completes a fresh Select handshake
/// after a connection was lost — distinct from the initial [`ConnectionState`]
/// transition into `Selected`, since callers often want to distinguish
/// "first connect" from "recovered".
#[derive(Clone, Copy, Debug)]
pub struct Reconnected {
  pub attempt: u32,
}

struct Outbox {
  waiters: Mutex<HashMap<u32, oneshot::Sender<HsmsFrame>>>,
  next_system_bytes: AtomicU32,
  width: SystemBytesWidth,
}

impl Outbox {
  fn new(width: SystemBytesWidth) -> Self {
    Self {
      waiters: Mutex::new(HashMap::new()),
      next_system_bytes: AtomicU32::new(1),
      width,
    }
  }

  fn next_id(&self) -> u32 {
    loop {
      let current = self.next_system_bytes.load(Ordering::Relaxed);
      let wrap = self.width.wraps_at();
      let next = if current + 1 >= wrap { 1 } else { current + 1 };
      if self.next_system_bytes.compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed).is_ok() {
        return current;
      }
    }
  }

  fn register(&self, system_bytes: u32) -> oneshot::Receiver<HsmsFrame> {
    let (tx, rx) = oneshot::channel();
    self.waiters.lock().unwrap().insert(system_bytes, tx);
    rx
  }

  fn resolve(&self, system_bytes: u32, frame: HsmsFrame) -> bool {
    if let Some(tx) = self.waiters.lock().unwrap().remove(&system_bytes) {
      let _ = tx.send(frame);
      true
    } else {
      false
    }
  }

  fn cancel(&self, system_bytes: u32) {
    self.waiters.lock().unwrap().remove(&system_bytes);
  }
}

/// The application-facing HSMS connection: Select-aware, self-healing, and
/// safe to share across threads behind an `Arc`.
pub struct ResilientConnection {
  entity: String,
  mode: ConnectionMode,
  options: ResilientOptions,
  raw: Arc<RawConnection>,
  state: Arc<StateMachine>,
  breaker: Arc<CircuitBreaker>,
  health: Arc<HealthMonitor>,
  queue: Arc<ExecutionQueue>,
  outbox: Arc<Outbox>,
  shutdown: CancellationToken,
  pub on_frame: EventBus<HsmsFrame>,
  pub on_health: EventBus<HealthStatus>,
  pub on_error: EventBus<String>,
  pub on_reconnected: EventBus<Reconnected>,
}

impl ResilientConnection {
  pub fn new(entity: impl Into<String>, mode: ConnectionMode, options: ResilientOptions, buffers: Arc<crate::buffer_pool::BufferPool>) -> Arc<Self> {
    let breaker = Arc::new(CircuitBreaker::new(options.breaker));
    let conn = Arc::new(Self {
      entity: entity.into(),
      mode,
      options,
      raw: RawConnection::new(buffers),
      state: Arc::new(StateMachine::new(options.reconnect.max_retries)),
      breaker: breaker.clone(),
      health: Arc::new(HealthMonitor::new()),
      queue: ExecutionQueue::new(options.queue, breaker),
      outbox: Arc::new(Outbox::new(SystemBytesWidth::default())),
      shutdown: CancellationToken::new(),
      on_frame: EventBus::new(),
      on_health: EventBus::new(),
      on_error: EventBus::new(),
      on_reconnected: EventBus::new(),
    });
    conn
  }

  pub fn state(&self) -> ConnectionState {
    self.state.state()
  }

  pub fn health(&self) -> HealthStatus {
    self.health.status()
  }

  /// Connects, performs the Select handshake, and starts the linktest and
  /// reconnect-supervisor background threads. Blocks until Selected or the
  /// connect attempt definitively fails.
  pub fn connect(self: &Arc<Self>) -> Result<(), HsmsError> {
    self.state.apply(Event::Connect);
    self.establish_and_select(1)?;

    let linktest_conn = self.clone();
    thread::spawn(move || linktest_conn.linktest_loop());

    let supervisor_conn = self.clone();
    thread::spawn(move || supervisor_conn.supervise_loop());

    Ok(())
  }

  fn establish_and_select(self: &Arc<Self>, attempt: u32) -> Result<(), HsmsError> {
    let connect_options = ConnectionOptions::from(self.options.connection);
    let connect_result = self.breaker.execute(|| {
      let (_, rx) = self.raw.connect(&self.entity, self.mode, connect_options)?;
      self.spawn_frame_router(rx);
      Ok(())
    });

    match connect_result {
      Ok(()) => {}
      Err(err) => {
        self.state.apply(Event::ConnectFailed);
        self.health.record_failure();
        return Err(err);
      }
    }
    self.state.apply(Event::Connected);

    let select_result = self.select_handshake();
    match &select_result {
      Ok(()) => {
        self.state.apply(Event::Select);
        self.health.record_success();
        if attempt > 1 {
          self.on_reconnected.publish(&Reconnected { attempt });
        }
      }
      Err(_) => {
        self.health.record_failure();
        self.raw.disconnect();
        self.state.apply(Event::Error);
      }
    }
    select_result
  }

  fn spawn_frame_router(self: &Arc<Self>, rx: std::sync::mpsc::Receiver<HsmsFrame>) {
    let router_conn = self.clone();
    thread::spawn(move || {
      for frame in rx.iter() {
        router_conn.route_inbound(frame);
      }
      // Channel closed: the reader thread exited, which only happens on a
      // connection-fatal error or an explicit disconnect.
      if router_conn.state.state() == ConnectionState::Selected || router_conn.state.state() == ConnectionState::Connected {
        router_conn.state.apply(Event::ConnectionLost);
        router_conn.health.record_failure();
      }
    });
  }

  fn route_inbound(&self, frame: HsmsFrame) {
    // Control replies and DeselectReq/RejectReq always resolve a pending
    // waiter by system_bytes; a Data Message resolves one only if it is
    // answering an outstanding `request()` — otherwise it is an unsolicited
    // primary message and falls through to `on_frame`.
    if frame.message_type.is_control_reply() {
      self.outbox.resolve(frame.system_bytes, frame);
      return;
    }
    if frame.message_type == MessageType::DataMessage && self.outbox.resolve(frame.system_bytes, frame.clone()) {
      return;
    }
    match frame.message_type {
      MessageType::LinktestReq => {
        let reply = HsmsFrame::control(MessageType::LinktestRsp, CONTROL_SESSION_ID, frame.system_bytes);
        let _ = self.raw.send(&reply);
      }
      MessageType::SeparateReq => {
        self.raw.disconnect();
      }
      _ => {
        self.on_frame.publish(&frame);
      }
    }
  }

  /// Select must complete before both the control-transaction timer (T6, the
  /// wait for any single reply) and the not-selected timer (T7, the total
  /// time a freshly `Connected` peer is allowed to remain unselected) expire.
  /// This connection attempts Select immediately upon `Connected`, so in
  /// practice whichever of T6/T7 is configured shorter is the one that fires.
  fn select_handshake(&self) -> Result<(), HsmsError> {
    let system_bytes = self.outbox.next_id();
    let rx = self.outbox.register(system_bytes);
    let req = HsmsFrame::control(MessageType::SelectReq, CONTROL_SESSION_ID, system_bytes);
    if self.raw.send(&req).is_err() {
      self.outbox.cancel(system_bytes);
      return Err(HsmsError::NotConnected);
    }
    let (deadline, timer) = if self.options.session.t7 <= self.options.session.t6 {
      (self.options.session.t7, TimerKind::T7)
    } else {
      (self.options.session.t6, TimerKind::T6)
    };
    match rx.recv_timeout(deadline) {
      Ok(reply) if reply.message_type == MessageType::SelectRsp => Ok(()),
      Ok(reply) if reply.message_type == MessageType::RejectReq => Err(HsmsError::SelectionRejected),
      Ok(_) => Err(HsmsError::InvalidState),
      Err(_) => {
        self.outbox.cancel(system_bytes);
        Err(HsmsError::Timeout { which: timer })
      }
    }
  }

  /// Sends a frame with no expectation of a reply (SEMI E37-1109§7.2).
  pub fn send(&self, mut frame: HsmsFrame) -> Result<(), HsmsError> {
    if self.state.state() != ConnectionState::Selected {
      return Err(HsmsError::NotConnected);
    }
    if frame.system_bytes == 0 {
      frame.system_bytes = self.outbox.next_id();
    }
    let raw = self.raw.clone();
    self.queue.submit(Priority::Normal, move || raw.send(&frame))
  }

  /// Sends a Data Message and waits up to T3 for its correlated reply.
  pub fn request(&self, mut frame: HsmsFrame) -> Result<HsmsFrame, HsmsError> {
    if self.state.state() != ConnectionState::Selected {
      return Err(HsmsError::NotConnected);
    }
    frame.system_bytes = self.outbox.next_id();
    let system_bytes = frame.system_bytes;
    let rx = self.outbox.register(system_bytes);

    let raw = self.raw.clone();
    self.queue.submit(Priority::High, move || raw.send(&frame))?;

    match rx.recv_timeout(self.options.session.t3) {
      Ok(reply) => Ok(reply),
      Err(_) => {
        self.outbox.cancel(system_bytes);
        Err(HsmsError::Timeout { which: TimerKind::T3 })
      }
    }
  }

  fn linktest_loop(self: Arc<Self>) {
    loop {
      if self.shutdown.wait(self.options.session.linktest_interval, TimerKind::T6).is_ok() {
        return; // shutdown signaled
      }
      if self.state.state() != ConnectionState::Selected {
        continue;
      }
      let system_bytes = self.outbox.next_id();
      let rx = self.outbox.register(system_bytes);
      let req = HsmsFrame::control(MessageType::LinktestReq, CONTROL_SESSION_ID, system_bytes);
      if self.raw.send(&req).is_err() {
        self.outbox.cancel(system_bytes);
        continue;
      }
      if rx.recv_timeout(self.options.session.t6).is_err() {
        self.outbox.cancel(system_bytes);
        self.health.record_failure();
        self.raw.disconnect();
        self.state.apply(Event::ConnectionLost);
      } else {
        self.health.record_success();
      }
    }
  }

  /// Drives backed-off reconnection from either `WaitingRetry` (an initial
  /// connect attempt failed, retries not yet exhausted) or `Error` (a
  /// Selected session was lost, or Select itself failed/timed out) — both
  /// have a `Reconnect` edge to `Connecting` in the transition table.
  fn supervise_loop(self: Arc<Self>) {
    let mut attempt: u32 = 1;
    loop {
      if self.shutdown.wait(Duration::from_millis(200), TimerKind::ConnectionWait).is_ok() {
        return;
      }
      let state = self.state.state();
      if state != ConnectionState::WaitingRetry && state != ConnectionState::Error {
        continue;
      }
      attempt += 1;
      let delay = (self.options.reconnect.base_delay * 2u32.saturating_pow(attempt.saturating_sub(2))).min(self.options.reconnect.max_delay);
      if self.shutdown.wait(delay, TimerKind::ConnectionWait).is_ok() {
        return;
      }
      self.state.apply(Event::Reconnect);
      if self.establish_and_select(attempt).is_err() {
        self.on_error.publish(&format!("reconnect attempt {attempt} failed"));
      }
    }
  }

  pub fn disconnect(&self) {
    self.shutdown.cancel();
    if self.state.state() == ConnectionState::Selected {
      let system_bytes = self.outbox.next_id();
      let deselect = HsmsFrame::control(MessageType::DeselectReq, CONTROL_SESSION_ID, system_bytes);
      let _ = self.raw.send(&deselect);
    }
    // Error has no `Disconnect` edge — it leaves via `Reset` instead, same
    // destination (`NotConnected`).
    if self.state.state() == ConnectionState::Error {
      self.raw.disconnect();
      self.state.apply(Event::Reset);
      return;
    }
    self.state.apply(Event::Disconnect);
    self.raw.disconnect();
    self.state.apply(Event::Disconnected);
  }

  pub fn subscribe_state(&self, listener: impl Fn(&StateChange) + Send + Sync + 'static) {
    self.state.on_state.subscribe(listener);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::buffer_pool::BufferPool;
  use std::net::TcpListener as StdListener;

  fn free_port() -> u16 {
    StdListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
  }

  fn run_passive_echo_select_peer(addr: String) {
    thread::spawn(move || {
      let listener = std::net::TcpListener::bind(&addr).unwrap();
      let (mut stream, _) = listener.accept().unwrap();
      stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
      loop {
        let mut header = [0u8; 14];
        use std::io::Read;
        if std::io::Read::read_exact(&mut stream, &mut header).is_err() {
          return;
        }
        let total_length = u32::from_be_bytes(header[0..4].try_into().unwrap());
        let body_len = (total_length - 10) as usize;
        let mut body = vec![0u8; body_len];
        if body_len > 0 {
          stream.read_exact(&mut body).unwrap();
        }
        let message_type = header[8];
        if message_type == MessageType::SelectReq.as_u8() {
          let system_bytes = &header[10..14];
          let mut reply = [0u8; 14];
          reply[..4].copy_from_slice(&10u32.to_be_bytes());
          reply[4..6].copy_from_slice(&header[4..6]);
          reply[8] = MessageType::SelectRsp.as_u8();
          reply[10..14].copy_from_slice(system_bytes);
          use std::io::Write;
          stream.write_all(&reply).unwrap();
        }
      }
    });
  }

  #[test]
  fn connect_performs_select_and_reaches_selected_state() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    run_passive_echo_select_peer(addr.clone());
    thread::sleep(Duration::from_millis(50));

    let buffers = Arc::new(BufferPool::new());
    let conn = ResilientConnection::new(addr, ConnectionMode::Active, ResilientOptions::default(), buffers);
    conn.connect().unwrap();
    assert_eq!(conn.state(), ConnectionState::Selected);
    conn.disconnect();
  }
}
