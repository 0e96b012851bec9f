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

//! Cross-module scenarios that don't fit naturally as a single module's
//! `#[cfg(test)]` unit tests: a rejected Select handshake, and a circuit
//! breaker that trips across repeated failed connect attempts against an
//! address nothing is listening on.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hsms::buffer_pool::BufferPool;
use hsms::circuit_breaker::{CircuitBreakerOptions, CircuitState};
use hsms::config::ResilientOptions;
use hsms::connection::ConnectionMode;
use hsms::error::HsmsError;
use hsms::frame::MessageType;
use hsms::resilient::ResilientConnection;
use hsms::state_machine::ConnectionState;

fn free_port() -> u16 {
  TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn run_rejecting_peer(addr: String) {
  thread::spawn(move || {
    let listener = TcpListener::bind(&addr).unwrap();
    let (mut stream, _) = listener.accept().unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut header = [0u8; 14];
    stream.read_exact(&mut header).unwrap();
    let mut reply = [0u8; 14];
    reply[..4].copy_from_slice(&10u32.to_be_bytes());
    reply[4..6].copy_from_slice(&header[4..6]);
    reply[8] = MessageType::RejectReq.as_u8();
    reply[10..14].copy_from_slice(&header[10..14]);
    stream.write_all(&reply).unwrap();
  });
}

#[test]
fn select_rejected_by_peer_surfaces_as_selection_rejected() {
  let port = free_port();
  let addr = format!("127.0.0.1:{port}");
  run_rejecting_peer(addr.clone());
  thread::sleep(Duration::from_millis(50));

  let buffers = Arc::new(BufferPool::new());
  let conn = ResilientConnection::new(addr, ConnectionMode::Active, ResilientOptions::default(), buffers);
  let err = conn.connect().unwrap_err();
  assert!(matches!(err, HsmsError::SelectionRejected));
  assert_eq!(conn.state(), ConnectionState::Error);
}

#[test]
fn circuit_opens_after_repeated_failed_connects_to_a_dead_address() {
  let port = free_port(); // bound momentarily above, now guaranteed free
  let addr = format!("127.0.0.1:{port}");

  let mut options = ResilientOptions::default();
  options.breaker = CircuitBreakerOptions {
    failure_threshold: 2,
    open_duration: Duration::from_secs(30),
    half_open_test_delay: Duration::from_millis(10),
  };
  options.connection.t5 = Duration::from_millis(200);

  let buffers = Arc::new(BufferPool::new());
  let conn = ResilientConnection::new(addr, ConnectionMode::Active, options, buffers);

  assert!(conn.connect().is_err());
  assert!(conn.connect().is_err());

  let third = conn.connect();
  assert!(matches!(third, Err(HsmsError::CircuitOpen { .. })));
}

#[test]
fn breaker_state_is_closed_before_any_failures() {
  use hsms::circuit_breaker::CircuitBreaker;
  let breaker = CircuitBreaker::new(CircuitBreakerOptions::default());
  assert_eq!(breaker.state(), CircuitState::Closed);
}
