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

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hsms::buffer_pool::BufferPool;
use hsms::config::ResilientOptions;
use hsms::connection::ConnectionMode;
use hsms::frame::{HsmsFrame, MessageType};
use hsms::resilient::ResilientConnection;

fn main() {
  tracing_subscriber::fmt::init();

  let buffers = Arc::new(BufferPool::new());
  let client = ResilientConnection::new("127.0.0.1:5000", ConnectionMode::Active, ResilientOptions::default(), buffers);

  client.subscribe_state(|change| {
    tracing::info!(from = ?change.from, to = ?change.to, event = ?change.event, "conn.state");
  });
  client.on_frame.subscribe(|frame: &HsmsFrame| {
    tracing::info!(stream = frame.stream, function = frame.function, "conn.recv");
  });

  client.connect().expect("initial connect failed");

  let tx_client = client.clone();
  let tx_thread = thread::spawn(move || loop {
    thread::sleep(Duration::from_secs(5));
    // S1F1 "are you there" equivalent, sent opaquely: this crate carries no
    // SECS-II item encoder, so the body is whatever bytes the application
    // layer hands it.
    let request = HsmsFrame {
      session_id: 0,
      stream: 1,
      function: 1,
      message_type: MessageType::DataMessage,
      system_bytes: 0,
      data: None,
    };
    match tx_client.request(request) {
      Ok(reply) => tracing::info!(stream = reply.stream, function = reply.function, "conn.request.reply"),
      Err(err) => {
        tracing::warn!(error = %err, "conn.request.failed");
        break;
      }
    }
  });

  tx_thread.join().unwrap();
}
