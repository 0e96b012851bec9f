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

//! # CONNECTION POOL
//!
//! Keeps a bounded set of already-Selected [`ResilientConnection`]s per
//! `(endpoint, mode)` key, handing them out on loan and reclaiming them on
//! drop. An idle reaper thread closes connections that have sat unused past
//! `idle_timeout`, but never below `min_idle` of them, and tops a key back up
//! to `min_idle` in the background (best-effort; a failed fill attempt just
//! leaves the key short until the next reap tick retries it).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::buffer_pool::BufferPool;
use crate::config::ResilientOptions;
use crate::connection::ConnectionMode;
use crate::error::{HsmsError, TimerKind};
use crate::health::HealthStatus;
use crate::resilient::ResilientConnection;
use crate::sync::{CancellationToken, OwnedSemaphoreGuard, Semaphore};

/// Tunables for one [`ConnectionPool`].
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct PoolOptions {
  pub min_idle: usize,
  pub max_size: usize,
  #[serde(with = "crate::config::duration_ms")]
  pub idle_timeout: Duration,
  #[serde(with = "crate::config::duration_ms")]
  pub cleanup_interval: Duration,
  #[serde(with = "crate::config::duration_ms")]
  pub acquire_timeout: Duration,
}

impl Default for PoolOptions {
  fn default() -> Self {
    Self {
      min_idle: 0,
      max_size: 10,
      idle_timeout: Duration::from_secs(5 * 60),
      cleanup_interval: Duration::from_secs(60),
      acquire_timeout: Duration::from_secs(30),
    }
  }
}

type PoolKey = (String, ConnectionMode);

struct Bucket {
  available: VecDeque<(Arc<ResilientConnection>, Instant)>,
  in_use: usize,
  /// Optimistic count of connections the filler has committed to creating
  /// for this key but hasn't yet resolved (success or failure).
  pending_fill: usize,
  semaphore: Arc<Semaphore>,
}

impl Bucket {
  fn new(max_size: usize) -> Self {
    Self {
      available: VecDeque::new(),
      in_use: 0,
      pending_fill: 0,
      semaphore: Arc::new(Semaphore::new(max_size)),
    }
  }
}

/// Keyed pool of resilient HSMS connections.
pub struct ConnectionPool {
  options: PoolOptions,
  resilient_options: ResilientOptions,
  buffers: Arc<BufferPool>,
  buckets: Mutex<HashMap<PoolKey, Bucket>>,
  shutdown: CancellationToken,
}

impl ConnectionPool {
  pub fn new(options: PoolOptions, resilient_options: ResilientOptions) -> Arc<Self> {
    let pool = Arc::new(Self {
      options,
      resilient_options,
      buffers: Arc::new(BufferPool::new()),
      buckets: Mutex::new(HashMap::new()),
      shutdown: CancellationToken::new(),
    });
    let reaper = pool.clone();
    thread::spawn(move || reaper.reap_loop());
    pool
  }

  /// Borrows a connection for `(endpoint, mode)`, reusing an idle one if one
  /// is Healthy or Degraded, otherwise establishing a new one. Blocks up to
  /// `acquire_timeout` for a semaphore slot if the key is already at
  /// `max_size`.
  pub fn get(self: &Arc<Self>, endpoint: &str, mode: ConnectionMode) -> Result<PooledConnection, HsmsError> {
    let key: PoolKey = (endpoint.to_string(), mode);
    let semaphore = {
      let mut buckets = self.buckets.lock().unwrap();
      let bucket = buckets.entry(key.clone()).or_insert_with(|| Bucket::new(self.options.max_size));
      bucket.semaphore.clone()
    };
    let cancel = CancellationToken::new();
    let permit = semaphore.acquire_owned(&cancel, self.options.acquire_timeout)?;

    let reused = {
      let mut buckets = self.buckets.lock().unwrap();
      let bucket = buckets.get_mut(&key).unwrap();
      loop {
        match bucket.available.pop_front() {
          Some((conn, _)) if matches!(conn.health(), HealthStatus::Healthy | HealthStatus::Degraded | HealthStatus::Unknown) => {
            bucket.in_use += 1;
            break Some(conn);
          }
          Some((conn, _)) => {
            conn.disconnect(); // unhealthy, don't hand it back out
            continue;
          }
          None => break None,
        }
      }
    };

    let conn = match reused {
      Some(conn) => conn,
      None => {
        let conn = ResilientConnection::new(endpoint, mode, self.resilient_options, self.buffers.clone());
        conn.connect()?;
        self.buckets.lock().unwrap().get_mut(&key).unwrap().in_use += 1;
        conn
      }
    };

    Ok(PooledConnection {
      pool: self.clone(),
      key,
      conn: Some(conn),
      permit: Some(permit),
    })
  }

  fn give_back(&self, key: &PoolKey, conn: Arc<ResilientConnection>) {
    let mut buckets = self.buckets.lock().unwrap();
    let Some(bucket) = buckets.get_mut(key) else { return };
    bucket.in_use = bucket.in_use.saturating_sub(1);
    if matches!(conn.health(), HealthStatus::Poor | HealthStatus::Critical) {
      drop(buckets);
      conn.disconnect();
      return;
    }
    bucket.available.push_back((conn, Instant::now()));
  }

  fn reap_loop(self: Arc<Self>) {
    loop {
      if self.shutdown.wait(self.options.cleanup_interval, TimerKind::ConnectionWait).is_ok() {
        return;
      }
      let mut to_close = Vec::new();
      let mut to_fill = Vec::new();
      {
        let mut buckets = self.buckets.lock().unwrap();
        for (key, bucket) in buckets.iter_mut() {
          let keep_at_least = self.options.min_idle;
          let mut kept = 0usize;
          let mut retained = VecDeque::new();
          while let Some((conn, last_used)) = bucket.available.pop_front() {
            if last_used.elapsed() > self.options.idle_timeout && kept >= keep_at_least {
              to_close.push(conn);
            } else {
              kept += 1;
              retained.push_back((conn, last_used));
            }
          }
          bucket.available = retained;

          let total = bucket.in_use + bucket.available.len() + bucket.pending_fill;
          let short = self.options.min_idle.saturating_sub(total);
          if short > 0 {
            bucket.pending_fill += short;
            to_fill.extend(std::iter::repeat(key.clone()).take(short));
          }
        }
      }
      for conn in to_close {
        conn.disconnect();
      }
      for key in to_fill {
        self.spawn_filler(key);
      }
    }
  }

  /// Establishes one connection for `key` in the background to bring
  /// `min_idle` back up after reaping. `pending_fill` was already
  /// incremented optimistically by the caller; this reconciles it once the
  /// attempt resolves one way or the other, and on failure just leaves the
  /// bucket short until the next reap tick tries again.
  fn spawn_filler(self: &Arc<Self>, key: PoolKey) {
    let pool = self.clone();
    thread::spawn(move || {
      let (endpoint, mode) = (key.0.clone(), key.1);
      let conn = ResilientConnection::new(endpoint, mode, pool.resilient_options, pool.buffers.clone());
      let connected = conn.connect().is_ok();
      let mut buckets = pool.buckets.lock().unwrap();
      let Some(bucket) = buckets.get_mut(&key) else { return };
      bucket.pending_fill = bucket.pending_fill.saturating_sub(1);
      if connected && !pool.shutdown.is_cancelled() {
        bucket.available.push_back((conn, Instant::now()));
      } else if connected {
        drop(buckets);
        conn.disconnect();
      }
    });
  }

  pub fn shutdown(&self) {
    self.shutdown.cancel();
    let mut buckets = self.buckets.lock().unwrap();
    for bucket in buckets.values_mut() {
      for (conn, _) in bucket.available.drain(..) {
        conn.disconnect();
      }
    }
  }
}

/// RAII loan from a [`ConnectionPool`]; returns the connection to its bucket
/// (or destroys it, if unhealthy) when dropped.
pub struct PooledConnection {
  pool: Arc<ConnectionPool>,
  key: PoolKey,
  conn: Option<Arc<ResilientConnection>>,
  permit: Option<OwnedSemaphoreGuard>,
}

impl std::ops::Deref for PooledConnection {
  type Target = Arc<ResilientConnection>;
  fn deref(&self) -> &Arc<ResilientConnection> {
    self.conn.as_ref().unwrap()
  }
}

impl Drop for PooledConnection {
  fn drop(&mut self) {
    self.permit = None;
    if let Some(conn) = self.conn.take() {
      self.pool.give_back(&self.key, conn);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::MessageType;
  use std::net::TcpListener as StdListener;

  fn free_port() -> u16 {
    StdListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
  }

  fn run_select_peer(addr: String) {
    thread::spawn(move || loop {
      let listener = std::net::TcpListener::bind(&addr).unwrap();
      let (mut stream, _) = listener.accept().unwrap();
      stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
      loop {
        let mut header = [0u8; 14];
        use std::io::Read;
        if Read::read_exact(&mut stream, &mut header).is_err() {
          return;
        }
        let total_length = u32::from_be_bytes(header[0..4].try_into().unwrap());
        let body_len = (total_length - 10) as usize;
        let mut body = vec![0u8; body_len];
        if body_len > 0 {
          stream.read_exact(&mut body).unwrap();
        }
        if header[8] == MessageType::SelectReq.as_u8() {
          let mut reply = [0u8; 14];
          reply[..4].copy_from_slice(&10u32.to_be_bytes());
          reply[4..6].copy_from_slice(&header[4..6]);
          reply[8] = MessageType::SelectRsp.as_u8();
          reply[10..14].copy_from_slice(&header[10..14]);
          use std::io::Write;
          stream.write_all(&reply).unwrap();
        }
      }
    });
  }

  /// Unlike `run_select_peer`, stays bound and accepts a new connection each
  /// time the previous one drops, for tests where the filler reconnects
  /// behind the caller's back.
  fn run_multi_select_peer(addr: String) {
    thread::spawn(move || {
      let listener = std::net::TcpListener::bind(&addr).unwrap();
      loop {
        let Ok((mut stream, _)) = listener.accept() else { return };
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        loop {
          let mut header = [0u8; 14];
          use std::io::Read;
          if Read::read_exact(&mut stream, &mut header).is_err() {
            break;
          }
          let total_length = u32::from_be_bytes(header[0..4].try_into().unwrap());
          let body_len = (total_length - 10) as usize;
          let mut body = vec![0u8; body_len];
          if body_len > 0 {
            stream.read_exact(&mut body).unwrap();
          }
          if header[8] == MessageType::SelectReq.as_u8() {
            let mut reply = [0u8; 14];
            reply[..4].copy_from_slice(&10u32.to_be_bytes());
            reply[4..6].copy_from_slice(&header[4..6]);
            reply[8] = MessageType::SelectRsp.as_u8();
            reply[10..14].copy_from_slice(&header[10..14]);
            use std::io::Write;
            stream.write_all(&reply).unwrap();
          }
        }
      }
    });
  }

  #[test]
  fn reaper_creates_connections_to_reach_min_idle() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    run_multi_select_peer(addr.clone());
    thread::sleep(Duration::from_millis(50));

    let options = PoolOptions {
      min_idle: 2,
      max_size: 10,
      idle_timeout: Duration::from_secs(5 * 60),
      cleanup_interval: Duration::from_millis(20),
      acquire_timeout: Duration::from_secs(5),
    };
    let pool = ConnectionPool::new(options, ResilientOptions::default());
    {
      let _conn = pool.get(&addr, ConnectionMode::Active).unwrap();
    }
    thread::sleep(Duration::from_millis(500));
    let bucket_len = pool.buckets.lock().unwrap().get(&(addr.clone(), ConnectionMode::Active)).unwrap().available.len();
    assert_eq!(bucket_len, 2);
  }

  #[test]
  fn get_then_drop_makes_connection_available_for_reuse() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    run_select_peer(addr.clone());
    thread::sleep(Duration::from_millis(50));

    let pool = ConnectionPool::new(PoolOptions::default(), ResilientOptions::default());
    {
      let _conn = pool.get(&addr, ConnectionMode::Active).unwrap();
    }
    let bucket_len = pool.buckets.lock().unwrap().get(&(addr.clone(), ConnectionMode::Active)).unwrap().available.len();
    assert_eq!(bucket_len, 1);
  }
}
