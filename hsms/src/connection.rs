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

//! # RAW CONNECTION
//! **Based on SEMI E37-1109§6.3-6.5**
//!
//! The bare TCP/IP transport beneath the session layer: establishing and
//! tearing down the socket, reading exactly one frame at a time off the
//! wire, and serializing writes behind a single mutex so two threads can
//! never interleave their bytes.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::buffer_pool::BufferPool;
use crate::error::{HsmsError, TimerKind};
use crate::frame::{self, HsmsFrame, DEFAULT_MAX_FRAME_BYTES, HEADER_LEN};

/// Which side of the TCP/IP handshake this connection plays (SEMI
/// E37-1109§6.3.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionMode {
  /// Listens for and accepts an incoming connect request.
  Passive,
  /// Initiates the connect request and waits up to T5 for it to land.
  Active,
}

/// Tunable parameters for [`RawConnection::connect`] and the reader thread it
/// spawns.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionOptions {
  pub t5: Duration,
  pub t8: Duration,
  pub max_frame_bytes: u32,
}

impl Default for ConnectionOptions {
  fn default() -> Self {
    Self {
      t5: Duration::from_secs(10),
      t8: Duration::from_secs(5),
      max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
    }
  }
}

enum Socket {
  NotConnected,
  Connected(TcpStream),
}

/// One raw TCP/IP transport: connect, a background reader thread that
/// delivers decoded frames over a channel, and a mutex-serialized writer.
///
/// Mirrors the teacher's primitive `Client` almost field-for-field, but reads
/// whole HSMS frames (via [`frame::decode`]) instead of raw `Message`s, and
/// re-arms the T8 intercharacter timer per read rather than relying on the
/// socket's own read timeout to mean the same thing twice.
pub struct RawConnection {
  socket: RwLock<Socket>,
  write_lock: Mutex<()>,
  pool: Arc<BufferPool>,
}

impl RawConnection {
  pub fn new(pool: Arc<BufferPool>) -> Arc<Self> {
    Arc::new(Self {
      socket: RwLock::new(Socket::NotConnected),
      write_lock: Mutex::new(()),
      pool,
    })
  }

  pub fn is_connected(&self) -> bool {
    matches!(*self.socket.read().unwrap(), Socket::Connected(_))
  }

  /// Establishes the TCP/IP transport per `mode` and spawns the reader
  /// thread. Returns the peer's address and the channel the reader delivers
  /// decoded frames on; the channel closes when the reader thread exits,
  /// which happens on any connection-fatal error or an explicit
  /// [`RawConnection::disconnect`].
  pub fn connect(
    self: &Arc<Self>,
    entity: &str,
    mode: ConnectionMode,
    options: ConnectionOptions,
  ) -> Result<(SocketAddr, Receiver<HsmsFrame>), HsmsError> {
    if self.is_connected() {
      return Err(HsmsError::InvalidState);
    }

    let (stream, peer) = match mode {
      ConnectionMode::Passive => {
        let listener = TcpListener::bind(entity)?;
        listener.set_ttl(64).ok();
        accept_with_t5_deadline(&listener, options.t5)?
      }
      ConnectionMode::Active => {
        let addr: SocketAddr = entity
          .to_socket_addrs()?
          .next()
          .ok_or_else(|| HsmsError::Io(std::io::Error::new(ErrorKind::AddrNotAvailable, "no address resolved")))?;
        let stream = TcpStream::connect_timeout(&addr, options.t5)?;
        (stream, addr)
      }
    };

    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(options.t8))?;
    stream.set_write_timeout(Some(options.t8))?;

    *self.socket.write().unwrap() = Socket::Connected(stream.try_clone()?);

    let (tx, rx) = channel::<HsmsFrame>();
    let reader_conn = self.clone();
    thread::spawn(move || reader_conn.read_loop(stream, tx, options));

    Ok((peer, rx))
  }

  pub fn disconnect(&self) {
    if let Socket::Connected(stream) = &*self.socket.read().unwrap() {
      let _ = stream.shutdown(Shutdown::Both);
    }
    *self.socket.write().unwrap() = Socket::NotConnected;
  }

  /// Serializes `frame` and writes it whole. Concurrent callers block on
  /// `write_lock` rather than interleave partial frames on the wire.
  pub fn send(&self, frame: &HsmsFrame) -> Result<(), HsmsError> {
    let _write_guard = self.write_lock.lock().unwrap();
    let socket = self.socket.read().unwrap();
    let Socket::Connected(stream) = &*socket else {
      return Err(HsmsError::NotConnected);
    };
    let mut writer: &TcpStream = stream;
    let mut buf = self.pool.rent(frame.encoded_len());
    frame::encode(frame, &mut buf)?;
    if writer.write_all(&buf).is_err() {
      drop(buf);
      drop(socket);
      self.disconnect();
      return Err(HsmsError::Io(std::io::Error::new(ErrorKind::ConnectionAborted, "write failed, connection torn down")));
    }
    Ok(())
  }

  /// Background reader: decodes one frame at a time and forwards it, exiting
  /// (and tearing the transport down) on EOF or any connection-fatal error.
  /// A read timeout (T8 elapsing with no bytes at all) is not itself fatal —
  /// it just means the intercharacter clock had nothing to measure — but a
  /// timeout *mid-frame*, after some but not all of a header or body has
  /// arrived, is the T8 violation and is fatal.
  fn read_loop(self: Arc<Self>, stream: TcpStream, tx: Sender<HsmsFrame>, options: ConnectionOptions) {
    loop {
      if !self.is_connected() {
        return;
      }
      match read_one_frame(&stream, options.t8, options.max_frame_bytes) {
        Ok(Some(frame)) => {
          if tx.send(frame).is_err() {
            self.disconnect();
            return;
          }
        }
        Ok(None) => continue, // idle timeout between frames, not an error
        Err(_err) => {
          self.disconnect();
          return;
        }
      }
    }
  }
}

/// Accepts one connection, bounding the wait by T5 the way the Active side's
/// `connect_timeout` does. `TcpListener::accept` has no built-in deadline, so
/// this polls a non-blocking listener instead of blocking indefinitely.
fn accept_with_t5_deadline(listener: &TcpListener, t5: Duration) -> Result<(TcpStream, SocketAddr), HsmsError> {
  listener.set_nonblocking(true)?;
  let deadline = Instant::now() + t5;
  loop {
    match listener.accept() {
      Ok((stream, addr)) => {
        drain_spurious_bytes(&stream);
        stream.set_nonblocking(false)?;
        return Ok((stream, addr));
      }
      Err(err) if err.kind() == ErrorKind::WouldBlock => {
        if Instant::now() >= deadline {
          return Err(HsmsError::Timeout { which: TimerKind::T5 });
        }
        thread::sleep(Duration::from_millis(10).min(deadline.saturating_duration_since(Instant::now())));
      }
      Err(err) => return Err(HsmsError::Io(err)),
    }
  }
}

/// Drains and discards whatever bytes, if any, are already sitting in the
/// kernel receive buffer the instant the Passive side accepts — a peer that
/// opens the TCP connection and starts writing before this side calls
/// `accept` can leave spurious pre-connection noise queued. The socket is
/// still non-blocking here, so this only ever consumes what's already
/// arrived; it never waits for more.
fn drain_spurious_bytes(mut stream: &TcpStream) {
  let mut scratch = [0u8; 256];
  let mut drained = 0usize;
  loop {
    match stream.read(&mut scratch) {
      Ok(0) => break,
      Ok(n) => drained += n,
      Err(err) if err.kind() == ErrorKind::WouldBlock => break,
      Err(_) => break,
    }
  }
  if drained > 0 {
    warn!(bytes = drained, "drained spurious pre-connection bytes before starting the HSMS reader");
  }
}

/// Reads exactly one HSMS frame, treating each of the three reads (length,
/// header remainder, body) as subject to its own T8 intercharacter deadline.
/// `std::net::TcpStream`'s read timeout cannot be re-armed mid-call, so each
/// `read_exact`-equivalent loop below re-checks the deadline itself between
/// partial reads.
fn read_one_frame(stream: &TcpStream, t8: Duration, max_frame_bytes: u32) -> Result<Option<HsmsFrame>, HsmsError> {
  let mut header = [0u8; HEADER_LEN];
  match read_with_intercharacter_timeout(stream, &mut header[..4], t8, true)? {
    None => return Ok(None),
    Some(()) => {}
  }
  read_with_intercharacter_timeout(stream, &mut header[4..], t8, false)?;

  let (_frame, total_length) = frame::decode_header(&header, max_frame_bytes)?;
  let body_len = (total_length - 10) as usize;
  let mut body = vec![0u8; body_len];
  if body_len > 0 {
    read_with_intercharacter_timeout(stream, &mut body, t8, false)?;
  }
  Ok(Some(frame::decode(&header, &body, max_frame_bytes)?))
}

/// Fills `buf` completely, honoring `t8` as the maximum gap between any two
/// successive bytes. When `allow_idle_timeout` is set, a timeout with zero
/// bytes read yet is reported as `Ok(None)` (no frame was starting); any
/// timeout after partial progress is `Err(Timeout{T8})`.
fn read_with_intercharacter_timeout(
  mut stream: &TcpStream,
  buf: &mut [u8],
  t8: Duration,
  allow_idle_timeout: bool,
) -> Result<Option<()>, HsmsError> {
  let mut filled = 0;
  while filled < buf.len() {
    match stream.read(&mut buf[filled..]) {
      Ok(0) => return Err(HsmsError::EndOfStream),
      Ok(n) => filled += n,
      Err(err) if err.kind() == ErrorKind::TimedOut || err.kind() == ErrorKind::WouldBlock => {
        if filled == 0 && allow_idle_timeout {
          return Ok(None);
        }
        return Err(HsmsError::Timeout { which: TimerKind::T8 });
      }
      Err(err) => return Err(HsmsError::Io(err)),
    }
  }
  Ok(Some(()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::{CONTROL_SESSION_ID, MessageType};
  use std::net::TcpListener as StdListener;

  fn free_port() -> u16 {
    StdListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
  }

  #[test]
  fn active_and_passive_exchange_one_control_frame() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");

    let pool = Arc::new(BufferPool::new());
    let passive = RawConnection::new(pool.clone());
    let passive_addr = addr.clone();
    let passive_clone = passive.clone();
    let server = thread::spawn(move || {
      let (_, rx) = passive_clone
        .connect(&passive_addr, ConnectionMode::Passive, ConnectionOptions::default())
        .unwrap();
      rx.recv_timeout(Duration::from_secs(2)).unwrap()
    });

    thread::sleep(Duration::from_millis(50));

    let active = RawConnection::new(pool);
    let (_, _rx) = active.connect(&addr, ConnectionMode::Active, ConnectionOptions::default()).unwrap();
    let frame = HsmsFrame::control(MessageType::LinktestReq, CONTROL_SESSION_ID, 7);
    active.send(&frame).unwrap();

    let received = server.join().unwrap();
    assert_eq!(received, frame);
  }

  #[test]
  fn send_before_connect_is_not_connected() {
    let pool = Arc::new(BufferPool::new());
    let conn = RawConnection::new(pool);
    let frame = HsmsFrame::control(MessageType::LinktestReq, CONTROL_SESSION_ID, 1);
    let err = conn.send(&frame).unwrap_err();
    assert!(matches!(err, HsmsError::NotConnected));
  }

  #[test]
  fn disconnect_then_reconnect_is_allowed() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let pool = Arc::new(BufferPool::new());

    let passive = RawConnection::new(pool.clone());
    let passive_addr = addr.clone();
    let passive_clone = passive.clone();
    let server = thread::spawn(move || {
      passive_clone.connect(&passive_addr, ConnectionMode::Passive, ConnectionOptions::default()).unwrap();
    });
    thread::sleep(Duration::from_millis(50));

    let active = RawConnection::new(pool);
    active.connect(&addr, ConnectionMode::Active, ConnectionOptions::default()).unwrap();
    server.join().unwrap();
    active.disconnect();
    assert!(!active.is_connected());
  }
}
