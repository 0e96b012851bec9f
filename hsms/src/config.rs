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

//! # PARAMETER SETTINGS
//! **Based on SEMI E37-1109§10**
//!
//! Caller-facing option bags, one per layer, all deriving `serde` so a host
//! application can load them from whatever configuration format it likes.
//! Every default here matches a value named in this crate's specification.

use std::time::Duration;

use crate::buffer_pool::BufferPool;
use crate::circuit_breaker::CircuitBreakerOptions;
use crate::connection::ConnectionOptions;
use crate::frame::{CodecVariant, DEFAULT_MAX_FRAME_BYTES};
use crate::pool::PoolOptions;
use crate::queue::QueueOptions;
use std::sync::Arc;

/// Serializes a `Duration` as milliseconds; used by every options struct in
/// this crate so configuration files carry plain integers instead of nested
/// objects.
pub(crate) mod duration_ms {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    Ok(Duration::from_millis(u64::deserialize(d)?))
  }
}

/// Which wire convention this crate's codec follows; see [`CodecVariant`].
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct CodecOptions {
  pub variant: SerializableCodecVariant,
  pub max_frame_bytes: u32,
  pub system_bytes_width: SystemBytesWidth,
}

impl Default for CodecOptions {
  fn default() -> Self {
    Self {
      variant: SerializableCodecVariant(CodecVariant::Current),
      max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
      system_bytes_width: SystemBytesWidth::Sixteen,
    }
  }
}

/// Newtype so the non-`serde` [`CodecVariant`] enum can live inside a
/// `serde`-derived options struct without forcing every consumer of
/// [`CodecVariant`] itself to take on a serde dependency.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerializableCodecVariant(pub CodecVariant);

impl serde::Serialize for SerializableCodecVariant {
  fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
    match self.0 {
      CodecVariant::Current => s.serialize_str("current"),
    }
  }
}

impl<'de> serde::Deserialize<'de> for SerializableCodecVariant {
  fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
    let s = String::deserialize(d)?;
    match s.as_str() {
      "current" => Ok(Self(CodecVariant::Current)),
      other => Err(serde::de::Error::custom(format!("unknown codec variant {other:?}; only \"current\" is implemented"))),
    }
  }
}

/// The default 16-bit range `[1, 65536)` rolls over quickly for a
/// high-throughput session; `ThirtyTwo` opts into the full 32-bit range
/// SEMI E37 permits for peers that need it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SystemBytesWidth {
  #[default]
  Sixteen,
  ThirtyTwo,
}

impl SystemBytesWidth {
  pub fn wraps_at(self) -> u32 {
    match self {
      SystemBytesWidth::Sixteen => 1 << 16,
      SystemBytesWidth::ThirtyTwo => u32::MAX,
    }
  }
}

/// Select/Deselect/Linktest handshake timing.
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct SessionOptions {
  #[serde(with = "duration_ms")]
  pub t3: Duration,
  #[serde(with = "duration_ms")]
  pub t6: Duration,
  #[serde(with = "duration_ms")]
  pub t7: Duration,
  #[serde(with = "duration_ms")]
  pub linktest_interval: Duration,
}

impl Default for SessionOptions {
  fn default() -> Self {
    Self {
      t3: Duration::from_secs(45),
      t6: Duration::from_secs(5),
      t7: Duration::from_secs(10),
      linktest_interval: Duration::from_secs(30),
    }
  }
}

/// Reconnect backoff for [`crate::resilient::ResilientConnection`].
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct ReconnectOptions {
  pub max_retries: u32,
  #[serde(with = "duration_ms")]
  pub base_delay: Duration,
  #[serde(with = "duration_ms")]
  pub max_delay: Duration,
}

impl Default for ReconnectOptions {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay: Duration::from_millis(500),
      max_delay: Duration::from_secs(30),
    }
  }
}

/// The full bundle of options a [`crate::resilient::ResilientConnection`]
/// needs: its own reconnect policy plus every layer it composes.
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct ResilientOptions {
  pub connection: ConnectionOptionsSerde,
  pub session: SessionOptions,
  pub breaker: CircuitBreakerOptions,
  pub queue: QueueOptions,
  pub reconnect: ReconnectOptions,
}

impl Default for ResilientOptions {
  fn default() -> Self {
    Self {
      connection: ConnectionOptionsSerde::default(),
      session: SessionOptions::default(),
      breaker: CircuitBreakerOptions::default(),
      queue: QueueOptions::default(),
      reconnect: ReconnectOptions::default(),
    }
  }
}

/// `serde`-capable mirror of [`ConnectionOptions`] (which itself stays
/// serde-free since its fields are reused verbatim by the non-serializable
/// [`crate::connection::RawConnection`] call sites).
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct ConnectionOptionsSerde {
  #[serde(with = "duration_ms")]
  pub t5: Duration,
  #[serde(with = "duration_ms")]
  pub t8: Duration,
  pub max_frame_bytes: u32,
}

impl Default for ConnectionOptionsSerde {
  fn default() -> Self {
    let d = ConnectionOptions::default();
    Self { t5: d.t5, t8: d.t8, max_frame_bytes: d.max_frame_bytes }
  }
}

impl From<ConnectionOptionsSerde> for ConnectionOptions {
  fn from(v: ConnectionOptionsSerde) -> Self {
    Self { t5: v.t5, t8: v.t8, max_frame_bytes: v.max_frame_bytes }
  }
}

/// Everything a [`crate::pool::ConnectionPool`] needs plus the shared
/// [`BufferPool`] its members draw scratch buffers from.
pub struct PoolBundle {
  pub pool_options: PoolOptions,
  pub resilient_options: ResilientOptions,
  pub buffers: Arc<BufferPool>,
}

impl Default for PoolBundle {
  fn default() -> Self {
    Self {
      pool_options: PoolOptions::default(),
      resilient_options: ResilientOptions::default(),
      buffers: Arc::new(BufferPool::new()),
    }
  }
}
