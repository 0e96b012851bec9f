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

//! # HSMS
//! **High-Speed SECS Message Services, based on SEMI E37-1109**
//!
//! A resilient transport for the HSMS wire protocol: frame codec, raw TCP
//! connection, Select-aware session state machine, circuit breaker, health
//! monitor, priority execution queue, and a pooled, self-healing
//! [`ResilientConnection`](resilient::ResilientConnection) built on top of
//! all of them.
//!
//! This crate carries no opinion about what's inside a Data Message body —
//! SECS-II item encoding, GEM state models, and everything above the
//! transport layer are out of scope. What it guarantees is getting bytes to
//! and from a Selected peer, correctly framed, with the session kept alive
//! and automatically recovered across transient failures.
//!
//! ## Layers
//!
//! - [`frame`] — wire codec
//! - [`buffer_pool`] — scratch-buffer reuse
//! - [`connection`] — raw TCP/IP transport
//! - [`state_machine`] — named connection states and transitions
//! - [`circuit_breaker`] — failure isolation
//! - [`health`] — rolling health classification
//! - [`resilient`] — the supervisor applications actually use
//! - [`queue`] — bounded, prioritized dispatch
//! - [`pool`] — keyed connection reuse
//! - [`config`] — `serde`-capable option bags for every layer above
//! - [`sync`] — shared concurrency primitives
//! - [`error`] — the crate's [`HsmsError`](error::HsmsError) taxonomy

pub mod buffer_pool;
pub mod circuit_breaker;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod health;
pub mod pool;
pub mod queue;
pub mod resilient;
pub mod state_machine;
pub mod sync;

pub use error::{HsmsError, Result};
pub use frame::{HsmsFrame, MessageType};
pub use resilient::ResilientConnection;
