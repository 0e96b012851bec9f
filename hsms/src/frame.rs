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

//! # FRAME CODEC
//! **Based on SEMI E37-1109§8.2.6, bit-compatible with the teacher's
//! `PrimitiveMessageHeader`.**
//!
//! Defines the [`HsmsFrame`] wire representation and the [`encode`]/[`decode`]
//! pair that turns it into and out of the 14-byte header plus payload that
//! travels over the wire. No allocation happens on the encode path; decode
//! allocates exactly once, for the returned frame's payload.

use bytemuck::{Pod, Zeroable};

use crate::error::HsmsError;

/// Size in bytes of the fixed HSMS header (4-byte length + 10-byte header
/// proper).
pub const HEADER_LEN: usize = 14;

/// Default cap on a single frame's payload, matching the teacher's practical
/// ceiling for a SECS-II message body.
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Byte 8 of the HSMS header, decoded into its named variants.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
  DataMessage = 0,
  SelectReq = 1,
  SelectRsp = 2,
  DeselectReq = 3,
  DeselectRsp = 4,
  LinktestReq = 5,
  LinktestRsp = 6,
  RejectReq = 7,
  SeparateReq = 9,
}

impl MessageType {
  pub const fn as_u8(self) -> u8 {
    self as u8
  }

  /// Whether this message type expects a reply frame that correlates by
  /// `system_bytes`.
  pub fn expects_reply(self) -> bool {
    matches!(
      self,
      MessageType::DataMessage | MessageType::SelectReq | MessageType::DeselectReq | MessageType::LinktestReq
    )
  }

  /// Whether this message type is a control reply rather than a primary
  /// request, i.e. it resolves a pending transaction instead of creating one.
  pub fn is_control_reply(self) -> bool {
    matches!(
      self,
      MessageType::SelectRsp | MessageType::DeselectRsp | MessageType::LinktestRsp | MessageType::RejectReq
    )
  }
}

impl TryFrom<u8> for MessageType {
  type Error = HsmsError;

  fn try_from(value: u8) -> Result<Self, Self::Error> {
    match value {
      0 => Ok(MessageType::DataMessage),
      1 => Ok(MessageType::SelectReq),
      2 => Ok(MessageType::SelectRsp),
      3 => Ok(MessageType::DeselectReq),
      4 => Ok(MessageType::DeselectRsp),
      5 => Ok(MessageType::LinktestReq),
      6 => Ok(MessageType::LinktestRsp),
      7 => Ok(MessageType::RejectReq),
      9 => Ok(MessageType::SeparateReq),
      _ => Err(HsmsError::MalformedFrame { reason: "unrecognized ptype/stype byte" }),
    }
  }
}

/// Which wire layout governs bytes 9-13 of the header. Only the current SEMI
/// E37 layout (byte 9 reserved, system_bytes at 10-13) is implemented; this
/// exists as a named extension point rather than a bare `Current`-only unit,
/// in case a legacy variant that folds byte 9 into `system_bytes` is ever
/// needed — see DESIGN.md.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CodecVariant {
  #[default]
  Current,
}

/// Session id reserved for HSMS control frames (Select/Deselect/Linktest),
/// per SEMI E37.
pub const CONTROL_SESSION_ID: u16 = 0xFFFF;

/// An owned, immutable HSMS message: header fields plus an optional payload.
///
/// The payload is carried as opaque bytes — this crate has no notion of
/// SECS-II item formats; the caller's (stream, function) plus `data` is the
/// entire contract with whatever consumes `DataMessage` frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HsmsFrame {
  pub session_id: u16,
  pub stream: u8,
  pub function: u8,
  pub message_type: MessageType,
  pub system_bytes: u32,
  pub data: Option<Vec<u8>>,
}

impl HsmsFrame {
  pub fn data_len(&self) -> usize {
    self.data.as_ref().map_or(0, |d| d.len())
  }

  /// Total bytes this frame will occupy on the wire, including the 4-byte
  /// length prefix.
  pub fn encoded_len(&self) -> usize {
    HEADER_LEN + self.data_len()
  }

  /// Builds a control frame (Select/Deselect/Linktest request or response,
  /// Reject, Separate) with no payload.
  pub fn control(message_type: MessageType, session_id: u16, system_bytes: u32) -> Self {
    Self {
      session_id,
      stream: 0,
      function: 0,
      message_type,
      system_bytes,
      data: None,
    }
  }
}

/// The 14-byte wire header, laid out exactly as it appears on the wire so it
/// can be read and written via a single `bytemuck` cast with no per-field
/// shuffling beyond the big-endian conversions SEMI E37 mandates.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawHeader {
  total_length: [u8; 4],
  session_id: [u8; 2],
  stream: u8,
  function: u8,
  message_type: u8,
  reserved: u8,
  system_bytes: [u8; 4],
}

/// Writes `frame` into `dst`, returning the number of bytes written
/// (`frame.encoded_len()`). `dst` must be at least that long.
///
/// No heap allocation occurs. The reserved header byte (offset 9) is always
/// written as 0, per SEMI E37.
pub fn encode(frame: &HsmsFrame, dst: &mut [u8]) -> Result<usize, HsmsError> {
  let needed = frame.encoded_len();
  if dst.len() < needed {
    return Err(HsmsError::BufferTooSmall { needed, available: dst.len() });
  }

  let total_length = (frame.data_len() as u32) + 10;
  let header = RawHeader {
    total_length: total_length.to_be_bytes(),
    session_id: frame.session_id.to_be_bytes(),
    stream: frame.stream,
    function: frame.function,
    message_type: frame.message_type.as_u8(),
    reserved: 0,
    system_bytes: frame.system_bytes.to_be_bytes(),
  };
  dst[..HEADER_LEN].copy_from_slice(bytemuck::bytes_of(&header));
  if let Some(data) = &frame.data {
    dst[HEADER_LEN..needed].copy_from_slice(data);
  }
  Ok(needed)
}

/// Parses the 14-byte header alone, returning the decoded fields and the
/// declared `total_length` so the caller knows how many body bytes to read
/// next. Does not look at `body`.
pub fn decode_header(hdr_bytes: &[u8; HEADER_LEN], max_frame_bytes: u32) -> Result<(HsmsFrame, u32), HsmsError> {
  let header: &RawHeader = bytemuck::from_bytes(hdr_bytes);
  let total_length = u32::from_be_bytes(header.total_length);
  if total_length < 10 {
    return Err(HsmsError::MalformedFrame { reason: "total_length below minimum header size" });
  }
  if total_length > max_frame_bytes {
    return Err(HsmsError::FrameTooLarge { declared: total_length, max: max_frame_bytes });
  }
  let message_type = MessageType::try_from(header.message_type)?;
  let frame = HsmsFrame {
    session_id: u16::from_be_bytes(header.session_id),
    stream: header.stream,
    function: header.function,
    message_type,
    system_bytes: u32::from_be_bytes(header.system_bytes),
    data: None,
  };
  Ok((frame, total_length))
}

/// Combines a parsed header with its body, validating that `body.len()`
/// matches the header's declared length exactly: `total_length - 10 !=
/// body.len()` is `MalformedFrame`.
pub fn decode(hdr_bytes: &[u8; HEADER_LEN], body: &[u8], max_frame_bytes: u32) -> Result<HsmsFrame, HsmsError> {
  let (mut frame, total_length) = decode_header(hdr_bytes, max_frame_bytes)?;
  let declared_body_len = total_length - 10;
  if declared_body_len as usize != body.len() {
    return Err(HsmsError::MalformedFrame { reason: "total_length does not match body length" });
  }
  if !body.is_empty() {
    frame.data = Some(body.to_vec());
  }
  Ok(frame)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn encode_decode_round_trips_a_data_message() {
    let frame = HsmsFrame {
      session_id: 0x1234,
      stream: 1,
      function: 13,
      message_type: MessageType::DataMessage,
      system_bytes: 0x0A0B0C0D,
      data: Some(vec![0xDE, 0xAD, 0xBE, 0xEF]),
    };
    let mut buf = [0u8; 32];
    let written = encode(&frame, &mut buf).unwrap();
    assert_eq!(written, 18);
    assert_eq!(
      &buf[..18],
      &[0x00, 0x00, 0x00, 0x0E, 0x12, 0x34, 0x01, 0x0D, 0x00, 0x00, 0x0A, 0x0B, 0x0C, 0x0D, 0xDE, 0xAD, 0xBE, 0xEF]
    );
    let hdr: [u8; HEADER_LEN] = buf[..HEADER_LEN].try_into().unwrap();
    let decoded = decode(&hdr, &buf[HEADER_LEN..written], DEFAULT_MAX_FRAME_BYTES).unwrap();
    assert_eq!(decoded, frame);
  }

  #[test]
  fn round_trip_with_no_payload() {
    let frame = HsmsFrame::control(MessageType::LinktestReq, CONTROL_SESSION_ID, 42);
    let mut buf = [0u8; HEADER_LEN];
    let written = encode(&frame, &mut buf).unwrap();
    assert_eq!(written, HEADER_LEN);
    let decoded = decode(&buf, &[], DEFAULT_MAX_FRAME_BYTES).unwrap();
    assert_eq!(decoded, frame);
    assert!(decoded.data.is_none());
  }

  #[test]
  fn total_length_nine_is_malformed() {
    let mut buf = [0u8; HEADER_LEN];
    buf[..4].copy_from_slice(&9u32.to_be_bytes());
    let err = decode(&buf, &[], DEFAULT_MAX_FRAME_BYTES).unwrap_err();
    assert!(matches!(err, HsmsError::MalformedFrame { .. }));
  }

  #[test]
  fn oversize_frame_rejected_before_allocation() {
    let mut buf = [0u8; HEADER_LEN];
    buf[..4].copy_from_slice(&(DEFAULT_MAX_FRAME_BYTES + 1).to_be_bytes());
    let err = decode_header(&buf, DEFAULT_MAX_FRAME_BYTES).unwrap_err();
    assert!(matches!(err, HsmsError::FrameTooLarge { .. }));
  }

  #[test]
  fn reserved_byte_nonzero_on_input_is_ignored_zero_on_output() {
    let mut buf = [0u8; HEADER_LEN];
    buf[..4].copy_from_slice(&10u32.to_be_bytes());
    buf[9] = 0xFF; // reserved byte, garbage on input
    buf[8] = MessageType::LinktestReq.as_u8();
    let decoded = decode(&buf, &[], DEFAULT_MAX_FRAME_BYTES).unwrap();
    let mut out = [0u8; HEADER_LEN];
    encode(&decoded, &mut out).unwrap();
    assert_eq!(out[9], 0);
  }

  #[test]
  fn buffer_too_small_rejects_before_writing() {
    let frame = HsmsFrame::control(MessageType::SelectReq, CONTROL_SESSION_ID, 1);
    let mut tiny = [0u8; 4];
    let err = encode(&frame, &mut tiny).unwrap_err();
    assert!(matches!(err, HsmsError::BufferTooSmall { .. }));
  }

  #[test]
  fn unknown_message_type_is_malformed() {
    let mut buf = [0u8; HEADER_LEN];
    buf[..4].copy_from_slice(&10u32.to_be_bytes());
    buf[8] = 200; // not a valid MessageType
    let err = decode(&buf, &[], DEFAULT_MAX_FRAME_BYTES).unwrap_err();
    assert!(matches!(err, HsmsError::MalformedFrame { .. }));
  }
}
