// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;
use tracing::{debug, error};

use crate::net::tcp_buffer::TcpBuffer;

/// Frame start marker.
pub const PB_START: u8 = 0x02;
/// Frame end marker.
pub const PB_END: u8 = 0x03;

/// Fixed wire overhead: the two markers plus six 32-bit fields (pk_len,
/// msg_id_len, method_name_len, err_code, err_info_len, checksum).
const FIXED_OVERHEAD: usize = 26;

/// Encoded in place of an empty msg_id, matching the peer implementations
/// in the field.
const DEFAULT_MSG_ID: &str = "123456789";

/// One self-delimited unit on the wire carrying a single request or
/// response.
///
/// `msg_id` correlates a request with its response and rides through log
/// lines for tracing; `err_info` is only meaningful when `err_code` is
/// non-zero; `payload` is an opaque serialized message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TinyPbFrame {
    pub msg_id: String,
    pub method_name: String,
    pub err_code: i32,
    pub err_info: String,
    pub payload: Bytes,
}

impl TinyPbFrame {
    pub fn request(msg_id: String, method_name: String, payload: Bytes) -> Self {
        Self {
            msg_id,
            method_name,
            err_code: 0,
            err_info: String::new(),
            payload,
        }
    }

    pub fn set_error(&mut self, code: i32, info: impl Into<String>) {
        self.err_code = code;
        self.err_info = info.into();
    }
}

/// Appends the wire form of every frame to `out`.
pub fn encode(frames: &[TinyPbFrame], out: &mut TcpBuffer) {
    for frame in frames {
        let encoded = encode_frame(frame);
        out.append(&encoded);
        debug!(msg_id = %frame.msg_id, len = encoded.len(), "encoded frame");
    }
}

fn encode_frame(frame: &TinyPbFrame) -> Vec<u8> {
    let msg_id: &str = if frame.msg_id.is_empty() {
        DEFAULT_MSG_ID
    } else {
        &frame.msg_id
    };

    let pk_len = FIXED_OVERHEAD
        + msg_id.len()
        + frame.method_name.len()
        + frame.err_info.len()
        + frame.payload.len();

    let mut buf = Vec::with_capacity(pk_len);
    buf.push(PB_START);
    buf.extend_from_slice(&(pk_len as u32).to_be_bytes());
    buf.extend_from_slice(&(msg_id.len() as u32).to_be_bytes());
    buf.extend_from_slice(msg_id.as_bytes());
    buf.extend_from_slice(&(frame.method_name.len() as u32).to_be_bytes());
    buf.extend_from_slice(frame.method_name.as_bytes());
    buf.extend_from_slice(&frame.err_code.to_be_bytes());
    buf.extend_from_slice(&(frame.err_info.len() as u32).to_be_bytes());
    buf.extend_from_slice(frame.err_info.as_bytes());
    buf.extend_from_slice(&frame.payload);
    // Constant checksum for wire compatibility; peers do not verify it.
    buf.extend_from_slice(&1u32.to_be_bytes());
    buf.push(PB_END);

    debug_assert_eq!(buf.len(), pk_len);
    buf
}

/// Decodes every complete frame currently in `buffer`.
///
/// Bytes before a valid start marker are skipped silently. A frame whose
/// length prefixes contradict its declared bounds is dropped with a log; the
/// scan continues behind it. Incomplete trailing data is left in the buffer
/// for the next commit.
pub fn decode(buffer: &mut TcpBuffer) -> Vec<TinyPbFrame> {
    let mut frames = Vec::new();

    loop {
        let data = buffer.view();
        let Some((start, pk_len)) = find_frame(data) else {
            return frames;
        };

        let frame_bytes = &data[start..start + pk_len];
        let parsed = parse_frame(frame_bytes, pk_len);
        // The scan consumed everything before the marker plus the frame.
        let advance = start + pk_len;

        match parsed {
            Some(frame) => {
                debug!(msg_id = %frame.msg_id, method = %frame.method_name, "decoded frame");
                frames.push(frame);
            },
            None => {
                error!(pk_len, "failed to parse frame, dropping {advance} bytes");
            },
        }
        buffer.consume(advance);
    }
}

/// Locates the next complete frame: returns the start-marker offset and the
/// declared frame length, or None when more data is needed.
fn find_frame(data: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < data.len() {
        if data[i] != PB_START {
            i += 1;
            continue;
        }
        if i + 5 > data.len() {
            // Length field still in flight.
            return None;
        }
        let pk_len = read_u32(&data[i + 1..]) as usize;
        if pk_len < FIXED_OVERHEAD {
            // Cannot be a real frame; treat the marker as noise.
            i += 1;
            continue;
        }
        if i + pk_len > data.len() {
            return None;
        }
        if data[i + pk_len - 1] != PB_END {
            i += 1;
            continue;
        }
        return Some((i, pk_len));
    }
    None
}

fn parse_frame(data: &[u8], pk_len: usize) -> Option<TinyPbFrame> {
    // data covers exactly [PB_START .. PB_END]; walk the length-prefixed
    // fields, bailing out if any prefix escapes the frame bounds.
    let mut pos = 5; // past start marker and pk_len

    let msg_id = read_lp_string(data, &mut pos)?;
    let method_name = read_lp_string(data, &mut pos)?;

    if pos + 4 > data.len() {
        return None;
    }
    let err_code = i32::from_be_bytes([
        data[pos],
        data[pos + 1],
        data[pos + 2],
        data[pos + 3],
    ]);
    pos += 4;

    let err_info = read_lp_string(data, &mut pos)?;

    let payload_len = pk_len
        .checked_sub(FIXED_OVERHEAD + msg_id.len() + method_name.len() + err_info.len())?;
    if pos + payload_len + 5 != pk_len {
        return None;
    }
    let payload = Bytes::copy_from_slice(&data[pos..pos + payload_len]);

    Some(TinyPbFrame {
        msg_id,
        method_name,
        err_code,
        err_info,
        payload,
    })
}

fn read_lp_string(data: &[u8], pos: &mut usize) -> Option<String> {
    if *pos + 4 > data.len() {
        return None;
    }
    let len = read_u32(&data[*pos..]) as usize;
    *pos += 4;
    if *pos + len > data.len() {
        return None;
    }
    let s = String::from_utf8_lossy(&data[*pos..*pos + len]).into_owned();
    *pos += len;
    Some(s)
}

fn read_u32(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}
