//! Wire protocol codec for channel members.
//!
//! Length-prefixed frames with a JSON header:
//!
//! ```text
//! [u32 BE totalLength] [u32 BE headerLength] [header: UTF-8 JSON object] [body bytes]
//! ```
//!
//! `totalLength` counts the whole frame, both length fields included, so
//! `totalLength = 8 + headerLength + bodyLength` and `totalLength >= 8`.
//!
//! [`FrameDecoder`] reassembles frames from arbitrarily split reads. Inbound
//! chunks are kept as a queue of [`Bytes`]; a contiguous buffer is only built
//! when a completed frame straddles several chunks.

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::{DEFAULT_MAX_FRAME_BYTES, FRAME_PREFIX_LEN};
use crate::error::{ProxyError, ProxyResult};

const EVENT_KEY: &str = "event";
const TO_KEY: &str = "to";
const FROM_KEY: &str = "from";

/// JSON header of a frame.
///
/// A string-keyed object carrying `event`, one addressing field (`to` for
/// frames heading to clients, `from` for frames heading to servers), and any
/// free-form fields the peers agree on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameHeader(Map<String, Value>);

impl FrameHeader {
    /// Header with only an `event` field.
    pub fn new(event: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert(EVENT_KEY.to_string(), Value::String(event.into()));
        Self(map)
    }

    /// Wrap an arbitrary JSON object.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Builder: set the `to` address.
    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.set_address(TO_KEY, to.into());
        self
    }

    /// Builder: set the `from` address.
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.set_address(FROM_KEY, from.into());
        self
    }

    /// The `event` field, if present and a string.
    pub fn event(&self) -> Option<&str> {
        self.0.get(EVENT_KEY).and_then(Value::as_str)
    }

    /// The `to` address, if present and a string.
    pub fn to_address(&self) -> Option<&str> {
        self.0.get(TO_KEY).and_then(Value::as_str)
    }

    /// The `from` address, if present and a string.
    pub fn from_address(&self) -> Option<&str> {
        self.0.get(FROM_KEY).and_then(Value::as_str)
    }

    /// Look up any header field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Insert a free-form field.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Borrow the underlying JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Replace the addressing field; a header carries exactly one of `to`/`from`.
    fn set_address(&mut self, key: &str, address: String) {
        self.0.remove(TO_KEY);
        self.0.remove(FROM_KEY);
        self.0.insert(key.to_string(), Value::String(address));
    }
}

/// One decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// JSON header.
    pub header: FrameHeader,
    /// Opaque body bytes.
    pub body: Bytes,
}

impl Frame {
    /// Create a frame from a header and body.
    pub fn new(header: FrameHeader, body: impl Into<Bytes>) -> Self {
        Self {
            header,
            body: body.into(),
        }
    }

    /// Encode this frame into wire bytes.
    pub fn encode(&self) -> ProxyResult<Bytes> {
        encode(&self.header, &self.body)
    }
}

/// Encode a header and body as `[total][headerLen][header][body]`.
///
/// Fails only if the frame cannot be described by a `u32` length.
pub fn encode(header: &FrameHeader, body: &[u8]) -> ProxyResult<Bytes> {
    let header_bytes = serde_json::to_vec(header)
        .map_err(|e| ProxyError::MalformedFrame(format!("header serialization: {e}")))?;
    let total = FRAME_PREFIX_LEN + header_bytes.len() + body.len();
    if total > u32::MAX as usize {
        return Err(ProxyError::FrameTooLarge {
            length: total as u64,
            max: u32::MAX,
        });
    }

    let mut buf = BytesMut::with_capacity(total);
    buf.put_u32(total as u32);
    buf.put_u32(header_bytes.len() as u32);
    buf.extend_from_slice(&header_bytes);
    buf.extend_from_slice(body);
    Ok(buf.freeze())
}

/// Decode one complete frame whose bytes are exactly `totalLength` long.
fn decode_frame(raw: Bytes) -> ProxyResult<Frame> {
    let header_len = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize;
    let header_end = FRAME_PREFIX_LEN
        .checked_add(header_len)
        .filter(|end| *end <= raw.len())
        .ok_or_else(|| {
            ProxyError::MalformedFrame(format!(
                "header length {header_len} exceeds frame length {}",
                raw.len()
            ))
        })?;

    let header: Map<String, Value> = serde_json::from_slice(&raw[FRAME_PREFIX_LEN..header_end])
        .map_err(|e| ProxyError::MalformedFrame(format!("invalid JSON header: {e}")))?;

    Ok(Frame {
        header: FrameHeader(header),
        body: raw.slice(header_end..),
    })
}

/// Outcome of [`FrameDecoder::feed_until_error`].
#[derive(Debug)]
pub struct Decoded {
    /// Frames completed, in arrival order.
    pub frames: Vec<Frame>,
    /// Error that stopped decoding; later bytes are unusable.
    pub error: Option<ProxyError>,
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed chunks via [`FrameDecoder::feed`] and collect complete frames in
/// arrival order. Bytes past the last complete frame stay buffered.
#[derive(Debug)]
pub struct FrameDecoder {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    max_frame_bytes: u32,
}

impl FrameDecoder {
    /// Create a decoder enforcing `max_frame_bytes` on each `totalLength`.
    pub fn new(max_frame_bytes: u32) -> Self {
        Self {
            chunks: VecDeque::new(),
            buffered: 0,
            max_frame_bytes,
        }
    }

    /// Feed a chunk into the decoder and extract all complete frames.
    ///
    /// # Errors
    ///
    /// [`ProxyError::FrameTooLarge`] as soon as a length prefix above the cap
    /// is visible, [`ProxyError::MalformedFrame`] for structurally invalid
    /// frames. Frames completed before the error are discarded; use
    /// [`FrameDecoder::feed_until_error`] to keep them.
    pub fn feed(&mut self, chunk: Bytes) -> ProxyResult<Vec<Frame>> {
        let decoded = self.feed_until_error(chunk);
        match decoded.error {
            Some(e) => Err(e),
            None => Ok(decoded.frames),
        }
    }

    /// Feed a chunk and return every frame completed before the stream went
    /// bad, together with the error that stopped decoding, if any.
    ///
    /// The decoder should be discarded once an error is returned.
    pub fn feed_until_error(&mut self, chunk: Bytes) -> Decoded {
        if !chunk.is_empty() {
            self.buffered += chunk.len();
            self.chunks.push_back(chunk);
        }

        let mut frames = Vec::new();
        let error = loop {
            match self.next_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break None,
                Err(e) => break Some(e),
            }
        };
        Decoded { frames, error }
    }

    fn next_frame(&mut self) -> ProxyResult<Option<Frame>> {
        let Some(total) = self.peek_total_length() else {
            return Ok(None);
        };
        if total > self.max_frame_bytes {
            return Err(ProxyError::FrameTooLarge {
                length: u64::from(total),
                max: self.max_frame_bytes,
            });
        }
        let total = total as usize;
        if total < FRAME_PREFIX_LEN {
            return Err(ProxyError::MalformedFrame(format!(
                "total length {total} is shorter than the {FRAME_PREFIX_LEN}-byte prefix"
            )));
        }
        if self.buffered < total {
            return Ok(None); // Incomplete frame, wait for more data
        }
        let raw = self.take(total);
        decode_frame(raw).map(Some)
    }

    /// Number of bytes buffered towards the next frame.
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Returns true if the decoder holds a partial frame.
    pub fn has_partial(&self) -> bool {
        self.buffered > 0
    }

    /// Read the big-endian length prefix without consuming it.
    fn peek_total_length(&self) -> Option<u32> {
        if self.buffered < 4 {
            return None;
        }
        let mut prefix = [0u8; 4];
        let mut filled = 0;
        for chunk in &self.chunks {
            let n = (prefix.len() - filled).min(chunk.len());
            prefix[filled..filled + n].copy_from_slice(&chunk[..n]);
            filled += n;
            if filled == prefix.len() {
                break;
            }
        }
        Some(u32::from_be_bytes(prefix))
    }

    /// Remove exactly `n` buffered bytes; caller guarantees `n <= buffered`.
    fn take(&mut self, n: usize) -> Bytes {
        self.buffered -= n;

        if let Some(front) = self.chunks.front_mut() {
            if front.len() >= n {
                let out = front.split_to(n);
                if front.is_empty() {
                    self.chunks.pop_front();
                }
                return out;
            }
        }

        // Frame straddles chunks: materialize it once.
        let mut out = BytesMut::with_capacity(n);
        while out.len() < n {
            let Some(mut chunk) = self.chunks.pop_front() else {
                break;
            };
            let need = n - out.len();
            if chunk.len() > need {
                out.extend_from_slice(&chunk.split_to(need));
                self.chunks.push_front(chunk);
            } else {
                out.extend_from_slice(&chunk);
            }
        }
        out.freeze()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}
