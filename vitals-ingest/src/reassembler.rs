//! Reassembly of fragmented BLE notifications into JSON telemetry frames.
//!
//! Each device owns a [`FrameDecoder`]: a bounded byte buffer that moves
//! between three states. `Seeking` holds nothing useful (no `{` seen yet),
//! `Accumulating` holds a buffer that starts at a `{` and waits for a `}`
//! that closes a parseable object, and `Overflowed` records that the last
//! push exceeded the bound and the buffer was dropped.

use std::borrow::Cow;
use std::sync::OnceLock;

use base64::Engine;
use dashmap::DashMap;
use regex::bytes::Regex;
use serde_json::Value;

/// One chunk as delivered by a transport callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFragment {
    /// Base64 characteristic value, as BLE stacks hand it over.
    Base64(String),
    Text(String),
    Bytes(Vec<u8>),
}

impl RawFragment {
    fn into_bytes(self) -> Result<Vec<u8>, base64::DecodeError> {
        match self {
            RawFragment::Base64(encoded) => {
                base64::engine::general_purpose::STANDARD.decode(encoded.trim())
            }
            RawFragment::Text(text) => Ok(text.into_bytes()),
            RawFragment::Bytes(bytes) => Ok(bytes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Seeking,
    Accumulating,
    Overflowed,
}

/// Frames extracted by one push, plus how many bytes an overflow discarded.
#[derive(Debug, Default)]
pub struct Extracted {
    pub frames: Vec<Value>,
    pub discarded: usize,
}

/// Incremental JSON object decoder for a single device.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    capacity: usize,
    state: DecoderState,
    // Every `}` before this offset already failed to close the object that
    // starts at offset 0.
    scan_from: usize,
}

impl FrameDecoder {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Vec::new(),
            capacity,
            state: DecoderState::Seeking,
            scan_from: 0,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append decoded bytes and pull out every complete object, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Extracted {
        if self.state == DecoderState::Overflowed {
            self.state = DecoderState::Seeking;
        }
        self.buffer.extend_from_slice(bytes);

        let mut extracted = Extracted::default();
        loop {
            let Some(start) = self.buffer.iter().position(|b| *b == b'{') else {
                self.buffer.clear();
                self.scan_from = 0;
                self.state = DecoderState::Seeking;
                break;
            };
            if start > 0 {
                self.buffer.drain(..start);
                self.scan_from = self.scan_from.saturating_sub(start);
            }
            self.state = DecoderState::Accumulating;

            match self.next_object() {
                Some((value, end)) => {
                    extracted.frames.push(value);
                    self.buffer.drain(..=end);
                    self.scan_from = 0;
                }
                None => break,
            }
        }

        if self.buffer.len() > self.capacity {
            extracted.discarded = self.buffer.len();
            self.buffer.clear();
            self.scan_from = 0;
            self.state = DecoderState::Overflowed;
        }
        extracted
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scan_from = 0;
        self.state = DecoderState::Seeking;
    }

    // Buffer starts with `{`. Try each later `}` as the end of the object.
    fn next_object(&mut self) -> Option<(Value, usize)> {
        let from = self.scan_from.max(1);
        for end in from..self.buffer.len() {
            if self.buffer[end] != b'}' {
                continue;
            }
            let candidate = sanitize_nan(&self.buffer[..=end]);
            if let Ok(value) = serde_json::from_slice::<Value>(&candidate) {
                return Some((value, end));
            }
        }
        self.scan_from = self.buffer.len();
        None
    }
}

/// Firmware writes bare `nan` for unavailable readings, which is not JSON.
/// Only text outside string literals is rewritten.
fn sanitize_nan(candidate: &[u8]) -> Cow<'_, [u8]> {
    static NAN_VALUE: OnceLock<Regex> = OnceLock::new();
    let pattern = NAN_VALUE
        .get_or_init(|| Regex::new(r"(?i-u):\s*[-+]?nan\b").expect("static pattern compiles"));
    if !pattern.is_match(candidate) {
        return Cow::Borrowed(candidate);
    }

    let mut out = Vec::with_capacity(candidate.len());
    let mut span_start = 0;
    let mut in_string = false;
    let mut escaped = false;
    for (index, byte) in candidate.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if *byte == b'\\' {
                escaped = true;
            } else if *byte == b'"' {
                in_string = false;
                out.extend_from_slice(&candidate[span_start..=index]);
                span_start = index + 1;
            }
        } else if *byte == b'"' {
            out.extend_from_slice(&pattern.replace_all(&candidate[span_start..index], &b":0"[..]));
            in_string = true;
            span_start = index;
        }
    }
    let tail = &candidate[span_start..];
    if in_string {
        out.extend_from_slice(tail);
    } else {
        out.extend_from_slice(&pattern.replace_all(tail, &b":0"[..]));
    }
    Cow::Owned(out)
}

/// Per-device decoders keyed by device id.
#[derive(Debug)]
pub struct FrameReassembler {
    decoders: DashMap<String, FrameDecoder>,
    capacity: usize,
}

impl FrameReassembler {
    pub fn new(capacity: usize) -> Self {
        Self {
            decoders: DashMap::new(),
            capacity,
        }
    }

    /// Feed one fragment for a device and return the frames it completed.
    /// Never fails: undecodable fragments and overflows are logged and dropped.
    pub fn feed(&self, device_id: &str, fragment: RawFragment) -> Vec<Value> {
        let bytes = match fragment.into_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(device_id, error = %err, "discarding undecodable fragment");
                return Vec::new();
            }
        };

        let mut decoder = self
            .decoders
            .entry(device_id.to_string())
            .or_insert_with(|| FrameDecoder::new(self.capacity));
        let extracted = decoder.push(&bytes);

        if extracted.discarded > 0 {
            tracing::warn!(
                device_id,
                discarded = extracted.discarded,
                capacity = self.capacity,
                "framing error: buffer overflow, cleared"
            );
        }
        tracing::debug!(
            device_id,
            fragment_len = bytes.len(),
            frames = extracted.frames.len(),
            buffered = decoder.buffered(),
            "fragment consumed"
        );
        extracted.frames
    }

    /// Drop a device's buffer. Returns whether one existed.
    pub fn reset(&self, device_id: &str) -> bool {
        self.decoders.remove(device_id).is_some()
    }

    pub fn state(&self, device_id: &str) -> Option<DecoderState> {
        self.decoders.get(device_id).map(|decoder| decoder.state())
    }

    pub fn buffered(&self, device_id: &str) -> usize {
        self.decoders
            .get(device_id)
            .map(|decoder| decoder.buffered())
            .unwrap_or(0)
    }
}
