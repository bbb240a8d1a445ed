//! Text encodings and streaming chunk decoding.
//!
//! A connection either exchanges raw bytes or text in one configured
//! encoding. Outbound text is encoded with it; inbound bytes are decoded
//! chunk by chunk. UTF-8 goes through an `encoding_rs` streaming decoder,
//! which carries an incomplete sequence over to the next chunk so a
//! multi-byte character split by the transport is not mangled.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use super::TcpError;
use crate::models::Payload;

/// Supported text encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Ascii,
    Latin1,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf8",
            Encoding::Ascii => "ascii",
            Encoding::Latin1 => "latin1",
        }
    }

    /// Encode text for the wire.
    ///
    /// Characters outside the target range become `?` for ASCII. Latin-1
    /// keeps only the low byte of each code point, so anything above U+00FF
    /// is truncated rather than rejected.
    pub fn encode(&self, text: &str) -> Bytes {
        match self {
            Encoding::Utf8 => Bytes::copy_from_slice(text.as_bytes()),
            Encoding::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect::<Vec<u8>>()
                .into(),
            Encoding::Latin1 => text
                .chars()
                .map(|c| (u32::from(c) & 0xff) as u8)
                .collect::<Vec<u8>>()
                .into(),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = TcpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "ascii" => Ok(Encoding::Ascii),
            "latin1" | "binary" => Ok(Encoding::Latin1),
            _ => Err(TcpError::InvalidEncoding(s.to_owned())),
        }
    }
}

/// Turn outbound payloads into bytes.
///
/// Raw bytes pass through untouched. Text uses the configured encoding,
/// falling back to UTF-8 on a byte-mode connection.
pub(crate) fn encode_payload(payload: Payload, encoding: Option<Encoding>) -> Bytes {
    match payload {
        Payload::Bytes(bytes) => bytes,
        Payload::Text(text) => encoding.unwrap_or(Encoding::Utf8).encode(&text),
    }
}

/// Per-socket decoder for inbound chunks.
pub(crate) struct ChunkDecoder {
    encoding: Option<Encoding>,
    /// Streaming UTF-8 state; holds an incomplete sequence between chunks.
    utf8: encoding_rs::Decoder,
}

impl ChunkDecoder {
    pub(crate) fn new(encoding: Option<Encoding>) -> Self {
        Self {
            encoding,
            // Keep a leading BOM as U+FEFF instead of sniffing it away
            utf8: encoding_rs::UTF_8.new_decoder_without_bom_handling(),
        }
    }

    /// Decode one inbound chunk.
    ///
    /// Returns `None` when the whole chunk was held back as an incomplete
    /// character.
    pub(crate) fn decode(&mut self, bytes: Bytes) -> Option<Payload> {
        let text = match self.encoding {
            None => return Some(Payload::Bytes(bytes)),
            Some(Encoding::Utf8) => decode_utf8(&mut self.utf8, &bytes, false),
            Some(Encoding::Ascii) => bytes.iter().map(|b| char::from(b & 0x7f)).collect(),
            Some(Encoding::Latin1) => bytes.iter().map(|&b| char::from(b)).collect(),
        };

        if text.is_empty() && !bytes.is_empty() {
            None
        } else {
            Some(Payload::Text(text))
        }
    }

    /// Flush whatever is still held back once the stream has ended.
    pub(crate) fn finish(&mut self) -> Option<Payload> {
        if self.encoding != Some(Encoding::Utf8) {
            return None;
        }
        let rest = decode_utf8(&mut self.utf8, &[], true);
        if rest.is_empty() {
            None
        } else {
            Some(Payload::Text(rest))
        }
    }
}

impl fmt::Debug for ChunkDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkDecoder")
            .field("encoding", &self.encoding)
            .finish()
    }
}

/// Decode with malformed sequences replaced by U+FFFD.
fn decode_utf8(decoder: &mut encoding_rs::Decoder, mut src: &[u8], last: bool) -> String {
    let mut out = String::new();
    loop {
        let needed = decoder
            .max_utf8_buffer_length(src.len())
            .unwrap_or(src.len() * 3 + 4);
        out.reserve(needed);
        let (result, read, _) = decoder.decode_to_string(src, &mut out, last);
        src = &src[read..];
        if let encoding_rs::CoderResult::InputEmpty = result {
            return out;
        }
    }
}
