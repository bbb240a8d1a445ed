//! Data models shared by the connection, queue and RPC layers.
//!
//! These are plain values: what goes over the wire (`Payload`), what an
//! RPC caller sends and gets back (`Message`), and the knobs that select how
//! a response is carved out of an unframed stream (`ReadStrategy`,
//! `ReadOptions`).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::Deserialize;

use crate::connection::TcpError;

/// Default read timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 500;

/// Default settle delay after a response, in milliseconds.
pub const DEFAULT_DELAY_MS: u64 = 50;

/// One unit of data exchanged with the socket.
///
/// A connection configured with a text encoding produces `Text` chunks;
/// without one it produces raw `Bytes`. The two are never mixed on the
/// same socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Bytes(Bytes),
}

impl Payload {
    /// Whether this payload is decoded text.
    pub fn is_text(&self) -> bool {
        matches!(self, Payload::Text(_))
    }

    /// Length in bytes (for text, of its UTF-8 representation).
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Bytes(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the payload as text, if it is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Bytes(_) => None,
        }
    }

    /// Borrow the raw bytes of the payload.
    ///
    /// Text is returned as its UTF-8 representation, not re-encoded with the
    /// connection's encoding.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Bytes(bytes) => bytes,
        }
    }

    /// Join chunks in arrival order.
    ///
    /// `text` selects the representation of the result when `chunks` is empty;
    /// otherwise the chunks' own representation wins.
    pub(crate) fn concat(mut chunks: Vec<Payload>, text: bool) -> Payload {
        if chunks.len() == 1 {
            if let Some(chunk) = chunks.pop() {
                return chunk;
            }
        }

        if text {
            let mut joined = String::new();
            for chunk in &chunks {
                if let Payload::Text(part) = chunk {
                    joined.push_str(part);
                }
            }
            Payload::Text(joined)
        } else {
            let total = chunks.iter().map(Payload::len).sum();
            let mut joined = BytesMut::with_capacity(total);
            for chunk in &chunks {
                joined.extend_from_slice(chunk.as_bytes());
            }
            Payload::Bytes(joined.freeze())
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_owned())
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(bytes))
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Bytes(Bytes::copy_from_slice(bytes))
    }
}

/// A request or response as seen by an RPC caller.
///
/// With JSON enabled, replies always come back as `Json`. With JSON disabled,
/// replies mirror the connection's chunk representation (`Text` or `Bytes`).
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Json(serde_json::Value),
    Text(String),
    Bytes(Bytes),
}

impl Message {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Message::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_json(self) -> Option<serde_json::Value> {
        match self {
            Message::Json(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Json(value) => write!(f, "{}", value),
            Message::Text(text) => f.write_str(text),
            Message::Bytes(bytes) => f.write_str(&String::from_utf8_lossy(bytes)),
        }
    }
}

impl From<serde_json::Value> for Message {
    fn from(value: serde_json::Value) -> Self {
        Message::Json(value)
    }
}

impl From<Payload> for Message {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Text(text) => Message::Text(text),
            Payload::Bytes(bytes) => Message::Bytes(bytes),
        }
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_owned())
    }
}

impl From<Bytes> for Message {
    fn from(bytes: Bytes) -> Self {
        Message::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Self {
        Message::Bytes(Bytes::from(bytes))
    }
}

/// Policy deciding when inbound bytes form a complete response.
///
/// Accepts the legacy numeric codes (`1`, `2`) as well as names when parsed
/// from strings or deserialized from config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "StrategyRepr")]
pub enum ReadStrategy {
    /// Resolve with the next single inbound chunk.
    #[default]
    OnData,
    /// Accumulate chunks until the peer ends the stream.
    OnEnd,
}

impl ReadStrategy {
    /// Numeric code of the strategy.
    pub fn code(&self) -> u8 {
        match self {
            ReadStrategy::OnData => 1,
            ReadStrategy::OnEnd => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReadStrategy::OnData => "on_data",
            ReadStrategy::OnEnd => "on_end",
        }
    }
}

impl fmt::Display for ReadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<i64> for ReadStrategy {
    type Error = TcpError;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(ReadStrategy::OnData),
            2 => Ok(ReadStrategy::OnEnd),
            other => Err(TcpError::UnknownReadStrategy(other.to_string())),
        }
    }
}

impl FromStr for ReadStrategy {
    type Err = TcpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "1" | "on_data" | "data" => Ok(ReadStrategy::OnData),
            "2" | "on_end" | "end" => Ok(ReadStrategy::OnEnd),
            _ => Err(TcpError::UnknownReadStrategy(s.to_owned())),
        }
    }
}

/// Wire representations accepted for a read strategy in config files.
#[derive(Deserialize)]
#[serde(untagged)]
enum StrategyRepr {
    Code(i64),
    Name(String),
}

impl TryFrom<StrategyRepr> for ReadStrategy {
    type Error = TcpError;

    fn try_from(repr: StrategyRepr) -> Result<Self, Self::Error> {
        match repr {
            StrategyRepr::Code(code) => ReadStrategy::try_from(code),
            StrategyRepr::Name(name) => name.parse(),
        }
    }
}

/// Options for a single `Connection::read` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    pub strategy: ReadStrategy,
    pub timeout: Duration,
}

impl ReadOptions {
    pub fn new(strategy: ReadStrategy, timeout: Duration) -> Self {
        Self { strategy, timeout }
    }
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            strategy: ReadStrategy::OnData,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

/// Unvalidated connection construction options.
///
/// `port` is kept wide so out-of-range values from config files are reported
/// as an invalid port rather than a parse failure.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionOptions {
    pub host: String,
    pub port: i64,
    #[serde(default)]
    pub encoding: Option<String>,
}

impl ConnectionOptions {
    pub fn new(host: impl Into<String>, port: i64) -> Self {
        Self {
            host: host.into(),
            port,
            encoding: None,
        }
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = Some(encoding.into());
        self
    }
}
