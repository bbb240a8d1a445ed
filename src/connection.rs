//! TCP connection wrapper for unframed request/response streams.
//!
//! A `Connection` owns at most one socket to a fixed `host:port` and knows
//! how to (re)open it, write to it, and carve a response out of the raw
//! inbound stream using one of two read strategies.
//!
//! # States
//!
//! ```text
//!   CLOSED ──open()──► FULLY-OPEN ──peer ends stream──► ALIVE-NOT-FULLY-OPEN
//!     ▲                    │                                   │
//!     └──end()/destroy()───┘◄──────────open() (reconnect)──────┘
//! ```
//!
//! `write` and `read` check the state first and reopen the socket when it
//! cannot serve them. That implicit reopen happens at most once per call.
//!
//! # Inbound backlog
//!
//! Inbound chunks are queued as they arrive. Every `write` discards whatever
//! is still queued, so a reply read never sees bytes left over from an
//! earlier exchange. Chunks arriving after the write are kept for the next
//! `read`, even if they land before that read starts.
//!
//! Once the peer has ended the stream the socket takes no more writes, even
//! if chunks sent before the end are still queued; the next `write` opens a
//! fresh socket. At most about 1 MiB is queued; past that the socket is not
//! read until a read or write makes room.

mod encoding;
mod inbox;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub use encoding::Encoding;

use crate::models::{ConnectionOptions, Payload, ReadOptions, ReadStrategy};
use encoding::ChunkDecoder;
use inbox::{Event, Shared};

/// A connection shared between an RPC client and its queued jobs.
pub type SharedConnection = Arc<tokio::sync::Mutex<Connection>>;

/// Connection-level error types.
#[derive(Debug, Error)]
pub enum TcpError {
    /// Host is empty.
    #[error("Invalid host: must be a non-empty string")]
    InvalidHost,

    /// Port is outside 1..=65535.
    #[error("Invalid port: {0}")]
    InvalidPort(i64),

    /// Encoding name is not supported.
    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    /// `open()` was called on a fully open connection.
    #[error("Connection is already fully open")]
    AlreadyFullyOpen,

    /// The socket cannot accept writes even after reopening.
    #[error("Socket is not writable")]
    NotWritable,

    /// Read strategy is not one of the recognized values.
    #[error("Unknown read strategy: {0}")]
    UnknownReadStrategy(String),

    /// No response arrived within the read timeout.
    #[error("Read timed out after {0}ms")]
    ReadTimeout(u64),

    /// Failed to establish the socket.
    #[error("Connection to {addr} failed: {source}")]
    Connect {
        /// Target `host:port`
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The peer ended the stream before any data arrived.
    #[error("Connection closed by peer")]
    Closed,

    /// Transport error while reading or writing.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl TcpError {
    /// Whether this is a configuration error raised at construction.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            TcpError::InvalidHost | TcpError::InvalidPort(_) | TcpError::InvalidEncoding(_)
        )
    }
}

/// Validated, immutable connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    host: String,
    port: u16,
    encoding: Option<Encoding>,
}

impl ConnectionConfig {
    /// Validate raw options.
    ///
    /// # Errors
    ///
    /// - `TcpError::InvalidHost` if `host` is empty
    /// - `TcpError::InvalidPort` if `port` is not in `1..=65535`
    /// - `TcpError::InvalidEncoding` if `encoding` names an unsupported encoding
    pub fn new(options: ConnectionOptions) -> Result<Self, TcpError> {
        if options.host.is_empty() {
            return Err(TcpError::InvalidHost);
        }
        let port = u16::try_from(options.port)
            .ok()
            .filter(|p| *p > 0)
            .ok_or(TcpError::InvalidPort(options.port))?;
        let encoding = options
            .encoding
            .as_deref()
            .map(str::parse::<Encoding>)
            .transpose()?;

        Ok(Self {
            host: options.host,
            port,
            encoding,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Text encoding, or `None` for raw byte mode.
    pub fn encoding(&self) -> Option<Encoding> {
        self.encoding
    }

    /// `host:port` for display.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The live socket behind a connection.
struct Socket {
    writer: OwnedWriteHalf,
    shared: Arc<Shared>,
    pump: JoinHandle<()>,
    peer: Option<SocketAddr>,
}

impl Socket {
    fn is_alive(&self) -> bool {
        !self.shared.is_failed()
    }

    fn is_readable(&self) -> bool {
        self.is_alive() && !self.shared.is_drained()
    }

    // Once the peer has ended, nothing written here can be answered, even
    // while the last chunks are still queued for reading.
    fn is_writable(&self) -> bool {
        self.is_alive() && !self.shared.is_ended()
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// TCP connection with reconnect-on-demand and timeout-bounded reads.
///
/// Constructing a connection performs no I/O; the socket is created by
/// `open()`, or implicitly by `write()`/`read()`.
///
/// # Example
///
/// ```ignore
/// use tcp_rpc::{Connection, ConnectionOptions, ReadOptions, ReadStrategy};
///
/// let mut conn = Connection::new(ConnectionOptions::new("127.0.0.1", 7070).with_encoding("utf-8"))?;
/// conn.write("ping").await?;
/// let reply = conn.read(ReadOptions::default()).await?;
/// ```
pub struct Connection {
    config: ConnectionConfig,
    socket: Option<Socket>,
    /// Sockets established over the connection's lifetime.
    connects: u64,
}

impl Connection {
    /// Validate options and build a closed connection.
    pub fn new(options: ConnectionOptions) -> Result<Self, TcpError> {
        Ok(Self::from_config(ConnectionConfig::new(options)?))
    }

    pub fn from_config(config: ConnectionConfig) -> Self {
        Self {
            config,
            socket: None,
            connects: 0,
        }
    }

    /// Wrap the connection for sharing with an RPC client.
    pub fn into_shared(self) -> SharedConnection {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Number of sockets established so far, implicit reopens included.
    pub fn connect_count(&self) -> u64 {
        self.connects
    }

    /// Remote address of the current socket.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.peer)
    }

    /// A socket exists and has not failed or been closed.
    pub fn is_alive(&self) -> bool {
        self.socket.as_ref().is_some_and(Socket::is_alive)
    }

    /// Alive, readable and writable.
    pub fn is_fully_open(&self) -> bool {
        self.socket
            .as_ref()
            .is_some_and(|s| s.is_alive() && s.is_readable() && s.is_writable())
    }

    /// Establish a new socket.
    ///
    /// A socket that is alive but no longer fully open is ended gracefully
    /// first; it is never reused.
    ///
    /// # Errors
    ///
    /// - `TcpError::AlreadyFullyOpen` if the current socket is fully open
    ///   (it is left untouched)
    /// - `TcpError::Connect` if the connect attempt fails
    pub async fn open(&mut self) -> Result<(), TcpError> {
        if self.is_fully_open() {
            return Err(TcpError::AlreadyFullyOpen);
        }

        if self.is_alive() {
            debug!("Reconnecting half-open socket to {}", self.config.address());
            if let Err(e) = self.end().await {
                warn!("Failed to end previous socket cleanly: {}", e);
            }
        }
        // Release a failed socket, if any
        self.socket = None;

        let stream = TcpStream::connect((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|source| TcpError::Connect {
                addr: self.config.address(),
                source,
            })?;
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();

        let shared = Arc::new(Shared::default());
        let pump = inbox::spawn_pump(
            reader,
            ChunkDecoder::new(self.config.encoding),
            Arc::clone(&shared),
        );

        self.socket = Some(Socket {
            writer,
            shared,
            pump,
            peer,
        });
        self.connects += 1;
        info!("Connected to {}", self.config.address());
        Ok(())
    }

    /// Half-close the write side and release the socket.
    ///
    /// Afterwards `is_alive()` is false. Calling it on a closed connection
    /// is a no-op.
    pub async fn end(&mut self) -> Result<(), TcpError> {
        let Some(mut socket) = self.socket.take() else {
            return Ok(());
        };

        let result = if socket.is_alive() {
            socket.writer.shutdown().await.map_err(TcpError::Io)
        } else {
            Ok(())
        };
        drop(socket);
        debug!("Ended connection to {}", self.config.address());
        result
    }

    /// Drop the socket immediately without flushing or waiting.
    pub fn destroy(&mut self) {
        if self.socket.take().is_some() {
            debug!("Destroyed connection to {}", self.config.address());
        }
    }

    /// Write a payload, opening the socket first if it cannot take writes.
    ///
    /// Text is encoded with the configured encoding (UTF-8 on a byte-mode
    /// connection); bytes are written as-is. Chunks still queued from
    /// earlier traffic are discarded before sending.
    ///
    /// # Errors
    ///
    /// - whatever `open()` fails with during the implicit reopen
    /// - `TcpError::NotWritable` if the socket still cannot accept writes
    /// - `TcpError::Io` if the transport reports an error; the socket is
    ///   released and the next operation reconnects
    pub async fn write(&mut self, data: impl Into<Payload>) -> Result<(), TcpError> {
        let data = data.into();

        if !self.socket.as_ref().is_some_and(Socket::is_writable) {
            self.open().await?;
        }

        let encoding = self.config.encoding;
        let socket = self
            .socket
            .as_mut()
            .filter(|s| s.is_writable())
            .ok_or(TcpError::NotWritable)?;

        let stale = socket.shared.clear();
        if stale > 0 {
            debug!("Discarded {} stale inbound chunk(s) before write", stale);
        }

        let bytes = encoding::encode_payload(data, encoding);
        let mut result = socket.writer.write_all(&bytes).await;
        if result.is_ok() {
            result = socket.writer.flush().await;
        }

        if let Err(e) = result {
            warn!("Write to {} failed: {}", self.config.address(), e);
            self.socket = None;
            return Err(TcpError::Io(e));
        }
        Ok(())
    }

    /// Read one response using the given strategy.
    ///
    /// Opens the socket first if it is not readable. The timeout covers the
    /// read itself, not the implicit reopen.
    ///
    /// - `ReadStrategy::OnData` resolves with the next single inbound chunk.
    ///   On timeout the socket stays open for reuse.
    /// - `ReadStrategy::OnEnd` accumulates chunks until the peer ends the
    ///   stream and joins them in arrival order. The socket is ended on every
    ///   exit path, so the next operation reconnects.
    ///
    /// # Errors
    ///
    /// - `TcpError::ReadTimeout` if no response completes within the timeout
    /// - `TcpError::Closed` if an `OnData` read sees the peer end the stream
    /// - `TcpError::Io` if the transport fails mid-read
    pub async fn read(&mut self, options: ReadOptions) -> Result<Payload, TcpError> {
        if !self.socket.as_ref().is_some_and(Socket::is_readable) {
            self.open().await?;
        }

        match options.strategy {
            ReadStrategy::OnData => self.read_data(options.timeout).await,
            ReadStrategy::OnEnd => self.read_end(options.timeout).await,
        }
    }

    fn current_shared(&self) -> Result<Arc<Shared>, TcpError> {
        self.socket
            .as_ref()
            .map(|s| Arc::clone(&s.shared))
            .ok_or(TcpError::Closed)
    }

    async fn read_data(&mut self, limit: Duration) -> Result<Payload, TcpError> {
        let shared = self.current_shared()?;

        match timeout(limit, shared.next_event()).await {
            Ok(Event::Data(chunk)) => Ok(chunk),
            Ok(Event::End) => Err(TcpError::Closed),
            Ok(Event::Failed(e)) => {
                self.socket = None;
                Err(TcpError::Io(e))
            }
            Err(_) => {
                debug!("ON_DATA read timed out after {:?}", limit);
                Err(TcpError::ReadTimeout(millis(limit)))
            }
        }
    }

    async fn read_end(&mut self, limit: Duration) -> Result<Payload, TcpError> {
        let shared = self.current_shared()?;
        let text = self.config.encoding.is_some();

        let collect = async {
            let mut chunks = Vec::new();
            loop {
                match shared.next_event().await {
                    Event::Data(chunk) => chunks.push(chunk),
                    Event::End => return Ok(chunks),
                    Event::Failed(e) => return Err(e),
                }
            }
        };
        let outcome = timeout(limit, collect).await;

        // The peer is done with this socket (or we gave up on it)
        if let Err(e) = self.end().await {
            debug!("Failed to end socket after ON_END read: {}", e);
        }

        match outcome {
            Ok(Ok(chunks)) => Ok(Payload::concat(chunks, text)),
            Ok(Err(e)) => Err(TcpError::Io(e)),
            Err(_) => {
                debug!("ON_END read timed out after {:?}", limit);
                Err(TcpError::ReadTimeout(millis(limit)))
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("config", &self.config)
            .field("alive", &self.is_alive())
            .field("fully_open", &self.is_fully_open())
            .field("connects", &self.connects)
            .finish()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
