//! Request/response RPC over a single unframed TCP connection.
//!
//! `RpcClient` pairs a `Connection` with a single-slot `TaskQueue`. Every
//! `request` becomes one queued job that writes the payload, reads one
//! response, waits a short settle delay and decodes the reply. Because jobs
//! run strictly one at a time, concurrent callers can share the connection
//! without receiving each other's responses.
//!
//! # Settle delay
//!
//! The stream carries no message boundaries, so a slow tail of one response
//! could land in the next request's read. Holding the queue slot for
//! `delay` after each response narrows that window. It does not close it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

use crate::connection::{Connection, SharedConnection, TcpError};
use crate::models::{
    ConnectionOptions, Message, Payload, ReadOptions, ReadStrategy, DEFAULT_DELAY_MS,
    DEFAULT_TIMEOUT_MS,
};
use crate::queue::{QueueError, TaskQueue};

/// Client construction errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Neither a connection nor connection options were supplied.
    #[error("Either a connection or connection options must be provided")]
    MissingConnection,

    /// Both a connection and connection options were supplied.
    #[error("A connection and connection options cannot both be provided")]
    ConflictingConnection,

    /// Options from a config source could not be interpreted.
    #[error("Invalid options: {0}")]
    InvalidOptions(String),
}

/// RPC-level error types.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tcp(#[from] TcpError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Request payload could not be serialized as JSON.
    #[error("Failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    /// Response was not valid JSON.
    #[error("Failed to decode response: {0}")]
    Decode(#[source] serde_json::Error),
}

impl RpcError {
    /// Whether the request failed because no response arrived in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Tcp(TcpError::ReadTimeout(_)))
    }
}

/// Options for building an `RpcClient`.
///
/// Exactly one of `connection` and `connection_options` must be set.
///
/// ```ignore
/// let opts = RpcClientOptions {
///     connection_options: Some(ConnectionOptions::new("127.0.0.1", 7070)),
///     read_strategy: ReadStrategy::OnEnd,
///     ..Default::default()
/// };
/// ```
#[derive(Clone)]
pub struct RpcClientOptions {
    /// Existing connection to reuse.
    pub connection: Option<SharedConnection>,
    /// Options for a connection owned by the client.
    pub connection_options: Option<ConnectionOptions>,
    pub read_strategy: ReadStrategy,
    /// Encode requests and decode responses as JSON.
    pub json: bool,
    /// Read timeout per request.
    pub timeout: Duration,
    /// Settle delay after each response.
    pub delay: Duration,
}

impl Default for RpcClientOptions {
    fn default() -> Self {
        Self {
            connection: None,
            connection_options: None,
            read_strategy: ReadStrategy::OnData,
            json: true,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            delay: Duration::from_millis(DEFAULT_DELAY_MS),
        }
    }
}

impl std::fmt::Debug for RpcClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClientOptions")
            .field("connection", &self.connection.as_ref().map(|_| "<shared>"))
            .field("connection_options", &self.connection_options)
            .field("read_strategy", &self.read_strategy)
            .field("json", &self.json)
            .field("timeout", &self.timeout)
            .field("delay", &self.delay)
            .finish()
    }
}

/// Immutable per-client request settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcConfig {
    pub json: bool,
    pub timeout: Duration,
    pub read_strategy: ReadStrategy,
    pub delay: Duration,
}

/// Serialized request/response client.
///
/// # Example
///
/// ```ignore
/// use serde_json::json;
/// use tcp_rpc::{ConnectionOptions, Message, RpcClient, RpcClientOptions};
///
/// let client = RpcClient::new(RpcClientOptions {
///     connection_options: Some(ConnectionOptions::new("127.0.0.1", 7070).with_encoding("utf-8")),
///     ..Default::default()
/// })?;
/// client.start().await?;
/// let reply = client.request(json!({"ping": 1})).await?;
/// assert_eq!(reply, Message::Json(json!({"pong": 2})));
/// ```
pub struct RpcClient {
    connection: SharedConnection,
    queue: TaskQueue,
    config: RpcConfig,
}

impl RpcClient {
    /// Build a client. Performs no network I/O.
    ///
    /// # Errors
    ///
    /// - `ConfigError::MissingConnection` / `ConfigError::ConflictingConnection`
    ///   unless exactly one connection source is given
    /// - `RpcError::Tcp` if the connection options fail validation
    pub fn new(options: RpcClientOptions) -> Result<Self, RpcError> {
        let connection = match (options.connection, options.connection_options) {
            (None, None) => return Err(ConfigError::MissingConnection.into()),
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingConnection.into()),
            (Some(connection), None) => connection,
            (None, Some(opts)) => Connection::new(opts)?.into_shared(),
        };

        Ok(Self {
            connection,
            queue: TaskQueue::new(),
            config: RpcConfig {
                json: options.json,
                timeout: options.timeout,
                read_strategy: options.read_strategy,
                delay: options.delay,
            },
        })
    }

    pub fn config(&self) -> RpcConfig {
        self.config
    }

    /// Handle to the underlying connection.
    pub fn connection(&self) -> SharedConnection {
        Arc::clone(&self.connection)
    }

    /// Make sure the connection is fully open.
    pub async fn start(&self) -> Result<(), RpcError> {
        let mut connection = self.connection.lock().await;
        if !connection.is_fully_open() {
            connection.open().await?;
        }
        Ok(())
    }

    /// Gracefully end the connection.
    pub async fn stop(&self) -> Result<(), RpcError> {
        self.connection.lock().await.end().await?;
        Ok(())
    }

    /// Send one request and wait for its response.
    ///
    /// The request is queued immediately; requests run strictly one after
    /// another in call order, settle delay included. The returned future
    /// only observes the outcome, so dropping it does not cancel the job.
    ///
    /// With JSON enabled the payload is serialized (a `Text` payload becomes
    /// a JSON string) and the reply is parsed into `Message::Json`. With JSON
    /// disabled `Text` and `Bytes` pass through unchanged and the reply is
    /// returned raw; a `Json` payload is sent as its serialized text.
    pub fn request(
        &self,
        payload: impl Into<Message>,
    ) -> impl Future<Output = Result<Message, RpcError>> + Send + 'static {
        let connection = Arc::clone(&self.connection);
        let config = self.config;
        let payload = payload.into();

        let job = self
            .queue
            .push_task(move || exchange(connection, config, payload));
        async move { job.await? }
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("config", &self.config)
            .field("pending", &self.queue.pending())
            .finish()
    }
}

/// One queued request: write, read, settle, decode.
async fn exchange(
    connection: SharedConnection,
    config: RpcConfig,
    payload: Message,
) -> Result<Message, RpcError> {
    let request = encode_request(payload, config.json)?;

    let raw = {
        let mut connection = connection.lock().await;
        connection.write(request).await?;
        connection
            .read(ReadOptions::new(config.read_strategy, config.timeout))
            .await?
    };
    debug!("Received {} byte response", raw.len());

    sleep(config.delay).await;

    decode_response(raw, config.json)
}

fn encode_request(payload: Message, json: bool) -> Result<Payload, RpcError> {
    if !json {
        return Ok(match payload {
            Message::Text(text) => Payload::Text(text),
            Message::Bytes(bytes) => Payload::Bytes(bytes),
            Message::Json(value) => Payload::Text(value.to_string()),
        });
    }

    let encoded = match &payload {
        Message::Json(value) => serde_json::to_string(value),
        Message::Text(text) => serde_json::to_string(text),
        Message::Bytes(bytes) => serde_json::to_string(bytes.as_ref()),
    }
    .map_err(RpcError::Encode)?;
    Ok(Payload::Text(encoded))
}

fn decode_response(raw: Payload, json: bool) -> Result<Message, RpcError> {
    if !json {
        return Ok(raw.into());
    }

    let value = match &raw {
        Payload::Text(text) => serde_json::from_str(text),
        Payload::Bytes(bytes) => serde_json::from_slice(bytes),
    }
    .map_err(RpcError::Decode)?;
    Ok(Message::Json(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn options(port: i64) -> ConnectionOptions {
        ConnectionOptions::new("127.0.0.1", port).with_encoding("utf-8")
    }

    #[test]
    fn test_defaults() {
        let client = RpcClient::new(RpcClientOptions {
            connection_options: Some(options(7070)),
            ..Default::default()
        })
        .expect("Valid options");

        assert_eq!(
            client.config(),
            RpcConfig {
                json: true,
                timeout: Duration::from_millis(500),
                read_strategy: ReadStrategy::OnData,
                delay: Duration::from_millis(50),
            }
        );
    }

    #[test]
    fn test_missing_connection() {
        let err = RpcClient::new(RpcClientOptions::default()).unwrap_err();
        assert!(matches!(err, RpcError::Config(ConfigError::MissingConnection)));
    }

    #[test]
    fn test_conflicting_connection() {
        let shared = Connection::new(options(7070)).unwrap().into_shared();
        let err = RpcClient::new(RpcClientOptions {
            connection: Some(shared),
            connection_options: Some(options(7070)),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, RpcError::Config(ConfigError::ConflictingConnection)));
    }

    #[test]
    fn test_invalid_connection_options() {
        let err = RpcClient::new(RpcClientOptions {
            connection_options: Some(options(0)),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, RpcError::Tcp(TcpError::InvalidPort(0))));
    }

    #[test]
    fn test_existing_connection_is_shared() {
        let shared = Connection::new(options(7070)).unwrap().into_shared();
        let client = RpcClient::new(RpcClientOptions {
            connection: Some(Arc::clone(&shared)),
            ..Default::default()
        })
        .unwrap();
        assert!(Arc::ptr_eq(&client.connection(), &shared));
    }

    #[test]
    fn test_encode_json() {
        assert_eq!(
            encode_request(json!({"a": 1}).into(), true).unwrap(),
            Payload::from(r#"{"a":1}"#)
        );
        assert_eq!(
            encode_request(Message::from("hi"), true).unwrap(),
            Payload::from(r#""hi""#)
        );
        assert_eq!(
            encode_request(Message::from(vec![1u8, 2]), true).unwrap(),
            Payload::from("[1,2]")
        );
    }

    #[test]
    fn test_encode_raw_passes_through() {
        let raw = Bytes::from_static(b"request");
        assert_eq!(
            encode_request(Message::Bytes(raw.clone()), false).unwrap(),
            Payload::Bytes(raw)
        );
        assert_eq!(
            encode_request(Message::from("plain"), false).unwrap(),
            Payload::from("plain")
        );
    }

    #[test]
    fn test_decode_json_from_text_and_bytes() {
        assert_eq!(
            decode_response(Payload::from(r#"{"pong":2}"#), true).unwrap(),
            Message::Json(json!({"pong": 2}))
        );
        assert_eq!(
            decode_response(Payload::from(br#"{"pong":3}"#.to_vec()), true).unwrap(),
            Message::Json(json!({"pong": 3}))
        );
    }

    #[test]
    fn test_decode_malformed_json() {
        let err = decode_response(Payload::from("{not json"), true).unwrap_err();
        assert!(matches!(err, RpcError::Decode(_)));
    }

    #[test]
    fn test_decode_raw_mirrors_payload() {
        assert_eq!(
            decode_response(Payload::from(b"reply".to_vec()), false).unwrap(),
            Message::Bytes(Bytes::from_static(b"reply"))
        );
        assert_eq!(
            decode_response(Payload::from("reply"), false).unwrap(),
            Message::Text("reply".to_string())
        );
    }

    #[test]
    fn test_timeout_classification() {
        assert!(RpcError::from(TcpError::ReadTimeout(500)).is_timeout());
        assert!(!RpcError::from(TcpError::NotWritable).is_timeout());
    }
}
