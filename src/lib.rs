//! TCP RPC client library
//!
//! Turns a raw, unframed TCP byte stream into a request/response channel:
//!
//! - `connection` - socket lifecycle (open, reconnect, end, destroy) and the
//!   two read strategies for extracting a response from the stream
//! - `queue` - FIFO task queue that runs one job at a time
//! - `rpc` - `RpcClient`, which funnels `request(payload)` calls through the
//!   queue so concurrent callers never receive each other's responses
//! - `facility` - config-file driven start/stop wrapper
//! - `models` - payloads, messages and option types shared by the above
//!
//! # Example
//!
//! ```ignore
//! use serde_json::json;
//! use tcp_rpc::{ConnectionOptions, ReadStrategy, RpcClient, RpcClientOptions};
//!
//! let client = RpcClient::new(RpcClientOptions {
//!     connection_options: Some(ConnectionOptions::new("127.0.0.1", 7070).with_encoding("utf-8")),
//!     read_strategy: ReadStrategy::OnEnd,
//!     ..Default::default()
//! })?;
//!
//! let reply = client.request(json!({"ping": 1})).await?;
//! ```
//!
//! Message framing, multiplexing, pooling and retries are left to callers.

pub mod connection;
pub mod facility;
pub mod models;
pub mod queue;
pub mod rpc;

pub use connection::{Connection, ConnectionConfig, Encoding, SharedConnection, TcpError};
pub use facility::{default_config_path, FacilityConfig, TcpFacility};
pub use models::{ConnectionOptions, Message, Payload, ReadOptions, ReadStrategy};
pub use queue::{QueueError, TaskQueue};
pub use rpc::{ConfigError, RpcClient, RpcClientOptions, RpcConfig, RpcError};
