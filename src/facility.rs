//! Config-driven lifecycle wrapper.
//!
//! A `TcpFacility` reads a `FacilityConfig` (usually from a JSON file),
//! builds one connection plus an RPC client on `start()` and ends the
//! connection on `stop()`. It holds no logic of its own beyond wiring.
//!
//! # Config file
//!
//! ```text
//! {
//!   "host": "127.0.0.1",
//!   "port": 7070,
//!   "encoding": "utf-8",
//!   "readStrategy": "on_end",
//!   "json": true,
//!   "timeout": 3000,
//!   "delay": 50
//! }
//! ```
//!
//! Everything except `host` and `port` is optional; missing keys fall back
//! to the RPC client defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::connection::{Connection, SharedConnection, TcpError};
use crate::models::{ConnectionOptions, ReadStrategy};
use crate::rpc::{ConfigError, RpcClient, RpcClientOptions, RpcError};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV_VAR: &str = "TCP_RPC_CONFIG";

/// Settings for one facility instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilityConfig {
    pub host: String,
    pub port: i64,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub read_strategy: Option<ReadStrategy>,
    #[serde(default)]
    pub json: Option<bool>,
    /// Read timeout in milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Settle delay in milliseconds.
    #[serde(default)]
    pub delay: Option<u64>,
}

impl FacilityConfig {
    /// Config with only an address; everything else defaulted.
    pub fn new(host: impl Into<String>, port: i64) -> Self {
        Self {
            host: host.into(),
            port,
            encoding: None,
            read_strategy: None,
            json: None,
            timeout: None,
            delay: None,
        }
    }

    /// Parse a JSON config document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::InvalidOptions(e.to_string()))
    }

    /// Load a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            host: self.host.clone(),
            port: self.port,
            encoding: self.encoding.clone(),
        }
    }

    /// RPC options without a connection source.
    pub fn rpc_options(&self) -> RpcClientOptions {
        let defaults = RpcClientOptions::default();
        RpcClientOptions {
            connection: None,
            connection_options: None,
            read_strategy: self.read_strategy.unwrap_or(defaults.read_strategy),
            json: self.json.unwrap_or(defaults.json),
            timeout: self.timeout.map_or(defaults.timeout, Duration::from_millis),
            delay: self.delay.map_or(defaults.delay, Duration::from_millis),
        }
    }
}

/// Resolve the default config file path.
///
/// Resolution order:
/// 1. `$TCP_RPC_CONFIG`
/// 2. `<config dir>/tcp-rpc/facility.json` (XDG on Linux, Library on macOS)
/// 3. `./tcp-rpc.json`
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        return PathBuf::from(path);
    }

    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("tcp-rpc").join("facility.json");
    }

    PathBuf::from("tcp-rpc.json")
}

/// Lifecycle owner for one connection and its RPC client.
#[derive(Debug)]
pub struct TcpFacility {
    config: FacilityConfig,
    connection: Option<SharedConnection>,
    rpc: Option<RpcClient>,
}

impl TcpFacility {
    /// Create a stopped facility. Performs no I/O.
    pub fn new(config: FacilityConfig) -> Self {
        Self {
            config,
            connection: None,
            rpc: None,
        }
    }

    pub fn config(&self) -> &FacilityConfig {
        &self.config
    }

    /// Build the connection and RPC client and open the connection.
    ///
    /// Starting an already started facility reopens its connection if needed
    /// and keeps the existing client.
    pub async fn start(&mut self) -> Result<(), RpcError> {
        if let Some(rpc) = &self.rpc {
            return rpc.start().await;
        }

        let connection = Connection::new(self.config.connection_options())?.into_shared();
        let rpc = RpcClient::new(RpcClientOptions {
            connection: Some(connection.clone()),
            ..self.config.rpc_options()
        })?;
        rpc.start().await?;

        info!(
            "TCP facility started for {}:{}",
            self.config.host, self.config.port
        );
        self.connection = Some(connection);
        self.rpc = Some(rpc);
        Ok(())
    }

    /// End the connection. The client stays usable and reconnects on demand.
    pub async fn stop(&mut self) -> Result<(), RpcError> {
        if let Some(rpc) = &self.rpc {
            rpc.stop().await?;
            info!("TCP facility stopped");
        }
        Ok(())
    }

    /// RPC client, once started.
    pub fn rpc(&self) -> Option<&RpcClient> {
        self.rpc.as_ref()
    }

    /// Shared connection, once started.
    pub fn connection(&self) -> Option<SharedConnection> {
        self.connection.clone()
    }

    /// Build a standalone connection.
    pub fn client(options: ConnectionOptions) -> Result<Connection, TcpError> {
        Connection::new(options)
    }

    /// Build a standalone RPC client.
    pub fn rpc_client(options: RpcClientOptions) -> Result<RpcClient, RpcError> {
        RpcClient::new(options)
    }
}
