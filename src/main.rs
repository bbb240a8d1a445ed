//! tcp-rpc - send requests over an unframed TCP stream from the command line.
//!
//! Every positional payload is submitted as one request. Requests are queued
//! in argument order and run one at a time over a single connection; replies
//! are printed one per line in the same order.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Result};
use clap::Parser;
use tcp_rpc::{FacilityConfig, Message, ReadStrategy, TcpFacility};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Server host
    #[arg(long, default_value = "127.0.0.1", env = "TCP_RPC_HOST")]
    host: String,

    /// Server port
    #[arg(long, env = "TCP_RPC_PORT")]
    port: Option<i64>,

    /// Text encoding (utf8, ascii, latin1); raw bytes when omitted
    #[arg(long)]
    encoding: Option<String>,

    /// Read strategy: on_data or on_end
    #[arg(long, default_value = "on_data")]
    strategy: ReadStrategy,

    /// Read timeout in milliseconds
    #[arg(long, default_value_t = 500)]
    timeout_ms: u64,

    /// Settle delay after each response in milliseconds
    #[arg(long, default_value_t = 50)]
    delay_ms: u64,

    /// Send payloads as-is instead of JSON-encoding them
    #[arg(long)]
    raw: bool,

    /// Load connection and RPC settings from a JSON config file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Request payloads
    #[arg(required = true)]
    payloads: Vec<String>,
}

impl Args {
    fn facility_config(&self) -> Result<FacilityConfig> {
        if let Some(path) = &self.config {
            return FacilityConfig::load(path);
        }

        let Some(port) = self.port else {
            bail!("--port is required unless --config is given");
        };

        Ok(FacilityConfig {
            encoding: self.encoding.clone(),
            read_strategy: Some(self.strategy),
            json: Some(!self.raw),
            timeout: Some(self.timeout_ms),
            delay: Some(self.delay_ms),
            ..FacilityConfig::new(self.host.clone(), port)
        })
    }
}

/// Interpret a command-line argument as a request payload.
///
/// In JSON mode arguments that parse as JSON are sent as values; anything
/// else is sent as a JSON string.
fn to_message(arg: &str, json: bool) -> Message {
    if json {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(arg) {
            return Message::Json(value);
        }
    }
    Message::Text(arg.to_owned())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tcp_rpc=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let args = Args::parse();
    let config = args.facility_config()?;
    let json = config.json.unwrap_or(true);
    info!(
        "Sending {} request(s) to {}:{}",
        args.payloads.len(),
        config.host,
        config.port
    );

    let mut facility = TcpFacility::new(config);
    facility.start().await?;
    let Some(rpc) = facility.rpc() else {
        bail!("RPC client not available after start");
    };

    // Queue everything up front; replies still come back in order
    let pending: Vec<_> = args
        .payloads
        .iter()
        .map(|arg| rpc.request(to_message(arg, json)))
        .collect();

    let mut failures = 0usize;
    for (arg, reply) in args.payloads.iter().zip(pending) {
        match reply.await {
            Ok(message) => println!("{}", message),
            Err(e) => {
                failures += 1;
                error!("Request {} failed: {}", arg, e);
            }
        }
    }

    if let Err(e) = facility.stop().await {
        error!("Failed to close connection: {}", e);
    }

    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
