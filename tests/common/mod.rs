//! In-process TCP servers for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Test timeout to prevent hanging tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A running test server.
pub struct TestServer {
    pub port: u16,
    /// Connections accepted so far.
    pub accepted: Arc<AtomicUsize>,
    /// Server-side streams handed out by `accepting`, if requested.
    pub streams: Option<mpsc::UnboundedReceiver<TcpStream>>,
}

impl TestServer {
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub async fn next_stream(&mut self) -> TcpStream {
        let streams = self.streams.as_mut().expect("Server does not hand out streams");
        tokio::time::timeout(TEST_TIMEOUT, streams.recv())
            .await
            .expect("Test timed out")
            .expect("Server stopped")
    }
}

/// Spawn a server running `handler` on every accepted connection.
pub async fn serve<F, Fut>(handler: F) -> TestServer
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind");
    let port = listener.local_addr().expect("No local addr").port();
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(handler(stream));
        }
    });

    TestServer {
        port,
        accepted,
        streams: None,
    }
}

/// Spawn a server that hands every accepted stream to the test.
pub async fn accepting() -> TestServer {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut server = serve(move |stream| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(stream);
        }
    })
    .await;
    server.streams = Some(rx);
    server
}

/// Build the `{pong: ping + 1}` reply for a raw request.
pub fn pong(request: &[u8]) -> Vec<u8> {
    let req: Value = serde_json::from_slice(request).expect("Request is not JSON");
    let ping = req["ping"].as_i64().expect("Request has no ping");
    serde_json::to_vec(&json!({ "pong": ping + 1 })).expect("Serialize reply")
}

/// Answer one request with `{pong: ping + 1}` and close the connection.
pub async fn pong_then_close(mut stream: TcpStream) {
    let mut buf = vec![0u8; 4096];
    let Ok(n) = stream.read(&mut buf).await else {
        return;
    };
    if n == 0 {
        return;
    }
    let _ = stream.write_all(&pong(&buf[..n])).await;
    let _ = stream.shutdown().await;
}

/// Answer every request with `{pong: ping + 1}`, keeping the connection open.
pub async fn pong_keep_alive(mut stream: TcpStream) {
    let mut buf = vec![0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if stream.write_all(&pong(&buf[..n])).await.is_err() {
                    return;
                }
            }
        }
    }
}
