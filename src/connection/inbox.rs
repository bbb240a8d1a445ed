//! Background read pump and the inbox it fills.
//!
//! Each open socket gets one pump task that owns the read half, decodes
//! inbound bytes into chunks and queues them in a shared `Inbox`. Reads
//! never touch the socket directly; they wait on the inbox for the next
//! event. This keeps end-of-stream and transport failures observable even
//! while no read is running, which is what the liveness queries need.
//!
//! The backlog is bounded: once `MAX_BACKLOG_BYTES` are queued the pump stops
//! reading until a read or a write makes room, so a peer that keeps sending
//! is held back by TCP flow control instead of growing the inbox.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

use super::encoding::ChunkDecoder;
use crate::models::Payload;

/// Capacity reserved for each socket read.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Queued bytes at which the pump pauses reading.
pub(crate) const MAX_BACKLOG_BYTES: usize = 1024 * 1024;

/// What a waiting read observes next.
#[derive(Debug)]
pub(crate) enum Event {
    Data(Payload),
    End,
    Failed(io::Error),
}

#[derive(Debug, Default)]
struct Inbox {
    chunks: VecDeque<Payload>,
    /// Total length of `chunks`.
    bytes: usize,
    eof: bool,
    failed: bool,
    /// Error not yet reported to a reader.
    failure: Option<io::Error>,
}

/// State shared between a socket's pump and the owning connection.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    inbox: Mutex<Inbox>,
    /// Wakes a waiting read.
    notify: Notify,
    /// Wakes the pump once the backlog shrinks.
    space: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inbox> {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.lock().failed
    }

    /// The peer ended the stream, whether or not chunks are still queued.
    pub(crate) fn is_ended(&self) -> bool {
        self.lock().eof
    }

    /// The peer ended the stream and every chunk before the end was consumed.
    pub(crate) fn is_drained(&self) -> bool {
        let inbox = self.lock();
        inbox.eof && inbox.chunks.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.lock().chunks.len()
    }

    #[cfg(test)]
    pub(crate) fn queued_bytes(&self) -> usize {
        self.lock().bytes
    }

    /// Drop queued chunks, returning how many were discarded.
    pub(crate) fn clear(&self) -> usize {
        let mut inbox = self.lock();
        let dropped = inbox.chunks.len();
        inbox.chunks.clear();
        inbox.bytes = 0;
        drop(inbox);
        self.space.notify_one();
        dropped
    }

    /// Wait for the next event.
    ///
    /// Cancel safe: a chunk is removed from the inbox only in the same step
    /// that returns it.
    pub(crate) async fn next_event(&self) -> Event {
        loop {
            let notified = self.notify.notified();
            if let Some(event) = self.poll_event() {
                return event;
            }
            notified.await;
        }
    }

    fn poll_event(&self) -> Option<Event> {
        let mut inbox = self.lock();
        if inbox.failed {
            let err = inbox
                .failure
                .take()
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket failed"));
            return Some(Event::Failed(err));
        }
        if let Some(chunk) = inbox.chunks.pop_front() {
            inbox.bytes -= chunk.len();
            drop(inbox);
            self.space.notify_one();
            return Some(Event::Data(chunk));
        }
        if inbox.eof {
            return Some(Event::End);
        }
        None
    }

    fn push(&self, chunk: Payload) {
        {
            let mut inbox = self.lock();
            inbox.bytes += chunk.len();
            inbox.chunks.push_back(chunk);
        }
        self.notify.notify_one();
    }

    /// Wait until the backlog is below `MAX_BACKLOG_BYTES`.
    async fn wait_for_space(&self) {
        loop {
            let space = self.space.notified();
            if self.lock().bytes < MAX_BACKLOG_BYTES {
                return;
            }
            space.await;
        }
    }

    fn finish(&self) {
        self.lock().eof = true;
        self.notify.notify_one();
    }

    fn fail(&self, err: io::Error) {
        {
            let mut inbox = self.lock();
            inbox.failed = true;
            inbox.failure = Some(err);
        }
        self.notify.notify_one();
    }
}

/// Spawn the pump for a freshly connected socket.
pub(crate) fn spawn_pump(
    reader: OwnedReadHalf,
    decoder: ChunkDecoder,
    shared: Arc<Shared>,
) -> JoinHandle<()> {
    tokio::spawn(pump(reader, decoder, shared))
}

async fn pump(mut reader: OwnedReadHalf, mut decoder: ChunkDecoder, shared: Arc<Shared>) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        shared.wait_for_space().await;
        buf.reserve(READ_BUFFER_SIZE);
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                if let Some(rest) = decoder.finish() {
                    shared.push(rest);
                }
                debug!("Peer ended the stream");
                shared.finish();
                return;
            }
            Ok(_) => {
                let bytes = buf.split().freeze();
                if let Some(chunk) = decoder.decode(bytes) {
                    shared.push(chunk);
                }
            }
            Err(e) => {
                debug!("Socket read failed: {}", e);
                shared.fail(e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_events_in_order() {
        let shared = Shared::default();
        shared.push(Payload::from("a"));
        shared.push(Payload::from("b"));
        shared.finish();

        assert!(!shared.is_drained());
        assert!(matches!(shared.next_event().await, Event::Data(p) if p == Payload::from("a")));
        assert!(matches!(shared.next_event().await, Event::Data(p) if p == Payload::from("b")));
        assert!(shared.is_drained());
        assert!(matches!(shared.next_event().await, Event::End));
    }

    #[tokio::test]
    async fn test_waiter_is_woken_by_push() {
        let shared = Arc::new(Shared::default());
        let waiter = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move { shared.next_event().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        shared.push(Payload::from("late"));

        let event = timeout(TEST_TIMEOUT, waiter)
            .await
            .expect("Test timed out")
            .expect("Waiter panicked");
        assert!(matches!(event, Event::Data(p) if p == Payload::from("late")));
    }

    #[tokio::test]
    async fn test_failure_reported_before_data() {
        let shared = Shared::default();
        shared.push(Payload::from("lost"));
        shared.fail(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));

        assert!(shared.is_failed());
        match shared.next_event().await {
            Event::Failed(err) => assert_eq!(err.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("Expected failure, got {:?}", other),
        }
        // Subsequent waits keep failing rather than hanging
        assert!(matches!(shared.next_event().await, Event::Failed(_)));
    }

    #[tokio::test]
    async fn test_backlog_is_bounded_without_losing_data() {
        use tokio::io::AsyncWriteExt;
        use tokio::net::{TcpListener, TcpStream};

        // Well past what the kernel socket buffers can absorb
        const TOTAL: usize = 32 * 1024 * 1024;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        let (reader, _writer) = client.into_split();
        let shared = Arc::new(Shared::default());
        let _pump = spawn_pump(reader, ChunkDecoder::new(None), Arc::clone(&shared));

        let sender = tokio::spawn(async move {
            peer.write_all(&vec![7u8; TOTAL]).await.unwrap();
            peer.shutdown().await.unwrap();
        });

        // Nobody reads: the pump fills up to the cap and stops
        let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
        while shared.queued_bytes() < MAX_BACKLOG_BYTES {
            assert!(tokio::time::Instant::now() < deadline, "Backlog never filled");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let held = shared.queued_bytes();
        assert!(
            held < MAX_BACKLOG_BYTES + 4 * READ_BUFFER_SIZE,
            "Backlog grew to {} bytes",
            held
        );
        assert!(!sender.is_finished(), "Peer should be held back");

        // Draining lets the rest through, in full
        let mut received = 0;
        loop {
            match timeout(TEST_TIMEOUT, shared.next_event()).await.unwrap() {
                Event::Data(chunk) => received += chunk.len(),
                Event::End => break,
                Event::Failed(e) => panic!("Socket failed: {}", e),
            }
        }
        assert_eq!(received, TOTAL);
        timeout(TEST_TIMEOUT, sender).await.unwrap().unwrap();
    }

    #[test]
    fn test_end_is_seen_before_backlog_drains() {
        let shared = Shared::default();
        shared.push(Payload::from("tail"));
        shared.finish();

        assert!(shared.is_ended());
        assert!(!shared.is_drained());
    }

    #[test]
    fn test_clear_discards_backlog() {
        let shared = Shared::default();
        shared.push(Payload::from("stale 1"));
        shared.push(Payload::from("stale 2"));
        assert_eq!(shared.queued_bytes(), 14);
        assert_eq!(shared.clear(), 2);
        assert_eq!(shared.queued_bytes(), 0);
        assert_eq!(shared.clear(), 0);
    }
}
