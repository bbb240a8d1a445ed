//! FIFO task queue with bounded concurrency.
//!
//! `TaskQueue` runs asynchronous operations in submission order with at most
//! `concurrency` of them in flight. Each submission gets its own future that
//! settles with that operation's output only; a failing or panicking job
//! never affects the ones queued behind it.
//!
//! The queue is a generic primitive. Request/response correlation on a
//! shared unframed stream relies on running it with a concurrency of 1.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Queue-level error types.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The job panicked or was torn down before producing a result.
    #[error("Task aborted before completion")]
    Aborted,
}

#[derive(Default)]
struct State {
    jobs: VecDeque<Job>,
    running: usize,
}

struct Inner {
    concurrency: usize,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// FIFO executor for asynchronous jobs.
///
/// Cloning yields another handle to the same queue.
///
/// # Example
///
/// ```ignore
/// let queue = TaskQueue::new();
/// let first = queue.push_task(|| async { 1 });
/// let second = queue.push_task(|| async { 2 });
/// assert_eq!(first.await?, 1);
/// assert_eq!(second.await?, 2);
/// ```
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    /// Queue running one job at a time.
    pub fn new() -> Self {
        Self::with_concurrency(1)
    }

    /// Queue running up to `concurrency` jobs at once (`0` is treated as 1).
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                concurrency: concurrency.max(1),
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    /// Jobs waiting for a free slot.
    pub fn pending(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    /// Execution slots currently taken by workers.
    pub fn running(&self) -> usize {
        self.inner.lock().running
    }

    /// Enqueue an operation and return a future for its output.
    ///
    /// The job is queued when this method is called, not when the returned
    /// future is first polled, so call order is execution order. Dropping
    /// the returned future does not cancel the job.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// The future resolves to `QueueError::Aborted` if the operation panics.
    pub fn push_task<F, Fut, T>(&self, task: F) -> impl Future<Output = Result<T, QueueError>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let output = task().await;
            // Receiver may be gone; the job still ran to completion
            let _ = tx.send(output);
        });
        self.enqueue(job);

        async move { rx.await.map_err(|_| QueueError::Aborted) }
    }

    fn enqueue(&self, job: Job) {
        let start_worker = {
            let mut state = self.inner.lock();
            state.jobs.push_back(job);
            if state.running < self.inner.concurrency {
                state.running += 1;
                true
            } else {
                false
            }
        };

        if start_worker {
            tokio::spawn(drain(Arc::clone(&self.inner)));
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker loop: run queued jobs until the queue is empty.
///
/// Each job runs in its own task so a panic only loses that job.
async fn drain(inner: Arc<Inner>) {
    loop {
        let job = {
            let mut state = inner.lock();
            match state.jobs.pop_front() {
                Some(job) => job,
                None => {
                    state.running -= 1;
                    return;
                }
            }
        };

        if let Err(e) = tokio::spawn(job).await {
            warn!("Queued task aborted: {}", e);
        }
    }
}
