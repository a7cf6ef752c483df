//! Fixed-window rate limiter for upstream sends.
//!
//! A single worker task owns the pending queue and the count of tasks
//! admitted in the current window. Every `window` the count is reset to
//! zero and the queue is drained again. The count is never decremented
//! when a task finishes, so at most `limit` tasks *start* per window.
//!
//! The window is fixed, not sliding: a full burst just before a boundary
//! followed by another right after it dispatches up to `2 * limit` tasks
//! in quick succession.
//!
//! A `limit` of zero admits nothing and every submission waits forever.
//! Reject it when loading configuration.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;

/// A unit of work waiting for admission.
type Job = Box<dyn FnOnce() + Send>;

/// How many tasks may start per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub limit: usize,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 5,
            window: Duration::from_millis(10_000),
        }
    }
}

/// Handle to a queued task's eventual output.
///
/// Resolves to [`RelayError::ChannelClosed`] if the limiter shut down
/// before the task ran.
pub struct Completion<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for Completion<T> {
    type Output = Result<T, RelayError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.map_err(|_| RelayError::ChannelClosed))
    }
}

/// Submission side of the limiter. Cheap to clone.
#[derive(Clone)]
pub struct RateLimiter {
    jobs: mpsc::UnboundedSender<Job>,
}

impl RateLimiter {
    /// Spawn the worker task. It runs until `cancel` fires or every
    /// `RateLimiter` clone has been dropped.
    pub fn spawn(config: RateLimitConfig, cancel: CancellationToken) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(Window::new(config.limit), rx, config.window, cancel));
        Self { jobs }
    }

    /// Queue `task` for execution.
    ///
    /// The closure is invoked on the worker in admission order, so any
    /// synchronous work it does happens in FIFO order. The future it
    /// returns runs on its own tokio task and its output is delivered
    /// through the returned [`Completion`]. Failures are the task's own
    /// business: the limiter never retries and a failed task still used
    /// its slot in the window.
    pub fn submit<F, Fut, T>(&self, task: F) -> Completion<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let fut = task();
            tokio::spawn(async move {
                let _ = done_tx.send(fut.await);
            });
        });

        if self.jobs.send(job).is_err() {
            tracing::warn!("Rate limiter is stopped, task discarded");
        }

        Completion { rx }
    }
}

/// Admission bookkeeping for the current window.
struct Window {
    limit: usize,
    active: usize,
    queue: VecDeque<Job>,
}

impl Window {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            active: 0,
            queue: VecDeque::new(),
        }
    }

    fn push(&mut self, job: Job) {
        self.queue.push_back(job);
        self.drain();
    }

    fn reset(&mut self) {
        self.active = 0;
        self.drain();
    }

    /// Start queued jobs while the window has capacity.
    fn drain(&mut self) -> usize {
        let mut started = 0;
        while self.active < self.limit {
            let Some(job) = self.queue.pop_front() else {
                break;
            };
            self.active += 1;
            started += 1;
            job();
        }
        if started > 0 {
            tracing::trace!(
                started,
                active = self.active,
                pending = self.queue.len(),
                "Rate limiter dispatched tasks",
            );
        }
        started
    }
}

async fn run_worker(
    mut window: Window,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => window.reset(),
            job = jobs.recv() => match job {
                Some(job) => window.push(job),
                None => break,
            },
        }
    }

    tracing::debug!(pending = window.queue.len(), "Rate limiter stopped");
}
