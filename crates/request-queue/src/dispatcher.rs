//! Bounded-concurrency FIFO dispatcher
//!
//! Unary operations are appended to a queue and started strictly in arrival
//! order, with at most `max_concurrency` running at once. Each started
//! operation runs on its own tokio task; when it settles (success, failure or
//! panic) its slot is released and another drain is scheduled as a fresh
//! task, so a long run of fast completions never deepens the call stack.
//!
//! A queued item whose caller has dropped the returned future is skipped when
//! it reaches the head. Once started, an operation runs to completion even if
//! nobody is waiting for it; its result is discarded.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Maximum simultaneous in-flight operations.
pub const DEFAULT_MAX_CONCURRENCY: usize = 15;

/// A queued unit of work. Returns `None` when its caller has gone away.
type Job = Box<dyn FnOnce() -> Option<BoxFuture<'static, ()>> + Send>;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Job>,
    running: usize,
    peak: usize,
}

struct Inner {
    state: Mutex<QueueState>,
    max_concurrency: usize,
}

/// FIFO queue capped at `max_concurrency` running operations.
///
/// Cheap to clone; clones share the same queue. Must be used from within a
/// tokio runtime because started operations are spawned as tasks.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENCY)
    }
}

impl Dispatcher {
    /// Create a dispatcher. A `max_concurrency` of zero is treated as one.
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                max_concurrency: max_concurrency.max(1),
            }),
        }
    }

    /// Queue `op` and return a future for its output.
    ///
    /// The operation is queued immediately, before the returned future is
    /// first polled. An `Err` means the operation panicked; the operation's
    /// own failures travel inside `T`.
    pub fn enqueue<F, Fut, T>(&self, op: F) -> impl Future<Output = Result<T>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            if tx.is_closed() {
                return None;
            }
            Some(Box::pin(async move {
                let output = op().await;
                // Receiver gone means the caller stopped waiting
                let _ = tx.send(output);
            }) as BoxFuture<'static, ()>)
        });

        {
            let mut state = self.inner.lock();
            state.queue.push_back(job);
            trace!(queued = state.queue.len(), "operation queued");
            metrics::gauge!("api_dispatcher_queued").set(state.queue.len() as f64);
        }
        self.inner.drain();

        async move {
            rx.await
                .map_err(|_| Error::Dropped("operation panicked before producing a result".into()))
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }

    /// Operations currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().running
    }

    /// Operations waiting for a slot.
    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Highest `in_flight()` value observed since creation.
    pub fn peak_in_flight(&self) -> usize {
        self.inner.lock().peak
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start queued jobs until the queue is empty or every slot is taken.
    fn drain(self: &Arc<Self>) {
        loop {
            let job = {
                let mut state = self.lock();
                if state.running >= self.max_concurrency {
                    return;
                }
                let Some(job) = state.queue.pop_front() else {
                    return;
                };
                state.running += 1;
                state.peak = state.peak.max(state.running);
                metrics::gauge!("api_dispatcher_in_flight").set(state.running as f64);
                metrics::gauge!("api_dispatcher_queued").set(state.queue.len() as f64);
                job
            };

            match job() {
                Some(operation) => {
                    let slot = Slot {
                        inner: Arc::clone(self),
                    };
                    tokio::spawn(async move {
                        let _slot = slot;
                        operation.await;
                    });
                }
                None => {
                    debug!("skipping abandoned operation");
                    let mut state = self.lock();
                    state.running -= 1;
                    metrics::gauge!("api_dispatcher_in_flight").set(state.running as f64);
                }
            }
        }
    }
}

/// Holds one concurrency slot; dropping it releases the slot and schedules
/// the next drain. Dropped on settle and on panic alike.
struct Slot {
    inner: Arc<Inner>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        {
            let mut state = self.inner.lock();
            state.running -= 1;
            metrics::gauge!("api_dispatcher_in_flight").set(state.running as f64);
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            handle.spawn(async move { inner.drain() });
        }
    }
}
