//! Fan-in operation queue.
//!
//! Producers hold a [`QueueHandle`] and enqueue [`Backlog`] entries. Every
//! producer channel is forwarded into one backlog receiver, which a single
//! consumer drains one entry at a time.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Boxed operation body.
pub type OperationFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// One queued operation.
pub struct Backlog {
    context: String,
    operation: OperationFn,
}

impl Backlog {
    pub fn new<F, Fut>(context: impl Into<String>, operation: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            context: context.into(),
            operation: Box::new(move || operation().boxed()),
        }
    }

    /// Run the operation, logging a failure.
    pub async fn execute(self) {
        debug!(context = %self.context, "Executing queued operation");
        if let Err(e) = (self.operation)().await {
            warn!(context = %self.context, error = %e, "Queued operation failed");
        }
    }
}

impl std::fmt::Debug for Backlog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backlog").field("context", &self.context).finish_non_exhaustive()
    }
}

/// Resolves once `done` holds `true` or its sender is gone.
pub(crate) async fn stopped(done: &mut watch::Receiver<bool>) {
    let _ = done.wait_for(|done| *done).await;
}

/// Forward every input into `output` until the input closes, the output
/// closes, or `done` fires. One forwarding task per input.
///
/// Order is preserved per input only.
pub fn merge<T: Send + 'static>(
    inputs: Vec<mpsc::Receiver<T>>,
    output: mpsc::Sender<T>,
    done: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    inputs
        .into_iter()
        .map(|mut input| {
            let output = output.clone();
            let mut done = done.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        () = stopped(&mut done) => break,
                        item = input.recv() => {
                            let Some(item) = item else { break };
                            tokio::select! {
                                biased;
                                () = stopped(&mut done) => break,
                                sent = output.send(item) => {
                                    if sent.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
            })
        })
        .collect()
}

/// Producer side of an [`OperationQueue`].
#[derive(Debug, Clone)]
pub struct QueueHandle {
    sender: mpsc::Sender<Backlog>,
}

impl QueueHandle {
    /// Enqueue an entry, waiting for capacity.
    ///
    /// # Errors
    ///
    /// Returns `QueueClosed` when the consumer is gone.
    pub async fn enqueue(&self, backlog: Backlog) -> Result<()> {
        self.sender.send(backlog).await.map_err(|_| Error::QueueClosed)
    }

    /// Enqueue `work` and wait for its result.
    ///
    /// The wait is unbounded: the entry executes only when the consumer
    /// reaches it, which requires leadership.
    ///
    /// # Errors
    ///
    /// Returns `QueueClosed` when the entry is dropped without running,
    /// otherwise whatever `work` returns.
    pub async fn run<T, F, Fut>(&self, context: impl Into<String>, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (answer_tx, answer_rx) = oneshot::channel();
        self.enqueue(Backlog::new(context, move || async move {
            // The caller may have given up waiting.
            let _ = answer_tx.send(work().await);
            Ok(())
        }))
        .await?;

        answer_rx.await.map_err(|_| Error::QueueClosed)?
    }

    /// [`QueueHandle::run`] bounded by `after`.
    ///
    /// On timeout the entry stays queued and may still execute later.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when `after` elapses first.
    pub async fn run_timeout<T, F, Fut>(
        &self,
        context: impl Into<String>,
        after: Duration,
        work: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let context = context.into();
        tokio::time::timeout(after, self.run(context.clone(), work))
            .await
            .map_err(|_| Error::timeout(context, after))?
    }

    /// Run with an optional bound.
    pub(crate) async fn run_bounded<T, F, Fut>(
        &self,
        context: impl Into<String>,
        after: Option<Duration>,
        work: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        match after {
            Some(after) => self.run_timeout(context, after, work).await,
            None => self.run(context, work).await,
        }
    }
}

/// Multi-producer, single-consumer queue of operations.
#[derive(Debug)]
pub struct OperationQueue {
    capacity: usize,
    sender: mpsc::Sender<Backlog>,
    backlog: Mutex<Option<mpsc::Receiver<Backlog>>>,
    done: watch::Receiver<bool>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl OperationQueue {
    /// A queue whose channels hold up to `capacity` entries each. Producer
    /// forwarding stops once `done` fires.
    pub fn new(capacity: usize, done: watch::Receiver<bool>) -> Self {
        let (sender, backlog) = mpsc::channel(capacity.max(1));
        Self {
            capacity: capacity.max(1),
            sender,
            backlog: Mutex::new(Some(backlog)),
            done,
            forwarders: Mutex::new(Vec::new()),
        }
    }

    /// A handle sending straight into the backlog.
    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            sender: self.sender.clone(),
        }
    }

    /// A handle on a fresh channel forwarded into the backlog.
    pub fn producer(&self) -> QueueHandle {
        let (sender, input) = mpsc::channel(self.capacity);
        let forwarders = merge(vec![input], self.sender.clone(), self.done.clone());
        self.forwarders
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .extend(forwarders);
        QueueHandle { sender }
    }

    /// The consumer end. Available once.
    pub fn take_backlog(&self) -> Option<mpsc::Receiver<Backlog>> {
        self.backlog
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    /// Abort every forwarding task and drop the consumer end if nobody took
    /// it, so waiting and later callers see `QueueClosed`.
    pub fn close(&self) {
        drop(self.take_backlog());
        let forwarders = std::mem::take(
            &mut *self
                .forwarders
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for forwarder in forwarders {
            forwarder.abort();
        }
    }
}
