//! Single-worker task queue.
//!
//! Every mutating file operation is pushed onto a [`Sequential`] queue so that
//! its effects apply in submission order, one at a time, even when several
//! callers hold the same handle. A job is enqueued synchronously by
//! [`Sequential::push`]; the returned future only observes its completion.
//!
//! # Design
//!
//! - One tokio task drains an unbounded channel of boxed jobs
//! - The worker is spawned on the first push, from inside the caller's runtime
//! - A job that fails or panics resolves its own caller and nothing else

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Errors produced by the queue itself rather than by a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceError {
    /// `push` was called outside a tokio runtime.
    NoRuntime,
    /// The worker stopped before the job reported back.
    WorkerGone,
    /// The job panicked.
    Panicked,
}

impl fmt::Display for SequenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRuntime => write!(f, "no tokio runtime to run the queue worker"),
            Self::WorkerGone => write!(f, "queue worker stopped"),
            Self::Panicked => write!(f, "queued operation panicked"),
        }
    }
}

impl std::error::Error for SequenceError {}

/// A FIFO of asynchronous jobs executed one at a time.
#[derive(Default)]
pub struct Sequential {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
}

impl Sequential {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `job` now and return a future resolving to its result.
    pub fn push<T, E, F>(&self, job: F) -> impl Future<Output = Result<T, E>> + Send + use<T, E, F>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<SequenceError> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let boxed: Job = Box::pin(async move {
            let outcome = AssertUnwindSafe(job).catch_unwind().await;
            // The caller may have stopped waiting; the job still ran.
            let _ = tx.send(outcome.map_err(|_| SequenceError::Panicked));
        });
        let dispatched = self.dispatch(boxed);

        async move {
            dispatched?;
            match rx.await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(SequenceError::WorkerGone.into()),
            }
        }
    }

    /// Resolves once every job pushed before it has finished.
    pub fn barrier(&self) -> impl Future<Output = Result<(), SequenceError>> + Send + use<> {
        self.push(async { Ok::<(), SequenceError>(()) })
    }

    fn dispatch(&self, job: Job) -> Result<(), SequenceError> {
        let mut sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(tx) = sender.as_ref().filter(|tx| !tx.is_closed()) {
            return tx.send(job).map_err(|_| SequenceError::WorkerGone);
        }

        let handle =
            tokio::runtime::Handle::try_current().map_err(|_| SequenceError::NoRuntime)?;
        let (tx, rx) = mpsc::unbounded_channel();
        handle.spawn(drain(rx));
        tx.send(job).map_err(|_| SequenceError::WorkerGone)?;
        *sender = Some(tx);
        Ok(())
    }
}

async fn drain(mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        job.await;
    }
}
