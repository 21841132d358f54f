//! Async values.
//!
//! A [`Promise`] is a cloneable handle to a single shared future. Clones
//! observe the same outcome, and two promises compare equal only when they
//! are clones of each other, so a computed signal holding a promise treats
//! every new epoch's promise as a change.
//!
//! Promises created by an async computation are tracked against their
//! epoch: a rejection arriving while the epoch is current moves the signal
//! into its error state. When a tokio runtime is available a driver task
//! polls the promise to completion so rejections surface without anyone
//! awaiting it; the driver is aborted when the epoch ends.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures_util::future::{BoxFuture, FutureExt, Shared};

use crate::error::{SignalError, SignalResult};

use super::context::ComputeContext;

/// Settlement state of a [`Promise`].
#[derive(Debug, Clone)]
pub enum TaskState<T> {
    Pending,
    Ready(T),
    Failed(SignalError),
}

impl<T> TaskState<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Shared, cloneable future of a `SignalResult<T>`.
pub struct Promise<T> {
    id: u64,
    future: Shared<BoxFuture<'static, SignalResult<T>>>,
}

impl<T> Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = SignalResult<T>> + Send + 'static,
    {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self {
            id: COUNTER.fetch_add(1, Ordering::Relaxed),
            future: future.boxed().shared(),
        }
    }

    /// An already fulfilled promise.
    pub fn resolved(value: T) -> Self {
        Self::new(std::future::ready(Ok(value)))
    }

    /// An already rejected promise.
    pub fn rejected(error: SignalError) -> Self {
        Self::new(std::future::ready(Err(error)))
    }

    /// Current settlement state, without polling.
    pub fn state(&self) -> TaskState<T> {
        match self.future.peek() {
            None => TaskState::Pending,
            Some(Ok(value)) => TaskState::Ready(value.clone()),
            Some(Err(error)) => TaskState::Failed(error.clone()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wrap `future` so a rejection is reported to the epoch that produced
    /// it, and drive it on the ambient tokio runtime if there is one.
    pub(crate) fn tracked<F>(ctx: &ComputeContext, future: F) -> Self
    where
        F: Future<Output = SignalResult<T>> + Send + 'static,
    {
        let reporter = ctx.clone();
        let promise = Self::new(async move {
            let outcome = future.await;
            if let Err(error) = &outcome {
                if !error.is_aborted() {
                    reporter.report_rejection(error.clone());
                }
            }
            outcome
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let driver = promise.clone();
            let task = handle.spawn(async move {
                let _ = driver.await;
            });
            ctx.cleanup(move || task.abort());
        }
        promise
    }
}

impl<T: Clone> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            future: self.future.clone(),
        }
    }
}

impl<T> PartialEq for Promise<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Future for Promise<T>
where
    T: Clone,
{
    type Output = SignalResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.future).poll(cx)
    }
}

impl<T: Clone> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.id)
            .field("settled", &self.future.peek().is_some())
            .finish()
    }
}
