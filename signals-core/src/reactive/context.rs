//! Computation Context
//!
//! One `ComputeContext` exists per recomputation of a computed signal (an
//! "epoch"). It mediates everything the compute function touches:
//!
//! - **Dependencies.** [`ComputeContext::get`] reads a declared dependency.
//!   The first read of a name in an epoch subscribes to that dependency and
//!   caches the result; later reads reuse the cache. Only dependencies that
//!   were actually read are subscribed, so branching compute functions track
//!   exactly the branch they took.
//!
//! - **Cancellation.** Each epoch owns a `CancellationToken`, created on
//!   first use. It is cancelled when the next epoch starts or when the
//!   signal is disposed.
//!
//! - **Cleanup.** Callbacks registered with [`ComputeContext::cleanup`] run
//!   once, when the epoch is superseded or the signal is disposed.
//!
//! - **Guards.** [`ComputeContext::run`] refuses to start work in a
//!   superseded epoch. [`ComputeContext::safe`] wraps a future so that it
//!   never completes once its epoch is superseded, which keeps stale async
//!   continuations from writing into shared state.
//!
//! # Supersession
//!
//! Superseding an epoch cancels its token, drops its dependency
//! subscriptions and runs its cleanups. The owning signal does this before
//! the next epoch subscribes to anything, so subscriptions never leak from
//! one epoch into the next.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio_util::sync::CancellationToken;

use crate::error::{SignalError, SignalResult};

use super::signal::Deps;
use super::subscriber::Subscription;

type Notify = Arc<dyn Fn() + Send + Sync>;
type Reporter = Arc<dyn Fn(SignalError) + Send + Sync>;

/// A cached dependency read.
struct Read {
    version: u64,
    value: SignalResult<Arc<dyn Any + Send + Sync>>,
}

/// Tracks whether the epoch's result has been committed, and holds an async
/// rejection that arrived before that.
#[derive(Default)]
struct Settle {
    committed: bool,
    rejection: Option<SignalError>,
}

struct ContextInner {
    signal: String,
    epoch: u64,
    deps: Deps,
    on_dependency_change: Notify,
    reporter: Option<Reporter>,
    superseded: AtomicBool,
    token: OnceLock<CancellationToken>,
    reads: Mutex<HashMap<String, Read>>,
    subscriptions: Mutex<SmallVec<[Subscription; 4]>>,
    cleanups: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    settle: Mutex<Settle>,
}

/// Per-epoch computation context. Clones share the same epoch.
#[derive(Clone)]
pub struct ComputeContext {
    inner: Arc<ContextInner>,
}

impl ComputeContext {
    pub(crate) fn new(
        signal: String,
        epoch: u64,
        deps: Deps,
        on_dependency_change: Notify,
        reporter: Option<Reporter>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                signal,
                epoch,
                deps,
                on_dependency_change,
                reporter,
                superseded: AtomicBool::new(false),
                token: OnceLock::new(),
                reads: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(SmallVec::new()),
                cleanups: Mutex::new(Vec::new()),
                settle: Mutex::new(Settle::default()),
            }),
        }
    }

    /// Recomputation index: 0 for the initial computation.
    pub fn epoch(&self) -> u64 {
        self.inner.epoch
    }

    /// Display name of the signal being computed.
    pub fn signal_name(&self) -> &str {
        &self.inner.signal
    }

    /// Read the dependency declared under `name`.
    ///
    /// The first read in this epoch subscribes to the dependency; every read
    /// in this epoch returns the same cached result.
    pub fn get<T>(&self, name: &str) -> SignalResult<T>
    where
        T: Clone + 'static,
    {
        let cached = self
            .inner
            .reads
            .lock()
            .get(name)
            .map(|read| read.value.clone());

        let value = match cached {
            Some(value) => value,
            None => self.track(name)?,
        };

        value?
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| SignalError::DependencyType {
                name: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    fn track(&self, name: &str) -> SignalResult<SignalResult<Arc<dyn Any + Send + Sync>>> {
        let dep = self
            .inner
            .deps
            .get(name)
            .cloned()
            .ok_or_else(|| SignalError::UnknownDependency(name.to_string()))?;

        let value: SignalResult<Arc<dyn Any + Send + Sync>> = dep.read_any().map(Arc::from);
        let version = dep.version();

        if !self.is_aborted() {
            let notify = Arc::clone(&self.inner.on_dependency_change);
            let subscription = dep.subscribe(Arc::new(move || notify()));
            self.inner.subscriptions.lock().push(subscription);
        }

        self.inner.reads.lock().insert(
            name.to_string(),
            Read {
                version,
                value: value.clone(),
            },
        );
        Ok(value)
    }

    /// Read and subscribe every declared dependency not read yet.
    pub(crate) fn track_all(&self) {
        let names: Vec<String> = self.inner.deps.iter().map(|(name, _)| name.to_string()).collect();
        for name in names {
            if self.inner.reads.lock().contains_key(&name) {
                continue;
            }
            if let Err(error) = self.track(&name) {
                tracing::debug!(signal = %self.inner.signal, %error, "could not track dependency");
            }
        }
    }

    /// Names of the dependencies read so far in this epoch.
    pub fn accessed(&self) -> Vec<String> {
        self.inner.reads.lock().keys().cloned().collect()
    }

    /// Whether any dependency read in this epoch has changed since.
    pub(crate) fn is_outdated(&self) -> bool {
        self.inner.reads.lock().iter().any(|(name, read)| {
            self.inner
                .deps
                .get(name)
                .is_some_and(|dep| dep.version() != read.version)
        })
    }

    /// The epoch's cancellation token.
    pub fn abort_token(&self) -> CancellationToken {
        let token = self.inner.token.get_or_init(CancellationToken::new).clone();
        if self.is_aborted() {
            token.cancel();
        }
        token
    }

    /// Whether this epoch has been superseded or its signal disposed.
    pub fn is_aborted(&self) -> bool {
        self.inner.superseded.load(Ordering::SeqCst)
    }

    /// Run `f` when this epoch ends. Runs immediately if it already has.
    pub fn cleanup<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_aborted() {
            f();
            return;
        }
        self.inner.cleanups.lock().push(Box::new(f));
    }

    /// Run `f` unless this epoch has been superseded.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> SignalResult<R> {
        if self.is_aborted() {
            tracing::trace!(signal = %self.inner.signal, epoch = self.inner.epoch, "refusing work in superseded epoch");
            return Err(SignalError::Aborted);
        }
        Ok(f())
    }

    /// Wrap `future` so it never completes once this epoch is superseded.
    ///
    /// A superseded `safe` future stays pending without registering a
    /// wake-up, and is freed when its owner drops it.
    pub fn safe<F>(&self, future: F) -> impl Future<Output = F::Output>
    where
        F: Future,
    {
        let token = self.abort_token();
        async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => std::future::pending().await,
                output = future => output,
            }
        }
    }

    /// Route an async failure to the owning signal. Held back until the
    /// epoch's result has been committed.
    pub(crate) fn report_rejection(&self, error: SignalError) {
        let Some(reporter) = &self.inner.reporter else {
            return;
        };
        {
            let mut settle = self.inner.settle.lock();
            if !settle.committed {
                settle.rejection = Some(error);
                return;
            }
        }
        reporter(error);
    }

    /// Mark the result committed and hand back any rejection that arrived
    /// early.
    pub(crate) fn commit(&self) -> Option<SignalError> {
        let mut settle = self.inner.settle.lock();
        settle.committed = true;
        settle.rejection.take()
    }

    /// End this epoch: cancel, unsubscribe, run cleanups. Idempotent.
    pub(crate) fn supersede(&self) {
        if self.inner.superseded.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(token) = self.inner.token.get() {
            token.cancel();
        }

        let subscriptions = std::mem::take(&mut *self.inner.subscriptions.lock());
        drop(subscriptions);

        let cleanups = std::mem::take(&mut *self.inner.cleanups.lock());
        for cleanup in cleanups {
            cleanup();
        }

        tracing::trace!(signal = %self.inner.signal, epoch = self.inner.epoch, "epoch superseded");
    }
}

impl std::fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeContext")
            .field("signal", &self.inner.signal)
            .field("epoch", &self.inner.epoch)
            .field("aborted", &self.is_aborted())
            .field("accessed", &self.accessed())
            .finish()
    }
}
