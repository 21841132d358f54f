//! Computed Signals
//!
//! A computed signal is a cached derivation over a named map of dependency
//! signals. Its compute function receives a [`ComputeContext`] and reads
//! dependencies through it.
//!
//! # How Recomputation Works
//!
//! 1. The previous epoch is superseded: its cancellation token fires, its
//!    cleanups run, and its dependency subscriptions are dropped.
//!
//! 2. A fresh context is created. Each dependency the compute function
//!    reads is subscribed once, recording the dependency's version.
//!
//! 3. The outcome is committed. A value equal to the previous one is not
//!    stored and notifies nobody. A failure goes through the fallback, if
//!    there is one, and is cached as the signal's error.
//!
//! 4. When a subscribed dependency changes, the signal recomputes, unless
//!    it is paused, stale, or has already seen that dependency version.
//!
//! # Laziness
//!
//! By default nothing is computed until the first `get()`/`peek()`. A
//! signal built with `.lazy(false)` computes at construction, right after
//! its plugins are attached.
//!
//! # Async
//!
//! `Computed::<Promise<T>>::new_async` runs a future-returning function per
//! epoch. Each epoch's promise is a new value, so dependents and listeners
//! see every epoch. A rejection that lands while its epoch is current moves
//! the signal into its error state.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{SignalError, SignalResult};

use super::context::ComputeContext;
use super::equality::{self, EqualsFn, Equality};
use super::plugin::{attach, Attachable, Tag, Use};
use super::promise::{Promise, TaskState};
use super::runtime::Runtime;
use super::scheduler::{defer, is_batching, schedule_notification};
use super::signal::{
    AnySignal, AsSignalRef, Cleanup, Current, Deps, Disposable, HydrateStatus, SignalCore,
    SignalKind, SignalRef, SignalValue,
};
use super::subscriber::{SignalId, Subscription};

type ComputeFn<T> = Arc<dyn Fn(&ComputeContext) -> SignalResult<T> + Send + Sync>;
type Fallback<T> = Arc<dyn Fn(SignalError) -> SignalResult<T> + Send + Sync>;
type ChangeCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&SignalError) + Send + Sync>;
type WhenFilter<T> = Arc<dyn Fn(&Computed<T>, &dyn AnySignal) -> SignalResult<bool> + Send + Sync>;

/// What a `when` notifier does to the signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhenAction {
    Refresh,
    Stale,
    /// Not supported by computed signals; rejected with a config error.
    Reset,
}

struct State<T> {
    current: Option<Current<T>>,
    ctx: Option<ComputeContext>,
    /// Identifies the live context; bumped for every new context.
    generation: u64,
    /// Index of the next computation.
    epochs: u64,
    computed: bool,
    paused: bool,
    refresh_pending: bool,
}

struct ComputedInner<T: SignalValue> {
    core: SignalCore,
    this: Weak<ComputedInner<T>>,
    deps: Deps,
    compute: ComputeFn<T>,
    fallback: Option<Fallback<T>>,
    equals: EqualsFn<T>,
    on_change: Option<ChangeCallback<T>>,
    on_error: Option<ErrorCallback>,
    state: Mutex<State<T>>,
}

/// A cached derivation over other signals.
pub struct Computed<T: SignalValue> {
    inner: Arc<ComputedInner<T>>,
}

impl<T: SignalValue> ComputedInner<T> {
    fn context(&self, generation: u64, epoch: u64) -> ComputeContext {
        let weak = self.this.clone();
        let on_dependency_change: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.dependency_changed(generation);
            }
        });

        let weak = self.this.clone();
        let reporter: Arc<dyn Fn(SignalError) + Send + Sync> = Arc::new(move |error| {
            if let Some(inner) = weak.upgrade() {
                inner.reject(generation, error);
            }
        });

        ComputeContext::new(
            self.core.name(),
            epoch,
            self.deps.clone(),
            on_dependency_change,
            Some(reporter),
        )
    }

    /// Swap in a new context and supersede the old one.
    fn begin(&self, counts_as_epoch: bool) -> (ComputeContext, u64) {
        let (previous, generation, epoch) = {
            let mut state = self.state.lock();
            state.generation += 1;
            let epoch = state.epochs;
            if counts_as_epoch {
                state.epochs += 1;
                state.refresh_pending = false;
            }
            (state.ctx.take(), state.generation, epoch)
        };

        if let Some(previous) = previous {
            previous.supersede();
        }

        let ctx = self.context(generation, epoch);
        self.state.lock().ctx = Some(ctx.clone());
        (ctx, generation)
    }

    fn recompute(&self, force_notify: bool) {
        if self.core.is_disposed() {
            return;
        }
        let (ctx, generation) = self.begin(true);
        tracing::trace!(signal = %self.core.name(), epoch = ctx.epoch(), "recomputing");

        let outcome = (self.compute)(&ctx);

        if ctx.is_aborted() || matches!(outcome, Err(SignalError::Aborted)) {
            tracing::trace!(signal = %self.core.name(), epoch = ctx.epoch(), "discarding aborted computation");
            return;
        }

        let next = match outcome {
            Ok(value) => Current::Value(value),
            Err(error) => self.recover(error),
        };
        self.commit(&ctx, generation, next, force_notify);
    }

    fn recover(&self, error: SignalError) -> Current<T> {
        let Some(fallback) = &self.fallback else {
            return Current::Error(error);
        };
        match fallback(error.clone()) {
            Ok(value) => Current::Value(value),
            Err(fallback_error) => {
                Current::Error(SignalError::fallback(self.core.name(), error, fallback_error))
            }
        }
    }

    fn commit(&self, ctx: &ComputeContext, generation: u64, next: Current<T>, force_notify: bool) {
        let (changed, had_previous) = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            let had_previous = state.current.is_some();
            let changed = match (&state.current, &next) {
                (Some(Current::Value(previous)), Current::Value(value)) => {
                    !(self.equals)(previous, value)
                }
                _ => true,
            };
            if changed {
                state.current = Some(next.clone());
            }
            state.computed = true;
            (changed, had_previous)
        };

        if changed {
            self.core.bump_version();
            if let Current::Error(error) = &next {
                self.report_error(error);
            }
        }
        if force_notify || (changed && had_previous) {
            self.notify();
        }

        if let Some(rejection) = ctx.commit() {
            self.reject(generation, rejection);
        }
    }

    /// An async rejection for the context identified by `generation`.
    fn reject(&self, generation: u64, error: SignalError) {
        {
            let mut state = self.state.lock();
            if state.generation != generation || self.core.is_disposed() {
                return;
            }
            state.current = Some(Current::Error(error.clone()));
        }
        self.core.bump_version();
        self.report_error(&error);
        self.notify();
    }

    fn dependency_changed(&self, generation: u64) {
        let ctx = {
            let state = self.state.lock();
            if state.generation != generation || state.paused || state.current.is_none() {
                return;
            }
            match &state.ctx {
                Some(ctx) => ctx.clone(),
                None => return,
            }
        };
        if ctx.is_outdated() {
            self.recompute(false);
        }
    }

    fn report_error(&self, error: &SignalError) {
        if error.is_aborted() {
            return;
        }
        if let Some(on_error) = &self.on_error {
            on_error(error);
        }
        self.core.runtime().signal_error(self, error);
    }

    fn notify(&self) {
        let Some(inner) = self.this.upgrade() else {
            return;
        };
        schedule_notification(move || {
            let current = inner.state.lock().current.clone();
            inner.core.changed.emit(&());
            if let Some(Current::Value(value)) = current {
                if let Some(on_change) = &inner.on_change {
                    on_change(&value);
                }
                inner.core.runtime().signal_changed(&*inner, &value);
            }
        });
    }

    fn read(&self) -> SignalResult<T> {
        let needs_compute = {
            let state = self.state.lock();
            !self.core.is_disposed() && (state.current.is_none() || state.refresh_pending)
        };
        if needs_compute {
            self.recompute(false);
        }

        match &self.state.lock().current {
            Some(current) => current.to_result(),
            None => Err(SignalError::NotComputed(self.core.name())),
        }
    }

    fn current_value(&self) -> Option<T> {
        self.state
            .lock()
            .current
            .as_ref()
            .and_then(|current| current.value().cloned())
    }

    fn run_pending_refresh(&self) {
        if self.state.lock().refresh_pending {
            self.recompute(false);
        }
    }
}

impl<T: SignalValue> Computed<T> {
    /// A lazy computed signal over `deps`.
    pub fn new<F>(deps: Deps, compute: F) -> Self
    where
        F: Fn(&ComputeContext) -> SignalResult<T> + Send + Sync + 'static,
    {
        Self::builder(deps, compute).create()
    }

    pub fn builder<F>(deps: Deps, compute: F) -> ComputedBuilder<T>
    where
        F: Fn(&ComputeContext) -> SignalResult<T> + Send + Sync + 'static,
    {
        ComputedBuilder::new(deps, Arc::new(compute))
    }

    /// Read the value, computing it if needed, and report the access.
    pub fn get(&self) -> SignalResult<T> {
        self.inner.core.runtime().signal_accessed(&*self.inner);
        self.inner.read()
    }

    /// Read the value, computing it if needed, without reporting the access.
    pub fn peek(&self) -> SignalResult<T> {
        self.inner.read()
    }

    /// Stop reacting to dependency changes.
    pub fn pause(&self) -> SignalResult<()> {
        self.inner.core.ensure_live("pause")?;
        self.inner.state.lock().paused = true;
        Ok(())
    }

    /// Resume reacting; recomputes at once and always notifies.
    pub fn resume(&self) -> SignalResult<()> {
        self.inner.core.ensure_live("resume")?;
        {
            let mut state = self.inner.state.lock();
            if !state.paused {
                return Ok(());
            }
            state.paused = false;
        }
        self.inner.recompute(true);
        Ok(())
    }

    pub fn paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    /// Request a recomputation once the current synchronous turn ends.
    /// Calls made before it runs coalesce into one recomputation.
    ///
    /// Inside a batch the recomputation runs when the outermost batch
    /// flushes. Outside one it is spawned on the ambient tokio runtime; with
    /// no runtime it waits for the next flush or read on this thread.
    pub fn refresh(&self) -> SignalResult<()> {
        self.inner.core.ensure_live("refresh")?;
        let already_pending = std::mem::replace(&mut self.inner.state.lock().refresh_pending, true);
        if already_pending {
            return Ok(());
        }

        let weak = Arc::downgrade(&self.inner);
        let run = move || {
            if let Some(inner) = weak.upgrade() {
                inner.run_pending_refresh();
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) if !is_batching() => {
                tracing::trace!(signal = %self.inner.core.name(), "spawning deferred refresh");
                handle.spawn(async move { run() });
            }
            _ => defer(run),
        }
        Ok(())
    }

    /// Drop the cached state and notify; the next read recomputes.
    pub fn stale(&self) -> SignalResult<()> {
        self.inner.core.ensure_live("stale")?;
        let had_state = self.inner.state.lock().current.take().is_some();
        if had_state {
            self.inner.core.bump_version();
            self.inner.notify();
        }
        Ok(())
    }

    /// React to changes of `notifier`. Call once per notifier.
    pub fn when(&self, notifier: &impl AsSignalRef, action: WhenAction) -> SignalResult<()> {
        self.when_inner(notifier.signal_ref(), action, None)
    }

    /// Like [`when`](Self::when), consulting `filter` first. A filter error is
    /// reported through this signal's error callbacks and skips the action.
    pub fn when_filtered<F>(
        &self,
        notifier: &impl AsSignalRef,
        action: WhenAction,
        filter: F,
    ) -> SignalResult<()>
    where
        F: Fn(&Computed<T>, &dyn AnySignal) -> SignalResult<bool> + Send + Sync + 'static,
    {
        self.when_inner(notifier.signal_ref(), action, Some(Arc::new(filter)))
    }

    fn when_inner(
        &self,
        notifier: SignalRef,
        action: WhenAction,
        filter: Option<WhenFilter<T>>,
    ) -> SignalResult<()> {
        self.inner.core.ensure_live("when")?;
        if action == WhenAction::Reset {
            return Err(SignalError::Config(format!(
                "computed signal `{}` cannot be reset by a notifier",
                self.display_name()
            )));
        }

        let weak_self = Arc::downgrade(&self.inner);
        let weak_notifier = Arc::downgrade(&notifier);
        let subscription = notifier.subscribe(Arc::new(move || {
            let (Some(inner), Some(notifier)) = (weak_self.upgrade(), weak_notifier.upgrade())
            else {
                return;
            };
            let signal = Computed { inner };

            if let Some(filter) = &filter {
                match filter(&signal, &*notifier) {
                    Ok(true) => {}
                    Ok(false) => return,
                    Err(error) => {
                        signal.inner.report_error(&error);
                        return;
                    }
                }
            }

            let outcome = match action {
                WhenAction::Refresh => signal.refresh(),
                WhenAction::Stale => signal.stale(),
                WhenAction::Reset => Ok(()),
            };
            if let Err(error) = outcome {
                tracing::debug!(signal = %signal.display_name(), %error, "notifier action failed");
            }
        }));

        self.inner
            .core
            .push_detacher(Box::new(move || subscription.unsubscribe()));
        Ok(())
    }

    /// Seed the value unless a computation has already completed.
    ///
    /// The hydrated value is kept until a dependency changes or the signal is
    /// refreshed.
    pub fn hydrate(&self, value: T) -> SignalResult<HydrateStatus> {
        self.inner.core.ensure_live("hydrate")?;
        if self.inner.state.lock().computed {
            return Ok(HydrateStatus::Skipped);
        }

        let (ctx, generation) = self.inner.begin(false);
        ctx.track_all();

        let changed = {
            let mut state = self.inner.state.lock();
            if state.generation != generation || state.computed {
                return Ok(HydrateStatus::Skipped);
            }
            let changed = match &state.current {
                Some(Current::Value(previous)) => !(self.inner.equals)(previous, &value),
                _ => true,
            };
            let had_previous = state.current.is_some();
            state.current = Some(Current::Value(value));
            changed && had_previous
        };
        if changed {
            self.inner.core.bump_version();
            self.inner.notify();
        }
        Ok(HydrateStatus::Success)
    }

    /// Listen for changes.
    pub fn on<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.core.changed.on(move |_| listener())
    }

    /// Listen for new values. Errors and stale transitions are skipped.
    pub fn on_value<F>(&self, listener: F) -> Subscription
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        self.inner.core.changed.on_filtered(
            move || weak.upgrade().and_then(|inner| inner.current_value()),
            listener,
        )
    }

    /// End the current epoch, detach, drop listeners and run plugin
    /// cleanups. Calling it again does nothing.
    pub fn dispose(&self) -> SignalResult<()> {
        if !self.inner.core.mark_disposed() {
            return Ok(());
        }
        tracing::debug!(signal = %self.inner.core.name(), "disposing computed signal");

        let ctx = self.inner.state.lock().ctx.take();
        if let Some(ctx) = ctx {
            ctx.supersede();
        }
        let outcome = self.inner.core.teardown();
        self.inner.core.runtime().signal_disposed(&*self.inner);
        outcome
    }

    /// Recompute now unless every dependency read by the live epoch is
    /// unchanged.
    pub(crate) fn recompute_if_outdated(&self) {
        let ctx = {
            let state = self.inner.state.lock();
            if state.current.is_none() {
                None
            } else {
                state.ctx.clone()
            }
        };
        match ctx {
            Some(ctx) if !ctx.is_outdated() => {}
            _ => self.inner.recompute(false),
        }
    }

    /// Index of the most recent computation, `None` before the first.
    pub fn epoch(&self) -> Option<u64> {
        self.inner.state.lock().epochs.checked_sub(1)
    }

    pub fn id(&self) -> SignalId {
        self.inner.core.id()
    }

    pub fn display_name(&self) -> String {
        self.inner.core.name()
    }

    pub fn set_display_name(&self, name: impl Into<String>) {
        self.inner.core.set_name(name.into());
        self.inner.core.runtime().signal_renamed(&*self.inner);
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.core.is_disposed()
    }

    pub fn version(&self) -> u64 {
        self.inner.core.version()
    }

    /// The declared dependencies.
    pub fn deps(&self) -> &Deps {
        &self.inner.deps
    }
}

impl<T> Computed<Promise<T>>
where
    T: Clone + Send + Sync + 'static,
{
    /// A lazy computed signal whose compute function is async.
    pub fn new_async<F, Fut>(deps: Deps, compute: F) -> Self
    where
        F: Fn(ComputeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SignalResult<T>> + Send + 'static,
    {
        Self::builder_async(deps, compute).create()
    }

    pub fn builder_async<F, Fut>(deps: Deps, compute: F) -> ComputedBuilder<Promise<T>>
    where
        F: Fn(ComputeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SignalResult<T>> + Send + 'static,
    {
        Computed::builder(deps, move |ctx: &ComputeContext| {
            // The future may first be polled much later; subscribe now so
            // changes in between start a new epoch.
            ctx.track_all();
            Ok(Promise::tracked(ctx, compute(ctx.clone())))
        })
    }

    /// Settlement state of the current promise. Reports the access to the
    /// runtime's task hook.
    pub fn task(&self) -> SignalResult<TaskState<T>> {
        let promise = self.inner.read()?;
        self.inner.core.runtime().task_accessed(&*self.inner);
        Ok(promise.state())
    }
}

impl<T: SignalValue> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: SignalValue> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.id())
            .field("name", &self.display_name())
            .field("deps", &self.inner.deps)
            .field("version", &self.version())
            .field("paused", &self.paused())
            .finish()
    }
}

impl<T: SignalValue> Disposable for Computed<T> {
    fn dispose(&self) -> SignalResult<()> {
        Computed::dispose(self)
    }
}

impl<T: SignalValue> AnySignal for ComputedInner<T> {
    fn id(&self) -> SignalId {
        self.core.id()
    }

    fn display_name(&self) -> String {
        self.core.name()
    }

    fn kind(&self) -> SignalKind {
        self.core.kind()
    }

    fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }

    fn version(&self) -> u64 {
        self.core.version()
    }

    fn subscribe(&self, listener: Arc<dyn Fn() + Send + Sync>) -> Subscription {
        self.core.subscribe(listener)
    }

    fn read_any(&self) -> SignalResult<Box<dyn std::any::Any + Send + Sync>> {
        self.read().map(|value| Box::new(value) as Box<dyn std::any::Any + Send + Sync>)
    }

    fn to_ref(&self) -> Option<SignalRef> {
        self.this.upgrade().map(|inner| inner as SignalRef)
    }
}

impl<T: SignalValue> AsSignalRef for Computed<T> {
    fn signal_ref(&self) -> SignalRef {
        Arc::clone(&self.inner) as SignalRef
    }
}

impl<T: SignalValue> Attachable for Computed<T> {
    fn core(&self) -> &SignalCore {
        &self.inner.core
    }
}

/// Options for a [`Computed`].
pub struct ComputedBuilder<T: SignalValue> {
    deps: Deps,
    compute: ComputeFn<T>,
    name: Option<String>,
    equals: Option<Equality<T>>,
    fallback: Option<Fallback<T>>,
    on_change: Option<ChangeCallback<T>>,
    on_error: Option<ErrorCallback>,
    uses: Vec<Use<Computed<T>>>,
    runtime: Option<Runtime>,
    lazy: bool,
    disposal_handled: bool,
}

impl<T: SignalValue> ComputedBuilder<T> {
    fn new(deps: Deps, compute: ComputeFn<T>) -> Self {
        Self {
            deps,
            compute,
            name: None,
            equals: None,
            fallback: None,
            on_change: None,
            on_error: None,
            uses: Vec::new(),
            runtime: None,
            lazy: true,
            disposal_handled: false,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn equals(mut self, equals: Equality<T>) -> Self {
        self.equals = Some(equals);
        self
    }

    /// Recover from a failing computation.
    pub fn fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(SignalError) -> SignalResult<T> + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    pub fn on_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.on_change = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&SignalError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn plugin<F>(self, plugin: F) -> Self
    where
        F: Fn(&Computed<T>) -> SignalResult<Option<Cleanup>> + Send + Sync + 'static,
    {
        self.attach(Use::plugin(plugin))
    }

    pub fn tag(self, tag: &Tag<Computed<T>>) -> Self {
        self.attach(Use::tag(tag))
    }

    pub fn attach(mut self, entry: Use<Computed<T>>) -> Self {
        self.uses.push(entry);
        self
    }

    pub fn runtime(mut self, runtime: &Runtime) -> Self {
        self.runtime = Some(runtime.clone());
        self
    }

    /// `false` computes at construction. Defaults to `true`.
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub(crate) fn disposal_handled(mut self) -> Self {
        self.disposal_handled = true;
        self
    }

    /// Create the signal, run its plugins, then compute if eager.
    pub fn build(mut self) -> SignalResult<Computed<T>> {
        let uses = std::mem::take(&mut self.uses);
        let lazy = self.lazy;
        let signal = self.create_deferred();

        if let Err(error) = attach(&signal, &uses) {
            tracing::debug!(signal = %signal.display_name(), %error, "plugin failed, disposing signal");
            let _ = signal.dispose();
            return Err(error);
        }
        if !lazy {
            signal.inner.recompute(false);
        }
        Ok(signal)
    }

    pub(crate) fn create(self) -> Computed<T> {
        let lazy = self.lazy;
        let signal = self.create_deferred();
        if !lazy {
            signal.inner.recompute(false);
        }
        signal
    }

    fn create_deferred(self) -> Computed<T> {
        let runtime = self.runtime.unwrap_or_else(|| Runtime::global().clone());
        let equals = equality::resolve(self.equals.as_ref());
        let core = SignalCore::new(SignalKind::Computed, self.name, runtime.clone());
        let dep_signals = self.deps.signals();

        let inner = Arc::new_cyclic(|this| ComputedInner {
            core,
            this: this.clone(),
            deps: self.deps,
            compute: self.compute,
            fallback: self.fallback,
            equals,
            on_change: self.on_change,
            on_error: self.on_error,
            state: Mutex::new(State {
                current: None,
                ctx: None,
                generation: 0,
                epochs: 0,
                computed: false,
                paused: false,
                refresh_pending: false,
            }),
        });

        let signal = Computed { inner };
        runtime.signal_created(signal.signal_ref(), dep_signals, self.disposal_handled);
        signal
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
