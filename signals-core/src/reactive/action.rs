//! Actions
//!
//! An action pairs a `payload` signal with a `result` signal:
//!
//! - `payload` is a [`Mutable<Option<P>>`] with notifier equality, so
//!   dispatching the same payload twice still counts as two dispatches.
//! - `result` is a [`Computed<Option<R>>`] whose only reactive dependency is
//!   `payload`. It is `None` until the first dispatch.
//!
//! [`Action::dispatch`] writes the payload and returns the handler's result
//! synchronously. Async handlers produce a [`Promise`], which is what
//! `dispatch` returns for them.
//!
//! Dependencies declared on the builder are read untracked from the
//! handler: changing one never re-runs the handler on its own.
//!
//! # Example
//!
//! ```rust,ignore
//! let double = Action::new(|ctx: &ActionContext<i32>| Ok(ctx.payload() * 2));
//! assert_eq!(double.dispatch(5)?, 10);
//! assert_eq!(double.result().get()?, Some(10));
//! ```

use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use crate::error::{SignalError, SignalResult};

use super::computed::Computed;
use super::context::ComputeContext;
use super::equality::Equality;
use super::mutable::Mutable;
use super::promise::Promise;
use super::runtime::Runtime;
use super::scheduler::batch;
use super::signal::{dispose_all, AsSignalRef, Deps, Disposable, SignalValue};

type DispatchCallback<P> = Arc<dyn Fn(&P) + Send + Sync>;
type SuccessCallback<R> = Arc<dyn Fn(&R) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&SignalError) + Send + Sync>;

/// What a handler receives: the payload, the declared dependencies, and
/// (through `Deref`) the epoch's [`ComputeContext`].
#[derive(Clone)]
pub struct ActionContext<P> {
    ctx: ComputeContext,
    payload: P,
    deps: Deps,
}

impl<P> ActionContext<P> {
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Read a declared dependency. Reads are untracked.
    pub fn get<T>(&self, name: &str) -> SignalResult<T>
    where
        T: Clone + 'static,
    {
        let dep = self
            .deps
            .get(name)
            .ok_or_else(|| SignalError::UnknownDependency(name.to_string()))?;
        dep.read_any()?
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| SignalError::DependencyType {
                name: name.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }
}

impl<P> Deref for ActionContext<P> {
    type Target = ComputeContext;

    fn deref(&self) -> &ComputeContext {
        &self.ctx
    }
}

impl<P: fmt::Debug> fmt::Debug for ActionContext<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionContext")
            .field("payload", &self.payload)
            .field("epoch", &self.ctx.epoch())
            .field("deps", &self.deps)
            .finish()
    }
}

/// A dispatchable handler with observable payload and result.
pub struct Action<P: SignalValue, R: SignalValue> {
    payload: Mutable<Option<P>>,
    result: Computed<Option<R>>,
    on_dispatch: Option<DispatchCallback<P>>,
}

impl<P: SignalValue, R: SignalValue> Action<P, R> {
    /// A lazy action around a synchronous handler.
    pub fn new<H>(handler: H) -> Self
    where
        H: Fn(&ActionContext<P>) -> SignalResult<R> + Send + Sync + 'static,
    {
        Self::builder(handler).build()
    }

    pub fn builder<H>(handler: H) -> ActionBuilder<P, R, H>
    where
        H: Fn(&ActionContext<P>) -> SignalResult<R> + Send + Sync + 'static,
    {
        ActionBuilder::new(handler)
    }

    /// Run the handler with `payload` and return its result.
    ///
    /// Works inside an outer `batch`: the result is computed before this
    /// returns, and listeners are notified when the batch completes.
    pub fn dispatch(&self, payload: P) -> SignalResult<R> {
        if self.is_disposed() {
            return Err(SignalError::Disposed(self.result.display_name()));
        }
        if let Some(on_dispatch) = &self.on_dispatch {
            on_dispatch(&payload);
        }
        batch(|| {
            self.payload.set(Some(payload))?;
            self.result.recompute_if_outdated();
            self.result
                .peek()?
                .ok_or_else(|| SignalError::NotComputed(self.result.display_name()))
        })
    }

    /// The last dispatched payload, `None` before the first dispatch.
    pub fn payload(&self) -> &Mutable<Option<P>> {
        &self.payload
    }

    /// The handler's latest result, `None` before the first dispatch.
    pub fn result(&self) -> &Computed<Option<R>> {
        &self.result
    }

    /// Dispose both signals, reporting every failure.
    pub fn dispose(&self) -> SignalResult<()> {
        dispose_all(&[&self.result, &self.payload])
    }

    pub fn is_disposed(&self) -> bool {
        self.result.is_disposed()
    }
}

impl<P, R> Action<P, Promise<R>>
where
    P: SignalValue,
    R: Clone + Send + Sync + 'static,
{
    /// A lazy action around an async handler.
    pub fn new_async<H, Fut>(handler: H) -> Self
    where
        H: Fn(ActionContext<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SignalResult<R>> + Send + 'static,
    {
        Self::async_builder(handler).build_async()
    }

    pub fn async_builder<H, Fut>(handler: H) -> ActionBuilder<P, R, H>
    where
        H: Fn(ActionContext<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SignalResult<R>> + Send + 'static,
    {
        ActionBuilder::new(handler)
    }
}

impl<P: SignalValue, R: SignalValue> Clone for Action<P, R> {
    fn clone(&self) -> Self {
        Self {
            payload: self.payload.clone(),
            result: self.result.clone(),
            on_dispatch: self.on_dispatch.clone(),
        }
    }
}

impl<P: SignalValue, R: SignalValue> Disposable for Action<P, R> {
    fn dispose(&self) -> SignalResult<()> {
        Action::dispose(self)
    }
}

impl<P: SignalValue, R: SignalValue> fmt::Debug for Action<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("payload", &self.payload)
            .field("result", &self.result)
            .finish()
    }
}

/// Options for an [`Action`]. `R` is the handler's success type.
pub struct ActionBuilder<P, R, H> {
    handler: H,
    deps: Deps,
    initial_payload: Option<P>,
    name: Option<String>,
    runtime: Option<Runtime>,
    on_dispatch: Option<DispatchCallback<P>>,
    on_success: Option<SuccessCallback<R>>,
    on_error: Option<ErrorCallback>,
}

impl<P, R, H> ActionBuilder<P, R, H>
where
    P: SignalValue,
    R: Clone + Send + Sync + 'static,
{
    fn new(handler: H) -> Self {
        Self {
            handler,
            deps: Deps::new(),
            initial_payload: None,
            name: None,
            runtime: None,
            on_dispatch: None,
            on_success: None,
            on_error: None,
        }
    }

    /// Declare a dependency the handler may read. It does not trigger the
    /// handler.
    pub fn dep(mut self, name: impl Into<String>, signal: &impl AsSignalRef) -> Self {
        self.deps.insert(name, signal);
        self
    }

    /// Run the handler at construction with this payload.
    pub fn initial_payload(mut self, payload: P) -> Self {
        self.initial_payload = Some(payload);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn runtime(mut self, runtime: &Runtime) -> Self {
        self.runtime = Some(runtime.clone());
        self
    }

    /// Called with each payload before the handler runs.
    pub fn on_dispatch<F>(mut self, f: F) -> Self
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        self.on_dispatch = Some(Arc::new(f));
        self
    }

    /// Called when the handler settles successfully, unless a later
    /// dispatch superseded it first.
    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&R) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    /// Called when the handler fails, unless a later dispatch superseded it
    /// first.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&SignalError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Action<P, R>
    where
        R: PartialEq,
        H: Fn(&ActionContext<P>) -> SignalResult<R> + Send + Sync + 'static,
    {
        let handler = self.handler;
        let on_success = self.on_success;
        let on_error = self.on_error;

        assemble(
            self.deps,
            self.initial_payload,
            self.name,
            self.runtime,
            self.on_dispatch,
            move |ctx: &ActionContext<P>| {
                let outcome = handler(ctx);
                if !ctx.is_aborted() {
                    settle(&outcome, on_success.as_ref(), on_error.as_ref());
                }
                outcome
            },
        )
    }

    pub fn build_async<Fut>(self) -> Action<P, Promise<R>>
    where
        H: Fn(ActionContext<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SignalResult<R>> + Send + 'static,
    {
        let handler = self.handler;
        let on_success = self.on_success;
        let on_error = self.on_error;

        assemble(
            self.deps,
            self.initial_payload,
            self.name,
            self.runtime,
            self.on_dispatch,
            move |ctx: &ActionContext<P>| {
                let pending = handler(ctx.clone());
                let watcher = ctx.ctx.clone();
                let on_success = on_success.clone();
                let on_error = on_error.clone();
                let future = async move {
                    let outcome = pending.await;
                    if !watcher.is_aborted() {
                        settle(&outcome, on_success.as_ref(), on_error.as_ref());
                    }
                    outcome
                };
                Ok(Promise::tracked(&ctx.ctx, future))
            },
        )
    }
}

fn settle<R>(
    outcome: &SignalResult<R>,
    on_success: Option<&SuccessCallback<R>>,
    on_error: Option<&ErrorCallback>,
) {
    match outcome {
        Ok(value) => {
            if let Some(on_success) = on_success {
                on_success(value);
            }
        }
        Err(error) if !error.is_aborted() => {
            if let Some(on_error) = on_error {
                on_error(error);
            }
        }
        Err(_) => {}
    }
}

fn assemble<P, R, F>(
    deps: Deps,
    initial_payload: Option<P>,
    name: Option<String>,
    runtime: Option<Runtime>,
    on_dispatch: Option<DispatchCallback<P>>,
    run: F,
) -> Action<P, R>
where
    P: SignalValue,
    R: SignalValue,
    F: Fn(&ActionContext<P>) -> SignalResult<R> + Send + Sync + 'static,
{
    let runtime = runtime.unwrap_or_else(|| Runtime::global().clone());

    let mut payload = Mutable::builder(initial_payload)
        .equals(Equality::Never)
        .runtime(&runtime)
        .disposal_handled();
    if let Some(name) = &name {
        payload = payload.name(format!("{name}.payload"));
    }
    let payload = payload.create();

    let mut result = Computed::builder(
        Deps::new().with("payload", &payload),
        move |ctx: &ComputeContext| {
            let Some(payload) = ctx.get::<Option<P>>("payload")? else {
                return Ok(None);
            };
            let action_ctx = ActionContext {
                ctx: ctx.clone(),
                payload,
                deps: deps.clone(),
            };
            run(&action_ctx).map(Some)
        },
    )
    .runtime(&runtime)
    .lazy(false)
    .disposal_handled();
    if let Some(name) = &name {
        result = result.name(format!("{name}.result"));
    }
    let result = result.create();

    Action {
        payload,
        result,
        on_dispatch,
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
