//! Mutable Signals
//!
//! A mutable signal is a container for state that application code writes
//! directly. It starts from either a value or a lazy factory, and every
//! write goes through the signal's equality function: an equal value is not
//! stored and notifies nobody.
//!
//! # Example
//!
//! ```rust,ignore
//! use signals_core::reactive::Mutable;
//!
//! let count = Mutable::new(0);
//! let _sub = count.on_value(|value| println!("count is {value}"));
//!
//! count.set(5)?;           // prints "count is 5"
//! count.set(5)?;           // equal, nothing happens
//! count.update(|n| n + 1)?; // prints "count is 6"
//! ```
//!
//! # Notification
//!
//! Writes schedule one notification job with the scheduler. The job emits
//! the change event (bare and value listeners), calls the `on_change`
//! callback, and reports the change to the runtime's hooks. Outside a
//! `batch` the job runs before `set` returns.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::error::{SignalError, SignalResult};

use super::equality::{self, EqualsFn, Equality};
use super::plugin::{attach, Attachable, Tag, Use};
use super::runtime::Runtime;
use super::scheduler::schedule_notification;
use super::signal::{
    AnySignal, AsSignalRef, Cleanup, Current, Disposable, HydrateStatus, SignalCore, SignalKind,
    SignalRef, SignalValue,
};
use super::subscriber::{SignalId, Subscription};

type Factory<T> = Arc<dyn Fn() -> SignalResult<T> + Send + Sync>;
type Fallback<T> = Arc<dyn Fn(SignalError) -> SignalResult<T> + Send + Sync>;
type ChangeCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&SignalError) + Send + Sync>;

enum Init<T> {
    Value(T),
    Factory(Factory<T>),
}

struct State<T> {
    current: Option<Current<T>>,
    modified: bool,
}

struct MutableInner<T: SignalValue> {
    core: SignalCore,
    this: Weak<MutableInner<T>>,
    init: Init<T>,
    fallback: Option<Fallback<T>>,
    equals: EqualsFn<T>,
    on_change: Option<ChangeCallback<T>>,
    on_error: Option<ErrorCallback>,
    state: RwLock<State<T>>,
}

/// A readable and writable signal.
///
/// Cloning the handle is cheap; clones refer to the same signal.
pub struct Mutable<T: SignalValue> {
    inner: Arc<MutableInner<T>>,
}

impl<T: SignalValue> MutableInner<T> {
    /// Produce the initial state from the value or factory.
    fn initial(&self) -> Current<T> {
        let outcome = match &self.init {
            Init::Value(value) => return Current::Value(value.clone()),
            Init::Factory(factory) => factory(),
        };

        match outcome {
            Ok(value) => Current::Value(value),
            Err(error) => match &self.fallback {
                None => Current::Error(error),
                Some(fallback) => match fallback(error.clone()) {
                    Ok(value) => Current::Value(value),
                    Err(fallback_error) => Current::Error(SignalError::fallback(
                        self.core.name(),
                        error,
                        fallback_error,
                    )),
                },
            },
        }
    }

    /// Install the initial state if the signal was never read.
    fn ensure_initialized(&self) {
        if self.state.read().current.is_some() || self.core.is_disposed() {
            return;
        }

        let initial = self.initial();
        let installed = {
            let mut state = self.state.write();
            if state.current.is_some() {
                None
            } else {
                state.current = Some(initial.clone());
                Some(initial)
            }
        };

        if let Some(Current::Error(error)) = installed {
            self.report_error(&error);
        }
    }

    fn read(&self) -> SignalResult<T> {
        self.ensure_initialized();
        match &self.state.read().current {
            Some(current) => current.to_result(),
            None => Err(SignalError::NotComputed(self.core.name())),
        }
    }

    fn current_value(&self) -> Option<T> {
        self.state
            .read()
            .current
            .as_ref()
            .and_then(|current| current.value().cloned())
    }

    fn report_error(&self, error: &SignalError) {
        if let Some(on_error) = &self.on_error {
            on_error(error);
        }
        self.core.runtime().signal_error(self, error);
    }

    /// Compare and store. Returns `true` when the value counted as a change.
    fn store(&self, value: T, modified: bool) -> bool {
        let mut state = self.state.write();
        if let Some(Current::Value(previous)) = &state.current {
            if (self.equals)(previous, &value) {
                return false;
            }
        }
        state.current = Some(Current::Value(value));
        state.modified = modified;
        true
    }

    fn notify(&self) {
        let Some(inner) = self.this.upgrade() else {
            return;
        };
        self.core.bump_version();
        schedule_notification(move || {
            let current = inner.state.read().current.clone();
            inner.core.changed.emit(&());
            match current {
                Some(Current::Value(value)) => {
                    if let Some(on_change) = &inner.on_change {
                        on_change(&value);
                    }
                    inner.core.runtime().signal_changed(&*inner, &value);
                }
                Some(Current::Error(error)) => inner.report_error(&error),
                None => {}
            }
        });
    }
}

impl<T: SignalValue> Mutable<T> {
    /// A signal holding `value`.
    pub fn new(value: T) -> Self {
        Self::builder(value).create()
    }

    /// A signal whose initial value comes from `factory`, run on first read
    /// and again on every `reset`.
    pub fn lazy<F>(factory: F) -> Self
    where
        F: Fn() -> SignalResult<T> + Send + Sync + 'static,
    {
        Self::lazy_builder(factory).create()
    }

    pub fn builder(value: T) -> MutableBuilder<T> {
        MutableBuilder::new(Init::Value(value))
    }

    pub fn lazy_builder<F>(factory: F) -> MutableBuilder<T>
    where
        F: Fn() -> SignalResult<T> + Send + Sync + 'static,
    {
        MutableBuilder::new(Init::Factory(Arc::new(factory)))
    }

    /// Read the value and report the access to the runtime.
    pub fn get(&self) -> SignalResult<T> {
        self.inner.core.runtime().signal_accessed(&*self.inner);
        self.inner.read()
    }

    /// Read the value without reporting the access.
    pub fn peek(&self) -> SignalResult<T> {
        self.inner.read()
    }

    /// Store `value` unless it equals the current one.
    pub fn set(&self, value: T) -> SignalResult<()> {
        self.inner.core.ensure_live("set")?;
        self.inner.ensure_initialized();
        if self.inner.store(value, true) {
            self.inner.notify();
        }
        Ok(())
    }

    /// Derive the next value from the current one.
    pub fn update<F>(&self, f: F) -> SignalResult<()>
    where
        F: FnOnce(&T) -> T,
    {
        self.inner.core.ensure_live("update")?;
        let current = self.inner.read()?;
        self.set(f(&current))
    }

    /// Restore the initial value (re-running the factory) and notify.
    pub fn reset(&self) -> SignalResult<()> {
        self.inner.core.ensure_live("reset")?;
        let initial = self.inner.initial();
        {
            let mut state = self.inner.state.write();
            state.current = Some(initial);
            state.modified = false;
        }
        self.inner.notify();
        Ok(())
    }

    /// Seed the value unless the signal was already written by the user.
    pub fn hydrate(&self, value: T) -> SignalResult<HydrateStatus> {
        self.inner.core.ensure_live("hydrate")?;
        if self.inner.state.read().modified {
            return Ok(HydrateStatus::Skipped);
        }
        if self.inner.store(value, false) {
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

    /// Listen for new values. Transitions into an error state are skipped.
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

    /// Detach from tags, drop listeners and run plugin cleanups. Calling it
    /// again does nothing.
    pub fn dispose(&self) -> SignalResult<()> {
        if !self.inner.core.mark_disposed() {
            return Ok(());
        }
        tracing::debug!(signal = %self.inner.core.name(), "disposing mutable signal");
        let outcome = self.inner.core.teardown();
        self.inner.core.runtime().signal_disposed(&*self.inner);
        outcome
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

    /// Whether the value was written with `set`/`update` since creation or
    /// the last `reset`.
    pub fn is_modified(&self) -> bool {
        self.inner.state.read().modified
    }

    pub fn version(&self) -> u64 {
        self.inner.core.version()
    }
}

impl<T: SignalValue> Clone for Mutable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: SignalValue> fmt::Debug for Mutable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutable")
            .field("id", &self.id())
            .field("name", &self.display_name())
            .field("version", &self.version())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl<T: SignalValue> Disposable for Mutable<T> {
    fn dispose(&self) -> SignalResult<()> {
        Mutable::dispose(self)
    }
}

impl<T: SignalValue> AnySignal for MutableInner<T> {
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

impl<T: SignalValue> AsSignalRef for Mutable<T> {
    fn signal_ref(&self) -> SignalRef {
        Arc::clone(&self.inner) as SignalRef
    }
}

impl<T: SignalValue> Attachable for Mutable<T> {
    fn core(&self) -> &SignalCore {
        &self.inner.core
    }
}

/// Options for a [`Mutable`].
pub struct MutableBuilder<T: SignalValue> {
    init: Init<T>,
    name: Option<String>,
    equals: Option<Equality<T>>,
    fallback: Option<Fallback<T>>,
    on_change: Option<ChangeCallback<T>>,
    on_error: Option<ErrorCallback>,
    uses: Vec<Use<Mutable<T>>>,
    runtime: Option<Runtime>,
    disposal_handled: bool,
}

impl<T: SignalValue> MutableBuilder<T> {
    fn new(init: Init<T>) -> Self {
        Self {
            init,
            name: None,
            equals: None,
            fallback: None,
            on_change: None,
            on_error: None,
            uses: Vec::new(),
            runtime: None,
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

    /// Recover from a failing factory.
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
        F: Fn(&Mutable<T>) -> SignalResult<Option<Cleanup>> + Send + Sync + 'static,
    {
        self.attach(Use::plugin(plugin))
    }

    pub fn tag(self, tag: &Tag<Mutable<T>>) -> Self {
        self.attach(Use::tag(tag))
    }

    /// Append an entry to the use list.
    pub fn attach(mut self, entry: Use<Mutable<T>>) -> Self {
        self.uses.push(entry);
        self
    }

    pub fn runtime(mut self, runtime: &Runtime) -> Self {
        self.runtime = Some(runtime.clone());
        self
    }

    /// Mark the signal as owned by a composite that disposes it.
    pub(crate) fn disposal_handled(mut self) -> Self {
        self.disposal_handled = true;
        self
    }

    /// Create the signal and run its plugins.
    pub fn build(mut self) -> SignalResult<Mutable<T>> {
        let uses = std::mem::take(&mut self.uses);
        let signal = self.create();

        if let Err(error) = attach(&signal, &uses) {
            tracing::debug!(signal = %signal.display_name(), %error, "plugin failed, disposing signal");
            let _ = signal.dispose();
            return Err(error);
        }
        Ok(signal)
    }

    pub(crate) fn create(self) -> Mutable<T> {
        let runtime = self.runtime.unwrap_or_else(|| Runtime::global().clone());
        let equals = equality::resolve(self.equals.as_ref());
        let core = SignalCore::new(SignalKind::Mutable, self.name, runtime.clone());

        let inner = Arc::new_cyclic(|this| MutableInner {
            core,
            this: this.clone(),
            init: self.init,
            fallback: self.fallback,
            equals,
            on_change: self.on_change,
            on_error: self.on_error,
            state: RwLock::new(State {
                current: None,
                modified: false,
            }),
        });

        let signal = Mutable { inner };
        runtime.signal_created(signal.signal_ref(), Vec::new(), self.disposal_handled);
        signal
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
