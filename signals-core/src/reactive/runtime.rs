//! Reactive Runtime
//!
//! The runtime is the observation point for signal lifecycle events. It
//! owns the hooks registry consumed by devtools and by render integration.
//!
//! # How It Works
//!
//! 1. Every signal is created against a runtime (the process-wide
//!    [`Runtime::global`] unless another one is injected) and reports its
//!    creation, changes, errors, renames and disposal to it.
//!
//! 2. Hooks are optional. With none installed every report is a no-op,
//!    except creation events: those are buffered (up to
//!    `create_queue_capacity`) and replayed as soon as a create hook is
//!    installed, so a devtools panel attached late still sees early
//!    signals.
//!
//! 3. [`Runtime::set_hooks`] merges overrides for the runtime's lifetime;
//!    [`Runtime::with_hooks`] merges them for the duration of a closure and
//!    restores the previous set afterwards, even on panic.
//!
//! 4. [`Runtime::forget`] collects disposals raised inside a closure and
//!    reports them as one `on_forget_signals` event instead of one
//!    `on_signal_dispose` per signal.
//!
//! # Isolation
//!
//! Tests and embedders create their own `Runtime` so hook state never leaks
//! between them. The lock around the hooks is never held while a hook runs.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};

use crate::config::RuntimeConfig;
use crate::error::SignalError;

use super::plugin::TagInfo;
use super::signal::{AnySignal, SignalRef};

type CreateHook = Arc<dyn Fn(&SignalRef, &[SignalRef], bool) + Send + Sync>;
type ChangeHook = Arc<dyn Fn(&dyn AnySignal, &dyn Any) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&dyn AnySignal, &SignalError) + Send + Sync>;
type SignalHook = Arc<dyn Fn(&dyn AnySignal) + Send + Sync>;
type ForgetHook = Arc<dyn Fn(&[SignalRef]) + Send + Sync>;
type TagHook = Arc<dyn Fn(&TagInfo) + Send + Sync>;
type TagMemberHook = Arc<dyn Fn(&TagInfo, &dyn AnySignal) + Send + Sync>;

/// Lifecycle callbacks. Every field is optional; unset fields are no-ops.
///
/// Build a partial set with the builder methods and merge it with
/// [`Runtime::set_hooks`] or [`Runtime::with_hooks`].
#[derive(Clone, Default)]
pub struct Hooks {
    on_signal_create: Option<CreateHook>,
    on_signal_change: Option<ChangeHook>,
    on_signal_error: Option<ErrorHook>,
    on_signal_dispose: Option<SignalHook>,
    on_signal_rename: Option<SignalHook>,
    on_signal_access: Option<SignalHook>,
    on_task_access: Option<SignalHook>,
    on_forget_signals: Option<ForgetHook>,
    on_tag_create: Option<TagHook>,
    on_tag_add: Option<TagMemberHook>,
    on_tag_remove: Option<TagMemberHook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal was created: `(signal, dependencies, disposal_handled)`.
    pub fn on_signal_create<F>(mut self, f: F) -> Self
    where
        F: Fn(&SignalRef, &[SignalRef], bool) + Send + Sync + 'static,
    {
        self.on_signal_create = Some(Arc::new(f));
        self
    }

    /// A signal committed a new value.
    pub fn on_signal_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&dyn AnySignal, &dyn Any) + Send + Sync + 'static,
    {
        self.on_signal_change = Some(Arc::new(f));
        self
    }

    /// A signal entered an error state.
    pub fn on_signal_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&dyn AnySignal, &SignalError) + Send + Sync + 'static,
    {
        self.on_signal_error = Some(Arc::new(f));
        self
    }

    pub fn on_signal_dispose<F>(mut self, f: F) -> Self
    where
        F: Fn(&dyn AnySignal) + Send + Sync + 'static,
    {
        self.on_signal_dispose = Some(Arc::new(f));
        self
    }

    pub fn on_signal_rename<F>(mut self, f: F) -> Self
    where
        F: Fn(&dyn AnySignal) + Send + Sync + 'static,
    {
        self.on_signal_rename = Some(Arc::new(f));
        self
    }

    /// A signal was read with `get()`. Render integration builds its
    /// dependency set from this.
    pub fn on_signal_access<F>(mut self, f: F) -> Self
    where
        F: Fn(&dyn AnySignal) + Send + Sync + 'static,
    {
        self.on_signal_access = Some(Arc::new(f));
        self
    }

    /// The settled state of an async value was read.
    pub fn on_task_access<F>(mut self, f: F) -> Self
    where
        F: Fn(&dyn AnySignal) + Send + Sync + 'static,
    {
        self.on_task_access = Some(Arc::new(f));
        self
    }

    pub fn on_forget_signals<F>(mut self, f: F) -> Self
    where
        F: Fn(&[SignalRef]) + Send + Sync + 'static,
    {
        self.on_forget_signals = Some(Arc::new(f));
        self
    }

    pub fn on_tag_create<F>(mut self, f: F) -> Self
    where
        F: Fn(&TagInfo) + Send + Sync + 'static,
    {
        self.on_tag_create = Some(Arc::new(f));
        self
    }

    pub fn on_tag_add<F>(mut self, f: F) -> Self
    where
        F: Fn(&TagInfo, &dyn AnySignal) + Send + Sync + 'static,
    {
        self.on_tag_add = Some(Arc::new(f));
        self
    }

    pub fn on_tag_remove<F>(mut self, f: F) -> Self
    where
        F: Fn(&TagInfo, &dyn AnySignal) + Send + Sync + 'static,
    {
        self.on_tag_remove = Some(Arc::new(f));
        self
    }

    /// Fields set in `overrides` win; the rest are kept.
    pub fn merge(&self, overrides: &Hooks) -> Hooks {
        fn pick<T: Clone>(base: &Option<T>, over: &Option<T>) -> Option<T> {
            over.clone().or_else(|| base.clone())
        }

        Hooks {
            on_signal_create: pick(&self.on_signal_create, &overrides.on_signal_create),
            on_signal_change: pick(&self.on_signal_change, &overrides.on_signal_change),
            on_signal_error: pick(&self.on_signal_error, &overrides.on_signal_error),
            on_signal_dispose: pick(&self.on_signal_dispose, &overrides.on_signal_dispose),
            on_signal_rename: pick(&self.on_signal_rename, &overrides.on_signal_rename),
            on_signal_access: pick(&self.on_signal_access, &overrides.on_signal_access),
            on_task_access: pick(&self.on_task_access, &overrides.on_task_access),
            on_forget_signals: pick(&self.on_forget_signals, &overrides.on_forget_signals),
            on_tag_create: pick(&self.on_tag_create, &overrides.on_tag_create),
            on_tag_add: pick(&self.on_tag_add, &overrides.on_tag_add),
            on_tag_remove: pick(&self.on_tag_remove, &overrides.on_tag_remove),
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_signal_create", &self.on_signal_create.is_some())
            .field("on_signal_change", &self.on_signal_change.is_some())
            .field("on_signal_error", &self.on_signal_error.is_some())
            .field("on_signal_dispose", &self.on_signal_dispose.is_some())
            .field("on_signal_rename", &self.on_signal_rename.is_some())
            .field("on_signal_access", &self.on_signal_access.is_some())
            .field("on_task_access", &self.on_task_access.is_some())
            .field("on_forget_signals", &self.on_forget_signals.is_some())
            .field("on_tag_create", &self.on_tag_create.is_some())
            .field("on_tag_add", &self.on_tag_add.is_some())
            .field("on_tag_remove", &self.on_tag_remove.is_some())
            .finish()
    }
}

struct CreateEvent {
    signal: SignalRef,
    deps: Vec<SignalRef>,
    disposal_handled: bool,
}

struct RuntimeInner {
    config: RuntimeConfig,
    hooks: RwLock<Arc<Hooks>>,
    pending_creates: Mutex<VecDeque<CreateEvent>>,
    forgetting: Mutex<Option<Vec<SignalRef>>>,
}

/// Handle to a hooks registry. Clones share state.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

static GLOBAL: OnceLock<Runtime> = OnceLock::new();

/// Restores the previous hooks when a `with_hooks` scope ends.
struct HooksGuard<'a> {
    runtime: &'a Runtime,
    previous: Option<Arc<Hooks>>,
}

impl Drop for HooksGuard<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            *self.runtime.inner.hooks.write() = previous;
        }
    }
}

/// Closes a `forget` scope, also when its closure panics.
struct ForgetGuard<'a> {
    runtime: &'a Runtime,
}

impl Drop for ForgetGuard<'_> {
    fn drop(&mut self) {
        let forgotten = self.runtime.inner.forgetting.lock().take().unwrap_or_default();
        if forgotten.is_empty() || std::thread::panicking() {
            return;
        }
        tracing::debug!(count = forgotten.len(), "forgetting signals");
        if let Some(hook) = &self.runtime.hooks().on_forget_signals {
            hook(&forgotten);
        }
    }
}

impl Runtime {
    /// A runtime with default configuration and no hooks.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                hooks: RwLock::new(Arc::new(Hooks::default())),
                pending_creates: Mutex::new(VecDeque::new()),
                forgetting: Mutex::new(None),
            }),
        }
    }

    /// The process-wide default runtime.
    pub fn global() -> &'static Runtime {
        GLOBAL.get_or_init(Runtime::new)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Snapshot of the installed hooks.
    pub fn hooks(&self) -> Arc<Hooks> {
        Arc::clone(&self.inner.hooks.read())
    }

    /// Merge `partial` into the installed hooks for the runtime's lifetime.
    pub fn set_hooks(&self, partial: Hooks) {
        {
            let mut hooks = self.inner.hooks.write();
            *hooks = Arc::new(hooks.merge(&partial));
        }
        self.replay_creates();
    }

    /// Merge `partial` into the installed hooks while `f` runs.
    pub fn with_hooks<R>(&self, partial: Hooks, f: impl FnOnce() -> R) -> R {
        let previous = {
            let mut hooks = self.inner.hooks.write();
            let merged = Arc::new(hooks.merge(&partial));
            std::mem::replace(&mut *hooks, merged)
        };
        let _guard = HooksGuard {
            runtime: self,
            previous: Some(previous),
        };
        self.replay_creates();
        f()
    }

    /// Report disposals raised inside `f` as a single forget event.
    pub fn forget<R>(&self, f: impl FnOnce() -> R) -> R {
        let outermost = {
            let mut forgetting = self.inner.forgetting.lock();
            if forgetting.is_some() {
                false
            } else {
                *forgetting = Some(Vec::new());
                true
            }
        };
        if !outermost {
            return f();
        }

        let _guard = ForgetGuard { runtime: self };
        f()
    }

    /// Number of creation events waiting for a create hook.
    pub fn pending_create_events(&self) -> usize {
        self.inner.pending_creates.lock().len()
    }

    fn replay_creates(&self) {
        let Some(hook) = self.hooks().on_signal_create.clone() else {
            return;
        };
        let events: Vec<CreateEvent> = self.inner.pending_creates.lock().drain(..).collect();
        if events.is_empty() {
            return;
        }

        tracing::debug!(count = events.len(), "replaying buffered signal creations");
        for event in events {
            hook(&event.signal, &event.deps, event.disposal_handled);
        }
    }

    pub(crate) fn signal_created(&self, signal: SignalRef, deps: Vec<SignalRef>, disposal_handled: bool) {
        if let Some(hook) = &self.hooks().on_signal_create {
            hook(&signal, &deps, disposal_handled);
            return;
        }

        let capacity = self.inner.config.create_queue_capacity;
        if capacity == 0 {
            return;
        }
        let mut queue = self.inner.pending_creates.lock();
        if queue.len() >= capacity {
            if let Some(dropped) = queue.pop_front() {
                tracing::debug!(signal = %dropped.signal.display_name(), "create queue full, dropping oldest event");
            }
        }
        queue.push_back(CreateEvent {
            signal,
            deps,
            disposal_handled,
        });
    }

    pub(crate) fn signal_changed(&self, signal: &dyn AnySignal, value: &dyn Any) {
        if let Some(hook) = &self.hooks().on_signal_change {
            hook(signal, value);
        }
    }

    pub(crate) fn signal_error(&self, signal: &dyn AnySignal, error: &SignalError) {
        if error.is_aborted() {
            return;
        }
        if let Some(hook) = &self.hooks().on_signal_error {
            hook(signal, error);
        }
    }

    pub(crate) fn signal_disposed(&self, signal: &dyn AnySignal) {
        {
            let mut forgetting = self.inner.forgetting.lock();
            if let Some(forgotten) = forgetting.as_mut() {
                if let Some(signal) = signal.to_ref() {
                    forgotten.push(signal);
                }
                return;
            }
        }
        if let Some(hook) = &self.hooks().on_signal_dispose {
            hook(signal);
        }
    }

    pub(crate) fn signal_renamed(&self, signal: &dyn AnySignal) {
        if let Some(hook) = &self.hooks().on_signal_rename {
            hook(signal);
        }
    }

    pub(crate) fn signal_accessed(&self, signal: &dyn AnySignal) {
        if let Some(hook) = &self.hooks().on_signal_access {
            hook(signal);
        }
    }

    pub(crate) fn task_accessed(&self, signal: &dyn AnySignal) {
        if let Some(hook) = &self.hooks().on_task_access {
            hook(signal);
        }
    }

    pub(crate) fn tag_created(&self, tag: &TagInfo) {
        if let Some(hook) = &self.hooks().on_tag_create {
            hook(tag);
        }
    }

    pub(crate) fn tag_added(&self, tag: &TagInfo, signal: &dyn AnySignal) {
        if let Some(hook) = &self.hooks().on_tag_add {
            hook(tag, signal);
        }
    }

    pub(crate) fn tag_removed(&self, tag: &TagInfo, signal: &dyn AnySignal) {
        if let Some(hook) = &self.hooks().on_tag_remove {
            hook(tag, signal);
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("hooks", &*self.hooks())
            .field("pending_creates", &self.pending_create_events())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    use crate::reactive::Mutable;

    #[test]
    fn create_events_are_buffered_until_a_hook_attaches() {
        let runtime = Runtime::new();
        let _a = Mutable::builder(1).runtime(&runtime).name("a").build().unwrap();
        let _b = Mutable::builder(2).runtime(&runtime).name("b").build().unwrap();
        assert_eq!(runtime.pending_create_events(), 2);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        runtime.set_hooks(Hooks::new().on_signal_create(move |signal, _, _| {
            seen_clone.lock().push(signal.display_name());
        }));

        assert_eq!(*seen.lock(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(runtime.pending_create_events(), 0);

        let _c = Mutable::builder(3).runtime(&runtime).name("c").build().unwrap();
        assert_eq!(seen.lock().len(), 3);
    }

    #[test]
    fn create_queue_is_capped() {
        let runtime = Runtime::with_config(RuntimeConfig {
            create_queue_capacity: 2,
            ..RuntimeConfig::default()
        });
        let _signals: Vec<_> = (0..5)
            .map(|i| Mutable::builder(i).runtime(&runtime).build().unwrap())
            .collect();
        assert_eq!(runtime.pending_create_events(), 2);
    }

    #[test]
    fn with_hooks_restores_previous_hooks() {
        let runtime = Runtime::new();
        let outer = Arc::new(AtomicI32::new(0));
        let inner = Arc::new(AtomicI32::new(0));

        let outer_clone = outer.clone();
        runtime.set_hooks(Hooks::new().on_signal_access(move |_| {
            outer_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let signal = Mutable::builder(0).runtime(&runtime).build().unwrap();

        let inner_clone = inner.clone();
        runtime.with_hooks(
            Hooks::new().on_signal_access(move |_| {
                inner_clone.fetch_add(1, Ordering::SeqCst);
            }),
            || {
                signal.get().unwrap();
            },
        );
        signal.get().unwrap();

        assert_eq!(inner.load(Ordering::SeqCst), 1);
        assert_eq!(outer.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn with_hooks_restores_after_panic() {
        let runtime = Runtime::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            runtime.with_hooks(Hooks::new().on_signal_access(|_| {}), || panic!("boom"))
        }));

        assert!(result.is_err());
        assert!(runtime.hooks().on_signal_access.is_none());
    }

    #[test]
    fn merge_keeps_unset_fields() {
        let base = Hooks::new().on_signal_dispose(|_| {});
        let merged = base.merge(&Hooks::new().on_signal_rename(|_| {}));
        assert!(merged.on_signal_dispose.is_some());
        assert!(merged.on_signal_rename.is_some());
        assert!(merged.on_signal_change.is_none());
    }

    #[test]
    fn forget_reports_disposals_once() {
        let runtime = Runtime::new();
        let disposed = Arc::new(AtomicI32::new(0));
        let forgotten = Arc::new(Mutex::new(Vec::new()));

        let disposed_clone = disposed.clone();
        let forgotten_clone = forgotten.clone();
        runtime.set_hooks(
            Hooks::new()
                .on_signal_dispose(move |_| {
                    disposed_clone.fetch_add(1, Ordering::SeqCst);
                })
                .on_forget_signals(move |signals| {
                    forgotten_clone
                        .lock()
                        .push(signals.iter().map(|s| s.display_name()).collect::<Vec<_>>());
                }),
        );

        let a = Mutable::builder(1).runtime(&runtime).name("a").build().unwrap();
        let b = Mutable::builder(2).runtime(&runtime).name("b").build().unwrap();
        runtime.forget(|| {
            a.dispose().unwrap();
            b.dispose().unwrap();
        });

        assert_eq!(disposed.load(Ordering::SeqCst), 0);
        assert_eq!(*forgotten.lock(), vec![vec!["a".to_string(), "b".to_string()]]);
    }

    #[test]
    fn panicking_forget_scope_still_closes() {
        let runtime = Runtime::new();
        let disposed = Arc::new(AtomicI32::new(0));
        let disposed_clone = disposed.clone();
        runtime.set_hooks(Hooks::new().on_signal_dispose(move |_| {
            disposed_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            runtime.forget(|| panic!("render failed"))
        }));
        assert!(outcome.is_err());

        let signal = Mutable::builder(1).runtime(&runtime).build().unwrap();
        signal.dispose().unwrap();
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }
}
