//! Signal Capability
//!
//! Types shared by mutable and computed signals:
//!
//! - [`AnySignal`]: the type-erased view used by dependency maps, hooks and
//!   tags.
//! - [`Current`]: the value-or-error slot. A signal that was never computed
//!   has no `Current` at all, which is distinct from both variants.
//! - `SignalCore`: identity, display name, disposal flag, version counter,
//!   change emitter and the cleanups collected from plugins.
//! - [`Disposable`] and [`dispose_all`].

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use crate::error::{SignalError, SignalResult};

use super::emitter::Emitter;
use super::runtime::Runtime;
use super::subscriber::{SignalId, Subscription};

/// Bound for values held by signals.
pub trait SignalValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T> SignalValue for T where T: Clone + PartialEq + Send + Sync + 'static {}

/// Which kind of signal an [`AnySignal`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Mutable,
    Computed,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mutable => f.write_str("mutable"),
            Self::Computed => f.write_str("computed"),
        }
    }
}

/// Type-erased signal.
pub trait AnySignal: Send + Sync + 'static {
    /// Process-unique identity.
    fn id(&self) -> SignalId;

    /// Human-readable label.
    fn display_name(&self) -> String;

    fn kind(&self) -> SignalKind;

    fn is_disposed(&self) -> bool;

    /// Counter bumped on every committed change.
    fn version(&self) -> u64;

    /// Register a bare change listener.
    fn subscribe(&self, listener: Arc<dyn Fn() + Send + Sync>) -> Subscription;

    /// Read the current value without firing render-access hooks. Computes
    /// the signal first if it was never computed.
    fn read_any(&self) -> SignalResult<Box<dyn Any + Send + Sync>>;

    /// An owning reference to this signal, if it is still alive.
    fn to_ref(&self) -> Option<SignalRef>;
}

/// Shared, type-erased signal reference.
pub type SignalRef = Arc<dyn AnySignal>;

impl fmt::Debug for dyn AnySignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnySignal")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("name", &self.display_name())
            .finish()
    }
}

/// Signals that can be placed in a dependency map or passed to hooks.
pub trait AsSignalRef {
    fn signal_ref(&self) -> SignalRef;
}

impl AsSignalRef for SignalRef {
    fn signal_ref(&self) -> SignalRef {
        Arc::clone(self)
    }
}

/// Ordered dependency map, name to signal.
#[derive(Clone, Default)]
pub struct Deps {
    map: IndexMap<String, SignalRef>,
}

impl Deps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dependency under `name`.
    pub fn with(mut self, name: impl Into<String>, signal: &impl AsSignalRef) -> Self {
        self.insert(name, signal);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, signal: &impl AsSignalRef) {
        self.map.insert(name.into(), signal.signal_ref());
    }

    pub fn get(&self, name: &str) -> Option<&SignalRef> {
        self.map.get(name)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SignalRef)> {
        self.map.iter().map(|(name, signal)| (name.as_str(), signal))
    }

    /// The declared signals, in declaration order.
    pub fn signals(&self) -> Vec<SignalRef> {
        self.map.values().cloned().collect()
    }
}

impl fmt::Debug for Deps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.map.keys()).finish()
    }
}

/// The value-or-error slot of a signal.
#[derive(Debug, Clone)]
pub enum Current<T> {
    Value(T),
    Error(SignalError),
}

impl<T: Clone> Current<T> {
    pub fn to_result(&self) -> SignalResult<T> {
        match self {
            Self::Value(value) => Ok(value.clone()),
            Self::Error(error) => Err(error.clone()),
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Value(value) => Some(value),
            Self::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&SignalError> {
        match self {
            Self::Value(_) => None,
            Self::Error(error) => Some(error),
        }
    }
}

/// Outcome of a `hydrate` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrateStatus {
    /// The value was installed.
    Success,
    /// The signal was already modified or computed; nothing changed.
    Skipped,
}

/// Cleanup returned by a plugin, run once at disposal.
pub type Cleanup = Box<dyn FnOnce() -> SignalResult<()> + Send>;

/// Something that can be disposed.
pub trait Disposable {
    /// Release everything the value owns. Calling it again is a no-op.
    fn dispose(&self) -> SignalResult<()>;
}

/// Dispose every item, even when some fail, and report all failures
/// together.
pub fn dispose_all(items: &[&dyn Disposable]) -> SignalResult<()> {
    let failures: Vec<SignalError> = items
        .iter()
        .filter_map(|item| item.dispose().err())
        .collect();

    if failures.is_empty() {
        Ok(())
    } else {
        Err(SignalError::Disposal(failures))
    }
}

/// State common to every signal.
pub(crate) struct SignalCore {
    id: SignalId,
    kind: SignalKind,
    name: RwLock<String>,
    runtime: Runtime,
    disposed: AtomicBool,
    version: AtomicU64,
    pub(crate) changed: Emitter<()>,
    cleanups: Mutex<Vec<Cleanup>>,
    detachers: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl SignalCore {
    pub(crate) fn new(kind: SignalKind, name: Option<String>, runtime: Runtime) -> Self {
        let id = SignalId::new();
        let name = name.unwrap_or_else(|| format!("{kind}{id}"));
        Self {
            id,
            kind,
            name: RwLock::new(name),
            runtime,
            disposed: AtomicBool::new(false),
            version: AtomicU64::new(0),
            changed: Emitter::new(),
            cleanups: Mutex::new(Vec::new()),
            detachers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn id(&self) -> SignalId {
        self.id
    }

    pub(crate) fn kind(&self) -> SignalKind {
        self.kind
    }

    pub(crate) fn name(&self) -> String {
        self.name.read().clone()
    }

    pub(crate) fn set_name(&self, name: String) {
        *self.name.write() = name;
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Refuse mutation once disposed.
    pub(crate) fn ensure_live(&self, operation: &str) -> SignalResult<()> {
        if self.is_disposed() {
            tracing::warn!(signal = %self.name(), operation, "mutation refused on disposed signal");
            return Err(SignalError::Disposed(self.name()));
        }
        Ok(())
    }

    /// Returns `true` only for the call that actually disposes.
    pub(crate) fn mark_disposed(&self) -> bool {
        !self.disposed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub(crate) fn bump_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn subscribe(&self, listener: Arc<dyn Fn() + Send + Sync>) -> Subscription {
        self.changed.on(move |_| listener())
    }

    pub(crate) fn push_cleanup(&self, cleanup: Cleanup) {
        self.cleanups.lock().push(cleanup);
    }

    /// Register something to release at disposal (tag membership,
    /// notifier subscriptions).
    pub(crate) fn push_detacher(&self, detach: Box<dyn FnOnce() + Send>) {
        self.detachers.lock().push(detach);
    }

    /// Detach, drop listeners, and run plugin cleanups in registration
    /// order. Every cleanup runs even when an earlier one fails.
    pub(crate) fn teardown(&self) -> SignalResult<()> {
        let detachers = std::mem::take(&mut *self.detachers.lock());
        for detach in detachers {
            detach();
        }

        self.changed.clear();

        let cleanups = std::mem::take(&mut *self.cleanups.lock());
        let failures: Vec<SignalError> = cleanups
            .into_iter()
            .filter_map(|cleanup| cleanup().err())
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            tracing::debug!(signal = %self.name(), failures = failures.len(), "cleanups failed during disposal");
            Err(SignalError::Disposal(failures))
        }
    }
}
