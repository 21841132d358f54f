//! Change Emitter
//!
//! A minimal synchronous pub/sub primitive. Every signal owns one emitter
//! and uses it both for change notification and for value listeners (which
//! are filtered subscriptions on the same emitter).
//!
//! Emission takes a snapshot of the listener list first, so listeners that
//! subscribe or unsubscribe while an emission is running only affect the
//! next emission. The lock is never held while a listener runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::subscriber::Subscription;

type Listener<A> = Arc<dyn Fn(&A) + Send + Sync>;

struct EmitterInner<A> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener<A>)>>,
}

/// Synchronous listener registry.
pub struct Emitter<A> {
    inner: Arc<EmitterInner<A>>,
}

impl<A: 'static> Emitter<A> {
    /// Create an emitter with no listeners.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                next_id: AtomicU64::new(0),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a listener. It runs on every emission until the returned
    /// subscription is dropped.
    pub fn on<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(listener)));

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.lock().retain(|(other, _)| *other != id);
            }
        })
    }

    /// Register a listener that receives `selector()` on each emission, but
    /// only when the selector yields a value.
    pub fn on_filtered<B, S, F>(&self, selector: S, listener: F) -> Subscription
    where
        S: Fn() -> Option<B> + Send + Sync + 'static,
        F: Fn(B) + Send + Sync + 'static,
    {
        self.on(move |_| {
            if let Some(value) = selector() {
                listener(value);
            }
        })
    }

    /// Invoke every listener registered at the moment of the call.
    pub fn emit(&self, arg: &A) {
        let snapshot: SmallVec<[Listener<A>; 4]> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            listener(arg);
        }
    }

    /// Drop every listener without calling it.
    pub fn clear(&self) {
        self.inner.listeners.lock().clear();
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<A: 'static> Default for Emitter<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Clone for Emitter<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> std::fmt::Debug for Emitter<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.inner.listeners.lock().len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
