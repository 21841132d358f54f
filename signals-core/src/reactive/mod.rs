//! Reactive Primitives
//!
//! This module implements the signal engine: mutable signals, computed
//! signals, and the actions built from them.
//!
//! # Concepts
//!
//! ## Mutable signals
//!
//! A [`Mutable`] is a container for state written by application code. A
//! write that compares equal to the current value (see [`Equality`]) is
//! dropped and notifies nobody.
//!
//! ## Computed signals
//!
//! A [`Computed`] derives its value from a named map of dependencies
//! ([`Deps`]). Dependencies are read through the [`ComputeContext`] handed
//! to the compute function, and only the ones actually read are
//! subscribed. Each recomputation is an epoch with its own cancellation
//! token and cleanups.
//!
//! ## Actions
//!
//! An [`Action`] pairs a payload signal with a result signal and exposes
//! `dispatch`.
//!
//! # Implementation Notes
//!
//! Dependencies are explicit: a computed signal declares what it may read,
//! and its context subscribes on first read within an epoch. Notifications
//! go through a per-thread scheduler so a [`batch`] of writes notifies once
//! per change, after the outermost batch completes.
//!
//! Lifecycle events (creation, change, error, disposal, renames, tags) are
//! reported to a [`Runtime`], where devtools and render integration install
//! [`Hooks`].

mod action;
mod computed;
mod context;
mod emitter;
mod equality;
mod mutable;
mod plugin;
mod promise;
mod runtime;
mod scheduler;
mod signal;
mod subscriber;

pub use action::{Action, ActionBuilder, ActionContext};
pub use computed::{Computed, ComputedBuilder, WhenAction};
pub use context::ComputeContext;
pub use emitter::Emitter;
pub use equality::{resolve as resolve_equality, EqualsFn, Equality, ShallowEq};
pub use mutable::{Mutable, MutableBuilder};
pub use plugin::{Plugin, Tag, TagInfo, Use};
pub use promise::{Promise, TaskState};
pub use runtime::{Hooks, Runtime};
pub use scheduler::{batch, defer, flush, is_batching, pending, schedule_notification};
pub use signal::{
    dispose_all, AnySignal, AsSignalRef, Cleanup, Current, Deps, Disposable, HydrateStatus,
    SignalKind, SignalRef, SignalValue,
};
pub use subscriber::{SignalId, Subscription};
