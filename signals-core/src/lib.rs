//! Signals Core
//!
//! This crate provides a reactive signal engine for client-side application
//! state. It implements:
//!
//! - Mutable and computed signals with pluggable equality
//! - Per-epoch computation contexts with cancellation and cleanup
//! - Batched, FIFO change notification
//! - Plugins and tags attached at signal construction
//! - Actions pairing a dispatched payload with a computed result
//! - A lifecycle hooks registry for devtools and render integration
//!
//! # Architecture
//!
//! - `reactive`: signals, contexts, scheduler, hooks and actions
//! - `error`: the [`SignalError`] type shared by every fallible operation
//! - `config`: [`RuntimeConfig`], loadable from JSON
//!
//! # Example
//!
//! ```rust,ignore
//! use signals_core::reactive::{Computed, Deps, Mutable};
//!
//! let count = Mutable::new(1);
//! let doubled = Computed::new(Deps::new().with("count", &count), |ctx| {
//!     Ok(ctx.get::<i32>("count")? * 2)
//! });
//!
//! assert_eq!(doubled.get()?, 2);
//! count.set(5)?;
//! assert_eq!(doubled.get()?, 10);
//! ```

pub mod config;
pub mod error;
pub mod reactive;

pub use config::RuntimeConfig;
pub use error::{SignalError, SignalResult};
pub use reactive::{batch, flush};
