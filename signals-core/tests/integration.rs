//! Integration Tests for the Signal Engine
//!
//! These tests verify that mutable signals, computed signals, actions,
//! plugins and hooks work together correctly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use signals_core::reactive::{
    dispose_all, Action, ActionContext, AsSignalRef, Cleanup, Computed, Deps, Equality, Hooks,
    Mutable, Runtime, Tag, TaskState, Use,
};
use signals_core::{batch, flush, RuntimeConfig, SignalError};

fn counter() -> (Arc<AtomicI32>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicI32::new(0));
    let clone = count.clone();
    (count, move || {
        clone.fetch_add(1, Ordering::SeqCst);
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CartItem {
    price: f64,
    discount_percentage: f64,
    quantity: u32,
}

/// The cart subtotal follows the item list.
#[test]
fn cart_subtotal_follows_items() {
    let items = Mutable::builder(vec![CartItem {
        price: 100.0,
        discount_percentage: 10.0,
        quantity: 2,
    }])
    .name("cart.items")
    .equals(Equality::deep())
    .build()
    .unwrap();

    let subtotal = Computed::builder(Deps::new().with("items", &items), |ctx| {
        let items = ctx.get::<Vec<CartItem>>("items")?;
        Ok(items
            .iter()
            .map(|item| {
                item.price * (1.0 - item.discount_percentage / 100.0) * f64::from(item.quantity)
            })
            .sum::<f64>())
    })
    .name("cart.subtotal")
    .build()
    .unwrap();

    assert!((subtotal.get().unwrap() - 180.0).abs() < 1e-9);

    items.set(Vec::new()).unwrap();
    assert_eq!(subtotal.get().unwrap(), 0.0);
}

/// Setting the same value twice notifies once.
#[test]
fn equal_writes_notify_once() {
    let signal = Mutable::new(String::from("initial"));
    let (count, listener) = counter();
    let _sub = signal.on(listener);

    signal.set("next".into()).unwrap();
    signal.set("next".into()).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

/// Unread lazy signals never compute.
#[test]
fn unread_computed_signals_never_compute() {
    let source = Mutable::new(1);
    let runs = Arc::new(AtomicI32::new(0));

    let signals: Vec<Computed<i32>> = (0..10)
        .map(|_| {
            let runs = runs.clone();
            Computed::new(Deps::new().with("source", &source), move |ctx| {
                runs.fetch_add(1, Ordering::SeqCst);
                ctx.get::<i32>("source")
            })
        })
        .collect();

    source.set(2).unwrap();
    assert_eq!(signals.len(), 10);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

/// After a branch switch only the branch actually read is subscribed.
#[test]
fn branch_switch_resubscribes() {
    let use_a = Mutable::new(true);
    let a = Mutable::new(1);
    let b = Mutable::new(100);
    let runs = Arc::new(AtomicI32::new(0));
    let runs_clone = runs.clone();

    let picked = Computed::new(
        Deps::new().with("use_a", &use_a).with("a", &a).with("b", &b),
        move |ctx| {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            if ctx.get::<bool>("use_a")? {
                ctx.get::<i32>("a")
            } else {
                ctx.get::<i32>("b")
            }
        },
    );
    assert_eq!(picked.get().unwrap(), 1);

    // Not read yet: b does not trigger anything.
    b.set(101).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    use_a.set(false).unwrap();
    assert_eq!(picked.get().unwrap(), 101);
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    a.set(2).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    b.set(102).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(picked.get().unwrap(), 102);
}

/// A superseded epoch never completes its `safe` work.
#[tokio::test]
async fn superseded_epochs_stay_silent() {
    let query = Mutable::new(String::from("first"));
    let committed = Arc::new(Mutex::new(Vec::new()));
    let committed_clone = committed.clone();

    let search = Computed::new_async(Deps::new().with("query", &query), move |ctx| {
        let committed = committed_clone.clone();
        async move {
            let query = ctx.get::<String>("query")?;
            let delay = if query == "first" { 40 } else { 1 };
            ctx.safe(tokio::time::sleep(Duration::from_millis(delay))).await;
            committed.lock().push(query.clone());
            Ok(query)
        }
    });

    let first = search.get().unwrap();
    // Let the first epoch start and subscribe.
    tokio::time::sleep(Duration::from_millis(5)).await;
    query.set("second".into()).unwrap();
    let second = search.get().unwrap();
    assert_ne!(first, second);

    assert_eq!(second.await.unwrap(), "second");
    let stalled = tokio::time::timeout(Duration::from_millis(100), first).await;
    assert!(stalled.is_err(), "superseded epoch must never settle");
    assert_eq!(*committed.lock(), vec!["second".to_string()]);
    assert!(matches!(search.task().unwrap(), TaskState::Ready(ref q) if q == "second"));
}

/// Bursts of refresh calls collapse into one recomputation after the turn.
#[tokio::test]
async fn refresh_bursts_coalesce() {
    let runs = Arc::new(AtomicI32::new(0));
    let runs_clone = runs.clone();
    let clock = Computed::new(Deps::new(), move |_| {
        Ok(runs_clone.fetch_add(1, Ordering::SeqCst))
    });
    let (notified, listener) = counter();
    let _sub = clock.on(listener);
    assert_eq!(clock.get().unwrap(), 0);

    clock.refresh().unwrap();
    clock.refresh().unwrap();
    clock.refresh().unwrap();
    tokio::task::yield_now().await;

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(clock.get().unwrap(), 1);
}

/// Inside a batch, refreshes run once when the batch closes.
#[test]
fn batched_refreshes_run_at_batch_end() {
    let runs = Arc::new(AtomicI32::new(0));
    let runs_clone = runs.clone();
    let clock = Computed::new(Deps::new(), move |_| {
        Ok(runs_clone.fetch_add(1, Ordering::SeqCst))
    });
    clock.get().unwrap();

    batch(|| {
        for _ in 0..10 {
            clock.refresh().unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    });
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    // Without a runtime or batch, the refresh waits for a flush.
    clock.refresh().unwrap();
    flush();
    assert_eq!(runs.load(Ordering::SeqCst), 3);
}

/// A dependency written right after an async read starts a new epoch.
#[tokio::test]
async fn async_reads_see_immediate_dependency_changes() {
    let query = Mutable::new(String::from("first"));
    let search = Computed::new_async(Deps::new().with("query", &query), |ctx| async move {
        ctx.get::<String>("query")
    });
    let (notified, listener) = counter();
    let _sub = search.on(listener);

    let first = search.get().unwrap();
    query.set("second".into()).unwrap();
    let second = search.get().unwrap();

    assert_ne!(first, second);
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(second.await.unwrap(), "second");
}

/// `dispatch` returns the result synchronously.
#[test]
fn action_dispatch_returns_result() {
    let action = Action::new(|ctx: &ActionContext<i32>| Ok(ctx.payload() * 2));

    assert_eq!(action.dispatch(5).unwrap(), 10);
    assert_eq!(action.result().get().unwrap(), Some(10));
}

/// When compute and fallback both fail, the signal holds one error that
/// carries both.
#[test]
fn fallback_failure_is_composite() {
    let price: Computed<f64> = Computed::builder(Deps::new(), |_| {
        Err(SignalError::message("E1: price service down"))
    })
    .name("price")
    .fallback(|_| Err(SignalError::message("E2: no cached price")))
    .build()
    .unwrap();

    let error = price.get().unwrap_err();
    match &error {
        SignalError::Fallback {
            signal,
            error,
            fallback,
        } => {
            assert_eq!(signal, "price");
            assert!(error.to_string().starts_with("E1"));
            assert!(fallback.to_string().starts_with("E2"));
        }
        other => panic!("expected a composite error, got {other:?}"),
    }
    // The same composite on every read.
    assert_eq!(price.peek().unwrap_err().to_string(), error.to_string());
}

/// Disposing twice is the same as disposing once.
#[test]
fn disposal_is_idempotent() {
    let cleanups = Arc::new(AtomicI32::new(0));
    let cleanups_clone = cleanups.clone();

    let signal = Mutable::builder(1)
        .plugin(move |_| {
            let cleanups = cleanups_clone.clone();
            Ok(Some(Box::new(move || {
                cleanups.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }) as Cleanup))
        })
        .build()
        .unwrap();
    let (count, listener) = counter();
    let _sub = signal.on(listener);

    signal.dispose().unwrap();
    signal.dispose().unwrap();

    assert!(signal.is_disposed());
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    assert!(signal.set(2).is_err());
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

/// A persistence plugin loads once, then writes back on every change.
#[test]
fn persistence_plugin_loads_then_subscribes() {
    type Store = Arc<Mutex<HashMap<String, String>>>;

    fn persisted(store: Store, key: &'static str) -> Use<Mutable<Vec<CartItem>>> {
        Use::plugin(move |signal: &Mutable<Vec<CartItem>>| {
            if let Some(saved) = store.lock().get(key).cloned() {
                let items: Vec<CartItem> =
                    serde_json::from_str(&saved).map_err(SignalError::new)?;
                signal.hydrate(items)?;
            }

            let store = store.clone();
            let subscription = signal.on_value(move |items| {
                if let Ok(json) = serde_json::to_string(&items) {
                    store.lock().insert(key.to_string(), json);
                }
            });
            Ok(Some(Box::new(move || {
                subscription.unsubscribe();
                Ok(())
            }) as Cleanup))
        })
    }

    let store: Store = Arc::new(Mutex::new(HashMap::new()));
    let saved = vec![CartItem {
        price: 5.0,
        discount_percentage: 0.0,
        quantity: 3,
    }];
    store.lock().insert(
        "cart".to_string(),
        serde_json::to_string(&saved).unwrap(),
    );

    let tag = Tag::new("persisted", vec![persisted(store.clone(), "cart")]);
    let cart = Mutable::builder(Vec::new()).tag(&tag).build().unwrap();
    assert_eq!(cart.get().unwrap(), saved);
    assert!(tag.contains(cart.id()));

    cart.set(Vec::new()).unwrap();
    assert_eq!(store.lock().get("cart").map(String::as_str), Some("[]"));

    cart.dispose().unwrap();
    assert!(!tag.contains(cart.id()));
}

/// Render integration collects the signals read during a render.
#[test]
fn access_hook_collects_render_dependencies() {
    let runtime = Runtime::new();
    let count = Mutable::builder(1).runtime(&runtime).name("count").build().unwrap();
    let label = Computed::builder(Deps::new().with("count", &count), |ctx| {
        Ok(format!("count: {}", ctx.get::<i32>("count")?))
    })
    .runtime(&runtime)
    .name("label")
    .build()
    .unwrap();

    let accessed = Arc::new(Mutex::new(Vec::new()));
    let accessed_clone = accessed.clone();
    let rendered = runtime.with_hooks(
        Hooks::new().on_signal_access(move |signal| {
            accessed_clone.lock().push(signal.display_name());
        }),
        || label.get().unwrap(),
    );

    assert_eq!(rendered, "count: 1");
    // Dependency reads inside a computation are not render accesses.
    assert_eq!(*accessed.lock(), vec!["label".to_string()]);

    count.get().unwrap();
    assert_eq!(accessed.lock().len(), 1);
}

/// Devtools attached late still see earlier signals, with their deps.
#[test]
fn late_devtools_see_earlier_signals() {
    let config = RuntimeConfig::from_json(r#"{"create_queue_capacity": 8}"#).unwrap();
    let runtime = Runtime::with_config(config);
    let a = Mutable::builder(1).runtime(&runtime).name("a").build().unwrap();
    let _b = Computed::builder(Deps::new().with("a", &a), |ctx| ctx.get::<i32>("a"))
        .runtime(&runtime)
        .name("b")
        .build()
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    runtime.set_hooks(Hooks::new().on_signal_create(move |signal, deps, _| {
        let deps: Vec<String> = deps.iter().map(|d| d.display_name()).collect();
        seen_clone.lock().push((signal.display_name(), deps));
    }));

    assert_eq!(
        *seen.lock(),
        vec![
            ("a".to_string(), Vec::<String>::new()),
            ("b".to_string(), vec!["a".to_string()]),
        ]
    );
}

/// A batch of writes settles every dependent before anyone is notified.
#[test]
fn batched_writes_notify_after_the_batch() {
    let first = Mutable::new(String::from("Ada"));
    let last = Mutable::new(String::from("Lovelace"));
    let full = Computed::new(Deps::new().with("first", &first).with("last", &last), |ctx| {
        Ok(format!("{} {}", ctx.get::<String>("first")?, ctx.get::<String>("last")?))
    });
    full.get().unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let _sub = full.on_value(move |name| seen_clone.lock().push(name));

    batch(|| {
        first.set("Grace".into()).unwrap();
        last.set("Hopper".into()).unwrap();
    });

    assert_eq!(full.get().unwrap(), "Grace Hopper");
    assert_eq!(seen.lock().last().map(String::as_str), Some("Grace Hopper"));
}

/// Disposing a group keeps going past failures.
#[test]
fn dispose_all_reports_every_failure() {
    let failing = Mutable::builder(0)
        .plugin(|_| {
            Ok(Some(
                Box::new(|| Err(SignalError::message("flush failed"))) as Cleanup
            ))
        })
        .build()
        .unwrap();
    let plain = Mutable::new(1);
    let action = Action::new(|ctx: &ActionContext<i32>| Ok(*ctx.payload()));

    let outcome = dispose_all(&[&failing, &plain, &action]);
    assert!(matches!(outcome, Err(SignalError::Disposal(ref failures)) if failures.len() == 1));
    assert!(failing.is_disposed() && plain.is_disposed() && action.is_disposed());
}

/// Forgotten signals are reported together.
#[test]
fn forget_groups_disposals() {
    let runtime = Runtime::new();
    let forgotten = Arc::new(Mutex::new(Vec::new()));
    let forgotten_clone = forgotten.clone();
    runtime.set_hooks(Hooks::new().on_forget_signals(move |signals| {
        forgotten_clone.lock().push(signals.len());
    }));

    let signals: Vec<Mutable<i32>> = (0..3)
        .map(|i| Mutable::builder(i).runtime(&runtime).build().unwrap())
        .collect();
    runtime.forget(|| {
        for signal in &signals {
            signal.dispose().unwrap();
        }
    });

    assert_eq!(*forgotten.lock(), vec![3]);
    assert_eq!(signals[0].signal_ref().display_name(), signals[0].display_name());
}
