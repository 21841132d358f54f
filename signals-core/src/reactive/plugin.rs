//! Extension Attachment
//!
//! A signal can be built with an ordered list of [`Use`] entries. Each entry
//! is either a plugin (a function that receives the freshly created signal
//! and may hand back a cleanup) or a [`Tag`] (a named group carrying its own
//! list of uses).
//!
//! Attachment walks the list left to right. A tag records the signal as a
//! member and then expands its own uses in place, so nested tags are
//! expanded depth-first without disturbing the overall order. Cleanups run
//! once each, in registration order, when the signal is disposed.
//!
//! A failing plugin stops the walk. The caller disposes the partially built
//! signal, which also releases the cleanups and tag memberships collected so
//! far.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::error::SignalResult;

use super::runtime::Runtime;
use super::signal::{AnySignal, AsSignalRef, Cleanup, SignalCore, SignalRef};
use super::subscriber::SignalId;

/// A plugin: runs once when a signal is built.
pub type Plugin<S> = Arc<dyn Fn(&S) -> SignalResult<Option<Cleanup>> + Send + Sync>;

/// Identity of a tag as reported to hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagInfo {
    pub id: u64,
    pub name: String,
}

/// One entry of a signal's use list.
pub enum Use<S> {
    Plugin(Plugin<S>),
    Tag(Tag<S>),
}

impl<S> Use<S> {
    pub fn plugin<F>(f: F) -> Self
    where
        F: Fn(&S) -> SignalResult<Option<Cleanup>> + Send + Sync + 'static,
    {
        Self::Plugin(Arc::new(f))
    }

    pub fn tag(tag: &Tag<S>) -> Self {
        Self::Tag(tag.clone())
    }
}

impl<S> Clone for Use<S> {
    fn clone(&self) -> Self {
        match self {
            Self::Plugin(plugin) => Self::Plugin(Arc::clone(plugin)),
            Self::Tag(tag) => Self::Tag(tag.clone()),
        }
    }
}

impl<S> fmt::Debug for Use<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plugin(_) => f.write_str("Use::Plugin"),
            Self::Tag(tag) => write!(f, "Use::Tag({})", tag.name()),
        }
    }
}

struct TagInner<S> {
    info: TagInfo,
    uses: Vec<Use<S>>,
    members: DashMap<SignalId, Weak<dyn AnySignal>>,
}

/// A named, composable group of uses.
///
/// Tags remember which live signals they were attached to.
pub struct Tag<S> {
    inner: Arc<TagInner<S>>,
}

impl<S> Tag<S> {
    /// Create a tag, reporting it to the global runtime.
    pub fn new(name: impl Into<String>, uses: Vec<Use<S>>) -> Self {
        Self::new_in(Runtime::global(), name, uses)
    }

    /// Create a tag, reporting it to `runtime`.
    pub fn new_in(runtime: &Runtime, name: impl Into<String>, uses: Vec<Use<S>>) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let tag = Self {
            inner: Arc::new(TagInner {
                info: TagInfo {
                    id: COUNTER.fetch_add(1, Ordering::Relaxed),
                    name: name.into(),
                },
                uses,
                members: DashMap::new(),
            }),
        };
        runtime.tag_created(&tag.inner.info);
        tag
    }

    pub fn name(&self) -> &str {
        &self.inner.info.name
    }

    pub fn info(&self) -> &TagInfo {
        &self.inner.info
    }

    /// Number of live member signals.
    pub fn len(&self) -> usize {
        self.prune();
        self.inner.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: SignalId) -> bool {
        self.inner
            .members
            .get(&id)
            .is_some_and(|member| member.strong_count() > 0)
    }

    /// Forget members dropped without being disposed.
    fn prune(&self) {
        self.inner.members.retain(|_, member| member.strong_count() > 0);
    }

    /// Live member signals, ordered by id.
    pub fn signals(&self) -> Vec<SignalRef> {
        let mut members: Vec<SignalRef> = self
            .inner
            .members
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        members.sort_by_key(|signal| signal.id());
        members
    }
}

impl<S> Clone for Tag<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> fmt::Debug for Tag<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tag")
            .field("id", &self.inner.info.id)
            .field("name", &self.inner.info.name)
            .field("members", &self.inner.members.len())
            .finish()
    }
}

impl<S: 'static> Tag<S> {
    /// Record `signal` as a member and arrange for removal at disposal.
    fn admit(&self, core: &SignalCore, signal: SignalRef) {
        let id = signal.id();
        self.prune();
        self.inner.members.insert(id, Arc::downgrade(&signal));
        core.runtime().tag_added(&self.inner.info, &*signal);

        let tag = Arc::downgrade(&self.inner);
        let member = Arc::downgrade(&signal);
        let runtime = core.runtime().clone();
        core.push_detacher(Box::new(move || {
            let Some(tag) = tag.upgrade() else {
                return;
            };
            tag.members.remove(&id);
            if let Some(member) = member.upgrade() {
                runtime.tag_removed(&tag.info, &*member);
            }
        }));
    }
}

/// Signal handles that plugins can be attached to.
pub(crate) trait Attachable: AsSignalRef + Sized + 'static {
    fn core(&self) -> &SignalCore;
}

/// Apply `uses` to `signal` in order, expanding tags depth-first.
pub(crate) fn attach<S: Attachable>(signal: &S, uses: &[Use<S>]) -> SignalResult<()> {
    for entry in uses {
        match entry {
            Use::Plugin(plugin) => {
                if let Some(cleanup) = plugin(signal)? {
                    signal.core().push_cleanup(cleanup);
                }
            }
            Use::Tag(tag) => {
                tag.admit(signal.core(), signal.signal_ref());
                attach(signal, &tag.inner.uses)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    use crate::error::SignalError;
    use crate::reactive::{Hooks, Mutable};

    fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &'static str) -> Use<Mutable<i32>> {
        let log = log.clone();
        Use::plugin(move |_: &Mutable<i32>| {
            log.lock().push(label.to_string());
            let log = log.clone();
            Ok(Some(Box::new(move || {
                log.lock().push(format!("cleanup {label}"));
                Ok(())
            }) as Cleanup))
        })
    }

    #[test]
    fn nested_tags_expand_depth_first_in_order() {
        let runtime = Runtime::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let inner = Tag::new_in(&runtime, "inner", vec![recorder(&log, "b")]);
        let outer = Tag::new_in(
            &runtime,
            "outer",
            vec![recorder(&log, "a"), Use::tag(&inner), recorder(&log, "c")],
        );

        let signal = Mutable::builder(0)
            .runtime(&runtime)
            .tag(&outer)
            .attach(recorder(&log, "d"))
            .build()
            .unwrap();

        assert_eq!(*log.lock(), vec!["a", "b", "c", "d"]);

        signal.dispose().unwrap();
        signal.dispose().unwrap();
        assert_eq!(
            log.lock()[4..],
            ["cleanup a", "cleanup b", "cleanup c", "cleanup d"]
        );
    }

    #[test]
    fn tags_track_and_release_members() {
        let runtime = Runtime::new();
        let added = Arc::new(Mutex::new(Vec::new()));
        let removed = Arc::new(Mutex::new(Vec::new()));

        let added_clone = added.clone();
        let removed_clone = removed.clone();
        runtime.set_hooks(
            Hooks::new()
                .on_tag_add(move |tag, signal| {
                    added_clone.lock().push((tag.name.clone(), signal.display_name()));
                })
                .on_tag_remove(move |tag, signal| {
                    removed_clone.lock().push((tag.name.clone(), signal.display_name()));
                }),
        );

        let tag: Tag<Mutable<i32>> = Tag::new_in(&runtime, "persisted", Vec::new());
        let a = Mutable::builder(1).runtime(&runtime).name("a").tag(&tag).build().unwrap();
        let b = Mutable::builder(2).runtime(&runtime).name("b").tag(&tag).build().unwrap();

        assert_eq!(tag.len(), 2);
        assert!(tag.contains(a.id()));
        let names: Vec<String> = tag.signals().iter().map(|s| s.display_name()).collect();
        assert_eq!(names, vec!["a", "b"]);

        a.dispose().unwrap();
        assert_eq!(tag.len(), 1);
        assert!(!tag.contains(a.id()));
        assert!(tag.contains(b.id()));
        assert_eq!(added.lock().len(), 2);
        assert_eq!(*removed.lock(), vec![("persisted".to_string(), "a".to_string())]);
    }

    #[test]
    fn failing_plugin_aborts_the_rest_and_disposes() {
        let runtime = Runtime::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let result = Mutable::builder(0)
            .runtime(&runtime)
            .attach(recorder(&log, "first"))
            .plugin(|_: &Mutable<i32>| Err(SignalError::message("no storage")))
            .attach(recorder(&log, "never"))
            .build();

        assert!(matches!(result, Err(SignalError::Message(m)) if m == "no storage"));
        assert_eq!(*log.lock(), vec!["first", "cleanup first"]);
    }

    #[test]
    fn tag_creation_is_reported() {
        let runtime = Runtime::new();
        let created = Arc::new(Mutex::new(Vec::new()));
        let created_clone = created.clone();
        runtime.set_hooks(Hooks::new().on_tag_create(move |tag| {
            created_clone.lock().push(tag.name.clone());
        }));

        let _tag: Tag<Mutable<String>> = Tag::new_in(&runtime, "session", Vec::new());
        assert_eq!(*created.lock(), vec!["session"]);
    }

    #[test]
    fn dropped_members_do_not_accumulate() {
        let runtime = Runtime::new();
        runtime.set_hooks(Hooks::new().on_signal_create(|_, _, _| {}));
        let tag: Tag<Mutable<i32>> = Tag::new_in(&runtime, "scratch", Vec::new());

        for i in 0..3 {
            let signal = Mutable::builder(i).runtime(&runtime).tag(&tag).build().unwrap();
            assert!(tag.contains(signal.id()));
        }
        assert_eq!(tag.len(), 0);

        let kept = Mutable::builder(9).runtime(&runtime).tag(&tag).build().unwrap();
        assert_eq!(tag.inner.members.len(), 1);
        assert!(tag.contains(kept.id()));
    }
}
