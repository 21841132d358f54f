//! Equality Resolver
//!
//! Maps an equality specification to a concrete comparison function. The
//! result decides whether a new value counts as a change, and therefore
//! whether listeners are notified.
//!
//! | Spec      | Meaning                                                      |
//! |-----------|--------------------------------------------------------------|
//! | `Strict`  | `PartialEq` (the default)                                    |
//! | `Shallow` | one level of elements/entries, shared pointers by identity   |
//! | `Deep`    | full structural comparison of the serialized form            |
//! | `Never`   | always "changed", for notifier signals                       |
//! | `Custom`  | caller-supplied function                                     |

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;

/// Resolved comparison function. Returns `true` when the values are equal.
pub type EqualsFn<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// An equality specification.
pub enum Equality<T> {
    /// Compare with `PartialEq`. The default.
    ///
    /// For `Vec`, `String` and maps this walks the whole value on every
    /// write. Values that share data through `Arc` can use [`Equality::Shallow`]
    /// to compare by pointer instead, or [`Equality::Never`] to skip the
    /// comparison entirely.
    Strict,
    /// Compare one level deep; see [`ShallowEq`].
    Shallow(EqualsFn<T>),
    /// Compare the full serialized structure.
    Deep(EqualsFn<T>),
    /// Every value is a change.
    Never,
    /// Compare with a caller-supplied function.
    Custom(EqualsFn<T>),
}

impl<T: 'static> Equality<T> {
    /// Equality from a caller-supplied function.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Short label for logs and debugging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Shallow(_) => "shallow",
            Self::Deep(_) => "deep",
            Self::Never => "never",
            Self::Custom(_) => "custom",
        }
    }
}

impl<T: PartialEq + 'static> Equality<T> {
    /// Produce the comparison function for this specification.
    pub fn resolve(&self) -> EqualsFn<T> {
        match self {
            Self::Strict => Arc::new(|a: &T, b: &T| a == b),
            Self::Never => Arc::new(|_: &T, _: &T| false),
            Self::Shallow(f) | Self::Deep(f) | Self::Custom(f) => Arc::clone(f),
        }
    }
}

impl<T: ShallowEq + 'static> Equality<T> {
    /// One-level comparison.
    pub fn shallow() -> Self {
        Self::Shallow(Arc::new(|a: &T, b: &T| a.shallow_eq(b)))
    }
}

impl<T: Serialize + 'static> Equality<T> {
    /// Structural comparison through `serde_json`. Values that fail to
    /// serialize always compare unequal.
    pub fn deep() -> Self {
        Self::Deep(Arc::new(|a: &T, b: &T| {
            match (serde_json::to_value(a), serde_json::to_value(b)) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            }
        }))
    }
}

/// Resolve an optional equality; unset means `Strict`.
pub fn resolve<T: PartialEq + 'static>(equality: Option<&Equality<T>>) -> EqualsFn<T> {
    equality
        .map(Equality::resolve)
        .unwrap_or_else(|| Equality::Strict.resolve())
}

impl<T> Default for Equality<T> {
    fn default() -> Self {
        Self::Strict
    }
}

impl<T> Clone for Equality<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Strict => Self::Strict,
            Self::Shallow(f) => Self::Shallow(Arc::clone(f)),
            Self::Deep(f) => Self::Deep(Arc::clone(f)),
            Self::Never => Self::Never,
            Self::Custom(f) => Self::Custom(Arc::clone(f)),
        }
    }
}

impl<T: 'static> fmt::Debug for Equality<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Equality::{}", self.label())
    }
}

/// One-level comparison.
///
/// Containers compare their length/keys and then each element by pointer
/// identity, which is what "shallow" means for values shared through `Arc`.
pub trait ShallowEq {
    fn shallow_eq(&self, other: &Self) -> bool;
}

impl<T: ?Sized> ShallowEq for Arc<T> {
    fn shallow_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other)
    }
}

impl<T: ShallowEq> ShallowEq for Option<T> {
    fn shallow_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Some(a), Some(b)) => a.shallow_eq(b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<T: ?Sized> ShallowEq for [Arc<T>] {
    fn shallow_eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other).all(|(a, b)| Arc::ptr_eq(a, b))
    }
}

impl<T: ?Sized> ShallowEq for Vec<Arc<T>> {
    fn shallow_eq(&self, other: &Self) -> bool {
        self.as_slice().shallow_eq(other.as_slice())
    }
}

impl<K: Eq + Hash, V: ?Sized> ShallowEq for HashMap<K, Arc<V>> {
    fn shallow_eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(k, v)| other.get(k).is_some_and(|o| Arc::ptr_eq(v, o)))
    }
}

impl<K: Ord, V: ?Sized> ShallowEq for BTreeMap<K, Arc<V>> {
    fn shallow_eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .zip(other)
                .all(|((ka, va), (kb, vb))| ka == kb && Arc::ptr_eq(va, vb))
    }
}

impl<K: Eq + Hash, V: ?Sized> ShallowEq for IndexMap<K, Arc<V>> {
    fn shallow_eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(k, v)| other.get(k).is_some_and(|o| Arc::ptr_eq(v, o)))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Item {
        price: u32,
        tags: Vec<String>,
    }

    #[test]
    fn unset_resolves_to_strict() {
        let equals = resolve::<i32>(None);
        assert!(equals(&1, &1));
        assert!(!equals(&1, &2));
    }

    #[test]
    fn never_always_reports_change() {
        let equals = Equality::<i32>::Never.resolve();
        assert!(!equals(&1, &1));
    }

    #[test]
    fn shallow_compares_elements_by_identity() {
        let shared = Arc::new(Item { price: 1, tags: vec![] });
        let a = vec![shared.clone()];
        let b = vec![shared.clone()];
        let c = vec![Arc::new(Item { price: 1, tags: vec![] })];

        let equals = Equality::<Vec<Arc<Item>>>::shallow().resolve();
        assert!(equals(&a, &b));
        assert!(!equals(&a, &c));
    }

    #[test]
    fn shallow_maps_compare_entries() {
        let value = Arc::new(5);
        let mut a = HashMap::new();
        a.insert("k", value.clone());
        let mut b = HashMap::new();
        b.insert("k", value);

        assert!(a.shallow_eq(&b));
        b.insert("other", Arc::new(6));
        assert!(!a.shallow_eq(&b));
    }

    #[test]
    fn deep_sees_through_fresh_allocations() {
        let a = vec![Arc::new(Item { price: 1, tags: vec!["x".into()] })];
        let b = vec![Arc::new(Item { price: 1, tags: vec!["x".into()] })];
        let c = vec![Arc::new(Item { price: 2, tags: vec!["x".into()] })];

        let equals = Equality::<Vec<Arc<Item>>>::deep().resolve();
        assert!(equals(&a, &b));
        assert!(!equals(&a, &c));
    }

    #[test]
    fn custom_function_is_used_verbatim() {
        let equals = Equality::<i32>::custom(|a, b| a % 10 == b % 10).resolve();
        assert!(equals(&3, &13));
        assert!(!equals(&3, &4));
        assert_eq!(Equality::<i32>::custom(|_, _| true).label(), "custom");
    }
}
