//! Memoized derivations keyed on shallow dependency identity.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::constants::DEFAULT_MEMO_CAPACITY;
use crate::core::ids::{ChatId, MessageId, TabId, UserId};
use crate::core::snapshot::Snapshot;

/// Cheap equality used to decide whether a derivation must rerun: `Arc`s
/// compare by pointer, plain values by value.
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

impl ShallowEq for () {
    fn shallow_eq(&self, _other: &Self) -> bool {
        true
    }
}

impl<A: ShallowEq, B: ShallowEq> ShallowEq for (A, B) {
    fn shallow_eq(&self, other: &Self) -> bool {
        self.0.shallow_eq(&other.0) && self.1.shallow_eq(&other.1)
    }
}

impl<A: ShallowEq, B: ShallowEq, C: ShallowEq> ShallowEq for (A, B, C) {
    fn shallow_eq(&self, other: &Self) -> bool {
        self.0.shallow_eq(&other.0) && self.1.shallow_eq(&other.1) && self.2.shallow_eq(&other.2)
    }
}

macro_rules! shallow_by_value {
    ($($ty:ty),* $(,)?) => {
        $(impl ShallowEq for $ty {
            fn shallow_eq(&self, other: &Self) -> bool {
                self == other
            }
        })*
    };
}

shallow_by_value!(bool, u32, u64, usize, i64, String, ChatId, UserId, TabId, MessageId);

type DepsFn<A, D> = Box<dyn Fn(&Snapshot, &A) -> D + Send + Sync>;
type ComputeFn<A, D, R> = Box<dyn Fn(&D, &A) -> R + Send + Sync>;

struct Entry<A, D, R> {
    args: A,
    deps: D,
    result: Arc<R>,
}

/// A derivation `snapshot, args -> R` that reruns only when its
/// dependencies change.
///
/// `deps` extracts the inputs (usually `Arc`s out of the snapshot) and must
/// be cheap; `compute` sees only those inputs. For each distinct `args` the
/// last result is kept. When the inputs changed but the new result equals the
/// old one, the old `Arc` is returned again, so identity-based consumers do
/// not see a spurious change.
pub struct Memo<A, D, R> {
    name: &'static str,
    deps: DepsFn<A, D>,
    compute: ComputeFn<A, D, R>,
    capacity: usize,
    cache: Mutex<VecDeque<Entry<A, D, R>>>,
    computations: AtomicU64,
}

impl<A, D, R> Memo<A, D, R>
where
    A: PartialEq + Clone,
    D: ShallowEq,
    R: PartialEq,
{
    pub fn new(
        name: &'static str,
        deps: impl Fn(&Snapshot, &A) -> D + Send + Sync + 'static,
        compute: impl Fn(&D, &A) -> R + Send + Sync + 'static,
    ) -> Self {
        Self::with_capacity(name, DEFAULT_MEMO_CAPACITY, deps, compute)
    }

    pub fn with_capacity(
        name: &'static str,
        capacity: usize,
        deps: impl Fn(&Snapshot, &A) -> D + Send + Sync + 'static,
        compute: impl Fn(&D, &A) -> R + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            deps: Box::new(deps),
            compute: Box::new(compute),
            capacity: capacity.max(1),
            cache: Mutex::new(VecDeque::new()),
            computations: AtomicU64::new(0),
        }
    }

    pub fn select(&self, snapshot: &Snapshot, args: &A) -> Arc<R> {
        let deps = (self.deps)(snapshot, args);
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(entry) = cache.iter_mut().find(|entry| &entry.args == args) {
            if entry.deps.shallow_eq(&deps) {
                return Arc::clone(&entry.result);
            }
            let result = self.run(&deps, args);
            entry.deps = deps;
            if *entry.result != result {
                entry.result = Arc::new(result);
            }
            return Arc::clone(&entry.result);
        }

        let result = Arc::new(self.run(&deps, args));
        cache.push_back(Entry {
            args: args.clone(),
            deps,
            result: Arc::clone(&result),
        });
        while cache.len() > self.capacity {
            cache.pop_front();
        }
        result
    }

    /// Runs the derivation without touching the cache.
    pub fn compute_uncached(&self, snapshot: &Snapshot, args: &A) -> R {
        let deps = (self.deps)(snapshot, args);
        (self.compute)(&deps, args)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// How many times the derivation actually ran through [`select`](Self::select).
    pub fn computations(&self) -> u64 {
        self.computations.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    fn run(&self, deps: &D, args: &A) -> R {
        self.computations.fetch_add(1, Ordering::Relaxed);
        (self.compute)(deps, args)
    }
}

impl<A, D, R> fmt::Debug for Memo<A, D, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memo")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("computations", &self.computations.load(Ordering::Relaxed))
            .finish()
    }
}
