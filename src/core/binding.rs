//! Subscriptions that fire when a derived value changes.
//!
//! A binding remembers the last value it delivered. On each notification
//! pass it re-derives against the new snapshot and calls back only if the
//! value changed: by identity and then `PartialEq` for [`Memo`] selectors,
//! by `PartialEq` alone for ad hoc derivations. The store runs one pass per
//! flushed batch, so a subscriber sees at most one call per batch whatever
//! the number of dispatches in it.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error};

use crate::core::selectors::{Memo, ShallowEq};
use crate::core::snapshot::Snapshot;

type Poll = Box<dyn FnMut(&Snapshot) -> bool + Send>;

struct Slot {
    owner: String,
    /// Taken out while the callback runs so the registry lock is not held.
    poll: Option<Poll>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    slots: BTreeMap<u64, Slot>,
}

#[derive(Clone, Default)]
pub struct Bindings {
    registry: Arc<Mutex<Registry>>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls `callback` whenever `memo` yields a different value for `args`.
    /// `snapshot` provides the baseline; no call is made for it.
    ///
    /// Identity is checked first. A fresh `Arc` holding an equal value, as
    /// happens once the memo has evicted these args, does not notify.
    pub fn bind<A, D, R, F>(
        &self,
        owner: impl Into<String>,
        snapshot: &Snapshot,
        memo: Arc<Memo<A, D, R>>,
        args: A,
        mut callback: F,
    ) -> Subscription
    where
        A: PartialEq + Clone + Send + Sync + 'static,
        D: ShallowEq + Send + 'static,
        R: PartialEq + Send + Sync + 'static,
        F: FnMut(Arc<R>) + Send + 'static,
    {
        let mut last = memo.select(snapshot, &args);
        let poll = move |snapshot: &Snapshot| {
            let next = memo.select(snapshot, &args);
            if Arc::ptr_eq(&next, &last) {
                return false;
            }
            if *next == *last {
                last = next;
                return false;
            }
            last = Arc::clone(&next);
            callback(next);
            true
        };
        self.insert(owner.into(), Box::new(poll))
    }

    /// Calls `callback` whenever `derive` returns a value unequal to the
    /// previous one.
    pub fn bind_with<T, G, F>(
        &self,
        owner: impl Into<String>,
        snapshot: &Snapshot,
        derive: G,
        mut callback: F,
    ) -> Subscription
    where
        T: PartialEq + Send + 'static,
        G: Fn(&Snapshot) -> T + Send + 'static,
        F: FnMut(&T) + Send + 'static,
    {
        let mut last = derive(snapshot);
        let poll = move |snapshot: &Snapshot| {
            let next = derive(snapshot);
            if next == last {
                return false;
            }
            callback(&next);
            last = next;
            true
        };
        self.insert(owner.into(), Box::new(poll))
    }

    /// Runs one notification pass and returns how many callbacks fired.
    ///
    /// Callbacks may unsubscribe themselves or others; a subscription removed
    /// during the pass is not called afterwards. Bindings added during the
    /// pass wait for the next one. A panicking callback is logged and its
    /// binding dropped.
    pub fn notify(&self, snapshot: &Snapshot) -> usize {
        let ids: Vec<u64> = self.lock().slots.keys().copied().collect();
        let mut fired = 0;

        for id in ids {
            let taken = self
                .lock()
                .slots
                .get_mut(&id)
                .and_then(|slot| slot.poll.take().map(|poll| (slot.owner.clone(), poll)));
            let Some((owner, mut poll)) = taken else {
                continue;
            };

            match panic::catch_unwind(AssertUnwindSafe(|| poll(snapshot))) {
                Ok(changed) => {
                    if changed {
                        fired += 1;
                    }
                    if let Some(slot) = self.lock().slots.get_mut(&id) {
                        slot.poll = Some(poll);
                    }
                }
                Err(_) => {
                    error!(owner = %owner, "binding callback panicked; dropping binding");
                    self.lock().slots.remove(&id);
                }
            }
        }

        if fired > 0 {
            debug!(fired, "bindings notified");
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owners of live bindings, in registration order.
    pub fn owners(&self) -> Vec<String> {
        self.lock()
            .slots
            .values()
            .map(|slot| slot.owner.clone())
            .collect()
    }

    fn insert(&self, owner: String, poll: Poll) -> Subscription {
        let mut registry = self.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.slots.insert(
            id,
            Slot {
                owner,
                poll: Some(poll),
            },
        );
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle to one binding. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Removes the binding. Calling it again, or after the [`Bindings`] is
    /// gone, does nothing.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .slots
                .remove(&self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.registry.upgrade().is_some_and(|registry| {
            registry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .slots
                .contains_key(&self.id)
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::ChatId;
    use crate::core::patch::{EntityPatch, TablePatch};
    use crate::core::selectors::SelectorSet;
    use crate::utils::test_utils::{sample_chat, sample_message, seeded_snapshot};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> usize) {
        let count = Arc::new(AtomicUsize::new(0));
        let read = {
            let count = Arc::clone(&count);
            move || count.load(Ordering::SeqCst)
        };
        (count, read)
    }

    #[test]
    fn memo_binding_fires_only_on_identity_change() {
        let bindings = Bindings::new();
        let selectors = SelectorSet::new();
        let snapshot = seeded_snapshot();
        let (count, calls) = counter();
        let _sub = bindings.bind(
            "chat-list",
            &snapshot,
            Arc::clone(&selectors.sorted_chat_ids),
            (),
            move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            },
        );

        assert_eq!(bindings.notify(&snapshot), 0);
        let mut next = snapshot.clone();
        EntityPatch::Chats(TablePatch::merge(vec![sample_chat("c2", "Two")]))
            .apply(&mut next.entities);
        assert_eq!(bindings.notify(&next), 1);
        assert_eq!(bindings.notify(&next), 0);
        assert_eq!(calls(), 1);
    }

    #[test]
    fn evicted_memo_entries_do_not_fire_unchanged_bindings() {
        let bindings = Bindings::new();
        let selectors = SelectorSet::new();
        let snapshot = seeded_snapshot();
        let (count, calls) = counter();

        let subs: Vec<Subscription> = (0..40)
            .map(|n| {
                let count = Arc::clone(&count);
                bindings.bind(
                    format!("thread-{n}"),
                    &snapshot,
                    Arc::clone(&selectors.chat_message_ids),
                    ChatId::from(format!("x{n}")),
                    move |_| {
                        count.fetch_add(1, Ordering::SeqCst);
                    },
                )
            })
            .collect();
        assert_eq!(subs.len(), 40);

        let mut next = snapshot.clone();
        next.version += 1;
        assert_eq!(bindings.notify(&next), 0);
        assert_eq!(bindings.notify(&next), 0);
        assert_eq!(calls(), 0);

        let mut grown = next.clone();
        EntityPatch::Messages {
            chat_id: ChatId::from("x3"),
            patch: TablePatch::merge(vec![sample_message("x3", 1, "hi")]),
        }
        .apply(&mut grown.entities);
        assert_eq!(bindings.notify(&grown), 1);
        assert_eq!(calls(), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent_and_drop_unsubscribes() {
        let bindings = Bindings::new();
        let snapshot = seeded_snapshot();
        let sub = bindings.bind_with("v", &snapshot, |s: &Snapshot| s.version, |_| {});
        let dropped = bindings.bind_with("w", &snapshot, |s: &Snapshot| s.version, |_| {});
        assert_eq!(bindings.len(), 2);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        drop(dropped);
        assert!(bindings.is_empty());
    }

    #[test]
    fn callbacks_can_unsubscribe_during_a_pass() {
        let bindings = Bindings::new();
        let snapshot = seeded_snapshot();
        let (count, calls) = counter();

        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&victim);
        let _killer = bindings.bind_with(
            "killer",
            &snapshot,
            |s: &Snapshot| s.version,
            move |_| {
                if let Some(sub) = slot.lock().unwrap().take() {
                    sub.unsubscribe();
                }
            },
        );
        let target = bindings.bind_with(
            "target",
            &snapshot,
            |s: &Snapshot| s.version,
            move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            },
        );
        *victim.lock().unwrap() = Some(target);

        let mut next = snapshot.clone();
        next.version += 1;
        assert_eq!(bindings.notify(&next), 1);
        assert_eq!(calls(), 0);
        assert_eq!(bindings.owners(), vec!["killer".to_string()]);
    }

    #[test]
    fn panicking_callback_does_not_stop_the_pass() {
        let bindings = Bindings::new();
        let snapshot = seeded_snapshot();
        let (count, calls) = counter();
        let _bad = bindings.bind_with(
            "bad",
            &snapshot,
            |s: &Snapshot| s.version,
            |_| panic!("subscriber bug"),
        );
        let _good = bindings.bind_with(
            "good",
            &snapshot,
            |s: &Snapshot| s.entities.chats.contains(&ChatId::from("c9")),
            move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            },
        );

        let mut next = snapshot.clone();
        next.version += 1;
        EntityPatch::Chats(TablePatch::merge(vec![sample_chat("c9", "Nine")]))
            .apply(&mut next.entities);
        assert_eq!(bindings.notify(&next), 1);
        assert_eq!(calls(), 1);
        assert_eq!(bindings.owners(), vec!["good".to_string()]);
    }
}
