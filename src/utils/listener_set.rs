// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;

/// Copy-on-write set of listeners.
///
/// Every add/remove swaps in a new immutable vector, a broadcast iterates over the
/// snapshot it loaded, so no lock is held while listener code runs and listeners may
/// add or remove listeners (themselves included) from inside a callback. Identity is
/// the `Arc` allocation: adding the same `Arc` twice is a no-op.
pub struct ListenerSet<L: ?Sized> {
    listeners: ArcSwap<Vec<Arc<L>>>,
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn new() -> Self {
        Self {
            listeners: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Returns `false` if the listener was already registered.
    pub fn add(&self, listener: Arc<L>) -> bool {
        let mut added = false;
        self.listeners.rcu(|current| {
            if current.iter().any(|l| Arc::ptr_eq(l, &listener)) {
                added = false;
                Arc::clone(current)
            } else {
                added = true;
                let mut next = Vec::with_capacity(current.len() + 1);
                next.extend(current.iter().cloned());
                next.push(Arc::clone(&listener));
                Arc::new(next)
            }
        });
        added
    }

    /// Returns `false` if the listener was not registered.
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut removed = false;
        self.listeners.rcu(|current| {
            removed = current.iter().any(|l| Arc::ptr_eq(l, listener));
            if removed {
                Arc::new(
                    current
                        .iter()
                        .filter(|l| !Arc::ptr_eq(l, listener))
                        .cloned()
                        .collect(),
                )
            } else {
                Arc::clone(current)
            }
        });
        removed
    }

    pub fn contains(&self, listener: &Arc<L>) -> bool {
        self.listeners
            .load()
            .iter()
            .any(|l| Arc::ptr_eq(l, listener))
    }

    pub fn len(&self) -> usize {
        self.listeners.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.load().is_empty()
    }

    pub fn clear(&self) {
        self.listeners.store(Arc::new(Vec::new()));
    }

    /// Calls `f` for every listener of the current snapshot. A listener removed while
    /// the broadcast is running is skipped if the broadcast has not reached it yet.
    pub fn for_each<F: FnMut(&L)>(&self, mut f: F) {
        let snapshot = self.listeners.load_full();
        for listener in snapshot.iter() {
            if !self.contains(listener) {
                continue;
            }
            f(listener);
        }
    }
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> fmt::Debug for ListenerSet<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    trait Listener: Send + Sync {
        fn notify(&self);
    }

    #[derive(Default)]
    struct Counter {
        calls: AtomicUsize,
    }

    impl Listener for Counter {
        fn notify(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Removes `victim` from `set` when notified.
    struct Remover {
        set: Arc<ListenerSet<dyn Listener>>,
        victim: Mutex<Option<Arc<dyn Listener>>>,
    }

    impl Listener for Remover {
        fn notify(&self) {
            if let Some(victim) = self.victim.lock().unwrap().take() {
                assert!(self.set.remove(&victim));
            }
        }
    }

    #[test]
    fn test_add_is_idempotent() {
        let set: ListenerSet<dyn Listener> = ListenerSet::new();
        let counter = Arc::new(Counter::default());
        let listener: Arc<dyn Listener> = counter.clone();
        assert!(set.add(Arc::clone(&listener)));
        assert!(!set.add(Arc::clone(&listener)));
        assert_eq!(set.len(), 1);

        set.for_each(|l| l.notify());
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);

        assert!(set.remove(&listener));
        assert!(!set.remove(&listener));
        assert!(set.is_empty());
    }

    #[test]
    fn test_remove_during_broadcast_skips_removed() {
        let set: Arc<ListenerSet<dyn Listener>> = Arc::new(ListenerSet::new());
        let counter = Arc::new(Counter::default());
        let victim: Arc<dyn Listener> = counter.clone();
        let remover: Arc<dyn Listener> = Arc::new(Remover {
            set: Arc::clone(&set),
            victim: Mutex::new(Some(Arc::clone(&victim))),
        });
        set.add(remover);
        set.add(victim);

        set.for_each(|l| l.notify());
        assert_eq!(counter.calls.load(Ordering::SeqCst), 0);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_add_during_broadcast_takes_effect_next_time() {
        struct Adder {
            set: Arc<ListenerSet<dyn Listener>>,
            new: Mutex<Option<Arc<dyn Listener>>>,
        }
        impl Listener for Adder {
            fn notify(&self) {
                if let Some(new) = self.new.lock().unwrap().take() {
                    self.set.add(new);
                }
            }
        }

        let set: Arc<ListenerSet<dyn Listener>> = Arc::new(ListenerSet::new());
        let counter = Arc::new(Counter::default());
        set.add(Arc::new(Adder {
            set: Arc::clone(&set),
            new: Mutex::new(Some(counter.clone() as Arc<dyn Listener>)),
        }));

        set.for_each(|l| l.notify());
        assert_eq!(counter.calls.load(Ordering::SeqCst), 0);
        set.for_each(|l| l.notify());
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_add_remove_while_broadcasting() {
        let set: Arc<ListenerSet<dyn Listener>> = Arc::new(ListenerSet::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let set = Arc::clone(&set);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let listener: Arc<dyn Listener> = Arc::new(Counter::default());
                        set.add(Arc::clone(&listener));
                        set.for_each(|l| l.notify());
                        set.remove(&listener);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(set.is_empty());
    }
}
