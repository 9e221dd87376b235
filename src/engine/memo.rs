use std::collections::HashMap;
use std::sync::{Condvar, Mutex, RwLock};
use std::thread::{self, ThreadId};

use crate::value::ValueRequirement;

#[derive(Default)]
struct Registry {
    /// Keys being computed, and by whom.
    owners: HashMap<ValueRequirement, ThreadId>,
    /// Threads blocked on a key owned by another thread.
    waiting: HashMap<ThreadId, ValueRequirement>,
}

impl Registry {
    /// Whether `owner` is blocked, directly or through a chain of other
    /// owners, on a key held by `me`.
    fn waits_on(&self, mut owner: ThreadId, me: ThreadId) -> bool {
        for _ in 0..=self.waiting.len() {
            let Some(key) = self.waiting.get(&owner) else {
                return false;
            };
            match self.owners.get(key) {
                Some(&next) if next == me => return true,
                Some(&next) => owner = next,
                None => return false,
            }
        }
        false
    }
}

/// Outcome of asking the cache for a key.
pub(crate) enum Claim<'a, V> {
    /// Already published.
    Hit(V),
    /// The caller computes the value and may publish it through the guard.
    Owner(ClaimGuard<'a, V>),
    /// Waiting would deadlock, or the caller already owns the key further up
    /// its own stack. Compute without publishing.
    Local,
}

/// Shared memo of resolutions, keyed by exact requirement.
///
/// Compute-if-absent with at most one computation in flight per key: a
/// thread asking for a key someone else is computing waits for it. A value
/// is published at most once and never changes afterwards. If the owner
/// finishes without publishing, a waiter takes the claim over.
pub(crate) struct ResolutionCache<V> {
    published: RwLock<HashMap<ValueRequirement, V>>,
    registry: Mutex<Registry>,
    changed: Condvar,
}

impl<V: Clone> ResolutionCache<V> {
    pub fn new() -> Self {
        Self {
            published: RwLock::new(HashMap::new()),
            registry: Mutex::new(Registry::default()),
            changed: Condvar::new(),
        }
    }

    pub fn get(&self, key: &ValueRequirement) -> Option<V> {
        self.published.read().unwrap().get(key).cloned()
    }

    pub fn claim(&self, key: &ValueRequirement) -> Claim<'_, V> {
        if let Some(value) = self.get(key) {
            return Claim::Hit(value);
        }

        let me = thread::current().id();
        let mut registry = self.registry.lock().unwrap();

        loop {
            if let Some(value) = self.get(key) {
                return Claim::Hit(value);
            }

            match registry.owners.get(key).copied() {
                None => {
                    registry.owners.insert(key.clone(), me);
                    return Claim::Owner(ClaimGuard {
                        cache: self,
                        key: key.clone(),
                    });
                }
                Some(owner) if owner == me => return Claim::Local,
                Some(owner) => {
                    if registry.waits_on(owner, me) {
                        tracing::debug!("Computing {key} locally to avoid waiting on myself");
                        return Claim::Local;
                    }

                    registry.waiting.insert(me, key.clone());
                    registry = self.changed.wait(registry).unwrap();
                    registry.waiting.remove(&me);
                }
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.published.read().unwrap().len()
    }
}

pub(crate) struct ClaimGuard<'a, V> {
    cache: &'a ResolutionCache<V>,
    key: ValueRequirement,
}

impl<V> ClaimGuard<'_, V> {
    pub fn publish(&self, value: V) {
        self.cache
            .published
            .write()
            .unwrap()
            .entry(self.key.clone())
            .or_insert(value);
    }
}

impl<V> Drop for ClaimGuard<'_, V> {
    fn drop(&mut self) {
        let mut registry = self.cache.registry.lock().unwrap();
        registry.owners.remove(&self.key);
        self.cache.changed.notify_all();
    }
}
