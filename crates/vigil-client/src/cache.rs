//! The session-scoped decision cache.
//!
//! Keys are `(session, policy key)`; entries remember the interpreter
//! generation current when they were stored, so bumping a generation stales
//! every decision derived from that type without touching the rest. When
//! the capacity is reached the least recently used entry is evicted.

use std::collections::{BTreeMap, HashMap};

use tracing::trace;

use vigil_core::types::{PolicyKey, PolicyResult};

use crate::interpreter::InterpreterRegistry;

/// Default capacity, matching the daemon's expectations for a busy checker.
pub const DEFAULT_CAPACITY: usize = 10_000;

type CacheKey = (String, PolicyKey);

#[derive(Debug, Clone)]
struct CacheEntry {
    result: PolicyResult,
    generation: u64,
    stamp: u64,
}

/// Capacity-bounded LRU of cached decisions.
#[derive(Debug)]
pub struct SessionCache {
    capacity: usize,
    entries: HashMap<CacheKey, CacheEntry>,
    /// LRU order: usage stamp → key. Stamps are unique.
    usage: BTreeMap<u64, CacheKey>,
    clock: u64,
}

impl SessionCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            usage: BTreeMap::new(),
            clock: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a cached result. A hit refreshes recency; an entry whose
    /// generation no longer matches the registry is removed and reported as
    /// a miss.
    pub fn get(
        &mut self,
        session: &str,
        key: &PolicyKey,
        registry: &InterpreterRegistry,
    ) -> Option<PolicyResult> {
        let cache_key = (session.to_owned(), key.clone());
        let entry = self.entries.get(&cache_key)?;

        if entry.generation != registry.generation(entry.result.policy_type()) {
            trace!(session, key = %key, "cached decision stale, evicting");
            let stamp = entry.stamp;
            self.entries.remove(&cache_key);
            self.usage.remove(&stamp);
            return None;
        }

        let old_stamp = entry.stamp;
        self.clock += 1;
        let new_stamp = self.clock;
        self.usage.remove(&old_stamp);
        self.usage.insert(new_stamp, cache_key.clone());
        if let Some(entry) = self.entries.get_mut(&cache_key) {
            entry.stamp = new_stamp;
            return Some(entry.result.clone());
        }
        None
    }

    /// Store a result with the registry's current generation for its type,
    /// evicting the least recently used entry when full.
    pub fn put(
        &mut self,
        session: &str,
        key: &PolicyKey,
        result: PolicyResult,
        registry: &InterpreterRegistry,
    ) {
        let cache_key = (session.to_owned(), key.clone());
        self.clock += 1;
        let stamp = self.clock;

        if let Some(old) = self.entries.insert(
            cache_key.clone(),
            CacheEntry {
                generation: registry.generation(result.policy_type()),
                result,
                stamp,
            },
        ) {
            self.usage.remove(&old.stamp);
        }
        self.usage.insert(stamp, cache_key);

        while self.entries.len() > self.capacity {
            let Some((_, oldest)) = self.usage.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    /// Drop everything — used on reconnect and on server-signalled policy
    /// change.
    pub fn invalidate_all(&mut self) {
        self.entries.clear();
        self.usage.clear();
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use vigil_core::types::PolicyType;

    use crate::interpreter::NaiveInterpreter;

    fn key(p: &str) -> PolicyKey {
        PolicyKey::new("client", "user", p).unwrap()
    }

    #[test]
    fn hit_and_miss() {
        let registry = InterpreterRegistry::new();
        let mut cache = SessionCache::new(4);
        assert!(cache.get("s", &key("a"), &registry).is_none());

        cache.put("s", &key("a"), PolicyResult::allow(), &registry);
        assert_eq!(
            cache.get("s", &key("a"), &registry),
            Some(PolicyResult::allow())
        );
        // Another session does not see the entry.
        assert!(cache.get("other", &key("a"), &registry).is_none());
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let registry = InterpreterRegistry::new();
        let mut cache = SessionCache::new(2);
        cache.put("s", &key("a"), PolicyResult::allow(), &registry);
        cache.put("s", &key("b"), PolicyResult::deny(), &registry);
        // Touch "a" so "b" is the eviction candidate.
        cache.get("s", &key("a"), &registry);
        cache.put("s", &key("c"), PolicyResult::allow(), &registry);

        assert!(cache.get("s", &key("a"), &registry).is_some());
        assert!(cache.get("s", &key("b"), &registry).is_none());
        assert!(cache.get("s", &key("c"), &registry).is_some());
    }

    #[test]
    fn generation_bump_stales_plugin_entries_only() {
        let mut registry = InterpreterRegistry::new();
        let plugin_type = PolicyType::new(0x10);
        registry.register(plugin_type, Arc::new(NaiveInterpreter));

        let mut cache = SessionCache::new(8);
        cache.put("s", &key("builtin"), PolicyResult::allow(), &registry);
        cache.put(
            "s",
            &key("plugin"),
            PolicyResult::new(plugin_type, "payload"),
            &registry,
        );

        registry.invalidate_all();
        assert!(cache.get("s", &key("plugin"), &registry).is_none());
        assert!(cache.get("s", &key("builtin"), &registry).is_some());
    }

    #[test]
    fn put_replaces_existing_entry() {
        let registry = InterpreterRegistry::new();
        let mut cache = SessionCache::new(2);
        cache.put("s", &key("a"), PolicyResult::allow(), &registry);
        cache.put("s", &key("a"), PolicyResult::deny(), &registry);
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.get("s", &key("a"), &registry),
            Some(PolicyResult::deny())
        );
    }

    #[test]
    fn invalidate_all_empties_cache() {
        let registry = InterpreterRegistry::new();
        let mut cache = SessionCache::new(2);
        cache.put("s", &key("a"), PolicyResult::allow(), &registry);
        cache.invalidate_all();
        assert!(cache.is_empty());
    }
}
