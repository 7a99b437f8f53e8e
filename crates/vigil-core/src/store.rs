//! The in-memory policy store: a mapping of bucket id to [`PolicyBucket`],
//! plus the recursive check algorithm that evaluates a key against it.
//!
//! The store is a plain value type — cloning it snapshots the whole
//! database, which is how admin batches stay atomic: the service applies a
//! batch to a clone, persists the clone, and swaps it in only on success.
//!
//! Cross-bucket links are not constrained at runtime beyond rejecting
//! single-hop self-links; evaluation and erase stay cycle-safe through
//! explicit visited sets.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::debug;

use crate::bucket::PolicyBucket;
use crate::error::StoreError;
use crate::types::{Policy, PolicyKey, PolicyResult, PolicyType};

/// Id of the root bucket, which always exists.
pub const ROOT_BUCKET: &str = "";

/// The bucketed policy database.
#[derive(Debug, Clone)]
pub struct PolicyStore {
    buckets: BTreeMap<String, PolicyBucket>,
}

impl PolicyStore {
    /// A store holding only the root bucket with a DENY default.
    #[must_use]
    pub fn new() -> Self {
        let mut buckets = BTreeMap::new();
        // The root id and a DENY default always satisfy the constructor.
        if let Ok(root) = PolicyBucket::new(ROOT_BUCKET, PolicyResult::deny()) {
            buckets.insert(ROOT_BUCKET.to_owned(), root);
        }
        Self { buckets }
    }

    /// Rebuild a store from loaded buckets, adding the root if absent.
    #[must_use]
    pub fn from_buckets(buckets: impl IntoIterator<Item = PolicyBucket>) -> Self {
        let mut store = Self {
            buckets: buckets
                .into_iter()
                .map(|bucket| (bucket.id().to_owned(), bucket))
                .collect(),
        };
        if !store.buckets.contains_key(ROOT_BUCKET) {
            debug!("root bucket missing after load, creating with DENY default");
            if let Ok(root) = PolicyBucket::new(ROOT_BUCKET, PolicyResult::deny()) {
                store.buckets.insert(ROOT_BUCKET.to_owned(), root);
            }
        }
        store
    }

    #[must_use]
    pub fn contains_bucket(&self, id: &str) -> bool {
        self.buckets.contains_key(id)
    }

    pub fn bucket(&self, id: &str) -> Result<&PolicyBucket, StoreError> {
        self.buckets
            .get(id)
            .ok_or_else(|| StoreError::BucketNotExists { id: id.to_owned() })
    }

    fn bucket_mut(&mut self, id: &str) -> Result<&mut PolicyBucket, StoreError> {
        self.buckets
            .get_mut(id)
            .ok_or_else(|| StoreError::BucketNotExists { id: id.to_owned() })
    }

    /// All buckets in id order.
    pub fn buckets(&self) -> impl Iterator<Item = &PolicyBucket> {
        self.buckets.values()
    }

    /// Create a bucket.
    ///
    /// # Errors
    ///
    /// - [`StoreError::BucketExists`] on an id collision.
    /// - [`StoreError::DefaultIsLink`] / [`StoreError::InvalidBucketId`] from
    ///   bucket construction.
    pub fn create_bucket(&mut self, id: &str, default: PolicyResult) -> Result<(), StoreError> {
        if self.buckets.contains_key(id) {
            return Err(StoreError::BucketExists { id: id.to_owned() });
        }
        let bucket = PolicyBucket::new(id, default)?;
        self.buckets.insert(id.to_owned(), bucket);
        Ok(())
    }

    /// Replace an existing bucket's default.
    ///
    /// # Errors
    ///
    /// - [`StoreError::BucketNotExists`] if the bucket is missing.
    /// - [`StoreError::RootBucketNone`] when setting the root default to NONE.
    /// - [`StoreError::DefaultIsLink`] if the default is `BUCKET`.
    pub fn update_bucket_default(
        &mut self,
        id: &str,
        default: PolicyResult,
    ) -> Result<(), StoreError> {
        if id == ROOT_BUCKET && default.policy_type() == PolicyType::NONE {
            return Err(StoreError::RootBucketNone);
        }
        self.bucket_mut(id)?.set_default(default)
    }

    /// Create the bucket or update its default, as the admin channel's
    /// insert-or-update operation requires.
    pub fn upsert_bucket(&mut self, id: &str, default: PolicyResult) -> Result<(), StoreError> {
        if self.buckets.contains_key(id) {
            self.update_bucket_default(id, default)
        } else {
            self.create_bucket(id, default)
        }
    }

    /// Delete a bucket and cascade: every link policy in every bucket whose
    /// metadata names `id` is removed too.
    ///
    /// # Errors
    ///
    /// - [`StoreError::RootBucketDeletion`] for the root bucket.
    /// - [`StoreError::BucketNotExists`] if the bucket is missing.
    pub fn delete_bucket(&mut self, id: &str) -> Result<(), StoreError> {
        if id == ROOT_BUCKET {
            return Err(StoreError::RootBucketDeletion);
        }
        if self.buckets.remove(id).is_none() {
            return Err(StoreError::BucketNotExists { id: id.to_owned() });
        }
        for bucket in self.buckets.values_mut() {
            bucket.remove_matching(|_, result| {
                result.policy_type() == PolicyType::BUCKET && result.metadata() == id
            });
        }
        Ok(())
    }

    /// Validate one policy destined for `bucket_id`: the key must be a
    /// stored key (no any-marker) and the metadata must fit the type.
    fn validate_policy(&self, bucket_id: &str, policy: &Policy) -> Result<(), StoreError> {
        if policy.key.uses_any() {
            return Err(StoreError::InvalidPolicy {
                reason: "stored keys cannot contain the any-marker".to_owned(),
            });
        }
        match policy.result.policy_type() {
            PolicyType::BUCKET => {
                if policy.result.metadata() == bucket_id {
                    return Err(StoreError::SelfLink {
                        id: bucket_id.to_owned(),
                    });
                }
            }
            PolicyType::NONE => {
                return Err(StoreError::InvalidPolicy {
                    reason: "NONE is only valid as a bucket default".to_owned(),
                });
            }
            t if t.is_builtin_terminal() => {
                if !policy.result.metadata().is_empty() {
                    return Err(StoreError::InvalidPolicy {
                        reason: format!("{t} carries no metadata"),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Insert a batch of policies grouped by bucket. The whole batch is
    /// validated before any bucket is touched, so the in-memory application
    /// cannot fail midway.
    pub fn insert_policies(
        &mut self,
        batch: &BTreeMap<String, Vec<Policy>>,
    ) -> Result<(), StoreError> {
        for (bucket_id, policies) in batch {
            self.bucket(bucket_id)?;
            for policy in policies {
                self.validate_policy(bucket_id, policy)?;
            }
        }
        for (bucket_id, policies) in batch {
            if let Ok(bucket) = self.bucket_mut(bucket_id) {
                for policy in policies {
                    bucket.insert(policy.clone());
                }
            }
        }
        Ok(())
    }

    /// Remove a batch of policies grouped by bucket. Validated up front the
    /// same way as [`insert_policies`](Self::insert_policies); removing an
    /// absent key is not an error.
    pub fn delete_policies(
        &mut self,
        batch: &BTreeMap<String, Vec<PolicyKey>>,
    ) -> Result<(), StoreError> {
        for bucket_id in batch.keys() {
            self.bucket(bucket_id)?;
        }
        for (bucket_id, keys) in batch {
            if let Ok(bucket) = self.bucket_mut(bucket_id) {
                for key in keys {
                    bucket.remove(key);
                }
            }
        }
        Ok(())
    }

    /// Enumerate the policies of one bucket passing an admin filter.
    pub fn list_policies(
        &self,
        bucket_id: &str,
        filter: &PolicyKey,
    ) -> Result<Vec<Policy>, StoreError> {
        Ok(self.bucket(bucket_id)?.list(filter))
    }

    /// Remove every policy matching `filter` from `start`, and, when
    /// `recursive`, from every bucket reachable through link policies.
    /// Traversal is cycle-safe; links whose target has gone missing are
    /// skipped rather than failing the erase.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BucketNotExists`] if `start` is missing.
    pub fn erase(
        &mut self,
        start: &str,
        recursive: bool,
        filter: &PolicyKey,
    ) -> Result<usize, StoreError> {
        self.bucket(start)?;

        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([start.to_owned()]);
        let mut removed = 0;

        while let Some(bucket_id) = queue.pop_front() {
            if !visited.insert(bucket_id.clone()) {
                continue;
            }
            let Ok(bucket) = self.bucket_mut(&bucket_id) else {
                // Dangling link encountered mid-traversal.
                continue;
            };
            if recursive {
                queue.extend(bucket.subbucket_ids());
            }
            removed += bucket.remove_matching(|key, _| key.matches_filter(filter));
        }

        debug!(start = %start, recursive, removed, "erased policies");
        Ok(removed)
    }

    /// Evaluate a literal key against the store.
    ///
    /// The search starts at `start`: the best wildcard match wins; with no
    /// match the bucket default is proposed. A `BUCKET` result descends into
    /// the target when `recursive` (a link to an already-visited or missing
    /// bucket falls back to the linking bucket's default), and a `NONE`
    /// result from a linked bucket defers to the linking bucket's default.
    /// The result may carry a plugin type; resolving those is the service's
    /// concern.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BucketNotExists`] if `start` is missing.
    pub fn check(
        &self,
        start: &str,
        recursive: bool,
        key: &PolicyKey,
    ) -> Result<PolicyResult, StoreError> {
        let mut visited = BTreeSet::from([start.to_owned()]);
        self.check_in(start, recursive, key, &mut visited)
    }

    fn check_in(
        &self,
        bucket_id: &str,
        recursive: bool,
        key: &PolicyKey,
        visited: &mut BTreeSet<String>,
    ) -> Result<PolicyResult, StoreError> {
        let bucket = self.bucket(bucket_id)?;

        let Some(hit) = bucket.best_match(key) else {
            return Ok(bucket.default_result().clone());
        };

        if hit.result.policy_type() != PolicyType::BUCKET {
            return Ok(hit.result);
        }

        let target = hit.result.metadata();
        if !recursive || !visited.insert(target.to_owned()) || !self.contains_bucket(target) {
            // A non-recursive check, a link cycle, or a dangling link: the
            // link is treated as not-found and the default wins.
            return Ok(bucket.default_result().clone());
        }

        let inner = self.check_in(target, recursive, key, visited)?;
        if inner.policy_type() == PolicyType::NONE {
            // The linked bucket abstained; the referrer's default applies.
            Ok(bucket.default_result().clone())
        } else {
            Ok(inner)
        }
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn key(c: &str, u: &str, p: &str) -> PolicyKey {
        PolicyKey::new(c, u, p).unwrap()
    }

    fn insert_one(store: &mut PolicyStore, bucket: &str, policy: Policy) {
        let mut batch = BTreeMap::new();
        batch.insert(bucket.to_owned(), vec![policy]);
        store.insert_policies(&batch).unwrap();
    }

    #[test]
    fn fresh_store_denies_everything() {
        let store = PolicyStore::new();
        let result = store.check(ROOT_BUCKET, true, &key("c", "u", "p")).unwrap();
        assert_eq!(result, PolicyResult::deny());
    }

    #[test]
    fn wildcard_user_allows_matching_clients_only() {
        let mut store = PolicyStore::new();
        insert_one(
            &mut store,
            ROOT_BUCKET,
            Policy::new(key("c", "*", "p"), PolicyResult::allow()),
        );
        assert_eq!(
            store.check(ROOT_BUCKET, true, &key("c", "u1", "p")).unwrap(),
            PolicyResult::allow()
        );
        assert_eq!(
            store.check(ROOT_BUCKET, true, &key("c2", "u1", "p")).unwrap(),
            PolicyResult::deny()
        );
    }

    #[test]
    fn most_specific_policy_wins() {
        let mut store = PolicyStore::new();
        insert_one(
            &mut store,
            ROOT_BUCKET,
            Policy::new(key("c", "*", "p"), PolicyResult::allow()),
        );
        insert_one(
            &mut store,
            ROOT_BUCKET,
            Policy::new(key("c", "u1", "p"), PolicyResult::deny()),
        );
        assert_eq!(
            store.check(ROOT_BUCKET, true, &key("c", "u1", "p")).unwrap(),
            PolicyResult::deny()
        );
        assert_eq!(
            store.check(ROOT_BUCKET, true, &key("c", "u2", "p")).unwrap(),
            PolicyResult::allow()
        );
    }

    #[test]
    fn link_to_abstaining_bucket_uses_referrer_default() {
        let mut store = PolicyStore::new();
        store.create_bucket("extra", PolicyResult::none()).unwrap();
        insert_one(
            &mut store,
            ROOT_BUCKET,
            Policy::new(key("c", "u", "p"), PolicyResult::bucket("extra")),
        );
        // The linked bucket has no match and a NONE default; the root
        // default (DENY) applies.
        assert_eq!(
            store.check(ROOT_BUCKET, true, &key("c", "u", "p")).unwrap(),
            PolicyResult::deny()
        );
    }

    #[test]
    fn direct_check_of_abstaining_bucket_surfaces_none() {
        let mut store = PolicyStore::new();
        store.create_bucket("extra", PolicyResult::none()).unwrap();
        assert_eq!(
            store.check("extra", true, &key("c", "u", "p")).unwrap(),
            PolicyResult::none()
        );
    }

    #[test]
    fn link_descends_into_target_match() {
        let mut store = PolicyStore::new();
        store.create_bucket("extra", PolicyResult::none()).unwrap();
        insert_one(
            &mut store,
            ROOT_BUCKET,
            Policy::new(key("c", "*", "p"), PolicyResult::bucket("extra")),
        );
        insert_one(
            &mut store,
            "extra",
            Policy::new(key("c", "u", "p"), PolicyResult::allow()),
        );
        assert_eq!(
            store.check(ROOT_BUCKET, true, &key("c", "u", "p")).unwrap(),
            PolicyResult::allow()
        );
    }

    #[test]
    fn non_recursive_check_treats_link_as_absent() {
        let mut store = PolicyStore::new();
        store.create_bucket("extra", PolicyResult::allow()).unwrap();
        insert_one(
            &mut store,
            ROOT_BUCKET,
            Policy::new(key("c", "u", "p"), PolicyResult::bucket("extra")),
        );
        assert_eq!(
            store.check(ROOT_BUCKET, false, &key("c", "u", "p")).unwrap(),
            PolicyResult::deny()
        );
    }

    #[test]
    fn link_cycles_terminate() {
        let mut store = PolicyStore::new();
        store.create_bucket("a", PolicyResult::deny()).unwrap();
        store.create_bucket("b", PolicyResult::allow()).unwrap();
        insert_one(
            &mut store,
            "a",
            Policy::new(key("c", "u", "p"), PolicyResult::bucket("b")),
        );
        insert_one(
            &mut store,
            "b",
            Policy::new(key("c", "u", "p"), PolicyResult::bucket("a")),
        );
        // b links back to the visited a, so the link falls back to b's
        // default.
        assert_eq!(
            store.check("a", true, &key("c", "u", "p")).unwrap(),
            PolicyResult::allow()
        );
    }

    #[test]
    fn dangling_link_falls_back_to_default() {
        let mut store = PolicyStore::new();
        store.create_bucket("a", PolicyResult::deny()).unwrap();
        store.create_bucket("b", PolicyResult::deny()).unwrap();
        insert_one(
            &mut store,
            "a",
            Policy::new(key("c", "u", "p"), PolicyResult::bucket("b")),
        );
        store.delete_bucket("b").unwrap();
        // delete_bucket cascades, so the link is gone entirely.
        assert_eq!(
            store.check("a", true, &key("c", "u", "p")).unwrap(),
            PolicyResult::deny()
        );
    }

    #[test]
    fn check_missing_start_bucket_errors() {
        let store = PolicyStore::new();
        assert!(matches!(
            store.check("nope", true, &key("c", "u", "p")),
            Err(StoreError::BucketNotExists { .. })
        ));
    }

    #[test]
    fn create_bucket_rejects_collision() {
        let mut store = PolicyStore::new();
        store.create_bucket("b", PolicyResult::deny()).unwrap();
        assert!(matches!(
            store.create_bucket("b", PolicyResult::deny()),
            Err(StoreError::BucketExists { .. })
        ));
    }

    #[test]
    fn root_default_cannot_become_none() {
        let mut store = PolicyStore::new();
        assert!(matches!(
            store.update_bucket_default(ROOT_BUCKET, PolicyResult::none()),
            Err(StoreError::RootBucketNone)
        ));
        store
            .update_bucket_default(ROOT_BUCKET, PolicyResult::allow())
            .unwrap();
    }

    #[test]
    fn root_bucket_cannot_be_deleted() {
        let mut store = PolicyStore::new();
        assert!(matches!(
            store.delete_bucket(ROOT_BUCKET),
            Err(StoreError::RootBucketDeletion)
        ));
    }

    #[test]
    fn delete_bucket_cascades_links() {
        let mut store = PolicyStore::new();
        store.create_bucket("a", PolicyResult::deny()).unwrap();
        store.create_bucket("b", PolicyResult::deny()).unwrap();
        insert_one(
            &mut store,
            ROOT_BUCKET,
            Policy::new(key("c", "u", "p"), PolicyResult::bucket("a")),
        );
        insert_one(
            &mut store,
            "b",
            Policy::new(key("c", "u", "q"), PolicyResult::bucket("a")),
        );
        store.delete_bucket("a").unwrap();
        assert!(store.bucket(ROOT_BUCKET).unwrap().is_empty());
        assert!(store.bucket("b").unwrap().is_empty());
    }

    #[test]
    fn insert_batch_rejects_self_link() {
        let mut store = PolicyStore::new();
        store.create_bucket("a", PolicyResult::deny()).unwrap();
        let mut batch = BTreeMap::new();
        batch.insert(
            "a".to_owned(),
            vec![Policy::new(key("c", "u", "p"), PolicyResult::bucket("a"))],
        );
        assert!(matches!(
            store.insert_policies(&batch),
            Err(StoreError::SelfLink { .. })
        ));
    }

    #[test]
    fn insert_batch_is_validated_before_any_mutation() {
        let mut store = PolicyStore::new();
        let mut batch = BTreeMap::new();
        batch.insert(
            ROOT_BUCKET.to_owned(),
            vec![Policy::new(key("c", "u", "p"), PolicyResult::allow())],
        );
        batch.insert(
            "missing".to_owned(),
            vec![Policy::new(key("c", "u", "p"), PolicyResult::allow())],
        );
        assert!(store.insert_policies(&batch).is_err());
        // The valid half must not have been applied.
        assert!(store.bucket(ROOT_BUCKET).unwrap().is_empty());
    }

    #[test]
    fn insert_batch_rejects_none_policy() {
        let mut store = PolicyStore::new();
        let mut batch = BTreeMap::new();
        batch.insert(
            ROOT_BUCKET.to_owned(),
            vec![Policy::new(key("c", "u", "p"), PolicyResult::none())],
        );
        assert!(matches!(
            store.insert_policies(&batch),
            Err(StoreError::InvalidPolicy { .. })
        ));
    }

    #[test]
    fn erase_with_any_filter_clears_bucket() {
        let mut store = PolicyStore::new();
        insert_one(
            &mut store,
            ROOT_BUCKET,
            Policy::new(key("c", "u", "p"), PolicyResult::allow()),
        );
        insert_one(
            &mut store,
            ROOT_BUCKET,
            Policy::new(key("d", "v", "q"), PolicyResult::allow()),
        );
        let removed = store
            .erase(ROOT_BUCKET, false, &key("#", "#", "#"))
            .unwrap();
        assert_eq!(removed, 2);
        assert!(store.bucket(ROOT_BUCKET).unwrap().is_empty());
    }

    #[test]
    fn recursive_erase_reaches_linked_buckets_and_survives_cycles() {
        let mut store = PolicyStore::new();
        store.create_bucket("a", PolicyResult::deny()).unwrap();
        insert_one(
            &mut store,
            ROOT_BUCKET,
            Policy::new(key("link", "u", "p"), PolicyResult::bucket("a")),
        );
        insert_one(
            &mut store,
            "a",
            Policy::new(key("c", "alice", "p"), PolicyResult::allow()),
        );
        // Cycle back to the root.
        insert_one(
            &mut store,
            "a",
            Policy::new(key("back", "u", "p"), PolicyResult::bucket("")),
        );

        let removed = store
            .erase(ROOT_BUCKET, true, &key("#", "alice", "#"))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.bucket("a").unwrap().get(&key("c", "alice", "p")).is_none());
    }

    #[test]
    fn non_recursive_erase_ignores_linked_buckets() {
        let mut store = PolicyStore::new();
        store.create_bucket("a", PolicyResult::deny()).unwrap();
        insert_one(
            &mut store,
            ROOT_BUCKET,
            Policy::new(key("link", "u", "p"), PolicyResult::bucket("a")),
        );
        insert_one(
            &mut store,
            "a",
            Policy::new(key("c", "u", "p"), PolicyResult::allow()),
        );
        store.erase(ROOT_BUCKET, false, &key("c", "#", "#")).unwrap();
        assert_eq!(store.bucket("a").unwrap().len(), 1);
    }

    #[test]
    fn check_visits_bounded_by_bucket_count() {
        // A chain of links a -> b -> c -> a terminates within |buckets|.
        let mut store = PolicyStore::new();
        for id in ["a", "b", "c"] {
            store.create_bucket(id, PolicyResult::deny()).unwrap();
        }
        for (from, to) in [("a", "b"), ("b", "c"), ("c", "a")] {
            insert_one(
                &mut store,
                from,
                Policy::new(key("c", "u", "p"), PolicyResult::bucket(to)),
            );
        }
        let result = store.check("a", true, &key("c", "u", "p")).unwrap();
        assert_eq!(result, PolicyResult::deny());
    }
}
