//! A policy bucket: a named, ordered set of policies plus a default result.
//!
//! Buckets are the unit of evaluation. Lookup by exact key is a map probe;
//! wildcard search against a literal query key probes the eight
//! literal/wildcard slot combinations in descending precedence, so the first
//! hit is already the most specific match (literal beats wildcard, and ties
//! break client over user over privilege).

use std::collections::{BTreeMap, BTreeSet};

use crate::error::StoreError;
use crate::types::{Policy, PolicyKey, PolicyResult, PolicyType, WILDCARD};

/// Characters allowed in a bucket id. Ids become database file names.
fn id_is_valid(id: &str) -> bool {
    id.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// A named container of policies with a default result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyBucket {
    id: String,
    default: PolicyResult,
    policies: BTreeMap<PolicyKey, PolicyResult>,
}

impl PolicyBucket {
    /// Create an empty bucket.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidBucketId`] if the id contains characters that
    ///   cannot appear in a database file name.
    /// - [`StoreError::DefaultIsLink`] if the default is `BUCKET`.
    pub fn new(id: impl Into<String>, default: PolicyResult) -> Result<Self, StoreError> {
        let id = id.into();
        if !id_is_valid(&id) {
            return Err(StoreError::InvalidBucketId { id });
        }
        if default.policy_type() == PolicyType::BUCKET {
            return Err(StoreError::DefaultIsLink);
        }
        Ok(Self {
            id,
            default,
            policies: BTreeMap::new(),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn default_result(&self) -> &PolicyResult {
        &self.default
    }

    /// Replace the default result.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DefaultIsLink`] if the new default is `BUCKET`.
    pub fn set_default(&mut self, default: PolicyResult) -> Result<(), StoreError> {
        if default.policy_type() == PolicyType::BUCKET {
            return Err(StoreError::DefaultIsLink);
        }
        self.default = default;
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Insert a policy, replacing any existing policy with an equal key.
    pub fn insert(&mut self, policy: Policy) {
        self.policies.insert(policy.key, policy.result);
    }

    /// Remove the policy with exactly this key. Returns whether one existed.
    pub fn remove(&mut self, key: &PolicyKey) -> bool {
        self.policies.remove(key).is_some()
    }

    /// Remove every policy the predicate accepts; returns the count removed.
    pub fn remove_matching(&mut self, mut predicate: impl FnMut(&PolicyKey, &PolicyResult) -> bool) -> usize {
        let before = self.policies.len();
        self.policies.retain(|key, result| !predicate(key, result));
        before - self.policies.len()
    }

    /// Exact-key lookup.
    #[must_use]
    pub fn get(&self, key: &PolicyKey) -> Option<&PolicyResult> {
        self.policies.get(key)
    }

    /// The single best wildcard match for a literal query key, if any.
    #[must_use]
    pub fn best_match(&self, query: &PolicyKey) -> Option<Policy> {
        for variant in key_variants(query) {
            if let Some(result) = self.policies.get(&variant) {
                return Some(Policy::new(variant, result.clone()));
            }
        }
        None
    }

    /// A bucket holding only the policies matching `query` by the wildcard
    /// rule, inheriting this bucket's id and default.
    #[must_use]
    pub fn filtered(&self, query: &PolicyKey) -> PolicyBucket {
        let mut policies = BTreeMap::new();
        for variant in key_variants(query) {
            if let Some(result) = self.policies.get(&variant) {
                policies.insert(variant, result.clone());
            }
        }
        Self {
            id: self.id.clone(),
            default: self.default.clone(),
            policies,
        }
    }

    /// Ids of every bucket referenced by a link policy in this bucket.
    #[must_use]
    pub fn subbucket_ids(&self) -> BTreeSet<String> {
        self.policies
            .values()
            .filter(|result| result.policy_type() == PolicyType::BUCKET)
            .map(|result| result.metadata().to_owned())
            .collect()
    }

    /// Enumerate policies passing an admin filter, in key order. An
    /// any-marker filter slot matches both literals and wildcards.
    #[must_use]
    pub fn list(&self, filter: &PolicyKey) -> Vec<Policy> {
        self.policies
            .iter()
            .filter(|(key, _)| key.matches_filter(filter))
            .map(|(key, result)| Policy::new(key.clone(), result.clone()))
            .collect()
    }

    /// All policies in key order.
    pub fn iter(&self) -> impl Iterator<Item = Policy> + '_ {
        self.policies
            .iter()
            .map(|(key, result)| Policy::new(key.clone(), result.clone()))
    }
}

/// The eight wildcard combinations of a literal query key, most specific
/// first. Ties at equal specificity are ordered client over user over
/// privilege, which makes a linear probe yield the winning policy directly.
fn key_variants(query: &PolicyKey) -> impl Iterator<Item = PolicyKey> + '_ {
    // Bit set = keep the literal slot; bit clear = wildcard. Client is the
    // most significant bit, so descending numeric order is exactly the
    // precedence order.
    (0..8u8).rev().filter_map(move |bits| {
        let client = if bits & 0b100 != 0 { query.client() } else { WILDCARD };
        let user = if bits & 0b010 != 0 { query.user() } else { WILDCARD };
        let privilege = if bits & 0b001 != 0 { query.privilege() } else { WILDCARD };
        PolicyKey::new(client, user, privilege).ok()
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn key(c: &str, u: &str, p: &str) -> PolicyKey {
        PolicyKey::new(c, u, p).unwrap()
    }

    fn bucket() -> PolicyBucket {
        PolicyBucket::new("test", PolicyResult::deny()).unwrap()
    }

    #[test]
    fn new_rejects_link_default() {
        assert!(matches!(
            PolicyBucket::new("b", PolicyResult::bucket("other")),
            Err(StoreError::DefaultIsLink)
        ));
    }

    #[test]
    fn new_rejects_bad_id() {
        assert!(matches!(
            PolicyBucket::new("a/b", PolicyResult::deny()),
            Err(StoreError::InvalidBucketId { .. })
        ));
        assert!(PolicyBucket::new("", PolicyResult::deny()).is_ok());
        assert!(PolicyBucket::new("bucket_A-1", PolicyResult::deny()).is_ok());
    }

    #[test]
    fn insert_replaces_equal_key() {
        let mut b = bucket();
        b.insert(Policy::new(key("c", "u", "p"), PolicyResult::deny()));
        b.insert(Policy::new(key("c", "u", "p"), PolicyResult::allow()));
        assert_eq!(b.len(), 1);
        assert_eq!(b.get(&key("c", "u", "p")), Some(&PolicyResult::allow()));
    }

    #[test]
    fn remove_matching_reports_count() {
        let mut b = bucket();
        b.insert(Policy::new(key("c", "u1", "p"), PolicyResult::allow()));
        b.insert(Policy::new(key("c", "u2", "p"), PolicyResult::allow()));
        b.insert(Policy::new(key("d", "u1", "p"), PolicyResult::allow()));
        let removed = b.remove_matching(|k, _| k.client() == "c");
        assert_eq!(removed, 2);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn best_match_prefers_most_specific() {
        let mut b = bucket();
        b.insert(Policy::new(key("c", "*", "p"), PolicyResult::allow()));
        b.insert(Policy::new(key("c", "u", "p"), PolicyResult::deny()));
        let hit = b.best_match(&key("c", "u", "p")).unwrap();
        assert_eq!(hit.result, PolicyResult::deny());

        let hit = b.best_match(&key("c", "other", "p")).unwrap();
        assert_eq!(hit.result, PolicyResult::allow());
    }

    #[test]
    fn best_match_breaks_specificity_ties_client_first() {
        let mut b = bucket();
        // Both have specificity 2; the literal-client one must win.
        b.insert(Policy::new(key("c", "u", "*"), PolicyResult::allow()));
        b.insert(Policy::new(key("*", "u", "p"), PolicyResult::deny()));
        let hit = b.best_match(&key("c", "u", "p")).unwrap();
        assert_eq!(hit.result, PolicyResult::allow());
    }

    #[test]
    fn best_match_falls_through_to_full_wildcard() {
        let mut b = bucket();
        b.insert(Policy::new(key("*", "*", "*"), PolicyResult::allow()));
        let hit = b.best_match(&key("c", "u", "p")).unwrap();
        assert_eq!(hit.key, key("*", "*", "*"));
    }

    #[test]
    fn filtered_keeps_default_and_matching_policies() {
        let mut b = bucket();
        b.insert(Policy::new(key("c", "*", "p"), PolicyResult::allow()));
        b.insert(Policy::new(key("x", "y", "z"), PolicyResult::allow()));
        let f = b.filtered(&key("c", "u", "p"));
        assert_eq!(f.len(), 1);
        assert_eq!(f.default_result(), &PolicyResult::deny());
        assert_eq!(f.id(), "test");
    }

    #[test]
    fn subbucket_ids_collects_link_targets() {
        let mut b = bucket();
        b.insert(Policy::new(key("c", "u", "p"), PolicyResult::bucket("one")));
        b.insert(Policy::new(key("c", "u", "q"), PolicyResult::bucket("two")));
        b.insert(Policy::new(key("c", "u", "r"), PolicyResult::allow()));
        let ids = b.subbucket_ids();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("one") && ids.contains("two"));
    }

    #[test]
    fn list_honours_any_marker() {
        let mut b = bucket();
        b.insert(Policy::new(key("c", "alice", "p"), PolicyResult::allow()));
        b.insert(Policy::new(key("c", "*", "p"), PolicyResult::deny()));
        b.insert(Policy::new(key("d", "alice", "p"), PolicyResult::allow()));

        let all_c = b.list(&key("c", "#", "#"));
        assert_eq!(all_c.len(), 2);

        let wild_only = b.list(&key("c", "*", "#"));
        assert_eq!(wild_only.len(), 1);
        assert_eq!(wild_only[0].key, key("c", "*", "p"));
    }
}
