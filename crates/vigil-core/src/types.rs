//! Policy value types.
//!
//! A [`PolicyKey`] is the 3-tuple `(client, user, privilege)` a decision is
//! asked about. A [`PolicyResult`] is the typed answer: one of the built-in
//! terminal types, a link to another bucket, or a plugin-owned type with an
//! opaque payload. A [`Policy`] pairs the two inside one bucket.
//!
//! Stored key slots may be literal or the wildcard `*`. The any-marker `#`
//! exists only in admin-side filters and never in stored policies.

use std::fmt;

use crate::error::KeyError;

/// The wildcard value a stored key slot may hold.
pub const WILDCARD: &str = "*";

/// The any-marker used in admin list/erase filters.
pub const ANY: &str = "#";

/// Upper bound on the byte length of a single key slot.
pub const MAX_SLOT_LEN: usize = 16 * 1024;

/// A 16-bit policy type tag.
///
/// The reserved values are stable on the wire; everything in
/// `[0x0002, 0xFFFD]` belongs to plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PolicyType(u16);

impl PolicyType {
    /// Access is denied.
    pub const DENY: PolicyType = PolicyType(0x0000);
    /// The bucket abstains; the referrer's default applies.
    pub const NONE: PolicyType = PolicyType(0x0001);
    /// The result names another bucket to consult.
    pub const BUCKET: PolicyType = PolicyType(0xFFFE);
    /// Access is allowed.
    pub const ALLOW: PolicyType = PolicyType(0xFFFF);

    #[must_use]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0
    }

    /// Whether this tag lies in the plugin-assignable range.
    #[must_use]
    pub const fn is_plugin_range(self) -> bool {
        self.0 >= 0x0002 && self.0 <= 0xFFFD
    }

    /// Whether this is one of the three terminal built-ins.
    #[must_use]
    pub const fn is_builtin_terminal(self) -> bool {
        matches!(self, Self::DENY | Self::NONE | Self::ALLOW)
    }
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

/// A typed policy decision with its metadata payload.
///
/// Metadata is the link target for [`PolicyType::BUCKET`], an opaque payload
/// for plugin types, and empty for the terminal built-ins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyResult {
    policy_type: PolicyType,
    metadata: String,
}

impl PolicyResult {
    #[must_use]
    pub fn new(policy_type: PolicyType, metadata: impl Into<String>) -> Self {
        Self {
            policy_type,
            metadata: metadata.into(),
        }
    }

    #[must_use]
    pub fn deny() -> Self {
        Self::new(PolicyType::DENY, "")
    }

    #[must_use]
    pub fn allow() -> Self {
        Self::new(PolicyType::ALLOW, "")
    }

    #[must_use]
    pub fn none() -> Self {
        Self::new(PolicyType::NONE, "")
    }

    /// A link to the named bucket.
    #[must_use]
    pub fn bucket(target: impl Into<String>) -> Self {
        Self::new(PolicyType::BUCKET, target)
    }

    #[must_use]
    pub const fn policy_type(&self) -> PolicyType {
        self.policy_type
    }

    #[must_use]
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    #[must_use]
    pub fn into_metadata(self) -> String {
        self.metadata
    }
}

impl Default for PolicyResult {
    fn default() -> Self {
        Self::deny()
    }
}

impl fmt::Display for PolicyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.metadata.is_empty() {
            write!(f, "{}", self.policy_type)
        } else {
            write!(f, "{}({})", self.policy_type, self.metadata)
        }
    }
}

/// The ordered `(client, user, privilege)` tuple policies are keyed by.
///
/// Two keys are equal iff all three slots are equal as strings; the ordering
/// is lexicographic over the tuple, which keeps bucket enumeration and the
/// persisted form deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PolicyKey {
    client: String,
    user: String,
    privilege: String,
}

impl PolicyKey {
    /// Build a key, checking the slot bounds.
    pub fn new(
        client: impl Into<String>,
        user: impl Into<String>,
        privilege: impl Into<String>,
    ) -> Result<Self, KeyError> {
        let key = Self {
            client: client.into(),
            user: user.into(),
            privilege: privilege.into(),
        };
        for (slot, value) in [
            ("client", &key.client),
            ("user", &key.user),
            ("privilege", &key.privilege),
        ] {
            if value.is_empty() {
                return Err(KeyError::EmptySlot { slot });
            }
            if value.len() > MAX_SLOT_LEN {
                return Err(KeyError::SlotTooLong {
                    slot,
                    len: value.len(),
                });
            }
        }
        Ok(key)
    }

    #[must_use]
    pub fn client(&self) -> &str {
        &self.client
    }

    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    #[must_use]
    pub fn privilege(&self) -> &str {
        &self.privilege
    }

    /// Whether any slot is the admin-only any-marker.
    #[must_use]
    pub fn uses_any(&self) -> bool {
        self.client == ANY || self.user == ANY || self.privilege == ANY
    }

    /// Whether any slot is the wildcard.
    #[must_use]
    pub fn uses_wildcard(&self) -> bool {
        self.client == WILDCARD || self.user == WILDCARD || self.privilege == WILDCARD
    }

    /// Count of non-wildcard slots (0..=3); higher is more specific.
    #[must_use]
    pub fn specificity(&self) -> u8 {
        [&self.client, &self.user, &self.privilege]
            .iter()
            .filter(|slot| slot.as_str() != WILDCARD)
            .count() as u8
    }

    /// Whether this *stored* key matches a literal query key: each stored
    /// slot equals the query slot or is the wildcard.
    #[must_use]
    pub fn matches_query(&self, query: &PolicyKey) -> bool {
        slot_matches(&self.client, &query.client)
            && slot_matches(&self.user, &query.user)
            && slot_matches(&self.privilege, &query.privilege)
    }

    /// Whether this stored key passes an admin *filter*, where an any-marker
    /// slot matches both literals and wildcards, and every other filter slot
    /// must be equal.
    #[must_use]
    pub fn matches_filter(&self, filter: &PolicyKey) -> bool {
        filter_slot_matches(&self.client, &filter.client)
            && filter_slot_matches(&self.user, &filter.user)
            && filter_slot_matches(&self.privilege, &filter.privilege)
    }
}

fn slot_matches(stored: &str, query: &str) -> bool {
    stored == WILDCARD || stored == query
}

fn filter_slot_matches(stored: &str, filter: &str) -> bool {
    filter == ANY || stored == filter
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({};{};{})", self.client, self.user, self.privilege)
    }
}

/// One rule inside a bucket: a key and the result it maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub key: PolicyKey,
    pub result: PolicyResult,
}

impl Policy {
    #[must_use]
    pub fn new(key: PolicyKey, result: PolicyResult) -> Self {
        Self { key, result }
    }
}

/// A wall-clock instant as carried on the monitor channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: i64,
}

impl Timestamp {
    /// The current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let elapsed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: elapsed.as_secs() as i64,
            nsec: i64::from(elapsed.subsec_nanos()),
        }
    }
}

/// One audit record: the key checked, the terminal decision, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorEntry {
    pub key: PolicyKey,
    pub result: PolicyType,
    pub timestamp: Timestamp,
}

impl MonitorEntry {
    #[must_use]
    pub fn new(key: PolicyKey, result: PolicyType, timestamp: Timestamp) -> Self {
        Self {
            key,
            result,
            timestamp,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn key(c: &str, u: &str, p: &str) -> PolicyKey {
        PolicyKey::new(c, u, p).unwrap()
    }

    #[test]
    fn key_rejects_empty_slot() {
        assert!(matches!(
            PolicyKey::new("", "u", "p"),
            Err(KeyError::EmptySlot { slot: "client" })
        ));
        assert!(matches!(
            PolicyKey::new("c", "", "p"),
            Err(KeyError::EmptySlot { slot: "user" })
        ));
    }

    #[test]
    fn key_rejects_oversized_slot() {
        let long = "x".repeat(MAX_SLOT_LEN + 1);
        assert!(matches!(
            PolicyKey::new("c", "u", long),
            Err(KeyError::SlotTooLong { slot: "privilege", .. })
        ));
    }

    #[test]
    fn specificity_counts_literals() {
        assert_eq!(key("c", "u", "p").specificity(), 3);
        assert_eq!(key("c", "*", "p").specificity(), 2);
        assert_eq!(key("*", "*", "p").specificity(), 1);
        assert_eq!(key("*", "*", "*").specificity(), 0);
    }

    #[test]
    fn wildcard_matches_any_query_value() {
        let stored = key("c", "*", "p");
        assert!(stored.matches_query(&key("c", "alice", "p")));
        assert!(stored.matches_query(&key("c", "bob", "p")));
        assert!(!stored.matches_query(&key("other", "alice", "p")));
    }

    #[test]
    fn literal_wildcard_in_query_matches_only_stored_wildcard() {
        // A query slot containing "*" is a literal from the matcher's view:
        // it equals only a stored wildcard slot.
        let stored = key("c", "u", "p");
        assert!(!stored.matches_query(&key("c", "*", "p")));
        let stored_wild = key("c", "*", "p");
        assert!(stored_wild.matches_query(&key("c", "*", "p")));
    }

    #[test]
    fn any_filter_matches_literal_and_wildcard() {
        let literal = key("c", "alice", "p");
        let wild = key("c", "*", "p");
        let filter = key("c", ANY, "p");
        assert!(literal.matches_filter(&filter));
        assert!(wild.matches_filter(&filter));

        // A wildcard filter slot is exact: it matches stored wildcards only.
        let wild_filter = key("c", WILDCARD, "p");
        assert!(wild.matches_filter(&wild_filter));
        assert!(!literal.matches_filter(&wild_filter));
    }

    #[test]
    fn result_constructors_carry_expected_metadata() {
        assert_eq!(PolicyResult::deny().metadata(), "");
        assert_eq!(PolicyResult::bucket("extra").metadata(), "extra");
        assert_eq!(
            PolicyResult::bucket("extra").policy_type(),
            PolicyType::BUCKET
        );
    }

    #[test]
    fn plugin_range_excludes_reserved() {
        assert!(!PolicyType::DENY.is_plugin_range());
        assert!(!PolicyType::NONE.is_plugin_range());
        assert!(!PolicyType::BUCKET.is_plugin_range());
        assert!(!PolicyType::ALLOW.is_plugin_range());
        assert!(PolicyType::new(0x0002).is_plugin_range());
        assert!(PolicyType::new(0xFFFD).is_plugin_range());
    }
}
