//! The database text format.
//!
//! `buckets` index records: `id;type-hex;metadata`. Bucket file records:
//! `client;user;privilege;type-hex;metadata`. Fields separate on `;`,
//! records on `\n`; the metadata field is the remainder of the record and
//! may itself contain separators but never a newline. Policy types
//! serialise as `0x` followed by uppercase hex.

use vigil_core::types::{Policy, PolicyKey, PolicyResult, PolicyType};
use vigil_core::PolicyBucket;

use crate::error::ParseError;

/// Name of the index file.
pub const INDEX_FILE: &str = "buckets";

/// Prefix bucket file names carry in front of the bucket id.
pub const BUCKET_FILE_PREFIX: &str = "_";

/// The database-relative file name of a bucket's policy file.
#[must_use]
pub fn bucket_file_name(bucket_id: &str) -> String {
    format!("{BUCKET_FILE_PREFIX}{bucket_id}")
}

fn format_type(policy_type: PolicyType) -> String {
    format!("0x{:X}", policy_type.raw())
}

fn parse_type(field: &str) -> Option<PolicyType> {
    let hex = field.strip_prefix("0x").or_else(|| field.strip_prefix("0X"))?;
    u16::from_str_radix(hex, 16).ok().map(PolicyType::new)
}

/// One parsed index record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub bucket_id: String,
    pub default: PolicyResult,
}

/// Serialise the index: one record per bucket, in the iteration order of the
/// store (bucket-id order, which keeps dumps byte-stable).
pub fn serialize_index<'a>(buckets: impl Iterator<Item = &'a PolicyBucket>) -> String {
    let mut out = String::new();
    for bucket in buckets {
        out.push_str(bucket.id());
        out.push(';');
        out.push_str(&format_type(bucket.default_result().policy_type()));
        out.push(';');
        out.push_str(bucket.default_result().metadata());
        out.push('\n');
    }
    out
}

/// Parse the index file contents.
pub fn parse_index(content: &str) -> Result<Vec<IndexRecord>, ParseError> {
    let mut records = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let error = |reason: &str| ParseError {
            file: INDEX_FILE.to_owned(),
            line: index + 1,
            content: line.to_owned(),
            reason: reason.to_owned(),
        };

        let mut fields = line.splitn(3, ';');
        let (Some(id), Some(type_field), Some(metadata)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(error("expected id;type;metadata"));
        };
        let policy_type = parse_type(type_field)
            .ok_or_else(|| error("bad policy type, expected 0x-prefixed hex"))?;
        records.push(IndexRecord {
            bucket_id: id.to_owned(),
            default: PolicyResult::new(policy_type, metadata),
        });
    }
    Ok(records)
}

/// Serialise one bucket's policies, in key order.
#[must_use]
pub fn serialize_bucket(bucket: &PolicyBucket) -> String {
    let mut out = String::new();
    for policy in bucket.iter() {
        out.push_str(policy.key.client());
        out.push(';');
        out.push_str(policy.key.user());
        out.push(';');
        out.push_str(policy.key.privilege());
        out.push(';');
        out.push_str(&format_type(policy.result.policy_type()));
        out.push(';');
        out.push_str(policy.result.metadata());
        out.push('\n');
    }
    out
}

/// Parse one bucket file's policy records.
pub fn parse_bucket_policies(file_name: &str, content: &str) -> Result<Vec<Policy>, ParseError> {
    let mut policies = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let error = |reason: String| ParseError {
            file: file_name.to_owned(),
            line: index + 1,
            content: line.to_owned(),
            reason,
        };

        let mut fields = line.splitn(5, ';');
        let (Some(client), Some(user), Some(privilege), Some(type_field), Some(metadata)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(error(
                "expected client;user;privilege;type;metadata".to_owned(),
            ));
        };
        let policy_type = parse_type(type_field)
            .ok_or_else(|| error("bad policy type, expected 0x-prefixed hex".to_owned()))?;
        let key = PolicyKey::new(client, user, privilege)
            .map_err(|err| error(err.to_string()))?;
        policies.push(Policy::new(key, PolicyResult::new(policy_type, metadata)));
    }
    Ok(policies)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use vigil_core::{PolicyStore, ROOT_BUCKET};

    fn key(c: &str, u: &str, p: &str) -> PolicyKey {
        PolicyKey::new(c, u, p).unwrap()
    }

    #[test]
    fn index_round_trips() {
        let mut store = PolicyStore::new();
        store.create_bucket("extra", PolicyResult::none()).unwrap();
        store
            .create_bucket("other", PolicyResult::allow())
            .unwrap();

        let dumped = serialize_index(store.buckets());
        let records = parse_index(&dumped).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].bucket_id, ROOT_BUCKET);
        assert_eq!(records[0].default, PolicyResult::deny());
        assert_eq!(records[1].bucket_id, "extra");
        assert_eq!(records[1].default, PolicyResult::none());
    }

    #[test]
    fn index_types_use_uppercase_hex() {
        let mut store = PolicyStore::new();
        store.create_bucket("b", PolicyResult::allow()).unwrap();
        let dumped = serialize_index(store.buckets());
        assert!(dumped.contains(";0xFFFF;"), "dump was {dumped:?}");
        assert!(dumped.starts_with(";0x0;"), "dump was {dumped:?}");
    }

    #[test]
    fn bucket_records_round_trip() {
        let mut bucket = PolicyBucket::new("b", PolicyResult::deny()).unwrap();
        bucket.insert(Policy::new(key("app", "*", "net"), PolicyResult::allow()));
        bucket.insert(Policy::new(
            key("app", "alice", "net"),
            PolicyResult::bucket("extra"),
        ));
        bucket.insert(Policy::new(
            key("svc", "bob", "gps"),
            PolicyResult::new(PolicyType::new(0x0A), "ask payload"),
        ));

        let dumped = serialize_bucket(&bucket);
        let parsed = parse_bucket_policies("_b", &dumped).unwrap();
        assert_eq!(parsed.len(), 3);
        let mut rebuilt = PolicyBucket::new("b", PolicyResult::deny()).unwrap();
        for policy in parsed {
            rebuilt.insert(policy);
        }
        assert_eq!(serialize_bucket(&rebuilt), dumped);
    }

    #[test]
    fn metadata_keeps_embedded_separators() {
        let content = "c;u;p;0x0A;meta;with;semicolons\n";
        let parsed = parse_bucket_policies("_b", content).unwrap();
        assert_eq!(parsed[0].result.metadata(), "meta;with;semicolons");
    }

    #[test]
    fn empty_metadata_parses() {
        let content = "c;u;p;0xFFFF;\n";
        let parsed = parse_bucket_policies("_b", content).unwrap();
        assert_eq!(parsed[0].result, PolicyResult::allow());
    }

    #[test]
    fn parse_errors_carry_line_numbers() {
        let content = "c;u;p;0xFFFF;\nnot-a-record\n";
        let err = parse_bucket_policies("_b", content).unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.content, "not-a-record");

        let err = parse_index("bucket;deadbeef;\n").unwrap_err();
        assert_eq!(err.line, 1);
    }

    #[test]
    fn lowercase_hex_is_accepted_on_parse() {
        let parsed = parse_bucket_policies("_b", "c;u;p;0xffff;\n").unwrap();
        assert_eq!(parsed[0].result.policy_type(), PolicyType::ALLOW);
    }
}
