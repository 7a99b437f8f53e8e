//! Bulk policy input.
//!
//! One record per line in the persisted format prefixed with the target
//! bucket: `bucket;client;user;privilege;type;metadata`. The type field
//! accepts the built-in names (`allow`, `deny`, `bucket`), `0x`-prefixed
//! hex, or decimal. Empty lines and `#` comment lines are skipped.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};

use vigil_core::types::{Policy, PolicyKey, PolicyResult, PolicyType};

/// Parse a policy type spelled as a name or a number.
pub fn parse_type(spec: &str) -> Result<PolicyType> {
    match spec.to_ascii_lowercase().as_str() {
        "deny" => return Ok(PolicyType::DENY),
        "none" => return Ok(PolicyType::NONE),
        "bucket" => return Ok(PolicyType::BUCKET),
        "allow" => return Ok(PolicyType::ALLOW),
        _ => {}
    }
    let raw = if let Some(hex) = spec.strip_prefix("0x").or_else(|| spec.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else {
        spec.parse()
    };
    raw.map(PolicyType::new)
        .map_err(|_| anyhow!("bad policy type {spec:?}"))
}

/// Parse bulk input into a set-policies insert batch.
pub fn parse_policies(input: &str) -> Result<BTreeMap<String, Vec<Policy>>> {
    let mut batch: BTreeMap<String, Vec<Policy>> = BTreeMap::new();

    for (index, line) in input.lines().enumerate() {
        let line_no = index + 1;
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }

        let mut fields = line.splitn(6, ';');
        let (Some(bucket), Some(client), Some(user), Some(privilege), Some(type_spec), Some(metadata)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            bail!("line {line_no}: expected bucket;client;user;privilege;type;metadata");
        };

        let policy_type =
            parse_type(type_spec).with_context(|| format!("line {line_no}"))?;
        let key = PolicyKey::new(client, user, privilege)
            .map_err(|err| anyhow!("line {line_no}: {err}"))?;
        batch
            .entry(bucket.to_owned())
            .or_default()
            .push(Policy::new(key, PolicyResult::new(policy_type, metadata)));
    }

    if batch.is_empty() {
        bail!("no policies in bulk input");
    }
    Ok(batch)
}
