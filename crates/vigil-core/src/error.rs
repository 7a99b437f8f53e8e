//! Error types for `vigil-core`.
//!
//! Each variant carries enough context to diagnose the failure without a
//! debugger. The mapping from these internal kinds to the numeric codes that
//! cross the wire lives in [`crate::code`].

use crate::types::PolicyType;

/// Errors from building or validating a policy key.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// A key slot was empty.
    #[error("{slot} must not be empty")]
    EmptySlot { slot: &'static str },

    /// A key slot exceeded the 16 KiB bound.
    #[error("{slot} too long: {len} bytes")]
    SlotTooLong { slot: &'static str, len: usize },

    /// The any-marker appeared where only literals or wildcards are valid.
    #[error("any-marker is only valid in admin filters")]
    AnyNotAllowed,
}

/// Errors from policy store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The named bucket does not exist.
    #[error("bucket not found: {id:?}")]
    BucketNotExists { id: String },

    /// A bucket with that id already exists.
    #[error("bucket already exists: {id:?}")]
    BucketExists { id: String },

    /// The root bucket cannot be removed.
    #[error("the root bucket cannot be removed")]
    RootBucketDeletion,

    /// The root bucket's default cannot abstain.
    #[error("the root bucket's default cannot be NONE")]
    RootBucketNone,

    /// A bucket default must be terminal, never a link.
    #[error("a bucket default cannot be BUCKET")]
    DefaultIsLink,

    /// Bucket ids become file names; only a restricted charset is accepted.
    #[error("invalid bucket id: {id:?}")]
    InvalidBucketId { id: String },

    /// A bucket may not link to itself at a single hop.
    #[error("bucket {id:?} cannot link to itself")]
    SelfLink { id: String },

    /// The policy type is neither built-in nor registered by a plugin.
    #[error("unknown policy type: {policy_type}")]
    UnknownPolicyType { policy_type: PolicyType },

    /// The policy's metadata does not fit its type.
    #[error("invalid policy: {reason}")]
    InvalidPolicy { reason: String },

    /// A key failed validation.
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Errors from the plugin registry.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The type lies outside the plugin-assignable range.
    #[error("policy type {policy_type} is reserved")]
    TypeReserved { policy_type: PolicyType },

    /// Another plugin already owns the type.
    #[error("policy type {policy_type} is already registered")]
    AlreadyRegistered { policy_type: PolicyType },

    /// No plugin owns the type.
    #[error("no plugin registered for policy type {policy_type}")]
    NotFound { policy_type: PolicyType },
}
