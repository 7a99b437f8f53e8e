//! Registry for plugin-owned policy types.
//!
//! A plugin owns one or more types in the open range and turns a stored
//! result of that type into a terminal decision — either immediately, or by
//! asking the service to query an agent out of band. Each registered type
//! carries a generation counter; bumping it logically evicts every cached
//! decision derived from that type.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::PluginError;
use crate::types::{PolicyKey, PolicyResult, PolicyType};

/// Generation carried by decisions not derived from any plugin. Built-in
/// results never go stale.
pub const BUILTIN_GENERATION: u64 = 0;

/// Outcome of a plugin's first look at a stored result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginCheckOutcome {
    /// The decision is final.
    Ready(PolicyResult),
    /// The named agent must be asked; `payload` is handed to it verbatim.
    AgentRequired { agent_type: String, payload: String },
    /// The plugin failed; the service degrades this to DENY.
    Error,
}

/// Outcome of feeding an agent's reply back into the plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginUpdateOutcome {
    /// The decision is final.
    Ready(PolicyResult),
    /// The plugin failed; the service degrades this to DENY.
    Error,
}

/// A handler for one or more plugin policy types.
pub trait ServicePlugin: Send + Sync {
    /// Resolve a stored result of an owned type for `key`.
    fn check(&self, key: &PolicyKey, seed: &PolicyResult) -> PluginCheckOutcome;

    /// Fold an agent's reply into a final decision.
    fn update(&self, key: &PolicyKey, agent_payload: &str) -> PluginUpdateOutcome;
}

/// Human-readable description of a policy type, as listed to admins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDescription {
    pub policy_type: PolicyType,
    pub name: String,
}

impl PolicyDescription {
    #[must_use]
    pub fn new(policy_type: PolicyType, name: impl Into<String>) -> Self {
        Self {
            policy_type,
            name: name.into(),
        }
    }
}

struct PluginEntry {
    plugin: Arc<dyn ServicePlugin>,
    description: String,
    generation: u64,
}

/// Dispatch table for plugin policy types.
pub struct PluginRegistry {
    entries: BTreeMap<PolicyType, PluginEntry>,
}

impl PluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Register a plugin for a type in the open range.
    ///
    /// # Errors
    ///
    /// - [`PluginError::TypeReserved`] outside `[0x0002, 0xFFFD]`.
    /// - [`PluginError::AlreadyRegistered`] if the type is taken.
    pub fn register(
        &mut self,
        policy_type: PolicyType,
        description: impl Into<String>,
        plugin: Arc<dyn ServicePlugin>,
    ) -> Result<(), PluginError> {
        if !policy_type.is_plugin_range() {
            return Err(PluginError::TypeReserved { policy_type });
        }
        if self.entries.contains_key(&policy_type) {
            return Err(PluginError::AlreadyRegistered { policy_type });
        }
        self.entries.insert(
            policy_type,
            PluginEntry {
                plugin,
                description: description.into(),
                // Start above the built-in generation so a plugin entry can
                // never be mistaken for one.
                generation: BUILTIN_GENERATION + 1,
            },
        );
        debug!(policy_type = %policy_type, "plugin registered");
        Ok(())
    }

    /// The handler owning `policy_type`.
    pub fn get(&self, policy_type: PolicyType) -> Result<Arc<dyn ServicePlugin>, PluginError> {
        self.entries
            .get(&policy_type)
            .map(|entry| Arc::clone(&entry.plugin))
            .ok_or(PluginError::NotFound { policy_type })
    }

    /// Current generation for a type; built-in terminals report the fixed
    /// built-in generation, unknown plugin types report it too (there is
    /// nothing to go stale).
    #[must_use]
    pub fn generation(&self, policy_type: PolicyType) -> u64 {
        self.entries
            .get(&policy_type)
            .map_or(BUILTIN_GENERATION, |entry| entry.generation)
    }

    /// Whether the type is usable in stored policies: a built-in terminal,
    /// the link type, or a registered plugin type.
    #[must_use]
    pub fn is_known_type(&self, policy_type: PolicyType) -> bool {
        policy_type.is_builtin_terminal()
            || policy_type == PolicyType::BUCKET
            || self.entries.contains_key(&policy_type)
    }

    /// Bump one plugin's generation, staling its cached decisions.
    pub fn invalidate(&mut self, policy_type: PolicyType) {
        if let Some(entry) = self.entries.get_mut(&policy_type) {
            entry.generation += 1;
        }
    }

    /// Bump every plugin's generation.
    pub fn invalidate_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.generation += 1;
        }
        debug!(plugins = self.entries.len(), "all plugin generations bumped");
    }

    /// Descriptions of every known type: the built-ins followed by the
    /// registered plugin types in type order.
    #[must_use]
    pub fn descriptions(&self) -> Vec<PolicyDescription> {
        let mut all = vec![
            PolicyDescription::new(PolicyType::DENY, "Deny"),
            PolicyDescription::new(PolicyType::NONE, "None"),
            PolicyDescription::new(PolicyType::ALLOW, "Allow"),
        ];
        all.extend(
            self.entries
                .iter()
                .map(|(ty, entry)| PolicyDescription::new(*ty, entry.description.clone())),
        );
        all
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("types", &self.entries.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct EchoPlugin;

    impl ServicePlugin for EchoPlugin {
        fn check(&self, _key: &PolicyKey, seed: &PolicyResult) -> PluginCheckOutcome {
            PluginCheckOutcome::Ready(seed.clone())
        }

        fn update(&self, _key: &PolicyKey, _agent_payload: &str) -> PluginUpdateOutcome {
            PluginUpdateOutcome::Ready(PolicyResult::allow())
        }
    }

    const ASK: PolicyType = PolicyType::new(0x0010);

    #[test]
    fn register_rejects_reserved_types() {
        let mut registry = PluginRegistry::new();
        for reserved in [
            PolicyType::DENY,
            PolicyType::NONE,
            PolicyType::BUCKET,
            PolicyType::ALLOW,
        ] {
            assert!(matches!(
                registry.register(reserved, "X", Arc::new(EchoPlugin)),
                Err(PluginError::TypeReserved { .. })
            ));
        }
    }

    #[test]
    fn register_rejects_duplicate_type() {
        let mut registry = PluginRegistry::new();
        registry.register(ASK, "Ask", Arc::new(EchoPlugin)).unwrap();
        assert!(matches!(
            registry.register(ASK, "Ask2", Arc::new(EchoPlugin)),
            Err(PluginError::AlreadyRegistered { .. })
        ));
    }

    #[test]
    fn descriptions_always_include_builtins() {
        let mut registry = PluginRegistry::new();
        registry.register(ASK, "AskUser", Arc::new(EchoPlugin)).unwrap();
        let descriptions = registry.descriptions();
        assert_eq!(descriptions.len(), 4);
        assert_eq!(descriptions[0].name, "Deny");
        assert_eq!(descriptions[1].name, "None");
        assert_eq!(descriptions[2].name, "Allow");
        assert_eq!(descriptions[3].name, "AskUser");
    }

    #[test]
    fn invalidate_all_bumps_generations() {
        let mut registry = PluginRegistry::new();
        registry.register(ASK, "Ask", Arc::new(EchoPlugin)).unwrap();
        let before = registry.generation(ASK);
        registry.invalidate_all();
        assert_eq!(registry.generation(ASK), before + 1);
        // Built-ins never move.
        assert_eq!(registry.generation(PolicyType::DENY), BUILTIN_GENERATION);
    }

    #[test]
    fn unknown_type_is_rejected_for_storage() {
        let registry = PluginRegistry::new();
        assert!(registry.is_known_type(PolicyType::ALLOW));
        assert!(registry.is_known_type(PolicyType::BUCKET));
        assert!(!registry.is_known_type(ASK));
    }
}
