//! Client-side result interpretation.
//!
//! The daemon may answer a check with a plugin-owned policy type; an
//! interpreter turns that raw result into a terminal decision (and decides
//! whether it may be cached). The built-in naive interpreter handles the
//! terminal built-ins; applications embedding vigil register interpreters
//! for the plugin types they understand.

use std::collections::BTreeMap;
use std::sync::Arc;

use vigil_core::types::{PolicyResult, PolicyType};
use vigil_core::plugin::BUILTIN_GENERATION;

/// A terminal client-visible decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// Turns raw policy results into decisions.
pub trait ResultInterpreter: Send + Sync {
    /// Interpret a raw result; `None` when the type cannot be resolved
    /// client-side (treated as deny, never cached).
    fn interpret(&self, result: &PolicyResult) -> Option<Decision>;

    /// Whether a decision derived from this result may be cached.
    fn cacheable(&self, result: &PolicyResult) -> bool;
}

/// The built-in interpreter for ALLOW and DENY.
#[derive(Debug, Default)]
pub struct NaiveInterpreter;

impl ResultInterpreter for NaiveInterpreter {
    fn interpret(&self, result: &PolicyResult) -> Option<Decision> {
        match result.policy_type() {
            PolicyType::ALLOW => Some(Decision::Allow),
            PolicyType::DENY => Some(Decision::Deny),
            _ => None,
        }
    }

    fn cacheable(&self, _result: &PolicyResult) -> bool {
        true
    }
}

struct InterpreterEntry {
    interpreter: Arc<dyn ResultInterpreter>,
    generation: u64,
}

/// Interpreters by policy type, each with a generation counter that stales
/// cached decisions when bumped.
pub struct InterpreterRegistry {
    builtin: Arc<dyn ResultInterpreter>,
    entries: BTreeMap<PolicyType, InterpreterEntry>,
}

impl InterpreterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            builtin: Arc::new(NaiveInterpreter),
            entries: BTreeMap::new(),
        }
    }

    /// Register an interpreter for a plugin policy type.
    pub fn register(&mut self, policy_type: PolicyType, interpreter: Arc<dyn ResultInterpreter>) {
        self.entries.insert(
            policy_type,
            InterpreterEntry {
                interpreter,
                generation: BUILTIN_GENERATION + 1,
            },
        );
    }

    /// The interpreter responsible for a result's type.
    #[must_use]
    pub fn interpreter_for(&self, policy_type: PolicyType) -> Option<Arc<dyn ResultInterpreter>> {
        if policy_type.is_builtin_terminal() {
            return Some(Arc::clone(&self.builtin));
        }
        self.entries
            .get(&policy_type)
            .map(|entry| Arc::clone(&entry.interpreter))
    }

    /// Current generation for a type; built-ins never change.
    #[must_use]
    pub fn generation(&self, policy_type: PolicyType) -> u64 {
        self.entries
            .get(&policy_type)
            .map_or(BUILTIN_GENERATION, |entry| entry.generation)
    }

    /// Bump every registered interpreter's generation.
    pub fn invalidate_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.generation += 1;
        }
    }
}

impl Default for InterpreterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InterpreterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpreterRegistry")
            .field("types", &self.entries.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
