//! Collaborators, capabilities and the static capability registry.

use crate::config::DispatchConfig;
use crate::error::DispatchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Opaque identifier of a provider or remote agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollaboratorId(String);

impl CollaboratorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollaboratorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CollaboratorId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CollaboratorId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Task-type label a collaborator advertises
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Capability {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Capability {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Result of an orchestrated invocation
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub value: Value,
    /// Answered from a cache without reaching the collaborator
    pub cached: bool,
}

impl Invocation {
    pub fn fresh(value: Value) -> Self {
        Self {
            value,
            cached: false,
        }
    }

    pub fn cached(value: Value) -> Self {
        Self {
            value,
            cached: true,
        }
    }
}

/// Anything that can run a task: a local call, an HTTP provider or a remote agent.
#[async_trait]
pub trait Collaborator: Send + Sync {
    fn id(&self) -> &CollaboratorId;

    async fn invoke(&self, capability: &Capability, payload: Value)
        -> Result<Value, DispatchError>;

    /// Invocation on behalf of the orchestrator. With `fresh` set the answer
    /// must come from the collaborator itself, never from a cache; the
    /// returned [`Invocation`] says whether it did.
    async fn invoke_tracked(
        &self,
        capability: &Capability,
        payload: Value,
        _fresh: bool,
    ) -> Result<Invocation, DispatchError> {
        self.invoke(capability, payload).await.map(Invocation::fresh)
    }
}

#[derive(Debug, Clone)]
struct RegistryEntry {
    id: CollaboratorId,
    capabilities: HashSet<Capability>,
}

/// Collaborator → capabilities table, in registration order.
///
/// Filled once at startup; the orchestrator only ever reads it afterwards.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    entries: Vec<RegistryEntry>,
    index: HashMap<CollaboratorId, usize>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the table from `[collaborators.<id>]` sections (sorted by id).
    pub fn from_config(config: &DispatchConfig) -> Self {
        let mut registry = Self::new();
        for (id, settings) in &config.collaborators {
            registry.register(
                CollaboratorId::from(id.as_str()),
                settings.capabilities.iter().map(|c| Capability::from(c.as_str())),
            );
        }
        registry
    }

    /// Add capabilities for `id`. Re-registering merges into the existing entry
    /// and keeps its original position.
    pub fn register<I>(&mut self, id: CollaboratorId, capabilities: I)
    where
        I: IntoIterator<Item = Capability>,
    {
        match self.index.get(&id) {
            Some(&pos) => self.entries[pos].capabilities.extend(capabilities),
            None => {
                self.index.insert(id.clone(), self.entries.len());
                self.entries.push(RegistryEntry {
                    id,
                    capabilities: capabilities.into_iter().collect(),
                });
            }
        }
    }

    /// Collaborators advertising `capability`, in registration order
    pub fn capable_of(&self, capability: &Capability) -> Vec<CollaboratorId> {
        self.entries
            .iter()
            .filter(|entry| entry.capabilities.contains(capability))
            .map(|entry| entry.id.clone())
            .collect()
    }

    pub fn capabilities_of(&self, id: &CollaboratorId) -> Option<&HashSet<Capability>> {
        self.index.get(id).map(|&pos| &self.entries[pos].capabilities)
    }

    /// Registration position, used as the last selection tie-break
    pub fn position(&self, id: &CollaboratorId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn contains(&self, id: &CollaboratorId) -> bool {
        self.index.contains_key(id)
    }

    pub fn collaborators(&self) -> impl Iterator<Item = &CollaboratorId> {
        self.entries.iter().map(|entry| &entry.id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(names: &[&str]) -> Vec<Capability> {
        names.iter().map(|n| Capability::from(*n)).collect()
    }

    #[test]
    fn test_capable_of_preserves_registration_order() {
        let mut registry = CapabilityRegistry::new();
        registry.register("zeta".into(), caps(&["coding"]));
        registry.register("alpha".into(), caps(&["coding", "vision"]));
        registry.register("mid".into(), caps(&["vision"]));

        let coding = registry.capable_of(&"coding".into());
        assert_eq!(coding, vec![CollaboratorId::from("zeta"), "alpha".into()]);
        assert_eq!(registry.position(&"mid".into()), Some(2));
        assert!(registry.capable_of(&"audio".into()).is_empty());
    }

    #[test]
    fn test_register_merges_capabilities() {
        let mut registry = CapabilityRegistry::new();
        registry.register("agent".into(), caps(&["read_note"]));
        registry.register("agent".into(), caps(&["write_note"]));

        assert_eq!(registry.len(), 1);
        let set = registry.capabilities_of(&"agent".into()).expect("registered");
        assert!(set.contains(&Capability::from("read_note")));
        assert!(set.contains(&Capability::from("write_note")));
    }

    #[test]
    fn test_from_config_reads_collaborator_sections() {
        let config = DispatchConfig::from_toml_str(
            r#"
            [collaborators.gemini]
            capabilities = ["analysis", "vision"]

            [collaborators.claude]
            capabilities = ["coding"]
            "#,
        )
        .expect("valid config");

        let registry = CapabilityRegistry::from_config(&config);
        assert_eq!(registry.len(), 2);
        // BTreeMap order
        assert_eq!(registry.position(&"claude".into()), Some(0));
        assert_eq!(
            registry.capable_of(&"vision".into()),
            vec![CollaboratorId::from("gemini")]
        );
    }

    #[test]
    fn test_ids_display_and_serialize_transparently() {
        let id = CollaboratorId::from("desktop-agent");
        assert_eq!(id.to_string(), "desktop-agent");
        assert_eq!(
            serde_json::to_string(&id).expect("serializes"),
            "\"desktop-agent\""
        );
    }
}
