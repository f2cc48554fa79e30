use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::Value;

/// Opaque identity of one managed instance (one stateful conversation or one
/// pooled entity context).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Mint a fresh identity
    pub fn new() -> Self {
        InstanceId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "inst_{}", self.0.simple())
    }
}

/// Global identity of a persisted entity row: component type plus primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub component: String,
    pub key: Value,
}

impl EntityKey {
    pub fn new(component: impl Into<String>, key: Value) -> Self {
        Self {
            component: component.into(),
            key,
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.component, self.key)
    }
}

/// Conversational state of a stateful instance: named values, serialized
/// wholesale on passivation.
pub type StateMap = BTreeMap<String, Value>;

/// Identity of one in-flight invocation, used to track guard ownership and
/// reentrancy along a single logical call chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvocationId(Uuid);

impl InvocationId {
    pub fn new() -> Self {
        InvocationId(Uuid::new_v4())
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InvocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "call_{}", self.0.simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_ids_are_unique() {
        let a = InstanceId::new();
        let b = InstanceId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_entity_key_display() {
        let key = EntityKey::new("Order", Value::Integer(7));
        assert_eq!(key.to_string(), "Order[7]");
    }

    #[test]
    fn test_entity_key_equality() {
        let a = EntityKey::new("Order", Value::Integer(7));
        let b = EntityKey::new("Order", Value::Integer(7));
        let c = EntityKey::new("Customer", Value::Integer(7));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
