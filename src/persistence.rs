// ============================================================================
// Persistence Collaborators
// ============================================================================
//
// The container never generates SQL or touches a driver. It talks to the
// persistence layer through these narrow interfaces: a fault handler that
// lazily populates row slots, a command that writes row images back, and a
// key generator consulted on entity create.
// ============================================================================

use async_trait::async_trait;

use crate::cache::CacheRow;
use crate::core::{Result, Value};

/// Lazy-loading strategy invoked when an accessor touches an unpopulated
/// slot, or when an identity is first referenced inside a transaction.
///
/// Implementations populate the row in place and must be idempotent: a
/// second fault against an already-populated row is a no-op (the cache skips
/// the call entirely when nothing is empty).
#[async_trait]
pub trait FaultHandler: Send + Sync {
    /// Populate the row's empty slots from the backing store.
    ///
    /// Returns `false` when the identity has no backing data at all, in
    /// which case the cache discards the placeholder row.
    async fn populate(&self, row: &mut CacheRow) -> Result<bool>;
}

/// The kind of write a flush pushes through a persistence command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Insert,
    Update,
    Delete,
}

/// Opaque write-back command supplied by the persistence layer, one per
/// entity component.
#[async_trait]
pub trait PersistenceCommand: Send + Sync {
    async fn execute(&self, op: WriteOp, row: &CacheRow) -> Result<()>;
}

/// Outcome of asking the key generator for an entity's primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyDecision {
    /// The generator minted a fresh key
    Generated(Value),
    /// Application code already assigned the key during the create callback
    ApplicationDefined,
}

/// Primary-key source consulted after the business create callback ran.
pub trait KeyGenerator: Send + Sync {
    fn next_key(&self, row: &CacheRow) -> Result<KeyDecision>;
}

/// Key generator backed by a monotonic counter; the default when a
/// deployment supplies none.
pub struct SequenceKeyGenerator {
    next: std::sync::atomic::AtomicI64,
}

impl SequenceKeyGenerator {
    pub fn new() -> Self {
        Self {
            next: std::sync::atomic::AtomicI64::new(1),
        }
    }

    pub fn starting_at(start: i64) -> Self {
        Self {
            next: std::sync::atomic::AtomicI64::new(start),
        }
    }
}

impl Default for SequenceKeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyGenerator for SequenceKeyGenerator {
    fn next_key(&self, _row: &CacheRow) -> Result<KeyDecision> {
        let id = self.next.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(KeyDecision::Generated(Value::Integer(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheRow, RowState};
    use crate::core::EntityKey;

    #[test]
    fn test_sequence_key_generator_is_monotonic() {
        let generator = SequenceKeyGenerator::starting_at(10);
        let row = CacheRow::new(EntityKey::new("Order", Value::Null), 1, RowState::New);

        let first = generator.next_key(&row).unwrap();
        let second = generator.next_key(&row).unwrap();

        assert_eq!(first, KeyDecision::Generated(Value::Integer(10)));
        assert_eq!(second, KeyDecision::Generated(Value::Integer(11)));
    }
}
