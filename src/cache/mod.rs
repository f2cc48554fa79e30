// ============================================================================
// Transaction-Scoped Entity Cache
// ============================================================================
//
// One cache per active transaction. Within that scope an entity identity maps
// to exactly one row: a second `add` for the same identity fails, and every
// `get` hands back the same shared row, so two business calls in one
// transaction always read their own writes.
//
// Rows carry ordered slots, one per persistent field or relationship. Slots
// start empty and are populated either by entity code (dirtying the row) or
// by a fault handler (leaving it clean).
// ============================================================================

pub mod flush;
pub mod registry;

pub use flush::{DeclarationOrder, EnforceRelationships, FlushItem, FlushStrategy};
pub use registry::CacheRegistry;

use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::{ContainerError, EntityKey, Result, Value};
use crate::persistence::{FaultHandler, PersistenceCommand, WriteOp};
use crate::transaction::TransactionId;

/// A row shared between every reference to one identity inside a transaction
pub type SharedRow = Arc<Mutex<CacheRow>>;

/// One slot of a cache row: a persistent attribute or a relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    /// Not yet populated; a fault is needed before reading
    Empty,
    Scalar(Value),
    Related(Vec<EntityKey>),
}

/// Persistence state of a cache row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowState {
    /// Created in this transaction, not yet written
    New,
    /// Matches the backing store
    Clean,
    /// Modified since last write
    Dirty,
    /// Removed in this transaction; flush turns this into a delete
    Removed,
}

/// In-memory representation of one entity's persisted data within one
/// transaction scope.
#[derive(Debug, Clone)]
pub struct CacheRow {
    identity: EntityKey,
    slots: Vec<Slot>,
    state: RowState,
    /// Whether the backing store holds this row. Set on load and after
    /// every successful write; a removed row that was never persisted must
    /// not flush as a delete.
    persisted: bool,
}

impl CacheRow {
    pub fn new(identity: EntityKey, slot_count: usize, state: RowState) -> Self {
        Self {
            identity,
            slots: vec![Slot::Empty; slot_count],
            persisted: state == RowState::Clean,
            state,
        }
    }

    pub fn identity(&self) -> &EntityKey {
        &self.identity
    }

    /// Rebind the row to its final identity once the key generator has run
    pub(crate) fn rekey(&mut self, identity: EntityKey) {
        self.identity = identity;
    }

    pub fn state(&self) -> RowState {
        self.state
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if slot >= self.slots.len() {
            return Err(ContainerError::Execution(format!(
                "Slot {} out of range for {} ({} slots)",
                slot,
                self.identity,
                self.slots.len()
            )));
        }
        Ok(())
    }

    pub fn slot(&self, slot: usize) -> Result<&Slot> {
        self.check_slot(slot)?;
        Ok(&self.slots[slot])
    }

    pub fn is_populated(&self, slot: usize) -> bool {
        !matches!(self.slots.get(slot), Some(Slot::Empty) | None)
    }

    pub fn has_empty_slots(&self) -> bool {
        self.slots.iter().any(|s| matches!(s, Slot::Empty))
    }

    /// Read a scalar slot. Empty slots are a fault-ordering bug on the
    /// caller's side and surface as a system error.
    pub fn value(&self, slot: usize) -> Result<&Value> {
        match self.slot(slot)? {
            Slot::Scalar(v) => Ok(v),
            Slot::Empty => Err(ContainerError::Execution(format!(
                "Slot {} of {} read before fault",
                slot, self.identity
            ))),
            Slot::Related(_) => Err(ContainerError::Execution(format!(
                "Slot {} of {} is a relationship, not an attribute",
                slot, self.identity
            ))),
        }
    }

    /// Read a relationship slot. An empty slot reads as "no related keys".
    pub fn related(&self, slot: usize) -> Result<Vec<EntityKey>> {
        match self.slot(slot)? {
            Slot::Related(keys) => Ok(keys.clone()),
            Slot::Empty => Ok(Vec::new()),
            Slot::Scalar(_) => Err(ContainerError::Execution(format!(
                "Slot {} of {} is an attribute, not a relationship",
                slot, self.identity
            ))),
        }
    }

    /// Write a scalar slot through entity code, dirtying a clean row
    pub fn set_value(&mut self, slot: usize, value: Value) -> Result<()> {
        self.check_slot(slot)?;
        if self.state == RowState::Removed {
            return Err(ContainerError::AlreadyRemoved(self.identity.to_string()));
        }
        self.slots[slot] = Slot::Scalar(value);
        if self.state == RowState::Clean {
            self.state = RowState::Dirty;
        }
        Ok(())
    }

    /// Write a relationship slot through entity code
    pub fn set_related(&mut self, slot: usize, keys: Vec<EntityKey>) -> Result<()> {
        self.check_slot(slot)?;
        if self.state == RowState::Removed {
            return Err(ContainerError::AlreadyRemoved(self.identity.to_string()));
        }
        self.slots[slot] = Slot::Related(keys);
        if self.state == RowState::Clean {
            self.state = RowState::Dirty;
        }
        Ok(())
    }

    /// Fault-populate a slot in place without dirtying the row.
    /// No-op when the slot is already populated.
    pub fn populate(&mut self, slot: usize, value: Slot) -> Result<()> {
        self.check_slot(slot)?;
        if matches!(self.slots[slot], Slot::Empty) {
            self.slots[slot] = value;
        }
        Ok(())
    }

    /// All entity keys referenced from relationship slots
    pub fn referenced_keys(&self) -> Vec<EntityKey> {
        self.slots
            .iter()
            .filter_map(|s| match s {
                Slot::Related(keys) => Some(keys.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Clear every relationship slot, returning what was related
    pub fn clear_relationships(&mut self) -> Vec<EntityKey> {
        let mut cleared = Vec::new();
        for slot in self.slots.iter_mut() {
            if let Slot::Related(keys) = slot {
                cleared.append(keys);
                *slot = Slot::Related(Vec::new());
            }
        }
        cleared
    }

    pub fn mark_removed(&mut self) {
        self.state = RowState::Removed;
    }

    pub fn mark_clean(&mut self) {
        self.state = RowState::Clean;
        self.persisted = true;
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }
}

/// Per-transaction cache of entity rows keyed by global identity.
pub struct TransactionScopedCache {
    txn_id: TransactionId,
    rows: HashMap<EntityKey, SharedRow>,
    /// Identities in association order, for declaration-order flushing
    order: Vec<EntityKey>,
    flush_strategy: Arc<dyn FlushStrategy>,
}

impl TransactionScopedCache {
    pub fn new(txn_id: TransactionId, flush_strategy: Arc<dyn FlushStrategy>) -> Self {
        Self {
            txn_id,
            rows: HashMap::new(),
            order: Vec::new(),
            flush_strategy,
        }
    }

    pub fn txn_id(&self) -> TransactionId {
        self.txn_id
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Look up the row associated with an identity in this scope
    pub fn get(&self, identity: &EntityKey) -> Option<SharedRow> {
        self.rows.get(identity).cloned()
    }

    /// Associate a row with an identity.
    ///
    /// # Errors
    /// `AlreadyAssociated` if the identity already has a row in this scope.
    pub fn add(&mut self, row: CacheRow) -> Result<SharedRow> {
        let identity = row.identity().clone();
        if self.rows.contains_key(&identity) {
            return Err(ContainerError::AlreadyAssociated(identity.to_string()));
        }
        let shared: SharedRow = Arc::new(Mutex::new(row));
        self.rows.insert(identity.clone(), Arc::clone(&shared));
        self.order.push(identity);
        Ok(shared)
    }

    /// Drop an identity's row from this scope entirely
    pub fn remove(&mut self, identity: &EntityKey) -> Option<SharedRow> {
        self.order.retain(|k| k != identity);
        self.rows.remove(identity)
    }

    /// Resolve an identity to a populated row, fault-loading if needed.
    ///
    /// A missing identity gets a placeholder row which the handler populates
    /// in place; if the handler reports no backing data the placeholder is
    /// discarded and `NotFound` is returned. A present, fully-populated row
    /// skips the handler entirely.
    pub async fn fault(
        &mut self,
        identity: &EntityKey,
        slot_count: usize,
        handler: &dyn FaultHandler,
    ) -> Result<SharedRow> {
        let (shared, was_absent) = match self.get(identity) {
            Some(row) => (row, false),
            None => {
                let row = CacheRow::new(identity.clone(), slot_count, RowState::Clean);
                (self.add(row)?, true)
            }
        };

        {
            let mut row = shared.lock().await;
            if row.has_empty_slots() && row.state() != RowState::Removed {
                let found = handler.populate(&mut row).await?;
                if !found && was_absent {
                    drop(row);
                    self.remove(identity);
                    return Err(ContainerError::NotFound(identity.to_string()));
                }
            }
        }

        Ok(shared)
    }

    /// Write every NEW/DIRTY row through its persistence command and delete
    /// every previously-persisted REMOVED row, in flush-strategy order.
    ///
    /// Returns the identities that were inserted or updated, so lifecycle
    /// hooks can run per stored row.
    pub async fn flush(
        &mut self,
        commands: &HashMap<String, Arc<dyn PersistenceCommand>>,
    ) -> Result<Vec<EntityKey>> {
        let mut items = Vec::new();
        let mut never_stored = Vec::new();
        for (seq, identity) in self.order.iter().enumerate() {
            let Some(shared) = self.rows.get(identity) else {
                continue;
            };
            let row = shared.lock().await;
            let op = match row.state() {
                RowState::New => WriteOp::Insert,
                RowState::Dirty => WriteOp::Update,
                RowState::Removed if row.is_persisted() => WriteOp::Delete,
                // Created and removed inside this transaction: the store
                // never saw it, so there is nothing to delete.
                RowState::Removed => {
                    never_stored.push(identity.clone());
                    continue;
                }
                RowState::Clean => continue,
            };
            items.push(FlushItem {
                op,
                identity: identity.clone(),
                references: row.referenced_keys(),
                seq,
            });
        }

        for identity in &never_stored {
            self.remove(identity);
        }

        let ordered = self.flush_strategy.order(items);
        debug!(
            "flushing {} row(s) for {} ({} cached)",
            ordered.len(),
            self.txn_id,
            self.rows.len()
        );

        let mut stored = Vec::new();
        for item in ordered {
            let Some(shared) = self.rows.get(&item.identity) else {
                continue;
            };
            let mut row = shared.lock().await;
            if let Some(command) = commands.get(&item.identity.component) {
                command.execute(item.op, &row).await?;
            } else {
                debug!(
                    "no persistence command for '{}'; skipping write of {}",
                    item.identity.component, item.identity
                );
            }
            match item.op {
                WriteOp::Insert | WriteOp::Update => {
                    row.mark_clean();
                    stored.push(item.identity.clone());
                }
                WriteOp::Delete => {
                    drop(row);
                    self.remove(&item.identity);
                }
            }
        }

        Ok(stored)
    }

    /// Throw away every cached row without writing anything back
    pub fn discard(&mut self) {
        self.rows.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn key(component: &str, id: i64) -> EntityKey {
        EntityKey::new(component, Value::Integer(id))
    }

    fn cache() -> TransactionScopedCache {
        TransactionScopedCache::new(TransactionId::new(), Arc::new(DeclarationOrder))
    }

    #[tokio::test]
    async fn test_add_then_get_returns_same_row() {
        let mut cache = cache();
        let row = CacheRow::new(key("Order", 1), 2, RowState::New);

        let added = cache.add(row).unwrap();
        let fetched = cache.get(&key("Order", 1)).unwrap();

        assert!(Arc::ptr_eq(&added, &fetched));
    }

    #[tokio::test]
    async fn test_duplicate_add_fails() {
        let mut cache = cache();
        cache
            .add(CacheRow::new(key("Order", 1), 2, RowState::New))
            .unwrap();

        let err = cache
            .add(CacheRow::new(key("Order", 1), 2, RowState::New))
            .unwrap_err();
        assert!(matches!(err, ContainerError::AlreadyAssociated(_)));
    }

    #[tokio::test]
    async fn test_row_dirty_tracking() {
        let mut row = CacheRow::new(key("Order", 1), 2, RowState::Clean);
        assert_eq!(row.state(), RowState::Clean);

        row.set_value(0, Value::Integer(10)).unwrap();
        assert_eq!(row.state(), RowState::Dirty);

        row.mark_clean();
        assert_eq!(row.state(), RowState::Clean);
    }

    #[tokio::test]
    async fn test_new_row_stays_new_on_write() {
        let mut row = CacheRow::new(key("Order", 1), 1, RowState::New);
        row.set_value(0, Value::Integer(10)).unwrap();
        assert_eq!(row.state(), RowState::New);
    }

    #[tokio::test]
    async fn test_removed_row_rejects_writes() {
        let mut row = CacheRow::new(key("Order", 1), 1, RowState::Clean);
        row.mark_removed();

        let err = row.set_value(0, Value::Integer(1)).unwrap_err();
        assert!(matches!(err, ContainerError::AlreadyRemoved(_)));
    }

    #[tokio::test]
    async fn test_populate_is_idempotent() {
        let mut row = CacheRow::new(key("Order", 1), 1, RowState::Clean);

        row.populate(0, Slot::Scalar(Value::Integer(1))).unwrap();
        row.populate(0, Slot::Scalar(Value::Integer(99))).unwrap();

        assert_eq!(row.value(0).unwrap(), &Value::Integer(1));
        assert_eq!(row.state(), RowState::Clean);
    }

    #[tokio::test]
    async fn test_unpopulated_read_is_error() {
        let row = CacheRow::new(key("Order", 1), 1, RowState::Clean);
        assert!(row.value(0).is_err());
    }

    struct CountingFault {
        calls: std::sync::atomic::AtomicUsize,
        found: bool,
    }

    #[async_trait]
    impl FaultHandler for CountingFault {
        async fn populate(&self, row: &mut CacheRow) -> Result<bool> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.found {
                for slot in 0..row.slot_count() {
                    row.populate(slot, Slot::Scalar(Value::Integer(slot as i64)))?;
                }
            }
            Ok(self.found)
        }
    }

    #[tokio::test]
    async fn test_fault_loads_once_per_identity() {
        let mut cache = cache();
        let handler = CountingFault {
            calls: std::sync::atomic::AtomicUsize::new(0),
            found: true,
        };

        let first = cache.fault(&key("Order", 1), 2, &handler).await.unwrap();
        let second = cache.fault(&key("Order", 1), 2, &handler).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(handler.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(first.lock().await.value(0).unwrap(), &Value::Integer(0));
    }

    #[tokio::test]
    async fn test_fault_missing_identity_is_not_found() {
        let mut cache = cache();
        let handler = CountingFault {
            calls: std::sync::atomic::AtomicUsize::new(0),
            found: false,
        };

        let err = cache
            .fault(&key("Order", 404), 2, &handler)
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::NotFound(_)));
        assert!(cache.get(&key("Order", 404)).is_none());
    }

    struct RecordingCommand {
        writes: tokio::sync::Mutex<Vec<(WriteOp, EntityKey)>>,
    }

    #[async_trait]
    impl PersistenceCommand for RecordingCommand {
        async fn execute(&self, op: WriteOp, row: &CacheRow) -> Result<()> {
            self.writes.lock().await.push((op, row.identity().clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_flush_writes_dirty_rows_once() {
        let mut cache = cache();

        let mut clean = CacheRow::new(key("Order", 1), 1, RowState::Clean);
        clean.populate(0, Slot::Scalar(Value::Integer(0))).unwrap();
        cache.add(clean).unwrap();

        let fresh = CacheRow::new(key("Order", 2), 1, RowState::New);
        cache.add(fresh).unwrap();

        let dirty_row = cache.get(&key("Order", 1)).unwrap();
        dirty_row
            .lock()
            .await
            .set_value(0, Value::Integer(42))
            .unwrap();

        let command = Arc::new(RecordingCommand {
            writes: tokio::sync::Mutex::new(Vec::new()),
        });
        let mut commands: HashMap<String, Arc<dyn PersistenceCommand>> = HashMap::new();
        commands.insert("Order".to_string(), Arc::clone(&command) as _);

        let stored = cache.flush(&commands).await.unwrap();
        assert_eq!(stored.len(), 2);

        let writes = command.writes.lock().await;
        assert_eq!(writes.len(), 2);
        assert!(writes.contains(&(WriteOp::Update, key("Order", 1))));
        assert!(writes.contains(&(WriteOp::Insert, key("Order", 2))));
        drop(writes);

        // A second flush has nothing left to write
        let stored_again = cache.flush(&commands).await.unwrap();
        assert!(stored_again.is_empty());
        assert_eq!(command.writes.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_flush_deletes_removed_rows() {
        let mut cache = cache();
        let mut row = CacheRow::new(key("Order", 1), 1, RowState::Clean);
        row.populate(0, Slot::Scalar(Value::Integer(0))).unwrap();
        row.mark_removed();
        cache.add(row).unwrap();

        let command = Arc::new(RecordingCommand {
            writes: tokio::sync::Mutex::new(Vec::new()),
        });
        let mut commands: HashMap<String, Arc<dyn PersistenceCommand>> = HashMap::new();
        commands.insert("Order".to_string(), Arc::clone(&command) as _);

        let stored = cache.flush(&commands).await.unwrap();
        assert!(stored.is_empty());
        assert_eq!(
            command.writes.lock().await.as_slice(),
            &[(WriteOp::Delete, key("Order", 1))]
        );
        assert!(cache.get(&key("Order", 1)).is_none());
    }

    #[tokio::test]
    async fn test_flush_skips_rows_created_and_removed_in_scope() {
        let mut cache = cache();
        let mut row = CacheRow::new(key("Order", 1), 1, RowState::New);
        row.set_value(0, Value::Integer(10)).unwrap();
        row.mark_removed();
        cache.add(row).unwrap();

        let command = Arc::new(RecordingCommand {
            writes: tokio::sync::Mutex::new(Vec::new()),
        });
        let mut commands: HashMap<String, Arc<dyn PersistenceCommand>> = HashMap::new();
        commands.insert("Order".to_string(), Arc::clone(&command) as _);

        // The store never saw this row, so nothing may reach the command
        let stored = cache.flush(&commands).await.unwrap();
        assert!(stored.is_empty());
        assert!(command.writes.lock().await.is_empty());
        assert!(cache.get(&key("Order", 1)).is_none());
    }

    #[tokio::test]
    async fn test_discard_drops_everything_unwritten() {
        let mut cache = cache();
        cache
            .add(CacheRow::new(key("Order", 1), 1, RowState::New))
            .unwrap();

        cache.discard();
        assert!(cache.is_empty());
    }
}
