/// Entity and transaction integration tests
///
/// Transaction-scoped caching, flush-on-commit, discard-on-rollback, and
/// cascade removal, exercised through the public container API.
/// Run with: cargo test --test entity_transaction_tests
use async_trait::async_trait;
use rustcontainer::cache::{CacheRow, EnforceRelationships};
use rustcontainer::{
    AppError, ComponentDescriptor, Container, ContainerConfig, EntityKey, FaultHandler, Outcome,
    PersistenceCommand, Result, TxAttribute, Value, WriteOp, method_fn,
};
use std::sync::{Arc, Mutex};

/// Records every write the container pushes through it, in order.
#[derive(Default)]
struct RecordingStore {
    writes: Mutex<Vec<(WriteOp, EntityKey)>>,
}

impl RecordingStore {
    fn writes(&self) -> Vec<(WriteOp, EntityKey)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl PersistenceCommand for RecordingStore {
    async fn execute(&self, op: WriteOp, row: &CacheRow) -> Result<()> {
        self.writes
            .lock()
            .unwrap()
            .push((op, row.identity().clone()));
        Ok(())
    }
}

/// Serves a fixed backing row for one identity.
struct FixedRow {
    key: Value,
    total: i64,
}

#[async_trait]
impl FaultHandler for FixedRow {
    async fn populate(&self, row: &mut CacheRow) -> Result<bool> {
        if row.identity().key != self.key {
            return Ok(false);
        }
        row.populate(0, rustcontainer::cache::Slot::Scalar(Value::Integer(self.total)))?;
        Ok(true)
    }
}

fn order_bean() -> ComponentDescriptor {
    ComponentDescriptor::entity("Order")
        .field("total")
        .relationship(
            "lines",
            "LineItem",
            rustcontainer::Cardinality::Many,
            true,
        )
        .method(
            "create",
            TxAttribute::Required,
            method_fn(|ctx, args| {
                if let Some(row) = ctx.row.as_deref_mut() {
                    row.set_value(0, args.first().cloned().unwrap_or(Value::Null))
                        .map_err(|e| AppError::new(e.to_string()))?;
                }
                Ok(Value::Null)
            }),
        )
        .method(
            "total",
            TxAttribute::Required,
            method_fn(|ctx, _args| {
                let row = ctx.row.as_deref().expect("entity row");
                row.value(0).cloned().map_err(|e| AppError::new(e.to_string()))
            }),
        )
        .method(
            "setTotal",
            TxAttribute::Required,
            method_fn(|ctx, args| {
                let row = ctx.row.as_deref_mut().expect("entity row");
                row.set_value(0, args.first().cloned().unwrap_or(Value::Null))
                    .map_err(|e| AppError::new(e.to_string()))?;
                Ok(Value::Null)
            }),
        )
        .method(
            "attach",
            TxAttribute::Required,
            method_fn(|ctx, args| {
                let row = ctx.row.as_deref_mut().expect("entity row");
                let keys = args
                    .iter()
                    .map(|k| EntityKey::new("LineItem", k.clone()))
                    .collect();
                row.set_related(1, keys)
                    .map_err(|e| AppError::new(e.to_string()))?;
                Ok(Value::Null)
            }),
        )
}

fn line_bean() -> ComponentDescriptor {
    ComponentDescriptor::entity("LineItem").field("sku").method(
        "create",
        TxAttribute::Required,
        method_fn(|ctx, args| {
            if let Some(row) = ctx.row.as_deref_mut() {
                row.set_value(0, args.first().cloned().unwrap_or(Value::Null))
                    .map_err(|e| AppError::new(e.to_string()))?;
            }
            Ok(Value::Null)
        }),
    )
}

fn success_value(outcome: Outcome) -> Value {
    match outcome {
        Outcome::Success(value) => value,
        other => panic!("expected success, got {:?}", other),
    }
}

#[tokio::test]
async fn test_flush_on_commit_writes_through_command() {
    let container = Container::new(ContainerConfig::new()).await.unwrap();
    container.deploy(order_bean()).await.unwrap();
    let store = Arc::new(RecordingStore::default());
    container.register_persistence("Order", Arc::clone(&store) as Arc<dyn PersistenceCommand>).await;

    // Required with no inherited transaction: the container begins and
    // commits around the create, so the flush happens here
    let key = success_value(
        container
            .create_entity("Order", "create", vec![Value::Integer(99)], None)
            .await,
    );

    let writes = store.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].0, WriteOp::Insert);
    assert_eq!(writes[0].1, EntityKey::new("Order", key));

    container.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rollback_discards_pending_writes() {
    let container = Container::new(ContainerConfig::new()).await.unwrap();
    container.deploy(order_bean()).await.unwrap();
    let store = Arc::new(RecordingStore::default());
    container.register_persistence("Order", Arc::clone(&store) as Arc<dyn PersistenceCommand>).await;

    let txn = container.begin_transaction().await.unwrap();
    success_value(
        container
            .create_entity("Order", "create", vec![Value::Integer(1)], Some(txn))
            .await,
    );
    container.rollback_transaction(txn).await.unwrap();

    assert!(store.writes().is_empty());
    assert_eq!(container.stats().await.cache_scopes, 0);

    container.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_create_then_remove_in_same_transaction_writes_nothing() {
    let container = Container::new(ContainerConfig::new()).await.unwrap();
    container.deploy(order_bean()).await.unwrap();
    let store = Arc::new(RecordingStore::default());
    container.register_persistence("Order", Arc::clone(&store) as Arc<dyn PersistenceCommand>).await;

    let txn = container.begin_transaction().await.unwrap();
    let key = success_value(
        container
            .create_entity("Order", "create", vec![Value::Integer(3)], Some(txn))
            .await,
    );
    success_value(container.remove_entity("Order", key, Some(txn)).await);
    container.commit_transaction(txn).await.unwrap();

    // The store never saw the row, so commit must not issue a delete
    assert!(store.writes().is_empty());

    container.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_same_transaction_shares_one_row() {
    let container = Container::new(ContainerConfig::new()).await.unwrap();
    container.deploy(order_bean()).await.unwrap();

    let txn = container.begin_transaction().await.unwrap();
    let key = success_value(
        container
            .create_entity("Order", "create", vec![Value::Integer(10)], Some(txn))
            .await,
    );

    // A write in one call is visible to a read in the next, same scope
    success_value(
        container
            .invoke_entity(
                "Order",
                key.clone(),
                "setTotal",
                vec![Value::Integer(55)],
                Some(txn),
            )
            .await,
    );
    let total = success_value(
        container
            .invoke_entity("Order", key, "total", Vec::new(), Some(txn))
            .await,
    );
    assert_eq!(total, Value::Integer(55));

    container.commit_transaction(txn).await.unwrap();
    container.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_key_is_application_level() {
    struct SameKey;
    impl rustcontainer::KeyGenerator for SameKey {
        fn next_key(
            &self,
            _row: &CacheRow,
        ) -> Result<rustcontainer::KeyDecision> {
            Ok(rustcontainer::KeyDecision::Generated(Value::Integer(1)))
        }
    }

    let container = Container::new(ContainerConfig::new()).await.unwrap();
    container.deploy(order_bean()).await.unwrap();
    container.register_key_generator("Order", Arc::new(SameKey)).await;

    let txn = container.begin_transaction().await.unwrap();
    success_value(
        container
            .create_entity("Order", "create", vec![Value::Integer(1)], Some(txn))
            .await,
    );
    let outcome = container
        .create_entity("Order", "create", vec![Value::Integer(2)], Some(txn))
        .await;
    assert!(matches!(outcome, Outcome::Application(_)));

    // The duplicate did not poison the transaction
    assert!(!container.transactions().is_rollback_only(txn).await);
    container.commit_transaction(txn).await.unwrap();
    container.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fault_handler_loads_missing_rows() {
    let container = Container::new(ContainerConfig::new()).await.unwrap();
    container.deploy(order_bean()).await.unwrap();
    container
        .register_fault_handler(
            "Order",
            Arc::new(FixedRow {
                key: Value::Integer(7),
                total: 120,
            }),
        )
        .await;

    let total = success_value(
        container
            .invoke_entity("Order", Value::Integer(7), "total", Vec::new(), None)
            .await,
    );
    assert_eq!(total, Value::Integer(120));

    // An identity the handler does not know is a not-found, reported as an
    // application-level condition
    let outcome = container
        .invoke_entity("Order", Value::Integer(8), "total", Vec::new(), None)
        .await;
    assert!(matches!(outcome, Outcome::Application(_)));

    container.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cascade_delete_orders_deletes_child_first() {
    let container = Container::builder(ContainerConfig::new())
        .flush_strategy(Arc::new(EnforceRelationships))
        .build()
        .await
        .unwrap();
    container.deploy(order_bean()).await.unwrap();
    container.deploy(line_bean()).await.unwrap();
    // One recorder for both components, so cross-component ordering shows
    let store = Arc::new(RecordingStore::default());
    container.register_persistence("Order", Arc::clone(&store) as Arc<dyn PersistenceCommand>).await;
    container.register_persistence("LineItem", Arc::clone(&store) as Arc<dyn PersistenceCommand>).await;

    // Create and commit a graph: one order with one cascade-deleted line
    let txn = container.begin_transaction().await.unwrap();
    let line_key = success_value(
        container
            .create_entity("LineItem", "create", vec![Value::from("sku-9")], Some(txn))
            .await,
    );
    let order_key = success_value(
        container
            .create_entity("Order", "create", vec![Value::Integer(10)], Some(txn))
            .await,
    );
    success_value(
        container
            .invoke_entity(
                "Order",
                order_key.clone(),
                "attach",
                vec![line_key.clone()],
                Some(txn),
            )
            .await,
    );
    container.commit_transaction(txn).await.unwrap();

    // Referenced row inserted before the row pointing at it
    assert_eq!(
        store.writes(),
        vec![
            (WriteOp::Insert, EntityKey::new("LineItem", line_key.clone())),
            (WriteOp::Insert, EntityKey::new("Order", order_key.clone())),
        ]
    );

    // Remove the order in a second transaction; teach it the rows again
    container
        .register_fault_handler(
            "Order",
            Arc::new(GraphFault {
                order_key: order_key.clone(),
                line_key: line_key.clone(),
            }),
        )
        .await;
    container
        .register_fault_handler(
            "LineItem",
            Arc::new(LineFault {
                line_key: line_key.clone(),
            }),
        )
        .await;

    let txn = container.begin_transaction().await.unwrap();
    success_value(
        container
            .remove_entity("Order", order_key.clone(), Some(txn))
            .await,
    );
    container.commit_transaction(txn).await.unwrap();

    // Both rows deleted, cascade target before the row that referenced it
    let writes = store.writes();
    assert_eq!(
        &writes[2..],
        &[
            (WriteOp::Delete, EntityKey::new("LineItem", line_key)),
            (WriteOp::Delete, EntityKey::new("Order", order_key)),
        ]
    );

    container.shutdown().await.unwrap();
}

/// Backs the order row (with its relationship) for the removal transaction.
struct GraphFault {
    order_key: Value,
    line_key: Value,
}

#[async_trait]
impl FaultHandler for GraphFault {
    async fn populate(&self, row: &mut CacheRow) -> Result<bool> {
        if row.identity().key != self.order_key {
            return Ok(false);
        }
        row.populate(0, rustcontainer::cache::Slot::Scalar(Value::Integer(10)))?;
        row.populate(
            1,
            rustcontainer::cache::Slot::Related(vec![EntityKey::new(
                "LineItem",
                self.line_key.clone(),
            )]),
        )?;
        Ok(true)
    }
}

struct LineFault {
    line_key: Value,
}

#[async_trait]
impl FaultHandler for LineFault {
    async fn populate(&self, row: &mut CacheRow) -> Result<bool> {
        if row.identity().key != self.line_key {
            return Ok(false);
        }
        row.populate(
            0,
            rustcontainer::cache::Slot::Scalar(Value::from("sku-9")),
        )?;
        Ok(true)
    }
}

#[tokio::test]
async fn test_after_store_runs_per_flushed_row() {
    let stored = Arc::new(Mutex::new(0usize));
    let stored_cb = Arc::clone(&stored);
    let bean = ComponentDescriptor::entity("Audited")
        .field("value")
        .after_store(Arc::new(move |_| {
            *stored_cb.lock().unwrap() += 1;
            Ok(())
        }))
        .method(
            "create",
            TxAttribute::Required,
            method_fn(|ctx, args| {
                if let Some(row) = ctx.row.as_deref_mut() {
                    row.set_value(0, args.first().cloned().unwrap_or(Value::Null))
                        .map_err(|e| AppError::new(e.to_string()))?;
                }
                Ok(Value::Null)
            }),
        );

    let container = Container::new(ContainerConfig::new()).await.unwrap();
    container.deploy(bean).await.unwrap();

    let txn = container.begin_transaction().await.unwrap();
    for i in 0..3 {
        success_value(
            container
                .create_entity("Audited", "create", vec![Value::Integer(i)], Some(txn))
                .await,
        );
    }
    assert_eq!(*stored.lock().unwrap(), 0);

    container.commit_transaction(txn).await.unwrap();
    assert_eq!(*stored.lock().unwrap(), 3);

    container.shutdown().await.unwrap();
}
