// ============================================================================
// Cache Registry
// ============================================================================
//
// Maps each active transaction to its (lazily created) scoped cache and ties
// the cache's fate to the transaction outcome: flush on commit, discard on
// rollback. The tie is a registered transaction synchronization, so cache
// disposal needs no cooperation from the dispatch pipeline.
// ============================================================================

use async_trait::async_trait;
use log::{debug, error};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::{FlushStrategy, TransactionScopedCache};
use crate::core::{ContainerError, InvocationId, Result, StateMap};
use crate::descriptor::{DeploymentMap, MethodContext};
use crate::persistence::PersistenceCommand;
use crate::transaction::{TransactionId, TransactionManager, TransactionSynchronization};

type CacheMap = HashMap<TransactionId, Arc<Mutex<TransactionScopedCache>>>;
type CommandMap = HashMap<String, Arc<dyn PersistenceCommand>>;

pub struct CacheRegistry {
    caches: Arc<RwLock<CacheMap>>,
    flush_strategy: Arc<dyn FlushStrategy>,
    commands: Arc<RwLock<CommandMap>>,
    deployments: Arc<RwLock<DeploymentMap>>,
}

impl CacheRegistry {
    pub fn new(
        flush_strategy: Arc<dyn FlushStrategy>,
        deployments: Arc<RwLock<DeploymentMap>>,
    ) -> Self {
        Self {
            caches: Arc::new(RwLock::new(HashMap::new())),
            flush_strategy,
            commands: Arc::new(RwLock::new(HashMap::new())),
            deployments,
        }
    }

    /// Register the persistence command that writes a component's rows
    pub async fn register_command(
        &self,
        component: impl Into<String>,
        command: Arc<dyn PersistenceCommand>,
    ) {
        self.commands.write().await.insert(component.into(), command);
    }

    /// The cache for `txn_id`, if one has been created
    pub async fn get(&self, txn_id: TransactionId) -> Option<Arc<Mutex<TransactionScopedCache>>> {
        self.caches.read().await.get(&txn_id).cloned()
    }

    /// The cache for `txn_id`, created on first need.
    ///
    /// Creation registers a completion synchronization with the transaction,
    /// so the scope cannot outlive it.
    pub async fn ensure(
        &self,
        txn_id: TransactionId,
        tx_manager: &TransactionManager,
    ) -> Result<Arc<Mutex<TransactionScopedCache>>> {
        {
            let caches = self.caches.read().await;
            if let Some(cache) = caches.get(&txn_id) {
                return Ok(Arc::clone(cache));
            }
        }

        let mut caches = self.caches.write().await;
        // Raced another creator between the read and write locks
        if let Some(cache) = caches.get(&txn_id) {
            return Ok(Arc::clone(cache));
        }

        let cache = Arc::new(Mutex::new(TransactionScopedCache::new(
            txn_id,
            Arc::clone(&self.flush_strategy),
        )));

        tx_manager
            .register_synchronization(
                txn_id,
                Box::new(CacheCompletion {
                    txn_id,
                    cache: Arc::clone(&cache),
                    caches: Arc::clone(&self.caches),
                    commands: Arc::clone(&self.commands),
                    deployments: Arc::clone(&self.deployments),
                }),
            )
            .await?;

        caches.insert(txn_id, Arc::clone(&cache));
        debug!("created cache scope for {}", txn_id);
        Ok(cache)
    }

    /// Number of live cache scopes
    pub async fn scope_count(&self) -> usize {
        self.caches.read().await.len()
    }
}

/// Ties one cache scope to its transaction's completion.
struct CacheCompletion {
    txn_id: TransactionId,
    cache: Arc<Mutex<TransactionScopedCache>>,
    caches: Arc<RwLock<CacheMap>>,
    commands: Arc<RwLock<CommandMap>>,
    deployments: Arc<RwLock<DeploymentMap>>,
}

#[async_trait]
impl TransactionSynchronization for CacheCompletion {
    async fn before_completion(&self) -> Result<()> {
        let commands = self.commands.read().await.clone();
        let stored = {
            let mut cache = self.cache.lock().await;
            cache.flush(&commands).await?
        };

        // Stored rows get their after-store hook as part of the flush,
        // not per business call
        let deployments = self.deployments.read().await;
        for identity in stored {
            let Some(descriptor) = deployments.get(&identity.component) else {
                continue;
            };
            let Some(cb) = descriptor.callbacks.after_store.clone() else {
                continue;
            };
            let cache = self.cache.lock().await;
            if let Some(shared) = cache.get(&identity) {
                drop(cache);
                let mut row = shared.lock().await;
                let mut state = StateMap::new();
                let mut ctx = MethodContext {
                    invocation: InvocationId::new(),
                    state: &mut state,
                    row: Some(&mut row),
                };
                cb(&mut ctx).map_err(|message| ContainerError::Callback {
                    callback: "after_store".to_string(),
                    message,
                })?;
            }
        }

        Ok(())
    }

    async fn after_completion(&self, committed: bool) {
        if !committed {
            let mut cache = self.cache.lock().await;
            let discarded = cache.len();
            cache.discard();
            if discarded > 0 {
                debug!(
                    "discarded {} uncommitted row(s) for {}",
                    discarded, self.txn_id
                );
            }
        }

        let mut caches = self.caches.write().await;
        if caches.remove(&self.txn_id).is_none() {
            error!("cache scope for {} already gone at completion", self.txn_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheRow, DeclarationOrder, RowState, Slot};
    use crate::core::{EntityKey, Value};
    use crate::persistence::WriteOp;

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

    fn registry() -> CacheRegistry {
        CacheRegistry::new(
            Arc::new(DeclarationOrder),
            Arc::new(RwLock::new(DeploymentMap::new())),
        )
    }

    #[tokio::test]
    async fn test_scope_is_lazy_and_unique_per_transaction() {
        let tx_manager = TransactionManager::new();
        let registry = registry();
        let txn = tx_manager.begin().await.unwrap();

        assert!(registry.get(txn).await.is_none());

        let first = registry.ensure(txn, &tx_manager).await.unwrap();
        let second = registry.ensure(txn, &tx_manager).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.scope_count().await, 1);

        tx_manager.rollback(txn).await.unwrap();
        assert_eq!(registry.scope_count().await, 0);
    }

    #[tokio::test]
    async fn test_flush_on_commit() {
        let tx_manager = TransactionManager::new();
        let registry = registry();
        let command = Arc::new(RecordingCommand {
            writes: tokio::sync::Mutex::new(Vec::new()),
        });
        registry
            .register_command("Order", Arc::clone(&command) as _)
            .await;

        let txn = tx_manager.begin().await.unwrap();
        let cache = registry.ensure(txn, &tx_manager).await.unwrap();
        {
            let mut cache = cache.lock().await;
            let mut row = CacheRow::new(
                EntityKey::new("Order", Value::Integer(1)),
                1,
                RowState::Clean,
            );
            row.populate(0, Slot::Scalar(Value::Integer(5))).unwrap();
            row.set_value(0, Value::Integer(6)).unwrap();
            cache.add(row).unwrap();
        }

        tx_manager.commit(txn).await.unwrap();

        let writes = command.writes.lock().await;
        assert_eq!(
            writes.as_slice(),
            &[(WriteOp::Update, EntityKey::new("Order", Value::Integer(1)))]
        );
    }

    #[tokio::test]
    async fn test_discard_on_rollback() {
        let tx_manager = TransactionManager::new();
        let registry = registry();
        let command = Arc::new(RecordingCommand {
            writes: tokio::sync::Mutex::new(Vec::new()),
        });
        registry
            .register_command("Order", Arc::clone(&command) as _)
            .await;

        let txn = tx_manager.begin().await.unwrap();
        let cache = registry.ensure(txn, &tx_manager).await.unwrap();
        {
            let mut cache = cache.lock().await;
            let mut row = CacheRow::new(
                EntityKey::new("Order", Value::Integer(1)),
                1,
                RowState::Clean,
            );
            row.populate(0, Slot::Scalar(Value::Integer(5))).unwrap();
            row.set_value(0, Value::Integer(6)).unwrap();
            cache.add(row).unwrap();
        }

        tx_manager.rollback(txn).await.unwrap();

        assert!(command.writes.lock().await.is_empty());
        assert!(cache.lock().await.is_empty());
    }
}
