// ============================================================================
// RustContainer Library
// ============================================================================

pub mod cache;
pub mod config;
pub mod core;
pub mod descriptor;
pub mod dispatch;
pub mod entity;
pub mod instance;
pub mod passivation;
pub mod persistence;
pub mod security;
pub mod transaction;

// Re-export main types for convenience
pub use crate::config::ContainerConfig;
pub use crate::core::{
    AppError, ContainerError, EntityKey, InstanceId, Outcome, Result, StateMap, Value,
};
pub use crate::descriptor::{
    Callback, Cardinality, ComponentDescriptor, ComponentKind, MethodContext, TxAttribute,
    method_fn,
};
pub use crate::dispatch::{InvocationRequest, InvocationTarget};
pub use crate::persistence::{FaultHandler, KeyDecision, KeyGenerator, PersistenceCommand, WriteOp};
pub use crate::transaction::TransactionId;

use std::sync::Arc;

use log::info;
use tokio::sync::{Mutex, RwLock};

use crate::cache::{CacheRegistry, DeclarationOrder, FlushStrategy};
use crate::core::InvocationId;
use crate::descriptor::DeploymentMap;
use crate::dispatch::{
    BusinessDispatchStage, CacheScopeStage, ConnectionTrackingStage, DispatchPipeline,
    ExceptionTranslationStage, InstanceBindingStage, InvocationContext, SecurityStage,
    TransactionPolicyStage,
};
use crate::entity::EntityLifecycleEngine;
use crate::instance::{InstanceRegistry, RegistryStats};
use crate::passivation::{
    FilePassivationStore, MemoryPassivationStore, PassivationScheduler, PassivationStore,
    spawn_passivation_scheduler,
};
use crate::security::{AllowAll, SecurityGuard};
use crate::transaction::TransactionManager;

// ============================================================================
// High-level Container API
// ============================================================================

/// Runtime snapshot of the container population.
#[derive(Debug, Clone, Copy)]
pub struct ContainerStats {
    pub instances: RegistryStats,
    pub active_transactions: usize,
    pub cache_scopes: usize,
    pub deployed_components: usize,
}

/// Assembles a [`Container`] with non-default collaborators.
pub struct ContainerBuilder {
    config: ContainerConfig,
    flush_strategy: Arc<dyn FlushStrategy>,
    security: Arc<dyn SecurityGuard>,
    store: Option<Arc<dyn PassivationStore>>,
}

impl ContainerBuilder {
    pub fn flush_strategy(mut self, strategy: Arc<dyn FlushStrategy>) -> Self {
        self.flush_strategy = strategy;
        self
    }

    pub fn security(mut self, guard: Arc<dyn SecurityGuard>) -> Self {
        self.security = guard;
        self
    }

    pub fn passivation_store(mut self, store: Arc<dyn PassivationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn build(self) -> Result<Container> {
        self.config
            .validate()
            .map_err(ContainerError::Execution)?;

        let store: Arc<dyn PassivationStore> = match self.store {
            Some(store) => store,
            None => match &self.config.passivation_dir {
                Some(dir) => Arc::new(FilePassivationStore::new(dir)?),
                None => Arc::new(MemoryPassivationStore::new()),
            },
        };

        let deployments: Arc<RwLock<DeploymentMap>> = Arc::new(RwLock::new(DeploymentMap::new()));
        let tx_manager = Arc::new(TransactionManager::new());
        let caches = Arc::new(CacheRegistry::new(
            self.flush_strategy,
            Arc::clone(&deployments),
        ));
        let instances = Arc::new(InstanceRegistry::new(self.config.clone(), store));
        let engine = Arc::new(EntityLifecycleEngine::new());

        let pipeline = DispatchPipeline::builder()
            .stage(Arc::new(ExceptionTranslationStage))
            .stage(Arc::new(TransactionPolicyStage::new(Arc::clone(
                &tx_manager,
            ))))
            .stage(Arc::new(CacheScopeStage::new(
                Arc::clone(&caches),
                Arc::clone(&tx_manager),
            )))
            .stage(Arc::new(ConnectionTrackingStage))
            .stage(Arc::new(InstanceBindingStage::new(Arc::clone(&instances))))
            .stage(Arc::new(SecurityStage::new(self.security)))
            .stage(Arc::new(BusinessDispatchStage::new(
                Arc::clone(&engine),
                Arc::clone(&caches),
                Arc::clone(&deployments),
            )))
            .build();

        let scheduler = spawn_passivation_scheduler(
            Arc::clone(&instances),
            self.config.sweep_interval,
        );

        info!(
            "container up: {:?} stages, sweep every {:?}",
            pipeline.stage_names(),
            self.config.sweep_interval
        );

        Ok(Container {
            deployments,
            tx_manager,
            caches,
            instances,
            engine,
            pipeline,
            scheduler: Mutex::new(Some(scheduler)),
        })
    }
}

/// The component container: deploy descriptors, then create sessions and
/// invoke methods through it.
///
/// # Examples
///
/// ```
/// use rustcontainer::{Container, ContainerConfig, ComponentDescriptor, TxAttribute, Value, method_fn};
///
/// # tokio_test::block_on(async {
/// let container = Container::new(ContainerConfig::new()).await.unwrap();
///
/// container.deploy(
///     ComponentDescriptor::stateful("CartBean").method(
///         "addItem",
///         TxAttribute::Supports,
///         method_fn(|ctx, args| {
///             ctx.set("last", args.first().cloned().unwrap_or(Value::Null));
///             Ok(Value::Null)
///         }),
///     ),
/// ).await.unwrap();
///
/// let session = container.create_session("CartBean").await.unwrap();
/// let outcome = container
///     .invoke_session("CartBean", session, "addItem", vec![Value::from("apple")])
///     .await;
/// assert!(outcome.is_success());
/// container.shutdown().await.unwrap();
/// # });
/// ```
pub struct Container {
    deployments: Arc<RwLock<DeploymentMap>>,
    tx_manager: Arc<TransactionManager>,
    caches: Arc<CacheRegistry>,
    instances: Arc<InstanceRegistry>,
    engine: Arc<EntityLifecycleEngine>,
    pipeline: DispatchPipeline,
    scheduler: Mutex<Option<PassivationScheduler>>,
}

impl Container {
    /// Start a container with default collaborators: declaration-order
    /// flushing, allow-all security, and a passivation store chosen from
    /// the configuration.
    pub async fn new(config: ContainerConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    pub fn builder(config: ContainerConfig) -> ContainerBuilder {
        ContainerBuilder {
            config,
            flush_strategy: Arc::new(DeclarationOrder),
            security: Arc::new(AllowAll),
            store: None,
        }
    }

    // ------------------------------------------------------------------------
    // Deployment
    // ------------------------------------------------------------------------

    /// Deploy a component. Redeploying a name replaces the old descriptor
    /// for future calls; live instances keep the one they were created with.
    pub async fn deploy(&self, descriptor: ComponentDescriptor) -> Result<()> {
        descriptor.validate().map_err(ContainerError::Execution)?;
        let name = descriptor.name.clone();
        self.deployments
            .write()
            .await
            .insert(name.clone(), Arc::new(descriptor));
        info!("deployed component '{}'", name);
        Ok(())
    }

    /// Register the persistence command that writes one entity component's
    /// rows at flush time.
    pub async fn register_persistence(
        &self,
        component: &str,
        command: Arc<dyn PersistenceCommand>,
    ) {
        self.caches.register_command(component, command).await;
    }

    /// Register the fault handler that lazily loads one entity component's
    /// rows.
    pub async fn register_fault_handler(&self, component: &str, handler: Arc<dyn FaultHandler>) {
        self.engine.register_fault_handler(component, handler).await;
    }

    /// Register the key generator consulted when creating one entity
    /// component.
    pub async fn register_key_generator(&self, component: &str, generator: Arc<dyn KeyGenerator>) {
        self.engine
            .register_key_generator(component, generator)
            .await;
    }

    async fn descriptor(&self, component: &str) -> Result<Arc<ComponentDescriptor>> {
        self.deployments
            .read()
            .await
            .get(component)
            .cloned()
            .ok_or_else(|| {
                ContainerError::Execution(format!("Component '{}' is not deployed", component))
            })
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    /// Create a new stateful conversation and return its handle.
    pub async fn create_session(&self, component: &str) -> Result<InstanceId> {
        let descriptor = self.descriptor(component).await?;
        if descriptor.kind != ComponentKind::Stateful {
            return Err(ContainerError::Execution(format!(
                "Component '{}' is not stateful",
                component
            )));
        }
        self.instances.create(descriptor).await
    }

    /// Remove a conversation, running its pre-destroy callback.
    pub async fn remove_session(&self, session: InstanceId) -> Result<()> {
        self.instances.remove(session, InvocationId::new()).await
    }

    /// Invoke a business method on a conversation.
    pub async fn invoke_session(
        &self,
        component: &str,
        session: InstanceId,
        method: &str,
        args: Vec<Value>,
    ) -> Outcome {
        self.call(
            InvocationRequest {
                component: component.to_string(),
                method: method.to_string(),
                args,
                target: InvocationTarget::Session(session),
                caller: None,
                chain: None,
            },
            None,
        )
        .await
    }

    // ------------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------------

    /// Run an entity create method under a fresh (or the given) transaction.
    /// On success the outcome carries the new primary key.
    pub async fn create_entity(
        &self,
        component: &str,
        method: &str,
        args: Vec<Value>,
        txn: Option<TransactionId>,
    ) -> Outcome {
        self.call(
            InvocationRequest {
                component: component.to_string(),
                method: method.to_string(),
                args,
                target: InvocationTarget::None,
                caller: None,
                chain: None,
            },
            txn,
        )
        .await
    }

    /// Invoke a business method on an entity by primary key.
    pub async fn invoke_entity(
        &self,
        component: &str,
        key: Value,
        method: &str,
        args: Vec<Value>,
        txn: Option<TransactionId>,
    ) -> Outcome {
        self.call(
            InvocationRequest {
                component: component.to_string(),
                method: method.to_string(),
                args,
                target: InvocationTarget::Entity(key),
                caller: None,
                chain: None,
            },
            txn,
        )
        .await
    }

    /// Remove an entity (cascading where declared).
    pub async fn remove_entity(
        &self,
        component: &str,
        key: Value,
        txn: Option<TransactionId>,
    ) -> Outcome {
        self.invoke_entity(component, key, "remove", Vec::new(), txn)
            .await
    }

    /// Run a fully-specified invocation through the dispatch chain,
    /// optionally under a caller-managed transaction.
    pub async fn call(&self, request: InvocationRequest, txn: Option<TransactionId>) -> Outcome {
        let descriptor = match self.descriptor(&request.component).await {
            Ok(descriptor) => descriptor,
            Err(err) => return Outcome::System(err),
        };
        let mut ctx = InvocationContext::new(request).with_descriptor(descriptor);
        if let Some(txn) = txn {
            ctx = ctx.in_transaction(txn);
        }
        self.pipeline.run(&mut ctx).await
    }

    // ------------------------------------------------------------------------
    // Client-managed transactions
    // ------------------------------------------------------------------------

    pub async fn begin_transaction(&self) -> Result<TransactionId> {
        self.tx_manager.begin().await
    }

    pub async fn commit_transaction(&self, txn: TransactionId) -> Result<()> {
        self.tx_manager.commit(txn).await
    }

    pub async fn rollback_transaction(&self, txn: TransactionId) -> Result<()> {
        self.tx_manager.rollback(txn).await
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.tx_manager
    }

    // ------------------------------------------------------------------------
    // Lifecycle / stats
    // ------------------------------------------------------------------------

    pub async fn stats(&self) -> ContainerStats {
        ContainerStats {
            instances: self.instances.stats().await,
            active_transactions: self.tx_manager.active_count().await,
            cache_scopes: self.caches.scope_count().await,
            deployed_components: self.deployments.read().await.len(),
        }
    }

    /// Stop the sweep scheduler and destroy every live instance, granting
    /// pre-destroy callbacks the configured grace period.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(scheduler) = self.scheduler.lock().await.take() {
            scheduler.stop().await?;
        }
        self.instances.shutdown().await;
        info!("container shut down");
        Ok(())
    }
}
