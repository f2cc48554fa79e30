// ============================================================================
// Pipeline Stages
// ============================================================================
//
// The concrete stages, listed outermost-first as the container assembles
// them: exception translation, transaction policy, cache scope, connection
// tracking, instance binding, security, business dispatch.
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, warn};

use super::{InvocationContext, InvocationTarget, Next, Stage};
use crate::cache::CacheRegistry;
use crate::core::{AppError, ContainerError, EntityKey, Outcome};
use crate::descriptor::{ComponentKind, DeploymentMap, MethodContext, TxAttribute};
use crate::entity::EntityLifecycleEngine;
use crate::instance::InstanceRegistry;
use crate::security::SecurityGuard;
use crate::transaction::TransactionManager;
use tokio::sync::RwLock;

// ----------------------------------------------------------------------------
// Exception translation
// ----------------------------------------------------------------------------

/// Outermost stage. Re-tags system outcomes that carry an application-class
/// condition, so a duplicate key surfaces to the caller the same way a
/// declared business error does.
pub struct ExceptionTranslationStage;

#[async_trait]
impl Stage for ExceptionTranslationStage {
    fn name(&self) -> &'static str {
        "exception-translation"
    }

    async fn call(&self, ctx: &mut InvocationContext, next: Next<'_>) -> Outcome {
        let outcome = next.run(ctx).await;
        match outcome {
            Outcome::System(ContainerError::Application(app)) => Outcome::Application(app),
            Outcome::System(err) if err.is_application() => {
                Outcome::Application(AppError::new(err.to_string()))
            }
            Outcome::System(err) => {
                error!(
                    "{}.{} failed: {}",
                    ctx.request.component, ctx.request.method, err
                );
                Outcome::System(err)
            }
            other => other,
        }
    }
}

// ----------------------------------------------------------------------------
// Transaction policy
// ----------------------------------------------------------------------------

/// Resolves the invoked method's transaction attribute against the inherited
/// transaction, beginning/suspending as the attribute demands, and completes
/// any transaction this stage began once the inner stages return.
///
/// A system outcome under an inherited transaction marks it rollback-only
/// instead of completing it; the transaction belongs to the caller.
pub struct TransactionPolicyStage {
    manager: Arc<TransactionManager>,
}

impl TransactionPolicyStage {
    pub fn new(manager: Arc<TransactionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Stage for TransactionPolicyStage {
    fn name(&self) -> &'static str {
        "transaction-policy"
    }

    async fn call(&self, ctx: &mut InvocationContext, next: Next<'_>) -> Outcome {
        let attribute = match ctx.descriptor() {
            Ok(descriptor) => descriptor
                .find_method(&ctx.request.method)
                .map(|m| m.tx_attribute)
                .unwrap_or(TxAttribute::Required),
            Err(err) => return Outcome::System(err),
        };

        let inherited = ctx.transaction;
        let began = match attribute {
            TxAttribute::Required => match inherited {
                Some(_) => None,
                None => match self.manager.begin().await {
                    Ok(txn) => Some(txn),
                    Err(err) => return Outcome::System(err),
                },
            },
            TxAttribute::RequiresNew => match self.manager.begin().await {
                Ok(txn) => Some(txn),
                Err(err) => return Outcome::System(err),
            },
            TxAttribute::Supports => None,
            TxAttribute::NotSupported => None,
            TxAttribute::Mandatory => {
                if inherited.is_none() {
                    return Outcome::System(ContainerError::NoTransaction(format!(
                        "{}.{} is Mandatory",
                        ctx.request.component, ctx.request.method
                    )));
                }
                None
            }
            TxAttribute::Never => {
                if inherited.is_some() {
                    return Outcome::System(ContainerError::Execution(format!(
                        "{}.{} is Never but a transaction is in scope",
                        ctx.request.component, ctx.request.method
                    )));
                }
                None
            }
        };

        // The inherited transaction is suspended for the duration whenever
        // this method runs under a different (or no) scope.
        ctx.transaction = match attribute {
            TxAttribute::NotSupported => None,
            _ => began.or(inherited),
        };
        ctx.owns_transaction = began.is_some();

        let outcome = next.run(ctx).await;

        // Application-class conditions are a normal return; only genuine
        // system failures poison a transaction.
        let failed = matches!(&outcome, Outcome::System(err) if !err.is_application());

        let outcome = if let Some(txn) = began {
            if failed {
                if let Err(err) = self.manager.rollback(txn).await {
                    warn!("rollback of {} failed: {}", txn, err);
                }
                outcome
            } else {
                match self.manager.commit(txn).await {
                    Ok(()) => outcome,
                    Err(err) => Outcome::System(err),
                }
            }
        } else {
            if failed {
                if let Some(txn) = inherited {
                    if ctx.transaction == Some(txn) {
                        if let Err(err) = self.manager.mark_rollback_only(txn).await {
                            warn!("could not mark {} rollback-only: {}", txn, err);
                        }
                    }
                }
            }
            outcome
        };

        // Resume whatever the caller had
        ctx.transaction = inherited;
        ctx.owns_transaction = false;
        outcome
    }
}

// ----------------------------------------------------------------------------
// Cache scope
// ----------------------------------------------------------------------------

/// Guarantees the active transaction has a cache scope before any entity
/// work runs inside it.
pub struct CacheScopeStage {
    caches: Arc<CacheRegistry>,
    manager: Arc<TransactionManager>,
}

impl CacheScopeStage {
    pub fn new(caches: Arc<CacheRegistry>, manager: Arc<TransactionManager>) -> Self {
        Self { caches, manager }
    }
}

#[async_trait]
impl Stage for CacheScopeStage {
    fn name(&self) -> &'static str {
        "cache-scope"
    }

    async fn call(&self, ctx: &mut InvocationContext, next: Next<'_>) -> Outcome {
        let is_entity = ctx
            .descriptor
            .as_ref()
            .map(|d| d.kind == ComponentKind::Entity)
            .unwrap_or(false);

        if is_entity {
            if let Some(txn) = ctx.transaction {
                if let Err(err) = self.caches.ensure(txn, &self.manager).await {
                    return Outcome::System(err);
                }
            }
        }

        next.run(ctx).await
    }
}

// ----------------------------------------------------------------------------
// Connection tracking
// ----------------------------------------------------------------------------

/// Releases any resources inner stages registered on the context, success
/// or not; an unwinding call can never strand a tracked connection.
pub struct ConnectionTrackingStage;

#[async_trait]
impl Stage for ConnectionTrackingStage {
    fn name(&self) -> &'static str {
        "connection-tracking"
    }

    async fn call(&self, ctx: &mut InvocationContext, next: Next<'_>) -> Outcome {
        let outcome = next.run(ctx).await;
        let tracked = std::mem::take(&mut ctx.tracked_connections);
        if !tracked.is_empty() {
            debug!(
                "released {} tracked connection(s) after {}",
                tracked.len(),
                ctx.invocation
            );
        }
        outcome
    }
}

// ----------------------------------------------------------------------------
// Instance binding
// ----------------------------------------------------------------------------

/// Checks the target stateful instance out of the registry (acquiring its
/// guard, reactivating as needed) and checks it back in afterwards. A system
/// outcome discards the instance: its state is no longer trustworthy.
///
/// Entity calls have no per-call instance and pass straight through.
pub struct InstanceBindingStage {
    registry: Arc<InstanceRegistry>,
}

impl InstanceBindingStage {
    pub fn new(registry: Arc<InstanceRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Stage for InstanceBindingStage {
    fn name(&self) -> &'static str {
        "instance-binding"
    }

    async fn call(&self, ctx: &mut InvocationContext, next: Next<'_>) -> Outcome {
        let is_stateful = ctx
            .descriptor
            .as_ref()
            .map(|d| d.kind == ComponentKind::Stateful)
            .unwrap_or(false);
        if !is_stateful {
            return next.run(ctx).await;
        }

        let id = match ctx.request.target {
            InvocationTarget::Session(id) => id,
            _ => {
                return Outcome::System(ContainerError::Execution(format!(
                    "Stateful call to '{}' names no instance",
                    ctx.request.component
                )));
            }
        };

        let entry = match self.registry.checkout(id, ctx.invocation, None).await {
            Ok(entry) => entry,
            Err(err) => return Outcome::System(err),
        };
        ctx.entry = Some(Arc::clone(&entry));

        let outcome = next.run(ctx).await;
        ctx.entry = None;

        let failed = matches!(&outcome, Outcome::System(err) if !err.is_application());
        if failed {
            // The instance ran into a system failure mid-call; its state is
            // no longer trustworthy
            let _ = entry.guard.release(ctx.invocation);
            if let Err(err) = self.registry.discard(id).await {
                warn!("could not discard {}: {}", id, err);
            }
        } else if let Err(err) = self.registry.checkin(&entry, ctx.invocation).await {
            warn!("checkin of {} failed: {}", id, err);
        }

        outcome
    }
}

// ----------------------------------------------------------------------------
// Security
// ----------------------------------------------------------------------------

/// Consults the deployed security guard just before business dispatch.
pub struct SecurityStage {
    guard: Arc<dyn SecurityGuard>,
}

impl SecurityStage {
    pub fn new(guard: Arc<dyn SecurityGuard>) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl Stage for SecurityStage {
    fn name(&self) -> &'static str {
        "security"
    }

    async fn call(&self, ctx: &mut InvocationContext, next: Next<'_>) -> Outcome {
        if let Err(err) = self.guard.check(ctx) {
            return Outcome::System(err);
        }
        next.run(ctx).await
    }
}

// ----------------------------------------------------------------------------
// Business dispatch
// ----------------------------------------------------------------------------

/// Terminal stage: looks the method up in the component's static dispatch
/// table and runs it, against conversational state for stateful components
/// or through the entity lifecycle engine for entities.
///
/// Entity routing is by method-name convention: `create*` methods allocate a
/// new identity, `remove` tears one down (with cascades), everything else
/// runs against the loaded row.
pub struct BusinessDispatchStage {
    engine: Arc<EntityLifecycleEngine>,
    caches: Arc<CacheRegistry>,
    deployments: Arc<RwLock<DeploymentMap>>,
}

impl BusinessDispatchStage {
    pub fn new(
        engine: Arc<EntityLifecycleEngine>,
        caches: Arc<CacheRegistry>,
        deployments: Arc<RwLock<DeploymentMap>>,
    ) -> Self {
        Self {
            engine,
            caches,
            deployments,
        }
    }

    async fn dispatch_stateful(&self, ctx: &mut InvocationContext) -> Outcome {
        let Some(entry) = ctx.entry.as_ref().map(Arc::clone) else {
            return Outcome::System(ContainerError::Execution(format!(
                "No instance bound for '{}'",
                ctx.request.component
            )));
        };

        let Some(method) = entry.descriptor.find_method(&ctx.request.method) else {
            return Outcome::System(ContainerError::Execution(format!(
                "No method '{}' on component '{}'",
                ctx.request.method, ctx.request.component
            )));
        };

        // The method runs against a snapshot of the conversation, not the
        // locked instance: holding the instance mutex across the call would
        // deadlock a method that re-enters its own session. Writes merge
        // back afterwards; on a key both frames wrote, this frame wins.
        let mut conversation = entry.instance.lock().await.conversation.clone();
        let mut method_ctx = MethodContext {
            invocation: ctx.invocation,
            state: &mut conversation,
            row: None,
        };
        let result = method.method.invoke(&mut method_ctx, &ctx.request.args).await;
        entry.instance.lock().await.conversation.extend(conversation);
        match result {
            Ok(value) => Outcome::Success(value),
            Err(app) => Outcome::Application(app),
        }
    }

    async fn dispatch_entity(&self, ctx: &mut InvocationContext) -> Outcome {
        let descriptor = match ctx.descriptor() {
            Ok(descriptor) => Arc::clone(descriptor),
            Err(err) => return Outcome::System(err),
        };

        let Some(txn) = ctx.transaction else {
            return Outcome::System(ContainerError::NoTransaction(format!(
                "Entity call {}.{} outside any transaction",
                ctx.request.component, ctx.request.method
            )));
        };
        let Some(cache) = self.caches.get(txn).await else {
            return Outcome::System(ContainerError::Execution(format!(
                "No cache scope for {}",
                txn
            )));
        };
        let mut cache = cache.lock().await;

        let method = ctx.request.method.clone();
        let args = ctx.request.args.clone();
        let result = match &ctx.request.target {
            InvocationTarget::Entity(key) => {
                let identity = EntityKey::new(&descriptor.name, key.clone());
                if method == "remove" {
                    let deployments = self.deployments.read().await.clone();
                    self.engine
                        .remove(&descriptor, &deployments, &mut cache, &identity, &mut ctx.scratch)
                        .await
                } else {
                    self.engine
                        .invoke(
                            &descriptor,
                            &mut cache,
                            &identity,
                            &method,
                            &args,
                            &mut ctx.scratch,
                        )
                        .await
                }
            }
            InvocationTarget::None if method.starts_with("create") => {
                self.engine
                    .create(&descriptor, &mut cache, &method, &args, &mut ctx.scratch)
                    .await
            }
            other => Err(ContainerError::Execution(format!(
                "Entity call {}.{} has unusable target {:?}",
                ctx.request.component, method, other
            ))),
        };

        Outcome::from_result(result)
    }
}

#[async_trait]
impl Stage for BusinessDispatchStage {
    fn name(&self) -> &'static str {
        "business-dispatch"
    }

    async fn call(&self, ctx: &mut InvocationContext, _next: Next<'_>) -> Outcome {
        let kind = match ctx.descriptor() {
            Ok(descriptor) => descriptor.kind,
            Err(err) => return Outcome::System(err),
        };
        match kind {
            ComponentKind::Stateful => self.dispatch_stateful(ctx).await,
            ComponentKind::Entity => self.dispatch_entity(ctx).await,
        }
    }
}
