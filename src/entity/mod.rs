// ============================================================================
// Entity Lifecycle Engine
// ============================================================================
//
// Orchestrates persistent-component lifecycles against the transaction-scoped
// cache: create (with key generation), fault-load, field accessors, and
// cascade-aware removal. Actual storage I/O stays behind the persistence
// collaborators; the engine never sees a driver.
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use tokio::sync::RwLock;

use crate::cache::{CacheRow, RowState, SharedRow, TransactionScopedCache};
use crate::core::{ContainerError, EntityKey, InvocationId, Result, StateMap, Value};
use crate::descriptor::{Callback, ComponentDescriptor, DeploymentMap, MethodContext};
use crate::persistence::{FaultHandler, KeyDecision, KeyGenerator, SequenceKeyGenerator};

pub struct EntityLifecycleEngine {
    fault_handlers: RwLock<HashMap<String, Arc<dyn FaultHandler>>>,
    key_generators: RwLock<HashMap<String, Arc<dyn KeyGenerator>>>,
}

impl EntityLifecycleEngine {
    pub fn new() -> Self {
        Self {
            fault_handlers: RwLock::new(HashMap::new()),
            key_generators: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_fault_handler(&self, component: &str, handler: Arc<dyn FaultHandler>) {
        self.fault_handlers
            .write()
            .await
            .insert(component.to_string(), handler);
    }

    pub async fn register_key_generator(&self, component: &str, generator: Arc<dyn KeyGenerator>) {
        self.key_generators
            .write()
            .await
            .insert(component.to_string(), generator);
    }

    /// Deployments without an explicit generator get a per-component
    /// monotonic sequence.
    async fn key_generator_for(&self, component: &str) -> Arc<dyn KeyGenerator> {
        {
            let generators = self.key_generators.read().await;
            if let Some(generator) = generators.get(component) {
                return Arc::clone(generator);
            }
        }
        let mut generators = self.key_generators.write().await;
        Arc::clone(
            generators
                .entry(component.to_string())
                .or_insert_with(|| Arc::new(SequenceKeyGenerator::new())),
        )
    }

    // ------------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------------

    /// Run a create method: before-create hook, business create against a
    /// fresh row, key assignment, after-create hook, association with the
    /// transaction's cache. Returns the new primary key.
    ///
    /// # Errors
    /// `DuplicateKey` when the chosen identity is already associated in
    /// this transaction scope.
    pub async fn create(
        &self,
        descriptor: &ComponentDescriptor,
        cache: &mut TransactionScopedCache,
        method_name: &str,
        args: &[Value],
        scratch: &mut StateMap,
    ) -> Result<Value> {
        let method = descriptor.find_method(method_name).ok_or_else(|| {
            ContainerError::Execution(format!(
                "No method '{}' on component '{}'",
                method_name, descriptor.name
            ))
        })?;

        let mut row = CacheRow::new(
            EntityKey::new(&descriptor.name, Value::Null),
            descriptor.slot_count(),
            RowState::New,
        );

        run_callback(
            &descriptor.callbacks.before_create,
            "before_create",
            scratch,
            Some(&mut row),
        )?;

        let returned = {
            let mut ctx = MethodContext {
                invocation: InvocationId::new(),
                state: scratch,
                row: Some(&mut row),
            };
            method
                .method
                .invoke(&mut ctx, args)
                .await
                .map_err(ContainerError::Application)?
        };

        let key = match self.key_generator_for(&descriptor.name).await.next_key(&row)? {
            KeyDecision::Generated(key) => key,
            KeyDecision::ApplicationDefined => {
                if returned == Value::Null {
                    return Err(ContainerError::Execution(format!(
                        "Create method '{}' on '{}' returned no key",
                        method_name, descriptor.name
                    )));
                }
                returned
            }
        };

        let identity = EntityKey::new(&descriptor.name, key.clone());
        row.rekey(identity.clone());

        run_callback(
            &descriptor.callbacks.after_create,
            "after_create",
            scratch,
            Some(&mut row),
        )?;

        cache.add(row).map_err(|e| match e {
            ContainerError::AlreadyAssociated(id) => ContainerError::DuplicateKey(id),
            other => other,
        })?;

        debug!("Created entity {}", identity);
        Ok(key)
    }

    // ------------------------------------------------------------------------
    // Load and business dispatch
    // ------------------------------------------------------------------------

    /// Resolve an identity to its (fault-loaded) row and run the before-load
    /// hook.
    ///
    /// # Errors
    /// `NotFound` when no row exists and the fault handler reports no
    /// backing data; `AlreadyRemoved` when the row was removed earlier in
    /// this transaction.
    pub async fn load(
        &self,
        descriptor: &ComponentDescriptor,
        cache: &mut TransactionScopedCache,
        identity: &EntityKey,
        scratch: &mut StateMap,
    ) -> Result<SharedRow> {
        let shared = self.resolve(descriptor, cache, identity).await?;

        {
            let mut row = shared.lock().await;
            if row.state() == RowState::Removed {
                return Err(ContainerError::AlreadyRemoved(identity.to_string()));
            }
            run_callback(
                &descriptor.callbacks.before_load,
                "before_load",
                scratch,
                Some(&mut row),
            )?;
        }

        Ok(shared)
    }

    async fn resolve(
        &self,
        descriptor: &ComponentDescriptor,
        cache: &mut TransactionScopedCache,
        identity: &EntityKey,
    ) -> Result<SharedRow> {
        let handler = self
            .fault_handlers
            .read()
            .await
            .get(&descriptor.name)
            .cloned();
        match handler {
            Some(handler) => {
                cache
                    .fault(identity, descriptor.slot_count(), handler.as_ref())
                    .await
            }
            None => cache
                .get(identity)
                .ok_or_else(|| ContainerError::NotFound(identity.to_string())),
        }
    }

    /// Run a business method against a loaded entity row.
    pub async fn invoke(
        &self,
        descriptor: &ComponentDescriptor,
        cache: &mut TransactionScopedCache,
        identity: &EntityKey,
        method_name: &str,
        args: &[Value],
        scratch: &mut StateMap,
    ) -> Result<Value> {
        let method = descriptor.find_method(method_name).ok_or_else(|| {
            ContainerError::Execution(format!(
                "No method '{}' on component '{}'",
                method_name, descriptor.name
            ))
        })?;

        let shared = self.load(descriptor, cache, identity, scratch).await?;
        let mut row = shared.lock().await;
        let mut ctx = MethodContext {
            invocation: InvocationId::new(),
            state: scratch,
            row: Some(&mut row),
        };
        method
            .method
            .invoke(&mut ctx, args)
            .await
            .map_err(ContainerError::Application)
    }

    // ------------------------------------------------------------------------
    // Field accessors
    // ------------------------------------------------------------------------

    /// Read one persistent field, fault-loading the row if needed.
    pub async fn get_field(
        &self,
        descriptor: &ComponentDescriptor,
        cache: &mut TransactionScopedCache,
        identity: &EntityKey,
        field: &str,
        scratch: &mut StateMap,
    ) -> Result<Value> {
        let slot = descriptor
            .find_field(field)
            .map(|f| f.slot)
            .ok_or_else(|| {
                ContainerError::Execution(format!(
                    "No field '{}' on component '{}'",
                    field, descriptor.name
                ))
            })?;
        let shared = self.load(descriptor, cache, identity, scratch).await?;
        let row = shared.lock().await;
        row.value(slot).cloned()
    }

    /// Write one persistent field, dirtying the row.
    pub async fn set_field(
        &self,
        descriptor: &ComponentDescriptor,
        cache: &mut TransactionScopedCache,
        identity: &EntityKey,
        field: &str,
        value: Value,
        scratch: &mut StateMap,
    ) -> Result<()> {
        let slot = descriptor
            .find_field(field)
            .map(|f| f.slot)
            .ok_or_else(|| {
                ContainerError::Execution(format!(
                    "No field '{}' on component '{}'",
                    field, descriptor.name
                ))
            })?;
        let shared = self.load(descriptor, cache, identity, scratch).await?;
        let mut row = shared.lock().await;
        row.set_value(slot, value)
    }

    /// Read one relationship's related keys.
    pub async fn get_related(
        &self,
        descriptor: &ComponentDescriptor,
        cache: &mut TransactionScopedCache,
        identity: &EntityKey,
        relationship: &str,
        scratch: &mut StateMap,
    ) -> Result<Vec<EntityKey>> {
        let slot = descriptor
            .find_relationship(relationship)
            .map(|r| r.slot)
            .ok_or_else(|| {
                ContainerError::Execution(format!(
                    "No relationship '{}' on component '{}'",
                    relationship, descriptor.name
                ))
            })?;
        let shared = self.load(descriptor, cache, identity, scratch).await?;
        let row = shared.lock().await;
        row.related(slot)
    }

    /// Replace one relationship's related keys.
    pub async fn set_related(
        &self,
        descriptor: &ComponentDescriptor,
        cache: &mut TransactionScopedCache,
        identity: &EntityKey,
        relationship: &str,
        keys: Vec<EntityKey>,
        scratch: &mut StateMap,
    ) -> Result<()> {
        let slot = descriptor
            .find_relationship(relationship)
            .map(|r| r.slot)
            .ok_or_else(|| {
                ContainerError::Execution(format!(
                    "No relationship '{}' on component '{}'",
                    relationship, descriptor.name
                ))
            })?;
        let shared = self.load(descriptor, cache, identity, scratch).await?;
        let mut row = shared.lock().await;
        row.set_related(slot, keys)
    }

    // ------------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------------

    /// Remove an entity and cascade across `cascade_delete` relationships.
    ///
    /// For each affected row: related keys are gathered first, the row is
    /// marked removed, its relationship slots are cleared, and only then are
    /// the gathered cascade targets processed. Non-cascade relationships
    /// leave their targets untouched.
    pub async fn remove(
        &self,
        descriptor: &ComponentDescriptor,
        deployments: &DeploymentMap,
        cache: &mut TransactionScopedCache,
        identity: &EntityKey,
        scratch: &mut StateMap,
    ) -> Result<Value> {
        // The root must resolve; a cascade target that is already gone is
        // simply skipped.
        self.load(descriptor, cache, identity, scratch).await?;

        let mut pending = vec![identity.clone()];
        let mut removed = 0i64;

        while let Some(target) = pending.pop() {
            let target_descriptor = match deployments.get(&target.component) {
                Some(d) => Arc::clone(d),
                None => {
                    return Err(ContainerError::Execution(format!(
                        "Relationship references undeployed component '{}'",
                        target.component
                    )));
                }
            };

            let shared = match self.resolve(&target_descriptor, cache, &target).await {
                Ok(shared) => shared,
                Err(ContainerError::NotFound(_)) if target != *identity => continue,
                Err(e) => return Err(e),
            };

            let mut row = shared.lock().await;
            if row.state() == RowState::Removed {
                continue;
            }

            for rel in target_descriptor
                .relationships
                .iter()
                .filter(|r| r.cascade_delete)
            {
                pending.extend(row.related(rel.slot)?);
            }

            row.mark_removed();
            row.clear_relationships();
            removed += 1;
        }

        debug!("Removed {} ({} row(s) including cascades)", identity, removed);
        Ok(Value::Null)
    }
}

impl Default for EntityLifecycleEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn run_callback(
    callback: &Option<Callback>,
    name: &str,
    scratch: &mut StateMap,
    row: Option<&mut CacheRow>,
) -> Result<()> {
    if let Some(callback) = callback {
        let mut ctx = MethodContext {
            invocation: InvocationId::new(),
            state: scratch,
            row,
        };
        callback(&mut ctx).map_err(|message| ContainerError::Callback {
            callback: name.to_string(),
            message,
        })?;
    }
    Ok(())
}
