// ============================================================================
// Instance Registry
// ============================================================================
//
// Owns every live stateful instance: creation, guarded checkout, removal,
// idle/session sweeps, and passivation under pool pressure. An instance is
// addressed by its `InstanceId` for its whole life; the registry is the only
// component allowed to move one between lifecycle states.
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, info, warn};
use lru::LruCache;
use tokio::sync::{Mutex, RwLock};

use crate::config::ContainerConfig;
use crate::core::{ContainerError, InstanceId, InvocationId, Result, StateMap};
use crate::descriptor::{Callback, ComponentDescriptor, MethodContext};
use crate::instance::{InstanceEntry, InstanceState};
use crate::passivation::store::{PassivatedImage, PassivationStore};

/// Snapshot of the registry population, by lifecycle state.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryStats {
    pub active: usize,
    pub idle: usize,
    pub passivated: usize,
}

/// Outcome of one sweep pass, for the scheduler's log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepReport {
    pub marked_idle: usize,
    pub passivated: usize,
    pub expired: usize,
}

pub struct InstanceRegistry {
    config: ContainerConfig,
    entries: RwLock<HashMap<InstanceId, Arc<InstanceEntry>>>,
    /// Recency order across live instances; least recently used instances
    /// are the first passivated under pool pressure.
    recency: Mutex<LruCache<InstanceId, ()>>,
    store: Arc<dyn PassivationStore>,
}

impl InstanceRegistry {
    pub fn new(config: ContainerConfig, store: Arc<dyn PassivationStore>) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            recency: Mutex::new(LruCache::unbounded()),
            store,
        }
    }

    // ------------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------------

    /// Create a new instance of the given component, run its post-construct
    /// callback, and register it. Fails without registering anything when
    /// the callback fails.
    pub async fn create(&self, descriptor: Arc<ComponentDescriptor>) -> Result<InstanceId> {
        let entry = Arc::new(InstanceEntry::new(descriptor));
        let id = entry.id;

        {
            let mut instance = entry.instance.lock().await;
            run_callback(
                &entry.descriptor.callbacks.post_construct,
                "post_construct",
                &mut instance.conversation,
            )?;
        }

        let over_capacity = {
            let mut entries = self.entries.write().await;
            entries.insert(id, Arc::clone(&entry));
            entries.len() > self.config.pool_capacity
        };
        self.recency.lock().await.put(id, ());

        debug!("Created instance {} of {}", id, entry.descriptor.name);

        if over_capacity {
            self.passivate_oldest(self.config.bulk_passivate).await;
        }

        Ok(id)
    }

    // ------------------------------------------------------------------------
    // Checkout / checkin
    // ------------------------------------------------------------------------

    /// Check out an instance for one invocation: acquire its guard (bounded
    /// wait), reactivate it if it was passivated, and hand back the entry
    /// with the guard held. The caller must `checkin` when done.
    ///
    /// An instance destroyed while this caller was waiting on the guard
    /// fails with `NoSuchInstance`; the destroy wins the race.
    pub async fn checkout(
        &self,
        id: InstanceId,
        invocation: InvocationId,
        timeout: Option<Duration>,
    ) -> Result<Arc<InstanceEntry>> {
        let entry = self
            .entries
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| ContainerError::NoSuchInstance(id.to_string()))?;

        let wait = timeout
            .or(entry.descriptor.access_timeout)
            .unwrap_or(self.config.access_timeout);
        entry.guard.try_acquire(invocation, wait).await?;

        // Re-check state now that the guard is ours; the previous holder may
        // have destroyed the instance while we waited.
        if let Err(e) = self.ready_for_use(&entry).await {
            let _ = entry.guard.release(invocation);
            return Err(e);
        }

        self.recency.lock().await.get(&id);
        Ok(entry)
    }

    /// Release the guard after an invocation and refresh the idle clock.
    pub async fn checkin(&self, entry: &InstanceEntry, invocation: InvocationId) -> Result<()> {
        {
            let mut instance = entry.instance.lock().await;
            if instance.state != InstanceState::Destroyed {
                instance.touch();
            }
        }
        self.recency.lock().await.get(&entry.id);
        entry.guard.release(invocation)
    }

    /// Bring a checked-out entry into the `Active` state, reactivating or
    /// expiring it as its current state demands. Guard must be held.
    async fn ready_for_use(&self, entry: &InstanceEntry) -> Result<()> {
        let session_timeout = entry
            .descriptor
            .session_timeout
            .or(self.config.session_timeout);

        let mut instance = entry.instance.lock().await;
        match instance.state {
            InstanceState::Destroyed => {
                Err(ContainerError::NoSuchInstance(entry.id.to_string()))
            }
            InstanceState::Passivated => {
                drop(instance);
                self.reactivate(entry, session_timeout).await
            }
            InstanceState::Active | InstanceState::Idle => {
                if session_expired(&instance, session_timeout) {
                    // Timed out while live: destroy on access, pre-destroy
                    // still runs.
                    run_callback_logged(
                        &entry.descriptor.callbacks.pre_destroy,
                        "pre_destroy",
                        &mut instance.conversation,
                    );
                    instance.state = InstanceState::Destroyed;
                    drop(instance);
                    self.forget(entry.id).await;
                    return Err(ContainerError::NoSuchInstance(entry.id.to_string()));
                }
                instance.touch();
                Ok(())
            }
        }
    }

    /// Restore a passivated instance from its stored image. An image whose
    /// session expired while passivated is discarded without pre-destroy.
    async fn reactivate(
        &self,
        entry: &InstanceEntry,
        session_timeout: Option<Duration>,
    ) -> Result<()> {
        let image = self.store.activate(entry.id).await?;

        let mut instance = entry.instance.lock().await;
        let image = match image {
            Some(image) => image,
            None => {
                instance.state = InstanceState::Destroyed;
                drop(instance);
                self.forget(entry.id).await;
                return Err(ContainerError::NoSuchInstance(entry.id.to_string()));
            }
        };

        if let Some(timeout) = session_timeout {
            let age = Utc::now() - image.created;
            if age.to_std().unwrap_or(Duration::ZERO) > timeout {
                debug!("Instance {} timed out while passivated", entry.id);
                instance.state = InstanceState::Destroyed;
                drop(instance);
                self.forget(entry.id).await;
                return Err(ContainerError::NoSuchInstance(entry.id.to_string()));
            }
        }

        instance.conversation = image.conversation;
        instance.entity_key = image.entity_key;
        instance.created = image.created;
        instance.state = InstanceState::Active;
        instance.touch();

        if let Err(e) = run_callback(
            &entry.descriptor.callbacks.post_activate,
            "post_activate",
            &mut instance.conversation,
        ) {
            // A failed activation callback leaves the instance unusable
            warn!("Instance {} discarded: {}", entry.id, e);
            instance.state = InstanceState::Destroyed;
            instance.conversation = StateMap::new();
            drop(instance);
            self.forget(entry.id).await;
            return Err(e);
        }

        debug!("Reactivated instance {}", entry.id);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------------

    /// Client-initiated removal. Acquires the guard, runs pre-destroy, and
    /// destroys the instance. The callback result is reported but never
    /// prevents destruction.
    pub async fn remove(&self, id: InstanceId, invocation: InvocationId) -> Result<()> {
        let entry = self.checkout(id, invocation, None).await?;

        let callback_result = {
            let mut instance = entry.instance.lock().await;
            let result = run_callback(
                &entry.descriptor.callbacks.pre_destroy,
                "pre_destroy",
                &mut instance.conversation,
            );
            instance.state = InstanceState::Destroyed;
            instance.conversation = StateMap::new();
            result
        };

        self.forget(id).await;
        self.store.discard(id).await?;
        let _ = entry.guard.release(invocation);

        info!("Removed instance {}", id);
        callback_result
    }

    /// Drop an instance without running pre-destroy. Used after a callback
    /// or system failure already made the instance unusable.
    pub async fn discard(&self, id: InstanceId) -> Result<()> {
        if let Some(entry) = self.entries.read().await.get(&id).cloned() {
            let mut instance = entry.instance.lock().await;
            instance.state = InstanceState::Destroyed;
            instance.conversation = StateMap::new();
        }
        self.forget(id).await;
        self.store.discard(id).await
    }

    async fn forget(&self, id: InstanceId) {
        self.entries.write().await.remove(&id);
        self.recency.lock().await.pop(&id);
    }

    // ------------------------------------------------------------------------
    // Sweeps and pool pressure
    // ------------------------------------------------------------------------

    /// One pass over all live instances. Expires sessions past their hard
    /// timeout, stages quiet instances through `Idle`, and passivates those
    /// that stayed idle a full sweep. Instances whose guard is held are
    /// skipped and revisited next pass.
    pub async fn sweep(&self) -> SweepReport {
        let snapshot: Vec<Arc<InstanceEntry>> =
            self.entries.read().await.values().cloned().collect();
        let mut report = SweepReport::default();

        for entry in snapshot {
            let session_timeout = entry
                .descriptor
                .session_timeout
                .or(self.config.session_timeout);
            let idle_timeout = entry
                .descriptor
                .idle_timeout
                .unwrap_or(self.config.idle_timeout);
            let sweep_call = InvocationId::new();

            let mut instance = entry.instance.lock().await;
            match instance.state {
                InstanceState::Destroyed => {
                    drop(instance);
                    self.forget(entry.id).await;
                }
                InstanceState::Passivated => {
                    if session_expired(&instance, session_timeout) {
                        instance.state = InstanceState::Destroyed;
                        drop(instance);
                        self.forget(entry.id).await;
                        if let Err(e) = self.store.discard(entry.id).await {
                            warn!("Failed to discard expired image {}: {}", entry.id, e);
                        }
                        report.expired += 1;
                    }
                }
                InstanceState::Active | InstanceState::Idle => {
                    if session_expired(&instance, session_timeout) {
                        if !entry.guard.try_acquire_now(sweep_call) {
                            continue;
                        }
                        run_callback_logged(
                            &entry.descriptor.callbacks.pre_destroy,
                            "pre_destroy",
                            &mut instance.conversation,
                        );
                        instance.state = InstanceState::Destroyed;
                        drop(instance);
                        self.forget(entry.id).await;
                        let _ = entry.guard.release(sweep_call);
                        info!("Session expired, destroyed instance {}", entry.id);
                        report.expired += 1;
                    } else if instance.idle_for() > idle_timeout && !entry.guard.is_held() {
                        if instance.state == InstanceState::Active {
                            instance.state = InstanceState::Idle;
                            report.marked_idle += 1;
                        } else if entry.guard.try_acquire_now(sweep_call) {
                            drop(instance);
                            if self.passivate_entry(&entry).await {
                                report.passivated += 1;
                            }
                            let _ = entry.guard.release(sweep_call);
                        }
                    }
                }
            }
        }

        report
    }

    /// Passivate the least recently used unheld instances, up to `limit`.
    /// Called when the live population exceeds the pool capacity.
    async fn passivate_oldest(&self, limit: usize) {
        let candidates: Vec<InstanceId> = {
            let recency = self.recency.lock().await;
            // lru iterates most-recent first; take from the tail
            recency.iter().rev().map(|(id, _)| *id).collect()
        };

        let mut passivated = 0;
        for id in candidates {
            if passivated >= limit {
                break;
            }
            let Some(entry) = self.entries.read().await.get(&id).cloned() else {
                continue;
            };
            let sweep_call = InvocationId::new();
            if !entry.guard.try_acquire_now(sweep_call) {
                continue;
            }
            let eligible = {
                let instance = entry.instance.lock().await;
                matches!(
                    instance.state,
                    InstanceState::Active | InstanceState::Idle
                )
            };
            if eligible && self.passivate_entry(&entry).await {
                passivated += 1;
            }
            let _ = entry.guard.release(sweep_call);
        }

        if passivated > 0 {
            info!("Pool pressure: passivated {} instance(s)", passivated);
        }
    }

    /// Serialize one instance out to the store. Guard must be held. A
    /// failure at any step destroys the instance; returns whether the
    /// passivation itself succeeded.
    async fn passivate_entry(&self, entry: &InstanceEntry) -> bool {
        let image = {
            let mut instance = entry.instance.lock().await;
            if !matches!(
                instance.state,
                InstanceState::Active | InstanceState::Idle
            ) {
                return false;
            }
            if let Err(e) = run_callback(
                &entry.descriptor.callbacks.pre_passivate,
                "pre_passivate",
                &mut instance.conversation,
            ) {
                warn!("Instance {} destroyed: {}", entry.id, e);
                instance.state = InstanceState::Destroyed;
                drop(instance);
                self.forget(entry.id).await;
                return false;
            }
            PassivatedImage {
                id: entry.id,
                component: instance.component.clone(),
                conversation: std::mem::take(&mut instance.conversation),
                entity_key: instance.entity_key.clone(),
                created: instance.created,
                passivated_at: Utc::now(),
            }
        };

        match self.store.passivate(image).await {
            Ok(()) => {
                let mut instance = entry.instance.lock().await;
                instance.state = InstanceState::Passivated;
                debug!("Passivated instance {}", entry.id);
                true
            }
            Err(e) => {
                warn!("Passivation of {} failed, destroying: {}", entry.id, e);
                let mut instance = entry.instance.lock().await;
                instance.state = InstanceState::Destroyed;
                drop(instance);
                self.forget(entry.id).await;
                false
            }
        }
    }

    // ------------------------------------------------------------------------
    // Shutdown / stats
    // ------------------------------------------------------------------------

    /// Destroy every instance, waiting up to the shutdown grace period for
    /// held guards. Instances still held past the deadline are destroyed
    /// anyway.
    pub async fn shutdown(&self) {
        let deadline = Instant::now() + self.config.shutdown_grace;
        let snapshot: Vec<Arc<InstanceEntry>> =
            self.entries.read().await.values().cloned().collect();

        for entry in snapshot {
            let call = InvocationId::new();
            let remaining = deadline.saturating_duration_since(Instant::now());
            let acquired = entry.guard.try_acquire(call, remaining).await.is_ok();
            if !acquired {
                warn!(
                    "Instance {} still busy at shutdown deadline, destroying anyway",
                    entry.id
                );
            }

            {
                let mut instance = entry.instance.lock().await;
                if instance.state != InstanceState::Destroyed {
                    run_callback_logged(
                        &entry.descriptor.callbacks.pre_destroy,
                        "pre_destroy",
                        &mut instance.conversation,
                    );
                    instance.state = InstanceState::Destroyed;
                }
            }
            let _ = self.store.discard(entry.id).await;
            if acquired {
                let _ = entry.guard.release(call);
            }
        }

        self.entries.write().await.clear();
        self.recency.lock().await.clear();
        info!("Instance registry shut down");
    }

    pub async fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for entry in self.entries.read().await.values() {
            match entry.instance.lock().await.state {
                InstanceState::Active => stats.active += 1,
                InstanceState::Idle => stats.idle += 1,
                InstanceState::Passivated => stats.passivated += 1,
                InstanceState::Destroyed => {}
            }
        }
        stats
    }

    pub async fn live_count(&self) -> usize {
        self.entries.read().await.len()
    }
}

fn session_expired(
    instance: &crate::instance::ManagedInstance,
    timeout: Option<Duration>,
) -> bool {
    match timeout {
        Some(timeout) => {
            instance.age().to_std().unwrap_or(Duration::ZERO) > timeout
        }
        None => false,
    }
}

fn run_callback(
    callback: &Option<Callback>,
    name: &str,
    conversation: &mut StateMap,
) -> Result<()> {
    if let Some(callback) = callback {
        let mut ctx = MethodContext {
            invocation: InvocationId::new(),
            state: conversation,
            row: None,
        };
        callback(&mut ctx).map_err(|message| ContainerError::Callback {
            callback: name.to_string(),
            message,
        })?;
    }
    Ok(())
}

/// Scheduler-path variant: failures are logged and swallowed so a broken
/// callback cannot wedge a sweep.
fn run_callback_logged(callback: &Option<Callback>, name: &str, conversation: &mut StateMap) {
    if let Err(e) = run_callback(callback, name, conversation) {
        warn!("Ignoring callback failure during eviction: {}", e);
    }
}
