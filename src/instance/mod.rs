// ============================================================================
// Stateful Instance Model
// ============================================================================

pub mod guard;
pub mod registry;

pub use guard::ConcurrencyGuard;
pub use registry::{InstanceRegistry, RegistryStats, SweepReport};

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::core::{EntityKey, InstanceId, StateMap};
use crate::descriptor::ComponentDescriptor;

/// Lifecycle position of a managed instance.
///
/// Forward-only except for the active/idle pair and reactivation out of
/// the passivated state. `Destroyed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Active,
    Idle,
    Passivated,
    Destroyed,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InstanceState::Active => "active",
            InstanceState::Idle => "idle",
            InstanceState::Passivated => "passivated",
            InstanceState::Destroyed => "destroyed",
        };
        write!(f, "{}", name)
    }
}

/// A stateful component instance plus the bookkeeping the registry and the
/// passivation sweep need: lifecycle state, creation wall-clock (session
/// timeout), and last-access instant (idle timeout).
#[derive(Debug)]
pub struct ManagedInstance {
    pub id: InstanceId,
    pub component: String,
    pub state: InstanceState,
    /// Conversational state; emptied while passivated.
    pub conversation: StateMap,
    pub entity_key: Option<EntityKey>,
    pub created: DateTime<Utc>,
    pub last_access: Instant,
}

impl ManagedInstance {
    pub fn new(component: &str) -> Self {
        Self {
            id: InstanceId::new(),
            component: component.to_string(),
            state: InstanceState::Active,
            conversation: StateMap::new(),
            entity_key: None,
            created: Utc::now(),
            last_access: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_access = Instant::now();
        if self.state == InstanceState::Idle {
            self.state = InstanceState::Active;
        }
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_access.elapsed()
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created
    }
}

/// Registry entry tying an instance to its guard and descriptor. The guard
/// lives exactly as long as the entry.
#[derive(Debug)]
pub struct InstanceEntry {
    pub id: InstanceId,
    pub descriptor: Arc<ComponentDescriptor>,
    pub guard: ConcurrencyGuard,
    pub instance: Mutex<ManagedInstance>,
}

impl InstanceEntry {
    pub fn new(descriptor: Arc<ComponentDescriptor>) -> Self {
        let instance = ManagedInstance::new(&descriptor.name);
        Self {
            id: instance.id,
            descriptor,
            guard: ConcurrencyGuard::new(),
            instance: Mutex::new(instance),
        }
    }
}
