// ============================================================================
// Transaction Record
// ============================================================================
//
// The bookkeeping for one open unit of work: its identity, where it sits in
// its lifecycle, and the rollback-only mark that turns a commit attempt into
// a rollback.
//
// Completion callbacks (synchronizations) registered while the transaction is
// active fire in two phases: before-completion (commit only, may veto) and
// after-completion (always, with the final disposition).
// ============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::{ContainerError, Result};

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Handle for one transaction, process-unique and cheap to copy. Invocation
/// contexts and cache scopes carry this handle, never the record itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub fn new() -> Self {
        TransactionId(NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// Where a transaction sits in its lifecycle. A transaction leaves `Active`
/// exactly once, into `Committed` or `Aborted`, and never comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Open; work may still be enlisted
    Active,

    /// Completed with its writes flushed
    Committed,

    /// Completed by rollback, nothing written
    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// One open unit of work. Mutated only under the manager's lock; everything
/// outside it addresses the transaction through its id.
pub struct Transaction {
    id: TransactionId,

    state: TransactionState,

    /// Set when a system failure occurred inside this transaction; commit
    /// then becomes a rollback
    rollback_only: bool,

    /// Completion callbacks, fired in registration order
    synchronizations: Vec<Box<dyn super::TransactionSynchronization>>,

    /// When the transaction began, for duration diagnostics
    start_time: std::time::Instant,
}

impl Transaction {
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            rollback_only: false,
            synchronizations: Vec::new(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Whether commit has been vetoed
    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Veto any later commit attempt. Fails once the transaction has
    /// completed.
    pub fn set_rollback_only(&mut self) -> Result<()> {
        if !self.state.is_active() {
            return Err(ContainerError::TransactionInactive(self.id.to_string()));
        }
        self.rollback_only = true;
        Ok(())
    }

    /// Enlist a completion callback. Fails once the transaction has
    /// completed.
    pub fn register_synchronization(
        &mut self,
        sync: Box<dyn super::TransactionSynchronization>,
    ) -> Result<()> {
        if !self.state.is_active() {
            return Err(ContainerError::TransactionInactive(self.id.to_string()));
        }
        self.synchronizations.push(sync);
        Ok(())
    }

    /// Take the registered synchronizations for completion processing
    pub(crate) fn take_synchronizations(
        &mut self,
    ) -> Vec<Box<dyn super::TransactionSynchronization>> {
        std::mem::take(&mut self.synchronizations)
    }

    /// How long the transaction has been open
    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Close out as committed; legal only from `Active`
    pub fn mark_committed(&mut self) -> Result<()> {
        if !self.state.is_active() {
            return Err(ContainerError::TransactionInactive(self.id.to_string()));
        }
        self.state = TransactionState::Committed;
        Ok(())
    }

    /// Close out as rolled back; legal only from `Active`
    pub fn mark_aborted(&mut self) -> Result<()> {
        if !self.state.is_active() {
            return Err(ContainerError::TransactionInactive(self.id.to_string()));
        }
        self.state = TransactionState::Aborted;
        Ok(())
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("rollback_only", &self.rollback_only)
            .field("synchronizations", &self.synchronizations.len())
            .finish()
    }
}
