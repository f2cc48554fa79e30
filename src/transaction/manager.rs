// ============================================================================
// Transaction Manager
// ============================================================================

use super::{Transaction, TransactionId, TransactionState, TransactionSynchronization};
use crate::core::{ContainerError, Result};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Owns every active transaction and drives the two-phase completion
/// protocol over the registered synchronizations.
///
/// There is no ambient "current transaction": callers thread the
/// [`TransactionId`] through their invocation context explicitly, and
/// suspend/resume is a matter of which id the context carries.
pub struct TransactionManager {
    transactions: Arc<RwLock<HashMap<TransactionId, Transaction>>>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            transactions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Begin a new transaction
    pub async fn begin(&self) -> Result<TransactionId> {
        let transaction_id = TransactionId::new();
        let transaction = Transaction::new(transaction_id);

        let mut transactions = self.transactions.write().await;
        transactions.insert(transaction_id, transaction);
        debug!("began {}", transaction_id);

        Ok(transaction_id)
    }

    /// Whether the given transaction exists and is active
    pub async fn is_active(&self, txn_id: TransactionId) -> bool {
        let transactions = self.transactions.read().await;
        transactions
            .get(&txn_id)
            .map(|txn| txn.state().is_active())
            .unwrap_or(false)
    }

    /// Veto commit of the given transaction
    pub async fn mark_rollback_only(&self, txn_id: TransactionId) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        let transaction = transactions
            .get_mut(&txn_id)
            .ok_or_else(|| ContainerError::TransactionInactive(txn_id.to_string()))?;
        transaction.set_rollback_only()
    }

    /// Whether commit of the given transaction has been vetoed
    pub async fn is_rollback_only(&self, txn_id: TransactionId) -> bool {
        let transactions = self.transactions.read().await;
        transactions
            .get(&txn_id)
            .map(|txn| txn.is_rollback_only())
            .unwrap_or(false)
    }

    /// Register a completion callback with an active transaction
    pub async fn register_synchronization(
        &self,
        txn_id: TransactionId,
        sync: Box<dyn TransactionSynchronization>,
    ) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        let transaction = transactions
            .get_mut(&txn_id)
            .ok_or_else(|| ContainerError::TransactionInactive(txn_id.to_string()))?;
        transaction.register_synchronization(sync)
    }

    /// Commit the transaction.
    ///
    /// Runs every synchronization's `before_completion`; the first failure
    /// (or a prior rollback-only mark) converts the commit into a rollback
    /// and surfaces `RolledBack` to the caller. After the disposition is
    /// final, `after_completion` runs for every synchronization.
    pub async fn commit(&self, txn_id: TransactionId) -> Result<()> {
        let mut transaction = {
            let mut transactions = self.transactions.write().await;
            transactions
                .remove(&txn_id)
                .ok_or_else(|| ContainerError::TransactionInactive(txn_id.to_string()))?
        };

        if transaction.state() != TransactionState::Active {
            return Err(ContainerError::TransactionInactive(txn_id.to_string()));
        }

        let synchronizations = transaction.take_synchronizations();

        if transaction.is_rollback_only() {
            debug!("{} marked rollback-only; rolling back", txn_id);
            transaction.mark_aborted()?;
            Self::run_after_completion(&synchronizations, false).await;
            return Err(ContainerError::RolledBack(txn_id.to_string()));
        }

        for sync in &synchronizations {
            if let Err(err) = sync.before_completion().await {
                warn!("{} before-completion failed, rolling back: {}", txn_id, err);
                transaction.mark_aborted()?;
                Self::run_after_completion(&synchronizations, false).await;
                return Err(ContainerError::RolledBack(txn_id.to_string()));
            }
        }

        transaction.mark_committed()?;
        Self::run_after_completion(&synchronizations, true).await;
        debug!("committed {}", txn_id);

        Ok(())
    }

    /// Roll back the transaction, discarding uncommitted work
    pub async fn rollback(&self, txn_id: TransactionId) -> Result<()> {
        let mut transaction = {
            let mut transactions = self.transactions.write().await;
            transactions
                .remove(&txn_id)
                .ok_or_else(|| ContainerError::TransactionInactive(txn_id.to_string()))?
        };

        if transaction.state() != TransactionState::Active {
            return Err(ContainerError::TransactionInactive(txn_id.to_string()));
        }

        let synchronizations = transaction.take_synchronizations();
        transaction.mark_aborted()?;
        Self::run_after_completion(&synchronizations, false).await;
        debug!("rolled back {}", txn_id);

        Ok(())
    }

    async fn run_after_completion(
        synchronizations: &[Box<dyn TransactionSynchronization>],
        committed: bool,
    ) {
        for sync in synchronizations {
            sync.after_completion(committed).await;
        }
    }

    /// Diagnostic snapshot of one transaction
    pub async fn get_transaction_info(
        &self,
        txn_id: TransactionId,
    ) -> Option<TransactionInfo> {
        let transactions = self.transactions.read().await;
        transactions.get(&txn_id).map(|txn| TransactionInfo {
            id: txn.id(),
            state: txn.state(),
            rollback_only: txn.is_rollback_only(),
            duration: txn.duration(),
        })
    }

    /// Number of transactions currently active
    pub async fn active_count(&self) -> usize {
        self.transactions.read().await.len()
    }
}

pub struct TransactionInfo {
    pub id: TransactionId,
    pub state: TransactionState,
    pub rollback_only: bool,
    pub duration: std::time::Duration,
}
