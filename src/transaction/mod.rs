pub mod manager;
pub mod state;

pub use manager::{TransactionInfo, TransactionManager};
pub use state::{Transaction, TransactionId, TransactionState};

use async_trait::async_trait;

use crate::core::Result;

/// Completion callback registered with an active transaction.
///
/// `before_completion` runs only on the commit path and may veto it by
/// returning an error, in which case the manager rolls back instead.
/// `after_completion` always runs, with `committed` carrying the final
/// disposition.
#[async_trait]
pub trait TransactionSynchronization: Send + Sync {
    async fn before_completion(&self) -> Result<()>;
    async fn after_completion(&self, committed: bool);
}
