// ============================================================================
// Passivation
// ============================================================================

pub mod store;

pub use store::{FilePassivationStore, MemoryPassivationStore, PassivatedImage, PassivationStore};

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::core::{ContainerError, Result};
use crate::instance::InstanceRegistry;

/// Background worker that periodically sweeps the instance registry for
/// idle and session-expired instances.
pub struct PassivationScheduler {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl PassivationScheduler {
    /// Signals the scheduler to stop and waits for the sweep loop to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| ContainerError::Execution(format!("sweep worker join: {}", err)))?;
        }

        Ok(())
    }
}

impl Drop for PassivationScheduler {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Spawns the sweep loop against the given registry.
pub fn spawn_passivation_scheduler(
    registry: Arc<InstanceRegistry>,
    interval: Duration,
) -> PassivationScheduler {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(interval) => {
                    let report = registry.sweep().await;
                    if report.passivated > 0 || report.expired > 0 {
                        debug!(
                            "Sweep: {} passivated, {} expired, {} marked idle",
                            report.passivated, report.expired, report.marked_idle
                        );
                    }
                }
            }
        }
        debug!("Passivation scheduler stopped");
    });

    PassivationScheduler {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}
