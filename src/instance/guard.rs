// ============================================================================
// Concurrency Guard
// ============================================================================
//
// Per-instance mutual exclusion with bounded wait. One invocation holds the
// guard at a time; a nested call from the same invocation chain re-enters
// instead of deadlocking, and independent callers past the configured wait
// fail with the distinct concurrent-access-timeout condition rather than
// blocking forever.
// ============================================================================

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::core::{ContainerError, InvocationId, Result};

#[derive(Debug)]
struct GuardState {
    holder: Option<InvocationId>,
    depth: usize,
}

/// Single-holder lock lent to exactly one invocation at a time.
#[derive(Debug)]
pub struct ConcurrencyGuard {
    state: Mutex<GuardState>,
    released: Notify,
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GuardState {
                holder: None,
                depth: 0,
            }),
            released: Notify::new(),
        }
    }

    /// Acquire the guard, waiting up to `timeout` for the current holder.
    ///
    /// Reentrant: the holding invocation may acquire again (each acquisition
    /// needs a matching release).
    ///
    /// # Errors
    /// `ConcurrentAccessTimeout` when the timeout elapses first.
    pub async fn try_acquire(&self, invocation: InvocationId, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.try_acquire_now(invocation) {
                return Ok(());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ContainerError::ConcurrentAccessTimeout(timeout));
            }

            // A release between the check above and this wait leaves a
            // stored permit, so the wakeup cannot be lost
            if tokio::time::timeout(remaining, self.released.notified())
                .await
                .is_err()
            {
                return Err(ContainerError::ConcurrentAccessTimeout(timeout));
            }
        }
    }

    /// Non-blocking acquisition; used by the passivation sweep so it never
    /// stalls a client thread.
    pub fn try_acquire_now(&self, invocation: InvocationId) -> bool {
        let mut state = self.state.lock().expect("guard state poisoned");
        match state.holder {
            None => {
                state.holder = Some(invocation);
                state.depth = 1;
                true
            }
            Some(holder) if holder == invocation => {
                state.depth += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Release one acquisition by the holding invocation.
    ///
    /// # Errors
    /// Returns a lock error when the caller is not the holder.
    pub fn release(&self, invocation: InvocationId) -> Result<()> {
        let mut state = self.state.lock().expect("guard state poisoned");
        match state.holder {
            Some(holder) if holder == invocation => {
                state.depth -= 1;
                if state.depth == 0 {
                    state.holder = None;
                    drop(state);
                    self.released.notify_one();
                }
                Ok(())
            }
            _ => Err(ContainerError::Lock(format!(
                "{} released a guard it does not hold",
                invocation
            ))),
        }
    }

    pub fn is_held(&self) -> bool {
        self.state
            .lock()
            .expect("guard state poisoned")
            .holder
            .is_some()
    }

    pub fn holder(&self) -> Option<InvocationId> {
        self.state.lock().expect("guard state poisoned").holder
    }
}

impl Default for ConcurrencyGuard {
    fn default() -> Self {
        Self::new()
    }
}
