use std::path::PathBuf;
use std::time::Duration;

/// Container runtime configuration
///
/// Covers the timeout and pooling knobs the deployment descriptor leaves to
/// the operator: guard wait, idle eviction, hard session expiry, sweep cadence.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// How long a caller may wait for another invocation to release an
    /// instance before failing with a concurrent-access timeout
    pub access_timeout: Duration,

    /// Inactivity window after which an unheld instance becomes eligible for
    /// passivation
    pub idle_timeout: Duration,

    /// Hard lifetime of a conversation, measured from creation. `None`
    /// disables the session timeout entirely.
    pub session_timeout: Option<Duration>,

    /// Interval between passivation sweeps
    pub sweep_interval: Duration,

    /// Preferred number of live instances before the registry starts
    /// passivating under pool pressure
    pub pool_capacity: usize,

    /// How many of the oldest unheld instances to passivate in one pressure
    /// response
    pub bulk_passivate: usize,

    /// Directory for passivated-state images. `None` keeps them in memory.
    pub passivation_dir: Option<PathBuf>,

    /// Grace period granted to pre-destroy callbacks during shutdown
    pub shutdown_grace: Duration,
}

impl ContainerConfig {
    pub fn new() -> Self {
        Self {
            access_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            session_timeout: None,
            sweep_interval: Duration::from_secs(60),
            pool_capacity: 1000,
            bulk_passivate: 25,
            passivation_dir: None,
            shutdown_grace: Duration::from_secs(10),
        }
    }

    /// Set the concurrent-access timeout
    pub fn access_timeout(mut self, timeout: Duration) -> Self {
        self.access_timeout = timeout;
        self
    }

    /// Set the idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the hard session timeout. A zero duration disables it, matching
    /// the descriptor convention where a non-positive value means "never".
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = if timeout.is_zero() {
            None
        } else {
            Some(timeout)
        };
        self
    }

    /// Set the sweep interval
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the preferred live-instance pool capacity
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// Set the bulk passivation size
    pub fn bulk_passivate(mut self, count: usize) -> Self {
        self.bulk_passivate = count;
        self
    }

    /// Passivate to disk under the given directory instead of in memory
    pub fn passivation_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.passivation_dir = Some(dir.into());
        self
    }

    /// Set the shutdown grace period
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.access_timeout.is_zero() {
            return Err("access_timeout must be > 0".to_string());
        }

        if self.sweep_interval.is_zero() {
            return Err("sweep_interval must be > 0".to_string());
        }

        if self.pool_capacity == 0 {
            return Err("pool_capacity must be > 0".to_string());
        }

        if self.bulk_passivate == 0 {
            return Err("bulk_passivate must be > 0".to_string());
        }

        if self.bulk_passivate > self.pool_capacity {
            return Err("bulk_passivate cannot exceed pool_capacity".to_string());
        }

        Ok(())
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self::new()
    }
}
