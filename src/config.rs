use std::sync::Arc;
use std::time::Duration;

/// Delay schedule for reconnect attempts, indexed by how many attempts
/// have already been made. Supplied by the embedding orchestrator;
/// expected (not enforced) to be non-decreasing.
pub type BackoffSchedule = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

const DEFAULT_ACTIVATION_MAX_RETRIES: u32 = 20;
const DEFAULT_CREDENTIAL_CHECK_INTERVAL: Duration = Duration::from_secs(600);

/// Tunables for one claim manager.
#[derive(Clone)]
pub struct ClaimConfig {
    /// How many times a busy peer (still vacating the previous occupant)
    /// is retried during activation before giving up.
    pub activation_max_retries: u32,
    pub activation_retry_delay: Duration,
    /// How many times a deactivate RPC is retried on communication
    /// failure during shutdown.
    pub shutdown_max_retries: u32,
    pub shutdown_retry_delay: Duration,
    /// Opt in to blocking up to the remaining lease when every shutdown
    /// retry failed.
    pub wait_on_shutdown: bool,
    /// Whether both the job and the execution agent support reconnection
    /// after a lost connection.
    pub supports_reconnect: bool,
    /// Weight of the slot, applied to committed slot time.
    pub slot_weight: f64,
    /// Lease duration granted to the job; `None` means no lease.
    pub lease_duration: Option<Duration>,
    /// Interval between delegated-credential renewal checks.
    pub credential_check_interval: Duration,
    pub reconnect_backoff: BackoffSchedule,
}

impl std::fmt::Debug for ClaimConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimConfig")
            .field("activation_max_retries", &self.activation_max_retries)
            .field("activation_retry_delay", &self.activation_retry_delay)
            .field("shutdown_max_retries", &self.shutdown_max_retries)
            .field("shutdown_retry_delay", &self.shutdown_retry_delay)
            .field("wait_on_shutdown", &self.wait_on_shutdown)
            .field("supports_reconnect", &self.supports_reconnect)
            .field("slot_weight", &self.slot_weight)
            .field("lease_duration", &self.lease_duration)
            .field("credential_check_interval", &self.credential_check_interval)
            .finish_non_exhaustive()
    }
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            activation_max_retries: DEFAULT_ACTIVATION_MAX_RETRIES,
            activation_retry_delay: Duration::from_secs(1),
            shutdown_max_retries: 3,
            shutdown_retry_delay: Duration::from_secs(2),
            wait_on_shutdown: false,
            supports_reconnect: true,
            slot_weight: 1.0,
            lease_duration: None,
            credential_check_interval: DEFAULT_CREDENTIAL_CHECK_INTERVAL,
            reconnect_backoff: Arc::new(default_backoff),
        }
    }
}

impl ClaimConfig {
    pub fn with_lease(mut self, duration: Duration) -> Self {
        self.lease_duration = Some(duration);
        self
    }

    pub fn with_backoff<F>(mut self, schedule: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.reconnect_backoff = Arc::new(schedule);
        self
    }

    pub fn with_slot_weight(mut self, weight: f64) -> Self {
        self.slot_weight = weight;
        self
    }
}

/// Default reconnect backoff: exponential from 5s, capped at 300s.
fn default_backoff(attempts: u32) -> Duration {
    let exp = attempts.min(16);
    Duration::from_secs((5u64 << exp).min(300))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ClaimConfig::default();
        assert_eq!(cfg.activation_max_retries, 20);
        assert_eq!(cfg.activation_retry_delay, Duration::from_secs(1));
        assert!(!cfg.wait_on_shutdown);
        assert!(cfg.supports_reconnect);
        assert_eq!(cfg.slot_weight, 1.0);
        assert!(cfg.lease_duration.is_none());
    }

    #[test]
    fn default_backoff_grows_and_caps() {
        assert_eq!(default_backoff(0), Duration::from_secs(5));
        assert_eq!(default_backoff(1), Duration::from_secs(10));
        assert_eq!(default_backoff(3), Duration::from_secs(40));
        assert_eq!(default_backoff(10), Duration::from_secs(300));
        assert_eq!(default_backoff(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn builder_overrides() {
        let cfg = ClaimConfig::default()
            .with_lease(Duration::from_secs(300))
            .with_slot_weight(4.0)
            .with_backoff(|_| Duration::from_secs(5));
        assert_eq!(cfg.lease_duration, Some(Duration::from_secs(300)));
        assert_eq!(cfg.slot_weight, 4.0);
        assert_eq!((cfg.reconnect_backoff)(7), Duration::from_secs(5));
    }
}
