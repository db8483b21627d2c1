//! The job record: a mutable typed attribute map shared with the broader
//! scheduling system. The manager treats every write as fire-and-forget:
//! the counters it writes are recomputed from the ledger, never read back
//! and modified, so last-writer-wins is acceptable.

use serde_json::Value;

/// Well-known attribute names written or read by the claim manager.
pub mod attr {
    /// Epoch seconds of the most recent successful contact with the peer.
    pub const LAST_LEASE_RENEWAL: &str = "LastLeaseRenewal";
    /// Lease duration granted to the job, in seconds.
    pub const LEASE_DURATION: &str = "JobLeaseDuration";
    /// Epoch seconds when the current activation was accepted.
    pub const CLAIM_START_DATE: &str = "ClaimStartDate";
    /// Epoch seconds when the job process started executing.
    pub const EXECUTION_START_DATE: &str = "ExecutionStartDate";
    pub const TOTAL_SUSPENSIONS: &str = "TotalSuspensions";
    pub const LAST_SUSPENSION_TIME: &str = "LastSuspensionTime";
    pub const CUMULATIVE_SUSPENSION_TIME: &str = "CumulativeSuspensionTime";
    pub const UNCOMMITTED_SUSPENSION_TIME: &str = "UncommittedSuspensionTime";
    pub const COMMITTED_SUSPENSION_TIME: &str = "CommittedSuspensionTime";
    pub const NUM_CHECKPOINTS: &str = "NumCheckpoints";
    pub const LAST_CHECKPOINT_TIME: &str = "LastCheckpointTime";
    pub const COMMITTED_TIME: &str = "CommittedTime";
    pub const COMMITTED_SLOT_TIME: &str = "CommittedSlotTime";
    /// Whether the underlying reservation should be released after the
    /// job is deactivated.
    pub const RELEASE_CLAIM: &str = "ReleaseClaim";
    /// Epoch seconds at which the delegated credential expires, if the
    /// job carries one.
    pub const CREDENTIAL_EXPIRATION: &str = "CredentialExpiration";
    pub const REMOTE_CPU_SECS: &str = "RemoteCpuSecs";
    pub const IMAGE_SIZE_KB: &str = "ImageSizeKb";
    pub const EXITED_BY_SIGNAL: &str = "ExitedBySignal";
    pub const EXIT_CODE: &str = "ExitCode";
    pub const EXIT_SIGNAL: &str = "ExitSignal";
}

/// Mutable typed attribute map with deferred persistence.
pub trait JobRecord: Send {
    fn get(&self, name: &str) -> Option<Value>;
    fn set(&mut self, name: &str, value: Value);
    /// Persist pending writes. Fire-and-forget: implementations log
    /// failures, callers never see them.
    fn save(&mut self);
    /// Snapshot of every attribute, handed to the peer on activation.
    fn snapshot(&self) -> Value;

    fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(|v| v.as_i64())
    }

    fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|v| v.as_f64())
    }

    fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(|v| v.as_bool())
    }
}

/// In-memory job record. The real system persists records in the
/// scheduler's job queue; this implementation backs tests and embedders
/// that keep records elsewhere.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobRecord {
    attrs: serde_json::Map<String, Value>,
    saves: u64,
}

impl MemoryJobRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attr(mut self, name: &str, value: Value) -> Self {
        self.attrs.insert(name.to_string(), value);
        self
    }

    /// Number of times `save` has been called.
    pub fn saves(&self) -> u64 {
        self.saves
    }
}

impl JobRecord for MemoryJobRecord {
    fn get(&self, name: &str) -> Option<Value> {
        self.attrs.get(name).cloned()
    }

    fn set(&mut self, name: &str, value: Value) {
        self.attrs.insert(name.to_string(), value);
    }

    fn save(&mut self) {
        self.saves += 1;
    }

    fn snapshot(&self) -> Value {
        Value::Object(self.attrs.clone())
    }
}
