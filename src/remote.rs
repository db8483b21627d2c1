//! Abstract seams to the claim manager's external collaborators: the
//! remote peer (RPC client), the trust/session manager, and the audit log.
//! Wire encodings live behind these traits and are out of scope here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::security::SecuritySession;

/// Job state as reported by the execution agent in a status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportedState {
    Running,
    Suspended,
    Checkpointed,
}

/// How the remote job process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub by_signal: bool,
    /// Exit code, or signal number when `by_signal` is set.
    pub value: i32,
}

/// Periodic update from the execution agent. Every received report counts
/// as peer contact and renews the lease.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusReport {
    pub job_state: Option<ReportedState>,
    pub exit: Option<ExitStatus>,
    pub remote_cpu_secs: Option<f64>,
    pub image_size_kb: Option<u64>,
    /// Cumulative bytes received from the agent, used to account bytes
    /// moved between checkpoints.
    pub bytes_received: Option<u64>,
    /// Updated agent contact address, sent when it changes.
    pub agent_addr: Option<String>,
    /// Number of processes affected by a suspension.
    pub num_pids: Option<u32>,
}

/// Outcome of an activation request.
#[derive(Debug)]
pub enum ActivationReply {
    /// The peer accepted and opened the claim data channel; status reports
    /// arrive on `reports` until the connection dies.
    Accepted {
        reports: mpsc::Receiver<StatusReport>,
    },
    /// Previous occupant still vacating; try again shortly.
    Busy,
    Refused,
    Failed(String),
}

/// Outcome of asking the scheduling authority where the execution agent
/// for a claim lives now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocateReply {
    Found(String),
    /// The peer answered and the job is gone.
    NotFound,
    /// Communication failure only; the agent may still be alive.
    Unreachable,
    /// The peer returned a code neither side should ever produce.
    ProtocolError(i32),
}

/// Outcome of a direct reconnect request to a located agent.
#[derive(Debug)]
pub enum ReconnectReply {
    Accepted {
        reports: mpsc::Receiver<StatusReport>,
        agent_addr: String,
    },
    Unreachable,
    /// The agent no longer trusts our credential. Retrying cannot change
    /// a trust decision.
    NotAuthorized(String),
    ProtocolError(i32),
}

/// RPC client for the remote peer holding the slot. One instance per
/// claim, exclusively owned by its manager.
#[async_trait]
pub trait PeerClient: Send {
    async fn activate(&mut self, job: serde_json::Value) -> ActivationReply;

    /// Ask the peer to deactivate the claim. Returns false on
    /// communication failure; the caller retries.
    async fn deactivate(&mut self, graceful: bool) -> bool;

    async fn suspend(&mut self) -> bool;

    async fn resume(&mut self) -> bool;

    async fn locate(&mut self, claim_credential: &str) -> LocateReply;

    async fn request_reconnect(&mut self, agent_addr: &str, session_id: &str) -> ReconnectReply;

    /// Best-effort release of the underlying reservation. Failures are
    /// invisible to the caller.
    async fn release(&mut self, fast: bool);

    /// Push a renewed delegated credential to the peer. Returns false if
    /// the peer could not take it.
    async fn renew_credential(&mut self, expiration_epoch: i64) -> bool;
}

/// External trust manager that security sessions are negotiated with.
#[async_trait]
pub trait SessionManager: Send {
    /// Register a derived session. Returns false when negotiation fails;
    /// the claim then falls back to ambient transport negotiation.
    async fn negotiate(&mut self, session: &SecuritySession) -> bool;

    async fn invalidate(&mut self, session_id: &str);
}

/// One entry in the user-visible audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AuditEvent {
    Activated { peer: String },
    ExecutionBegan,
    Suspended { num_pids: u32 },
    Resumed,
    Checkpointed { bytes_since_last: u64 },
    Exited { exit: ExitStatus },
    Disconnected,
    ReconnectAttempt { attempt: u32 },
    Reconnected { attempts: u32 },
    ShutdownRequested { graceful: bool },
    SessionDegraded { session_id: String },
}

pub trait AuditLog: Send {
    fn emit(&mut self, event: AuditEvent);
}
