use thiserror::Error;

/// Why activating the claim failed. Transient peer-busy replies are
/// retried internally and only surface once the retry bound is exhausted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActivationError {
    #[error("peer refused the activation request")]
    Refused,

    #[error("peer reported an activation error: {0}")]
    Failed(String),

    #[error("peer still vacating previous occupant after {0} attempts")]
    RetriesExhausted(u32),

    #[error("claim manager is no longer running")]
    ManagerStopped,
}

/// Why a requested shutdown could not be delivered to the peer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
    #[error("could not reach peer to deactivate after {0} attempts")]
    PeerUnreachable(u32),

    #[error("claim manager is no longer running")]
    ManagerStopped,
}

/// Terminal failure of the execution attempt, delivered exactly once to
/// the embedding orchestrator. Each variant carries a distinguishable
/// reason so "gave up" never looks like "failed".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalReason {
    #[error("job disconnected too long: lease ({0} seconds) expired")]
    LeaseExpired(u64),

    #[error("job not found at remote end")]
    JobNotFound,

    #[error("reconnect authentication rejected: {0}")]
    AuthorizationRejected(String),

    #[error("peer returned an impossible result code {0}")]
    ProtocolFault(i32),

    #[error("connection lost and reconnection is not supported")]
    ReconnectUnsupported,
}
