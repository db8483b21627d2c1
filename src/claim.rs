/// Identity of one reservation of a remote execution slot.
///
/// A claim is handed to us by the scheduling authority when a job is matched
/// to a slot. The credential is opaque to this crate: it authenticates us to
/// the remote peer and is the seed for both derived security sessions. A
/// claim is immutable once constructed; replacing it on re-activation must
/// release any sessions derived from the old one (the manager enforces this).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    credential: String,
    peer_addr: String,
    peer_name: Option<String>,
    pool: Option<String>,
}

impl Claim {
    pub fn new(credential: impl Into<String>, peer_addr: impl Into<String>) -> Self {
        Self {
            credential: credential.into(),
            peer_addr: peer_addr.into(),
            peer_name: None,
            pool: None,
        }
    }

    pub fn with_peer_name(mut self, name: impl Into<String>) -> Self {
        self.peer_name = Some(name.into());
        self
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }

    /// The opaque credential identifying this reservation.
    pub fn credential(&self) -> &str {
        &self.credential
    }

    /// Contact address of the remote peer holding the slot.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Logical name of the remote peer, if known.
    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    /// Pool the slot belongs to, if any.
    pub fn pool(&self) -> Option<&str> {
        self.pool.as_deref()
    }

    /// Best available human-readable name for log lines.
    pub fn display_name(&self) -> &str {
        self.peer_name.as_deref().unwrap_or(&self.peer_addr)
    }
}
