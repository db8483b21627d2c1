//! Derivation of the two per-claim security sessions.
//!
//! One opaque claim credential seeds two independent sessions: a *general*
//! session for ordinary RPC traffic with the execution agent, and a
//! *file-transfer* session negotiated at a different authorization level so
//! the two channels can carry different policy (encryption, integrity). The
//! file-transfer session namespaces the credential with a fixed prefix, so
//! its id can never collide with the general session's id, and any session
//! metadata inherited through the namespacing step is dropped before the
//! session is negotiated fresh.

use crate::claim::Claim;

/// Prefix applied to the claim credential when deriving the file-transfer
/// session. Stable across reconnects: the agent derives the same id.
const FILE_TRANSFER_PREFIX: &str = "xfer.";

const SESSION_ID_PREFIX: &str = "claim-session.";

/// Authorization level a session is negotiated at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthLevel {
    /// Peer-to-peer daemon traffic (the general claim session).
    Daemon,
    /// Write-level traffic (the file-transfer session).
    Write,
}

impl std::fmt::Display for AuthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthLevel::Daemon => write!(f, "daemon"),
            AuthLevel::Write => write!(f, "write"),
        }
    }
}

/// A negotiated, namespaced credential pair authenticating one category of
/// traffic under a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecuritySession {
    id: String,
    key: String,
    info: Option<String>,
    level: AuthLevel,
}

impl SecuritySession {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Opaque negotiation metadata, if any survived derivation.
    pub fn info(&self) -> Option<&str> {
        self.info.as_deref()
    }

    pub fn level(&self) -> AuthLevel {
        self.level
    }
}

/// The general and file-transfer sessions derived from one claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPair {
    pub general: SecuritySession,
    pub file_transfer: SecuritySession,
}

impl SessionPair {
    /// Derive both sessions from the claim credential. Pure: negotiation
    /// with the trust manager is the caller's job.
    pub fn derive(claim: &Claim) -> Self {
        let credential = claim.credential();

        let general = SecuritySession {
            id: format!("{}{}", SESSION_ID_PREFIX, credential),
            key: credential.to_string(),
            info: None,
            level: AuthLevel::Daemon,
        };

        // Namespace the credential so the derived id is distinct from the
        // general session's id for every credential, then clear inherited
        // metadata: the file-transfer session negotiates its own policy.
        let namespaced = format!("{}{}", FILE_TRANSFER_PREFIX, credential);
        let file_transfer = SecuritySession {
            id: format!("{}{}", SESSION_ID_PREFIX, namespaced),
            key: namespaced,
            info: None,
            level: AuthLevel::Write,
        };

        Self {
            general,
            file_transfer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_differ_for_any_credential() {
        for credential in ["", "a", "claim#42#secret", "xfer.", "claim-session."] {
            let claim = Claim::new(credential, "addr");
            let pair = SessionPair::derive(&claim);
            assert_ne!(
                pair.general.id(),
                pair.file_transfer.id(),
                "collision for credential {:?}",
                credential
            );
        }
    }

    #[test]
    fn derivation_is_stable_across_calls() {
        let claim = Claim::new("cred-1", "addr");
        assert_eq!(SessionPair::derive(&claim), SessionPair::derive(&claim));
    }

    #[test]
    fn levels_and_cleared_info() {
        let claim = Claim::new("cred-1", "addr");
        let pair = SessionPair::derive(&claim);

        assert_eq!(pair.general.level(), AuthLevel::Daemon);
        assert_eq!(pair.file_transfer.level(), AuthLevel::Write);
        // Metadata inherited through namespacing must be gone before the
        // file-transfer session is negotiated.
        assert!(pair.file_transfer.info().is_none());
    }

    #[test]
    fn file_transfer_key_is_namespaced() {
        let claim = Claim::new("cred-1", "addr");
        let pair = SessionPair::derive(&claim);
        assert_eq!(pair.general.key(), "cred-1");
        assert_eq!(pair.file_transfer.key(), "xfer.cred-1");
    }
}
