pub mod accounting;
pub mod claim;
pub mod config;
pub mod error;
pub mod lease;
pub mod manager;
pub mod record;
pub mod remote;
pub mod security;
pub mod state;

pub use claim::Claim;
pub use config::ClaimConfig;
pub use error::FatalReason;
pub use manager::{ClaimHandle, ClaimManager, RunOutcome};
pub use state::ResourceState;
