//! State-machine errors.

use thiserror::Error;

/// Errors carried from a failed state into the next round change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateError {
    /// A locked node received a proposal whose hash differs from the
    /// locked proposal's hash.
    #[error("locked proposal is incorrect")]
    IncorrectLockedProposal,
    /// A received proposal was rejected by the backend.
    #[error("proposal verification failed")]
    VerificationFailed,
    /// The backend rejected the quorum-certified proposal at insertion.
    #[error("failed to insert proposal")]
    FailedToInsertProposal,
}
