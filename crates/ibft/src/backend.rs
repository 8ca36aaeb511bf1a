//! Contracts between the consensus core and the outside world.

use ibft_types::{MessageReq, NodeId, Proposal, SealedProposal, ValidatorSet};

/// Boxed error type used at the trait seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The runtime the consensus core drives: proposal construction and
/// validation, the sealed-proposal sink, and chain/liveness queries.
///
/// Calls happen on the consensus task and must be bounded; a slow
/// backend stalls consensus.
pub trait Backend: Send {
    /// Build a proposal for the current height. Called only when this
    /// node is the round's proposer.
    fn build_proposal(&mut self) -> Result<Proposal, BoxError>;

    /// Validate a raw proposal received from the round's proposer.
    fn validate(&self, proposal: &[u8]) -> Result<(), BoxError>;

    /// Insert a sealed proposal into the chain.
    fn insert(&mut self, sealed: SealedProposal) -> Result<(), BoxError>;

    /// Current confirmed height; the next sequence to run is this value.
    fn height(&self) -> u64;

    /// Validator set snapshot for the current sequence.
    fn validator_set(&self) -> ValidatorSet;

    /// Deterministic content hash of proposal bytes.
    fn hash(&self, data: &[u8]) -> Vec<u8>;

    /// Liveness oracle: the best height known to the network, and
    /// whether this node has fallen behind it while stuck at `sequence`.
    fn is_stuck(&self, sequence: u64) -> (u64, bool);
}

/// Fire-and-forget gossip broadcast to the other validators.
pub trait Transport: Send {
    /// Broadcast `msg` to every validator except `msg.from`. Failures
    /// are logged by the caller and never fail the protocol; the
    /// network is unreliable by design.
    fn gossip(&self, msg: &MessageReq) -> Result<(), BoxError>;
}

/// Signing identity of the local validator.
pub trait SignKey: Send {
    /// This validator's identifier.
    fn node_id(&self) -> NodeId;

    /// Sign `data`, producing the seal attached to commit messages.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, BoxError>;
}
