//! Protocol messages and proposals.

use crate::{NodeId, View};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// The four protocol message kinds.
///
/// The derived ordering is the protocol order
/// `Preprepare < Prepare < Commit < RoundChange`, used by the message
/// queue to break ties between messages of the same view.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum MsgType {
    /// Proposal announcement from the round's proposer.
    Preprepare,
    /// First-phase vote on the announced proposal.
    Prepare,
    /// Second-phase vote, carrying the sender's committed seal.
    Commit,
    /// Vote to abandon the current round and start a higher one.
    RoundChange,
}

impl MsgType {
    /// Human-readable name for logging.
    pub fn name(self) -> &'static str {
        match self {
            MsgType::Preprepare => "preprepare",
            MsgType::Prepare => "prepare",
            MsgType::Commit => "commit",
            MsgType::RoundChange => "round_change",
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single protocol message as carried by gossip.
///
/// `Preprepare` is the only kind that carries the proposal payload and
/// `Commit` the only kind that carries a seal; `Prepare` and
/// `RoundChange` are bare votes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReq {
    /// Protocol kind of this message.
    pub msg_type: MsgType,
    /// The validator that produced the message.
    pub from: NodeId,
    /// The (sequence, round) the message applies to.
    pub view: View,
    /// Proposal payload; present on `Preprepare` only.
    pub proposal: Option<Vec<u8>>,
    /// Committed seal; present on `Commit` only.
    pub seal: Option<Vec<u8>>,
}

impl MessageReq {
    /// Create a bare message of the given kind; payload fields start
    /// empty and are filled in by the sender where the kind requires it.
    pub fn new(msg_type: MsgType, from: NodeId, view: View) -> Self {
        Self {
            msg_type,
            from,
            view,
            proposal: None,
            seal: None,
        }
    }
}

/// A proposal built by the local proposer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// Opaque proposal payload.
    pub data: Vec<u8>,
    /// Earliest instant at which the proposer may gossip this proposal.
    pub time: Instant,
}

impl Proposal {
    /// Create a proposal released at the given instant.
    pub fn new(data: Vec<u8>, time: Instant) -> Self {
        Self { data, time }
    }

    /// A proposal with no release delay, used when adopting a payload
    /// received from the round's proposer.
    pub fn immediate(data: Vec<u8>) -> Self {
        Self {
            data,
            time: Instant::now(),
        }
    }
}

/// A finalized, quorum-certified proposal handed to the backend for
/// insertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedProposal {
    /// The agreed proposal payload.
    pub proposal: Vec<u8>,
    /// Seals extracted from the commit messages of the quorum.
    pub committed_seals: Vec<Vec<u8>>,
    /// Proposer of the round that sealed the proposal.
    pub proposer: NodeId,
    /// The sequence this proposal seals.
    pub number: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_ordering_follows_protocol_order() {
        assert!(MsgType::Preprepare < MsgType::Prepare);
        assert!(MsgType::Prepare < MsgType::Commit);
        assert!(MsgType::Commit < MsgType::RoundChange);
    }

    #[test]
    fn bare_message_has_no_payload() {
        let msg = MessageReq::new(MsgType::Prepare, NodeId::from("a"), View::new(1, 0));
        assert!(msg.proposal.is_none());
        assert!(msg.seal.is_none());
    }
}
