//! Per-height consensus state.

use crate::error::StateError;
use ibft_types::{MessageReq, NodeId, Proposal, ValidatorSet, View};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Protocol stage of the current sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IbftState {
    /// Waiting for (or producing) the round's preprepare.
    Accept,
    /// Tallying prepare and commit votes.
    Validate,
    /// Handing the sealed proposal to the backend.
    Commit,
    /// Negotiating the next round after a timeout or error.
    RoundChange,
    /// This node fell behind the network; abandon the sequence and
    /// resynchronize externally.
    Sync,
    /// The sequence was sealed and the height advanced.
    Done,
}

impl IbftState {
    /// Terminal states end the current `run` call.
    pub fn is_terminal(self) -> bool {
        matches!(self, IbftState::Sync | IbftState::Done)
    }

    /// Human-readable name for logging.
    pub fn name(self) -> &'static str {
        match self {
            IbftState::Accept => "accept",
            IbftState::Validate => "validate",
            IbftState::Commit => "commit",
            IbftState::RoundChange => "round_change",
            IbftState::Sync => "sync",
            IbftState::Done => "done",
        }
    }
}

impl fmt::Display for IbftState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Accumulated votes and bookkeeping for the height under consensus.
///
/// The lock and the proposal survive round changes within a sequence;
/// every other accumulator is per-round. Vote maps are keyed by sender,
/// so a validator is never counted twice no matter how often its
/// message is delivered.
pub(crate) struct RoundState {
    view: View,
    state: IbftState,
    validators: ValidatorSet,
    proposer: Option<NodeId>,
    proposal: Option<Proposal>,
    locked: bool,
    err: Option<StateError>,
    /// Prepare messages seen this round, by sender.
    prepared: HashMap<NodeId, MessageReq>,
    /// Commit messages (carrying seals) seen this round, by sender.
    committed: HashMap<NodeId, MessageReq>,
    /// Round-change tallies across rounds, by round then sender.
    round_messages: BTreeMap<u64, HashMap<NodeId, MessageReq>>,
}

impl RoundState {
    pub(crate) fn new(validators: ValidatorSet, sequence: u64) -> Self {
        Self {
            view: View::new(sequence, 0),
            state: IbftState::Accept,
            validators,
            proposer: None,
            proposal: None,
            locked: false,
            err: None,
            prepared: HashMap::new(),
            committed: HashMap::new(),
            round_messages: BTreeMap::new(),
        }
    }

    pub(crate) fn view(&self) -> View {
        self.view
    }

    pub(crate) fn state(&self) -> IbftState {
        self.state
    }

    pub(crate) fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub(crate) fn proposer(&self) -> Option<&NodeId> {
        self.proposer.as_ref()
    }

    pub(crate) fn proposal(&self) -> Option<&Proposal> {
        self.proposal.as_ref()
    }

    pub(crate) fn locked(&self) -> bool {
        self.locked
    }

    pub(crate) fn set_state(&mut self, state: IbftState) {
        self.state = state;
    }

    /// Restart the view at round 0 of `sequence`.
    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.view = View::new(sequence, 0);
    }

    pub(crate) fn set_round(&mut self, round: u64) {
        self.view.round = round;
    }

    pub(crate) fn set_proposal(&mut self, proposal: Proposal) {
        self.proposal = Some(proposal);
    }

    /// Compute and remember the proposer for the current round.
    pub(crate) fn calc_proposer(&mut self) -> NodeId {
        let proposer = self.validators.calc_proposer(self.view.round);
        self.proposer = Some(proposer.clone());
        proposer
    }

    pub(crate) fn lock(&mut self) {
        self.locked = true;
    }

    /// Release the lock and drop the proposal so a different one may be
    /// built or adopted in the next round.
    pub(crate) fn unlock(&mut self) {
        self.proposal = None;
        self.locked = false;
    }

    pub(crate) fn set_err(&mut self, err: StateError) {
        self.err = Some(err);
    }

    /// Take the error recorded by the previous state, clearing it.
    pub(crate) fn take_err(&mut self) -> Option<StateError> {
        self.err.take()
    }

    pub(crate) fn num_prepared(&self) -> usize {
        self.prepared.len()
    }

    pub(crate) fn num_committed(&self) -> usize {
        self.committed.len()
    }

    /// The `2F` threshold for this sequence's validator set.
    pub(crate) fn num_valid(&self) -> usize {
        self.validators.num_valid()
    }

    pub(crate) fn max_faulty(&self) -> usize {
        self.validators.max_faulty_nodes()
    }

    /// The largest round above the current one that any validator has
    /// already asked for. A single entry is enough to surface the round;
    /// jumping to it is still gated by the weak-certificate rule.
    pub(crate) fn max_round(&self) -> Option<u64> {
        self.round_messages
            .iter()
            .rev()
            .find(|(round, msgs)| **round > self.view.round && !msgs.is_empty())
            .map(|(round, _)| *round)
    }

    /// Record a prepare vote. Messages from non-members are ignored.
    pub(crate) fn add_prepared(&mut self, msg: MessageReq) {
        if !self.validators.includes(&msg.from) {
            return;
        }
        self.prepared.insert(msg.from.clone(), msg);
    }

    /// Record a commit vote. Messages from non-members are ignored.
    pub(crate) fn add_committed(&mut self, msg: MessageReq) {
        if !self.validators.includes(&msg.from) {
            return;
        }
        self.committed.insert(msg.from.clone(), msg);
    }

    /// Record a round-change vote and return the tally for its round.
    pub(crate) fn add_round_message(&mut self, msg: MessageReq) -> usize {
        let round = msg.view.round;
        if self.validators.includes(&msg.from) {
            self.round_messages
                .entry(round)
                .or_default()
                .insert(msg.from.clone(), msg);
        }
        self.round_messages
            .get(&round)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    /// Reset the vote accumulators for a new round. The lock and the
    /// proposal survive; round-change tallies at or above `round` are
    /// kept so a weak certificate can grow into a strong one.
    pub(crate) fn clean_round(&mut self, round: u64) {
        self.prepared.clear();
        self.committed.clear();
        self.round_messages = self.round_messages.split_off(&round);
    }

    /// Clear every accumulator. Called on entry to the accept state.
    pub(crate) fn reset_round_msgs(&mut self) {
        self.prepared.clear();
        self.committed.clear();
        self.round_messages.clear();
    }

    /// Seals carried by the commit quorum. Order is unspecified but
    /// stable for a given run.
    pub(crate) fn get_committed_seals(&self) -> Vec<Vec<u8>> {
        self.committed
            .values()
            .filter_map(|msg| msg.seal.clone())
            .collect()
    }
}
