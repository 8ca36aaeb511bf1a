//! Validator membership and proposer rotation.

use crate::NodeId;
use serde::{Deserialize, Serialize};

/// Ordered validator membership for one sequence.
///
/// Carries the proposer of the previously sealed height, which anchors
/// the deterministic rotation: the proposer for round `r` is the
/// validator at index `(index(last) + r + 1) mod N`, or `r mod N` when
/// no height has been sealed yet.
///
/// Quorum arithmetic: with `N` validators the set tolerates
/// `F = (N - 1) / 3` Byzantine members, and counting strictly more than
/// [`num_valid`](Self::num_valid) `= 2F` messages constitutes a strong
/// quorum of `2F + 1`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<NodeId>,
    last_proposer: Option<NodeId>,
}

impl ValidatorSet {
    /// Create a validator set with no sealed-height anchor (genesis).
    pub fn new(validators: Vec<NodeId>) -> Self {
        Self {
            validators,
            last_proposer: None,
        }
    }

    /// Set the proposer of the last sealed height.
    pub fn set_last_proposer(&mut self, last_proposer: Option<NodeId>) {
        self.last_proposer = last_proposer;
    }

    /// Builder-style variant of [`set_last_proposer`](Self::set_last_proposer).
    pub fn with_last_proposer(mut self, last_proposer: NodeId) -> Self {
        self.last_proposer = Some(last_proposer);
        self
    }

    /// Whether `id` is a member of the set.
    pub fn includes(&self, id: &NodeId) -> bool {
        self.validators.contains(id)
    }

    /// Position of `id` in the set, if present.
    pub fn index(&self, id: &NodeId) -> Option<usize> {
        self.validators.iter().position(|v| v == id)
    }

    /// Number of validators.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Iterate over the members in order.
    pub fn iter(&self) -> impl Iterator<Item = &NodeId> {
        self.validators.iter()
    }

    /// Maximum number of Byzantine validators the set tolerates:
    /// `F = (N - 1) / 3`.
    pub fn max_faulty_nodes(&self) -> usize {
        self.len().saturating_sub(1) / 3
    }

    /// The `2F` threshold; a message count strictly greater than this is
    /// a strong quorum.
    pub fn num_valid(&self) -> usize {
        2 * self.max_faulty_nodes()
    }

    /// Deterministic proposer for the given round.
    ///
    /// # Panics
    ///
    /// Panics if the set is empty; callers check membership first.
    pub fn calc_proposer(&self, round: u64) -> NodeId {
        let n = self.validators.len() as u64;
        let pick = match &self.last_proposer {
            None => round,
            Some(last) => {
                let offset = self.index(last).unwrap_or(0) as u64;
                offset + round + 1
            }
        };
        self.validators[(pick % n) as usize].clone()
    }
}
