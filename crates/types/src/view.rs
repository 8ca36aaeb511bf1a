//! Consensus position.

use serde::{Deserialize, Serialize};

/// A consensus position: the sequence (block height) under agreement and
/// the retry round within it.
///
/// Ordering is lexicographic with `sequence` as the major key, which is
/// exactly the delivery order used by the message queue. Views carried
/// inside messages are never mutated.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct View {
    /// Block height under consensus.
    pub sequence: u64,
    /// Retry counter within the sequence; increments on timeout or state
    /// error and resets when the sequence advances.
    pub round: u64,
}

impl View {
    /// Create a view for the given sequence and round.
    pub fn new(sequence: u64, round: u64) -> Self {
        Self { sequence, round }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_sequence_major() {
        assert!(View::new(1, 5) < View::new(2, 0));
        assert!(View::new(2, 0) < View::new(2, 1));
        assert_eq!(View::new(3, 3), View::new(3, 3));
    }
}
