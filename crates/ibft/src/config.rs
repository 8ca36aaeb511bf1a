//! Consensus timing configuration.

use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Cap on the exponential term of the round timeout so the shift stays
/// defined at absurd round numbers.
const MAX_TIMEOUT_EXPONENT: u64 = 30;

/// Timing configuration for the consensus engine.
///
/// Logging and tracing are not configured here; they follow the
/// globally installed `tracing` subscriber.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base timeout for validation and round-change message waits.
    pub timeout: Duration,
    /// Base timeout for the preprepare wait as a non-proposer. Routed
    /// through the same per-round schedule as `timeout`.
    pub proposal_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            proposal_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl Config {
    /// Configuration with the default two-second bases.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base timeout for validation and round-change waits.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the base timeout for the preprepare wait.
    pub fn with_proposal_timeout(mut self, timeout: Duration) -> Self {
        self.proposal_timeout = timeout;
        self
    }

    /// Round timeout schedule: `base` at round 0, `base + 2^round`
    /// seconds afterwards. The exponential growth bounds the time to
    /// reach a correct leader once the network stabilizes.
    pub(crate) fn round_timeout(base: Duration, round: u64) -> Duration {
        if round == 0 {
            return base;
        }
        base + Duration::from_secs(1 << round.min(MAX_TIMEOUT_EXPONENT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_is_exponential_past_round_zero() {
        let base = Duration::from_secs(2);
        assert_eq!(Config::round_timeout(base, 0), Duration::from_secs(2));
        assert_eq!(Config::round_timeout(base, 1), Duration::from_secs(4));
        assert_eq!(Config::round_timeout(base, 2), Duration::from_secs(6));
        assert_eq!(Config::round_timeout(base, 3), Duration::from_secs(10));
    }

    #[test]
    fn schedule_survives_huge_rounds() {
        let t = Config::round_timeout(Duration::from_secs(2), u64::MAX);
        assert!(t > Duration::from_secs(1 << 30));
    }
}
