use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::registry::Timestamp;

/// Timing gate between distributions. Nothing here runs on a timer; callers
/// pass `now` from their clock.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RewardCycle {
    pub duration: u64,
    pub last_distribution_at: Timestamp,
}

impl RewardCycle {
    pub fn new(duration: u64, started_at: Timestamp) -> Result<Self, LedgerError> {
        validate_duration(duration)?;
        Ok(Self {
            duration,
            last_distribution_at: started_at,
        })
    }

    pub fn can_distribute(&self, now: Timestamp) -> bool {
        now.saturating_sub(self.last_distribution_at) >= self.duration
    }

    /// Seconds left before the next distribution is allowed.
    pub fn remaining(&self, now: Timestamp) -> u64 {
        let elapsed = now.saturating_sub(self.last_distribution_at);
        self.duration.saturating_sub(elapsed)
    }

    /// Applies to the next [`RewardCycle::can_distribute`] check only.
    pub fn change(&mut self, duration: u64) -> Result<u64, LedgerError> {
        validate_duration(duration)?;
        Ok(std::mem::replace(&mut self.duration, duration))
    }

    pub(crate) fn mark_distributed(&mut self, now: Timestamp) {
        self.last_distribution_at = now;
    }
}

fn validate_duration(duration: u64) -> Result<(), LedgerError> {
    if duration == 0 {
        return Err(LedgerError::InvalidAmount("reward cycle duration must be > 0"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_opens_after_full_duration() {
        let cycle = RewardCycle::new(100, 1_000).unwrap();
        assert!(!cycle.can_distribute(1_099));
        assert_eq!(cycle.remaining(1_099), 1);
        assert!(cycle.can_distribute(1_100));
        assert_eq!(cycle.remaining(5_000), 0);
    }

    #[test]
    fn clock_behind_last_run_keeps_gate_closed() {
        let cycle = RewardCycle::new(10, 1_000).unwrap();
        assert!(!cycle.can_distribute(900));
    }

    #[test]
    fn change_takes_effect_on_next_check() {
        let mut cycle = RewardCycle::new(100, 0).unwrap();
        assert!(!cycle.can_distribute(50));
        assert_eq!(cycle.change(50).unwrap(), 100);
        assert!(cycle.can_distribute(50));
        assert!(cycle.change(0).is_err());
        assert_eq!(cycle.duration, 50);
    }
}
