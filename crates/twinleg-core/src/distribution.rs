//! Conversion of matched leg volume into balance.
//!
//! A sweep is planned against an immutable view of the registry and only
//! then applied, so a failed plan leaves every balance untouched.
//!
//! Carry-over rule: the matched amount is deducted from both current legs.
//! The weaker leg drops to zero and the stronger leg keeps its excess for the
//! next cycle. The full matched amount is consumed even when the payout is
//! capped by [`EngineConfig::max_payout_per_cycle`].

use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, BPS_DENOMINATOR};
use crate::error::LedgerError;
use crate::registry::{Amount, ParticipantId, ParticipantRecord, Registry, Timestamp};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payout {
    pub participant: ParticipantId,
    pub matched: Amount,
    pub amount: Amount,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DistributionReport {
    pub distributed_at: Timestamp,
    /// Participants credited a non-zero payout.
    pub paid: usize,
    pub total_payout: Amount,
    pub skipped_inactive: Vec<ParticipantId>,
    /// Every active participant with matched volume, in registration order.
    pub payouts: Vec<Payout>,
}

pub fn payout_for(record: &ParticipantRecord, config: &EngineConfig) -> Amount {
    let matched = u128::from(record.matched_volume());
    let bps = u128::from(config.plan_rate_bps(record.plan));
    let raw = matched * bps / u128::from(BPS_DENOMINATOR);
    let raw = Amount::try_from(raw).unwrap_or(Amount::MAX);
    match config.max_payout_per_cycle {
        Some(cap) => raw.min(cap),
        None => raw,
    }
}

/// Compute the sweep for `now` without mutating anything.
pub fn plan_distribution(
    registry: &Registry,
    config: &EngineConfig,
    now: Timestamp,
) -> Result<DistributionReport, LedgerError> {
    let mut report = DistributionReport {
        distributed_at: now,
        paid: 0,
        total_payout: 0,
        skipped_inactive: Vec::new(),
        payouts: Vec::new(),
    };
    for record in registry.iter() {
        if !record.active {
            report.skipped_inactive.push(record.id.clone());
            continue;
        }
        let matched = record.matched_volume();
        if matched == 0 {
            continue;
        }
        let amount = payout_for(record, config);
        record
            .balance_points
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;
        record
            .total_earnings
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;
        report.total_payout = report
            .total_payout
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;
        if amount > 0 {
            report.paid += 1;
        }
        report.payouts.push(Payout {
            participant: record.id.clone(),
            matched,
            amount,
        });
    }
    Ok(report)
}

/// Apply a plan produced by [`plan_distribution`] on the same registry state.
pub(crate) fn apply_distribution(registry: &mut Registry, report: &DistributionReport) {
    for payout in &report.payouts {
        let Some(record) = registry.get_mut(&payout.participant) else {
            continue;
        };
        record.balance_points += payout.amount;
        record.total_earnings += payout.amount;
        record.current_left_volume -= payout.matched;
        record.current_right_volume -= payout.matched;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Plan;

    fn record(id: &str, plan: Plan, left: Amount, right: Amount) -> ParticipantRecord {
        let mut record = ParticipantRecord::new(id.into(), None, plan, 0, 0);
        record.current_left_volume = left;
        record.current_right_volume = right;
        record.total_left_volume = left;
        record.total_right_volume = right;
        record
    }

    #[test]
    fn matched_volume_pays_plan_rate_and_carries_excess() {
        let mut registry = Registry::new();
        registry.insert(record("a", Plan::Binary, 300, 150)).unwrap();
        let config = EngineConfig::default();
        let report = plan_distribution(&registry, &config, 10).unwrap();
        assert_eq!(report.paid, 1);
        assert_eq!(report.total_payout, 15);
        apply_distribution(&mut registry, &report);
        let a = registry.get("a").unwrap();
        assert_eq!(a.balance_points, 15);
        assert_eq!(a.total_earnings, 15);
        assert_eq!(a.current_left_volume, 150);
        assert_eq!(a.current_right_volume, 0);
        assert_eq!(a.total_left_volume, 300);
    }

    #[test]
    fn in_order_plan_uses_its_own_rate() {
        let config = EngineConfig::default();
        let r = record("m", Plan::InOrder, 1_000, 1_000);
        assert_eq!(payout_for(&r, &config), 80);
    }

    #[test]
    fn payout_cap_limits_credit_but_consumes_match() {
        let mut registry = Registry::new();
        registry.insert(record("a", Plan::Binary, 10_000, 4_000)).unwrap();
        let config = EngineConfig {
            max_payout_per_cycle: Some(100),
            ..EngineConfig::default()
        };
        let report = plan_distribution(&registry, &config, 0).unwrap();
        assert_eq!(report.payouts[0].amount, 100);
        apply_distribution(&mut registry, &report);
        let a = registry.get("a").unwrap();
        assert_eq!((a.current_left_volume, a.current_right_volume), (6_000, 0));
    }

    #[test]
    fn inactive_participants_are_skipped_and_keep_volume() {
        let mut registry = Registry::new();
        let mut frozen = record("frozen", Plan::Binary, 500, 500);
        frozen.active = false;
        registry.insert(frozen).unwrap();
        registry.insert(record("idle", Plan::Binary, 500, 0)).unwrap();
        let report = plan_distribution(&registry, &EngineConfig::default(), 0).unwrap();
        assert_eq!(report.skipped_inactive, vec!["frozen".to_string()]);
        assert_eq!(report.paid, 0);
        assert!(report.payouts.is_empty());
        apply_distribution(&mut registry, &report);
        assert_eq!(registry.get("frozen").unwrap().current_left_volume, 500);
    }

    #[test]
    fn overflowing_balance_rejects_the_whole_sweep() {
        let mut registry = Registry::new();
        registry.insert(record("a", Plan::Binary, 100, 100)).unwrap();
        let mut rich = record("rich", Plan::Binary, 1_000, 1_000);
        rich.balance_points = Amount::MAX;
        registry.insert(rich).unwrap();
        let err = plan_distribution(&registry, &EngineConfig::default(), 0).unwrap_err();
        assert_eq!(err, LedgerError::Overflow);
    }
}
