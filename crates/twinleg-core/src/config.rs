use serde::{Deserialize, Serialize};

use crate::cycle::RewardCycle;
use crate::error::LedgerError;
use crate::registry::{Amount, ParticipantId, Plan, Timestamp};

pub const BPS_DENOMINATOR: u64 = 10_000;
pub const DEFAULT_REWARD_CYCLE_SECS: u64 = 86_400;
pub const DEFAULT_REGISTRATION_STAKE: Amount = 100;

/// Tunables fixed when the ledger is created.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub binary_rate_bps: u32,
    pub in_order_rate_bps: u32,
    /// Per-participant payout cap for one cycle.
    pub max_payout_per_cycle: Option<Amount>,
    /// Deepest structural level a participant may be placed at.
    pub max_depth: Option<u32>,
    /// How many structural ancestors receive a registration's volume.
    pub propagation_depth: Option<u32>,
    pub registration_stake: Amount,
    pub default_reward_cycle: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary_rate_bps: 1_000,
            in_order_rate_bps: 800,
            max_payout_per_cycle: None,
            max_depth: None,
            propagation_depth: None,
            registration_stake: DEFAULT_REGISTRATION_STAKE,
            default_reward_cycle: DEFAULT_REWARD_CYCLE_SECS,
        }
    }
}

impl EngineConfig {
    pub fn plan_rate_bps(&self, plan: Plan) -> u32 {
        match plan {
            Plan::Binary => self.binary_rate_bps,
            Plan::InOrder => self.in_order_rate_bps,
        }
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        for (name, bps) in [
            ("binary_rate_bps", self.binary_rate_bps),
            ("in_order_rate_bps", self.in_order_rate_bps),
        ] {
            if u64::from(bps) > BPS_DENOMINATOR {
                return Err(LedgerError::InvalidConfig(format!(
                    "{name} {bps} exceeds {BPS_DENOMINATOR}"
                )));
            }
        }
        if self.registration_stake == 0 {
            return Err(LedgerError::InvalidConfig(
                "registration_stake must be > 0".into(),
            ));
        }
        if self.default_reward_cycle == 0 {
            return Err(LedgerError::InvalidConfig(
                "default_reward_cycle must be > 0".into(),
            ));
        }
        if self.max_depth == Some(0) {
            return Err(LedgerError::InvalidConfig(
                "max_depth must leave room below the root".into(),
            ));
        }
        Ok(())
    }
}

/// Privileged identities plus the owner-settable broadcast state.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GlobalConfig {
    pub owner: ParticipantId,
    pub admin: ParticipantId,
    pub owner_message: String,
    pub cycle: RewardCycle,
}

impl GlobalConfig {
    pub fn new(
        owner: ParticipantId,
        admin: ParticipantId,
        reward_cycle_duration: u64,
        genesis: Timestamp,
    ) -> Result<Self, LedgerError> {
        if owner == admin {
            return Err(LedgerError::InvalidConfig(
                "owner and admin must be distinct identities".into(),
            ));
        }
        if owner.is_empty() || admin.is_empty() {
            return Err(LedgerError::InvalidConfig(
                "owner and admin identities must not be empty".into(),
            ));
        }
        Ok(Self {
            owner,
            admin,
            owner_message: String::new(),
            cycle: RewardCycle::new(reward_cycle_duration, genesis)?,
        })
    }

    pub fn reward_cycle_duration(&self) -> u64 {
        self.cycle.duration
    }

    pub fn last_distribution_at(&self) -> Timestamp {
        self.cycle.last_distribution_at
    }
}
