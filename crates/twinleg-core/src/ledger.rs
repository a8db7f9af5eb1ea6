//! The single-writer ledger state machine.
//!
//! Every command authorizes first, then validates everything it is about to
//! write, and only then mutates. A returned error therefore means nothing
//! changed. Serializing commands against each other is the caller's job; see
//! [`crate::service::Ledger`] for the locked handle.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::access::{authorize, Operation};
use crate::config::{EngineConfig, GlobalConfig};
use crate::distribution::{apply_distribution, plan_distribution, DistributionReport};
use crate::error::LedgerError;
use crate::placement::{PlacementDecision, PlacementEngine};
use crate::registry::{
    Amount, Leg, ParticipantId, ParticipantRecord, ParticipantSnapshot, Plan, Registry, Timestamp,
};
use crate::volume::{plan_propagation, propagate_volume, VolumeCredit};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SnapshotMetadata {
    /// Number of committed commands.
    pub height: u64,
    pub timestamp: Timestamp,
    /// Emergency withdrawals authorized so far.
    pub withdrawals: u64,
}

/// Audit trail entry appended by every committed command.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    Registered {
        participant: ParticipantId,
        referrer: Option<ParticipantId>,
        parent: Option<ParticipantId>,
        leg: Option<Leg>,
        plan: Plan,
        volume: Amount,
        stake_reference: Option<String>,
        at: Timestamp,
    },
    RewardCycleChanged {
        by: ParticipantId,
        previous: u64,
        duration: u64,
        at: Timestamp,
    },
    MessageBroadcast {
        by: ParticipantId,
        message: String,
        at: Timestamp,
    },
    Distributed {
        by: ParticipantId,
        paid: usize,
        total_payout: Amount,
        skipped_inactive: Vec<ParticipantId>,
        at: Timestamp,
    },
    EmergencyWithdrawAuthorized {
        withdrawal: u64,
        by: ParticipantId,
        amount: Option<Amount>,
        at: Timestamp,
    },
    CustodyCompleted {
        withdrawal: u64,
        reference: String,
    },
    CustodyFailed {
        withdrawal: u64,
        reason: String,
    },
    Deactivated {
        participant: ParticipantId,
        by: ParticipantId,
        at: Timestamp,
    },
}

/// Input to [`LedgerEngine::register`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Registration {
    pub id: ParticipantId,
    pub referrer: Option<ParticipantId>,
    pub plan: Plan,
    /// Defaults to [`EngineConfig::registration_stake`].
    pub volume: Option<Amount>,
    /// Custodian reference for the approved stake, kept for audit.
    pub stake_reference: Option<String>,
}

impl Registration {
    pub fn new(id: impl Into<ParticipantId>, plan: Plan) -> Self {
        Self {
            id: id.into(),
            referrer: None,
            plan,
            volume: None,
            stake_reference: None,
        }
    }

    pub fn referred_by(mut self, referrer: impl Into<ParticipantId>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    pub fn with_volume(mut self, volume: Amount) -> Self {
        self.volume = Some(volume);
        self
    }
}

/// An authorized emergency withdrawal waiting for the custodian.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WithdrawalIntent {
    pub withdrawal: u64,
    pub requested_by: ParticipantId,
    /// Funds always go to the owner, whoever asked.
    pub recipient: ParticipantId,
    pub amount: Option<Amount>,
}

/// Persisted form: participants table, the config singleton and the audit log.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub meta: SnapshotMetadata,
    pub engine: EngineConfig,
    pub global: GlobalConfig,
    pub placement: PlacementEngine,
    pub participants: Vec<ParticipantRecord>,
    pub events: Vec<LedgerEvent>,
    #[serde(with = "hex_root")]
    pub state_root: [u8; 32],
}

/// Writes a validated registration will make.
struct RegistrationPlan {
    volume: Amount,
    /// `None` for the root.
    placement: Option<PlannedPlacement>,
}

struct PlannedPlacement {
    sponsor: ParticipantId,
    decision: PlacementDecision,
    credits: Vec<VolumeCredit>,
    directs: u32,
}

#[derive(Clone, Debug)]
pub struct LedgerEngine {
    meta: SnapshotMetadata,
    engine: EngineConfig,
    global: GlobalConfig,
    registry: Registry,
    placement: PlacementEngine,
    events: Vec<LedgerEvent>,
}

impl LedgerEngine {
    pub fn new(engine: EngineConfig, global: GlobalConfig) -> Result<Self, LedgerError> {
        engine.validate()?;
        Ok(Self {
            meta: SnapshotMetadata {
                timestamp: global.last_distribution_at(),
                ..SnapshotMetadata::default()
            },
            engine,
            global,
            registry: Registry::new(),
            placement: PlacementEngine::new(),
            events: Vec::new(),
        })
    }

    /// Convenience constructor using the engine's default cycle length.
    pub fn with_defaults(
        owner: impl Into<ParticipantId>,
        admin: impl Into<ParticipantId>,
        genesis: Timestamp,
    ) -> Result<Self, LedgerError> {
        let engine = EngineConfig::default();
        let global = GlobalConfig::new(owner.into(), admin.into(), engine.default_reward_cycle, genesis)?;
        Self::new(engine, global)
    }

    // ---- queries ----

    pub fn get(&self, id: &str) -> Option<ParticipantSnapshot> {
        self.registry.get(id).cloned()
    }

    pub fn list_all(&self) -> Vec<ParticipantSnapshot> {
        self.registry.list_all()
    }

    pub fn owner_message(&self) -> &str {
        &self.global.owner_message
    }

    pub fn reward_cycle_duration(&self) -> u64 {
        self.global.reward_cycle_duration()
    }

    pub fn can_distribute(&self, now: Timestamp) -> bool {
        self.global.cycle.can_distribute(now)
    }

    pub fn global_config(&self) -> &GlobalConfig {
        &self.global
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    pub fn meta(&self) -> &SnapshotMetadata {
        &self.meta
    }

    // ---- commands ----

    pub fn register(
        &mut self,
        caller: &str,
        request: Registration,
        now: Timestamp,
    ) -> Result<ParticipantSnapshot, LedgerError> {
        self.try_register(caller, request, now)
            .inspect_err(|err| warn!(caller, %err, "register rejected"))
    }

    /// Run every check [`Self::register`] would, without changing anything.
    pub fn check_registration(
        &self,
        caller: &str,
        request: &Registration,
    ) -> Result<(), LedgerError> {
        self.plan_registration(caller, request).map(|_| ())
    }

    fn plan_registration(
        &self,
        caller: &str,
        request: &Registration,
    ) -> Result<RegistrationPlan, LedgerError> {
        authorize(&self.global, &self.registry, caller, Operation::Register, Some(request.id.as_str()))?;
        let volume = request.volume.unwrap_or(self.engine.registration_stake);
        if volume == 0 {
            return Err(LedgerError::InvalidAmount("contributed volume must be > 0"));
        }
        let Some(sponsor) = self
            .registry
            .resolve_sponsor(&request.id, request.referrer.as_deref())?
        else {
            return Ok(RegistrationPlan {
                volume,
                placement: None,
            });
        };
        let decision = self
            .placement
            .locate(&self.registry, request.plan, &sponsor, self.engine.max_depth)?;
        let credits = plan_propagation(
            &self.registry,
            &decision.parent,
            decision.leg,
            volume,
            self.engine.propagation_depth,
        )?;
        let directs = self
            .registry
            .get(&sponsor)
            .map(|s| s.directs)
            .ok_or_else(|| LedgerError::UnknownReferrer(sponsor.clone()))?
            .checked_add(1)
            .ok_or(LedgerError::Overflow)?;
        Ok(RegistrationPlan {
            volume,
            placement: Some(PlannedPlacement {
                sponsor,
                decision,
                credits,
                directs,
            }),
        })
    }

    fn try_register(
        &mut self,
        caller: &str,
        request: Registration,
        now: Timestamp,
    ) -> Result<ParticipantSnapshot, LedgerError> {
        let RegistrationPlan { volume, placement } = self.plan_registration(caller, &request)?;
        let seq = self.registry.len() as u64;
        let sponsor = placement.as_ref().map(|p| p.sponsor.clone());
        let mut record = ParticipantRecord::new(request.id.clone(), sponsor, request.plan, seq, now);

        let Some(PlannedPlacement {
            sponsor,
            decision,
            credits,
            directs,
        }) = placement
        else {
            self.registry.insert(record.clone())?;
            self.commit(
                LedgerEvent::Registered {
                    participant: request.id.clone(),
                    referrer: None,
                    parent: None,
                    leg: None,
                    plan: request.plan,
                    volume,
                    stake_reference: request.stake_reference,
                    at: now,
                },
                now,
            );
            info!(participant = %request.id, "root registered");
            return Ok(record);
        };

        record.parent = Some(decision.parent.clone());
        record.position = Some(decision.leg);
        record.depth = decision.depth;
        self.registry.insert(record.clone())?;
        if let Some(parent) = self.registry.get_mut(&decision.parent) {
            match decision.leg {
                Leg::Left => parent.left_child = Some(request.id.clone()),
                Leg::Right => parent.right_child = Some(request.id.clone()),
            }
        }
        if let Some(sponsor_record) = self.registry.get_mut(&sponsor) {
            sponsor_record.directs = directs;
        }
        self.placement.commit(&decision);
        propagate_volume(&mut self.registry, &credits, volume);

        self.commit(
            LedgerEvent::Registered {
                participant: request.id.clone(),
                referrer: Some(sponsor.clone()),
                parent: Some(decision.parent.clone()),
                leg: Some(decision.leg),
                plan: request.plan,
                volume,
                stake_reference: request.stake_reference,
                at: now,
            },
            now,
        );
        info!(
            participant = %request.id,
            sponsor = %sponsor,
            parent = %decision.parent,
            leg = ?decision.leg,
            "participant registered"
        );
        Ok(record)
    }

    pub fn change_reward_cycle(
        &mut self,
        caller: &str,
        duration: u64,
        now: Timestamp,
    ) -> Result<(), LedgerError> {
        self.authorize(caller, Operation::ChangeRewardCycle)?;
        let previous = self
            .global
            .cycle
            .change(duration)
            .inspect_err(|err| warn!(caller, %err, "reward cycle change rejected"))?;
        self.commit(
            LedgerEvent::RewardCycleChanged {
                by: caller.to_string(),
                previous,
                duration,
                at: now,
            },
            now,
        );
        info!(caller, previous, duration, "reward cycle changed");
        Ok(())
    }

    pub fn send_message(
        &mut self,
        caller: &str,
        message: impl Into<String>,
        now: Timestamp,
    ) -> Result<(), LedgerError> {
        self.authorize(caller, Operation::SendMessage)?;
        let message = message.into();
        self.global.owner_message = message.clone();
        self.commit(
            LedgerEvent::MessageBroadcast {
                by: caller.to_string(),
                message,
                at: now,
            },
            now,
        );
        info!(caller, "owner message updated");
        Ok(())
    }

    /// Run one reward sweep. Either the whole cycle commits or nothing does.
    pub fn distribute(
        &mut self,
        caller: &str,
        now: Timestamp,
    ) -> Result<DistributionReport, LedgerError> {
        self.authorize(caller, Operation::Distribute)?;
        if !self.global.cycle.can_distribute(now) {
            let err = LedgerError::CycleNotElapsed {
                remaining: self.global.cycle.remaining(now),
            };
            warn!(caller, %err, "distribution rejected");
            return Err(err);
        }
        let report = plan_distribution(&self.registry, &self.engine, now)
            .inspect_err(|err| warn!(caller, %err, "distribution rejected"))?;
        apply_distribution(&mut self.registry, &report);
        self.global.cycle.mark_distributed(now);
        self.commit(
            LedgerEvent::Distributed {
                by: caller.to_string(),
                paid: report.paid,
                total_payout: report.total_payout,
                skipped_inactive: report.skipped_inactive.clone(),
                at: now,
            },
            now,
        );
        info!(
            paid = report.paid,
            total_payout = report.total_payout,
            skipped = report.skipped_inactive.len(),
            "rewards distributed"
        );
        Ok(report)
    }

    /// Authorize and record an emergency withdrawal. The transfer itself is
    /// the custodian's; report its outcome with [`Self::record_custody_outcome`].
    pub fn authorize_emergency_withdraw(
        &mut self,
        caller: &str,
        amount: Option<Amount>,
        now: Timestamp,
    ) -> Result<WithdrawalIntent, LedgerError> {
        self.authorize(caller, Operation::EmergencyWithdraw)?;
        if amount == Some(0) {
            let err = LedgerError::InvalidAmount("withdrawal amount must be > 0");
            warn!(caller, %err, "emergency withdraw rejected");
            return Err(err);
        }
        let withdrawal = self.meta.withdrawals + 1;
        self.meta.withdrawals = withdrawal;
        self.commit(
            LedgerEvent::EmergencyWithdrawAuthorized {
                withdrawal,
                by: caller.to_string(),
                amount,
                at: now,
            },
            now,
        );
        info!(caller, withdrawal, ?amount, "emergency withdraw authorized");
        Ok(WithdrawalIntent {
            withdrawal,
            requested_by: caller.to_string(),
            recipient: self.global.owner.clone(),
            amount,
        })
    }

    pub fn record_custody_outcome(
        &mut self,
        withdrawal: u64,
        outcome: Result<String, String>,
        now: Timestamp,
    ) {
        let event = match outcome {
            Ok(reference) => {
                info!(withdrawal, %reference, "custodian completed withdrawal");
                LedgerEvent::CustodyCompleted { withdrawal, reference }
            }
            Err(reason) => {
                warn!(withdrawal, %reason, "custodian failed withdrawal");
                LedgerEvent::CustodyFailed { withdrawal, reason }
            }
        };
        self.commit(event, now);
    }

    /// Permanently exclude a participant from future distributions.
    pub fn deactivate(
        &mut self,
        caller: &str,
        participant: &str,
        now: Timestamp,
    ) -> Result<(), LedgerError> {
        self.authorize(caller, Operation::Deactivate)?;
        let record = self
            .registry
            .get_mut(participant)
            .ok_or_else(|| LedgerError::UnknownParticipant(participant.to_string()))?;
        if !record.active {
            return Err(LedgerError::InactiveParticipant(participant.to_string()));
        }
        record.active = false;
        self.commit(
            LedgerEvent::Deactivated {
                participant: participant.to_string(),
                by: caller.to_string(),
                at: now,
            },
            now,
        );
        info!(caller, participant, "participant deactivated");
        Ok(())
    }

    fn authorize(&self, caller: &str, operation: Operation) -> Result<(), LedgerError> {
        authorize(&self.global, &self.registry, caller, operation, None)
            .map(|_| ())
            .inspect_err(|err| warn!(caller, %err, "command rejected"))
    }

    fn commit(&mut self, event: LedgerEvent, now: Timestamp) {
        self.events.push(event);
        self.meta.height += 1;
        self.meta.timestamp = self.meta.timestamp.max(now);
    }

    // ---- persistence ----

    pub fn state_root(&self) -> [u8; 32] {
        compute_state_root(
            &self.meta,
            &self.global,
            &self.engine,
            &self.placement,
            &self.registry,
            &self.events,
        )
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            meta: self.meta.clone(),
            engine: self.engine.clone(),
            global: self.global.clone(),
            placement: self.placement.clone(),
            participants: self.registry.list_all(),
            events: self.events.clone(),
            state_root: self.state_root(),
        }
    }

    /// Rebuild from a snapshot, rejecting it if the audit log does not match
    /// the height, or the root or the structural invariants do not hold.
    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Result<Self, LedgerError> {
        snapshot
            .engine
            .validate()
            .map_err(|err| LedgerError::CorruptSnapshot(err.to_string()))?;
        if snapshot.events.len() as u64 != snapshot.meta.height {
            return Err(LedgerError::CorruptSnapshot(format!(
                "{} events recorded for height {}",
                snapshot.events.len(),
                snapshot.meta.height
            )));
        }
        let engine = Self {
            meta: snapshot.meta,
            engine: snapshot.engine,
            global: snapshot.global,
            registry: Registry::from_records(snapshot.participants)?,
            placement: snapshot.placement,
            events: snapshot.events,
        };
        if engine.state_root() != snapshot.state_root {
            return Err(LedgerError::CorruptSnapshot("state root mismatch".into()));
        }
        engine.check_invariants()?;
        Ok(engine)
    }

    /// Structural invariants: single root, acyclic referrers, slot/parent
    /// agreement, directs counts and lifetime >= current volume.
    pub fn check_invariants(&self) -> Result<(), LedgerError> {
        let corrupt = |msg: String| Err(LedgerError::CorruptSnapshot(msg));
        let mut directs: BTreeMap<&str, u32> = BTreeMap::new();
        for (seq, record) in self.registry.iter().enumerate() {
            if record.joined_at != seq as u64 {
                return corrupt(format!("{} out of registration order", record.id));
            }
            if record.total_left_volume < record.current_left_volume
                || record.total_right_volume < record.current_right_volume
            {
                return corrupt(format!("{} current volume exceeds lifetime", record.id));
            }
            match (&record.referrer, &record.parent, record.position) {
                (None, None, None) if seq == 0 => {}
                (Some(referrer), Some(parent), Some(leg)) if seq > 0 => {
                    // Links may only point at earlier records, so no cycles.
                    let earlier = |id: &str| {
                        self.registry
                            .get(id)
                            .is_some_and(|r| r.joined_at < record.joined_at)
                    };
                    if !earlier(referrer) || !earlier(parent) {
                        return corrupt(format!("{} links to a later or unknown record", record.id));
                    }
                    let parent_record = self.registry.get(parent);
                    let slot_ok = parent_record
                        .is_some_and(|p| p.child(leg) == Some(&record.id) && p.depth + 1 == record.depth);
                    if !slot_ok {
                        return corrupt(format!("{} disagrees with its parent slot", record.id));
                    }
                    *directs.entry(referrer.as_str()).or_default() += 1;
                }
                _ => return corrupt(format!("{} has inconsistent root links", record.id)),
            }
            for leg in [Leg::Left, Leg::Right] {
                if let Some(child) = record.child(leg) {
                    let child_ok = self
                        .registry
                        .get(child)
                        .is_some_and(|c| c.parent.as_ref() == Some(&record.id) && c.position == Some(leg));
                    if !child_ok {
                        return corrupt(format!("{} has a dangling {leg:?} child", record.id));
                    }
                }
            }
        }
        for record in self.registry.iter() {
            let expected = directs.get(record.id.as_str()).copied().unwrap_or(0);
            if record.directs != expected {
                return corrupt(format!(
                    "{} directs {} but {} records name it",
                    record.id, record.directs, expected
                ));
            }
        }
        Ok(())
    }
}

fn compute_state_root(
    meta: &SnapshotMetadata,
    global: &GlobalConfig,
    engine: &EngineConfig,
    placement: &PlacementEngine,
    registry: &Registry,
    events: &[LedgerEvent],
) -> [u8; 32] {
    let mut leaves: Vec<[u8; 32]> = Vec::with_capacity(registry.len() + 3);

    let mut hasher = Sha256::new();
    hasher.update(b"config");
    hasher.update(meta.height.to_le_bytes());
    hasher.update(meta.timestamp.to_le_bytes());
    hasher.update(meta.withdrawals.to_le_bytes());
    hasher.update(global.owner.as_bytes());
    hasher.update([0u8]);
    hasher.update(global.admin.as_bytes());
    hasher.update([0u8]);
    hasher.update(global.owner_message.as_bytes());
    hasher.update([0u8]);
    hasher.update(global.cycle.duration.to_le_bytes());
    hasher.update(global.cycle.last_distribution_at.to_le_bytes());
    leaves.push(hasher.finalize().into());

    let mut hasher = Sha256::new();
    hasher.update(b"engine");
    hasher.update(engine.binary_rate_bps.to_le_bytes());
    hasher.update(engine.in_order_rate_bps.to_le_bytes());
    hasher.update(engine.max_payout_per_cycle.unwrap_or(u64::MAX).to_le_bytes());
    hasher.update(engine.max_depth.unwrap_or(u32::MAX).to_le_bytes());
    hasher.update(engine.propagation_depth.unwrap_or(u32::MAX).to_le_bytes());
    hasher.update(engine.registration_stake.to_le_bytes());
    hasher.update((placement.in_order_cursor() as u64).to_le_bytes());
    leaves.push(hasher.finalize().into());

    leaves.push(events_leaf(events));
    for record in registry.iter() {
        leaves.push(participant_leaf(record));
    }
    build_merkle(leaves)
}

/// Running hash over the audit log, one length-prefixed entry per event.
fn events_leaf(events: &[LedgerEvent]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"events");
    for event in events {
        // Events hold only strings, integers and enums; encoding cannot fail.
        let encoded = serde_json::to_vec(event).unwrap_or_default();
        hasher.update((encoded.len() as u64).to_le_bytes());
        hasher.update(&encoded);
    }
    hasher.finalize().into()
}

fn participant_leaf(record: &ParticipantRecord) -> [u8; 32] {
    let opt = |hasher: &mut Sha256, id: &Option<ParticipantId>| {
        match id {
            Some(id) => {
                hasher.update([1u8]);
                hasher.update(id.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        hasher.update([0u8]);
    };
    let mut hasher = Sha256::new();
    hasher.update(b"participant");
    hasher.update(record.id.as_bytes());
    hasher.update([0u8]);
    opt(&mut hasher, &record.referrer);
    opt(&mut hasher, &record.parent);
    opt(&mut hasher, &record.left_child);
    opt(&mut hasher, &record.right_child);
    hasher.update([
        match record.plan {
            Plan::Binary => 0,
            Plan::InOrder => 1,
        },
        match record.position {
            None => 0,
            Some(Leg::Left) => 1,
            Some(Leg::Right) => 2,
        },
        u8::from(record.active),
    ]);
    hasher.update(record.depth.to_le_bytes());
    hasher.update(record.directs.to_le_bytes());
    for value in [
        record.current_left_volume,
        record.current_right_volume,
        record.total_left_volume,
        record.total_right_volume,
        record.balance_points,
        record.total_earnings,
        record.joined_at,
        record.registered_at,
    ] {
        hasher.update(value.to_le_bytes());
    }
    hasher.finalize().into()
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"twinleg-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            hasher.update(chunk.get(1).unwrap_or(&chunk[0]));
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}

pub(crate) mod hex_root {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom("state root must be 32 bytes"))
    }
}
