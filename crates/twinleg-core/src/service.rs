//! Thread-safe handle around [`LedgerEngine`].
//!
//! Mutating commands take the write lock for their whole duration, so they
//! form one total order. Queries share the read lock and only ever see fully
//! committed state. Custodian calls are made with no lock held.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{info, warn};

use crate::clock::Clock;
use crate::custodian::{Custodian, TransferReceipt};
use crate::distribution::DistributionReport;
use crate::error::LedgerError;
use crate::ledger::{LedgerEngine, LedgerEvent, LedgerSnapshot, Registration};
use crate::registry::{Amount, ParticipantSnapshot};

pub struct Ledger<C, K> {
    engine: RwLock<LedgerEngine>,
    custodian: C,
    clock: K,
}

impl<C: Custodian, K: Clock> Ledger<C, K> {
    pub fn new(engine: LedgerEngine, custodian: C, clock: K) -> Self {
        Self {
            engine: RwLock::new(engine),
            custodian,
            clock,
        }
    }

    pub fn custodian(&self) -> &C {
        &self.custodian
    }

    pub fn clock(&self) -> &K {
        &self.clock
    }

    /// Validate the registration, collect the stake approval from the
    /// custodian, then register. A request the ledger would reject never
    /// reaches the custodian.
    pub fn register(
        &self,
        caller: &str,
        mut request: Registration,
    ) -> Result<ParticipantSnapshot, LedgerError> {
        let stake = {
            let engine = self.read();
            engine
                .check_registration(caller, &request)
                .inspect_err(|err| warn!(caller, %err, "register rejected"))?;
            request
                .volume
                .unwrap_or(engine.engine_config().registration_stake)
        };
        let receipt = self.custodian.approve_stake(&request.id, stake)?;
        request.volume = Some(stake);
        request.stake_reference = Some(receipt.reference);
        let now = self.clock.now();
        self.write().register(caller, request, now)
    }

    pub fn change_reward_cycle(&self, caller: &str, duration: u64) -> Result<(), LedgerError> {
        let now = self.clock.now();
        self.write().change_reward_cycle(caller, duration, now)
    }

    pub fn send_message(&self, caller: &str, message: impl Into<String>) -> Result<(), LedgerError> {
        let now = self.clock.now();
        self.write().send_message(caller, message, now)
    }

    pub fn distribute(&self, caller: &str) -> Result<DistributionReport, LedgerError> {
        let now = self.clock.now();
        self.write().distribute(caller, now)
    }

    pub fn deactivate(&self, caller: &str, participant: &str) -> Result<(), LedgerError> {
        let now = self.clock.now();
        self.write().deactivate(caller, participant, now)
    }

    /// Authorize and record the withdrawal, hand it to the custodian, then
    /// record what the custodian said.
    pub fn emergency_withdraw(
        &self,
        caller: &str,
        amount: Option<Amount>,
    ) -> Result<TransferReceipt, LedgerError> {
        let intent = self
            .write()
            .authorize_emergency_withdraw(caller, amount, self.clock.now())?;
        let outcome = self
            .custodian
            .emergency_withdraw(&intent.recipient, intent.amount);
        let recorded = outcome
            .as_ref()
            .map(|receipt| receipt.reference.clone())
            .map_err(|err| err.0.clone());
        self.write()
            .record_custody_outcome(intent.withdrawal, recorded, self.clock.now());
        let receipt = outcome?;
        info!(withdrawal = intent.withdrawal, reference = %receipt.reference, "emergency withdraw settled");
        Ok(receipt)
    }

    pub fn get(&self, id: &str) -> Option<ParticipantSnapshot> {
        self.read().get(id)
    }

    pub fn list_all(&self) -> Vec<ParticipantSnapshot> {
        self.read().list_all()
    }

    pub fn owner_message(&self) -> String {
        self.read().owner_message().to_string()
    }

    pub fn reward_cycle_duration(&self) -> u64 {
        self.read().reward_cycle_duration()
    }

    pub fn can_distribute(&self) -> bool {
        self.read().can_distribute(self.clock.now())
    }

    pub fn events(&self) -> Vec<LedgerEvent> {
        self.read().events().to_vec()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.read().snapshot()
    }

    pub fn into_engine(self) -> LedgerEngine {
        self.engine.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> RwLockReadGuard<'_, LedgerEngine> {
        self.engine.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LedgerEngine> {
        self.engine.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::clock::ManualClock;
    use crate::custodian::{CustodyCall, RecordingCustodian};
    use crate::registry::Plan;

    fn ledger() -> Ledger<RecordingCustodian, ManualClock> {
        let engine = LedgerEngine::with_defaults("owner", "admin", 0).unwrap();
        Ledger::new(engine, RecordingCustodian::new(), ManualClock::new(0))
    }

    #[test]
    fn registration_records_stake_reference() {
        let ledger = ledger();
        ledger
            .register("root", Registration::new("root", Plan::Binary))
            .unwrap();
        assert_eq!(
            ledger.custodian().calls(),
            vec![CustodyCall::ApproveStake {
                from: "root".into(),
                amount: 100
            }]
        );
        match &ledger.events()[0] {
            LedgerEvent::Registered { stake_reference, volume, .. } => {
                assert_eq!(stake_reference.as_deref(), Some("rec-1"));
                assert_eq!(*volume, 100);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn rejected_registrations_never_reach_the_custodian() {
        let ledger = ledger();
        ledger
            .register("root", Registration::new("root", Plan::Binary))
            .unwrap();
        let approved = ledger.custodian().calls();

        assert!(matches!(
            ledger.register("mallory", Registration::new("alice", Plan::Binary)),
            Err(LedgerError::Unauthorized { .. })
        ));
        assert_eq!(
            ledger.register("root", Registration::new("root", Plan::Binary)),
            Err(LedgerError::AlreadyRegistered("root".into()))
        );
        assert_eq!(
            ledger.register("bob", Registration::new("bob", Plan::Binary).referred_by("ghost")),
            Err(LedgerError::UnknownReferrer("ghost".into()))
        );
        assert!(matches!(
            ledger.register("bob", Registration::new("bob", Plan::Binary).with_volume(0)),
            Err(LedgerError::InvalidAmount(_))
        ));

        assert_eq!(ledger.custodian().calls(), approved);
        assert_eq!(ledger.events().len(), 1);
    }

    #[test]
    fn refused_stake_blocks_registration() {
        let ledger = ledger();
        ledger.custodian().fail_with("allowance missing");
        let err = ledger
            .register("root", Registration::new("root", Plan::Binary))
            .unwrap_err();
        assert_eq!(err, LedgerError::Custodian("allowance missing".into()));
        assert!(ledger.list_all().is_empty());
    }

    #[test]
    fn emergency_withdraw_records_custodian_outcome() {
        let ledger = ledger();
        let receipt = ledger.emergency_withdraw("admin", None).unwrap();
        assert_eq!(receipt.reference, "rec-1");
        assert_eq!(
            ledger.custodian().calls(),
            vec![CustodyCall::EmergencyWithdraw {
                to: "owner".into(),
                amount: None
            }]
        );
        ledger.custodian().fail_with("vault paused");
        assert!(ledger.emergency_withdraw("owner", Some(5)).is_err());
        let events = ledger.events();
        assert!(matches!(events.last(), Some(LedgerEvent::CustodyFailed { withdrawal: 2, .. })));
        assert_eq!(events.len(), 4);
    }

    #[test]
    fn distribution_uses_the_injected_clock() {
        let ledger = ledger();
        ledger.change_reward_cycle("admin", 60).unwrap();
        assert!(!ledger.can_distribute());
        assert!(matches!(
            ledger.distribute("owner"),
            Err(LedgerError::CycleNotElapsed { remaining: 60 })
        ));
        ledger.clock().advance(60);
        assert!(ledger.distribute("owner").is_ok());
    }

    #[test]
    fn concurrent_registrations_serialize_cleanly() {
        let ledger = Arc::new(ledger());
        ledger
            .register("root", Registration::new("root", Plan::Binary))
            .unwrap();
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    for n in 0..16 {
                        let id = format!("w{worker}-{n}");
                        let plan = if n % 2 == 0 { Plan::Binary } else { Plan::InOrder };
                        ledger
                            .register(&id, Registration::new(id.clone(), plan).referred_by("root"))
                            .unwrap();
                        let _ = ledger.list_all();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ledger.list_all().len(), 1 + 8 * 16);
        let engine = Arc::try_unwrap(ledger).ok().unwrap().into_engine();
        engine.check_invariants().unwrap();
    }
}
