use twinleg_core::{
    EngineConfig, GlobalConfig, LedgerEngine, LedgerError, LedgerEvent, Plan, Registration,
};

const OWNER: &str = "owner";
const ADMIN: &str = "admin";
const GENESIS: u64 = 1_700_000_000;
const CYCLE: u64 = 3_600;

fn ledger() -> LedgerEngine {
    let global = GlobalConfig::new(OWNER.into(), ADMIN.into(), CYCLE, GENESIS).unwrap();
    LedgerEngine::new(EngineConfig::default(), global).unwrap()
}

fn register(ledger: &mut LedgerEngine, id: &str, referrer: Option<&str>, volume: u64) {
    let mut request = Registration::new(id, Plan::Binary).with_volume(volume);
    request.referrer = referrer.map(str::to_string);
    ledger.register(id, request, GENESIS).unwrap();
}

#[test]
fn sponsor_slots_fill_left_then_right() {
    let mut ledger = ledger();
    register(&mut ledger, "A", None, 100);
    register(&mut ledger, "B", Some("A"), 100);
    register(&mut ledger, "C", Some("A"), 100);
    let a = ledger.get("A").unwrap();
    assert_eq!(a.referrer, None);
    assert_eq!(a.left_child.as_deref(), Some("B"));
    assert_eq!(a.right_child.as_deref(), Some("C"));
}

#[test]
fn volume_climbs_the_structural_chain() {
    let mut ledger = ledger();
    register(&mut ledger, "A", None, 100);
    register(&mut ledger, "B", Some("A"), 100);
    register(&mut ledger, "C", Some("A"), 100);
    let a_before = ledger.get("A").unwrap();
    register(&mut ledger, "D", Some("B"), 100);

    let b = ledger.get("B").unwrap();
    assert_eq!(b.left_child.as_deref(), Some("D"));
    assert_eq!(b.current_left_volume, 100);
    assert_eq!(b.total_left_volume, 100);

    let a = ledger.get("A").unwrap();
    assert_eq!(a.current_left_volume, a_before.current_left_volume + 100);
    assert_eq!(a.total_left_volume, a_before.total_left_volume + 100);
    assert_eq!(a.current_right_volume, a_before.current_right_volume);
}

#[test]
fn early_distribution_leaves_state_unchanged() {
    let mut ledger = ledger();
    register(&mut ledger, "A", None, 100);
    register(&mut ledger, "B", Some("A"), 100);
    register(&mut ledger, "C", Some("A"), 100);
    let before = ledger.snapshot();
    let err = ledger.distribute(OWNER, GENESIS + CYCLE - 1).unwrap_err();
    assert_eq!(err, LedgerError::CycleNotElapsed { remaining: 1 });
    assert_eq!(ledger.snapshot(), before);
}

#[test]
fn owner_broadcast_is_readable_verbatim() {
    let mut ledger = ledger();
    ledger
        .send_message(OWNER, "Maintenance at 10:00", GENESIS)
        .unwrap();
    assert_eq!(ledger.owner_message(), "Maintenance at 10:00");
}

#[test]
fn admin_cannot_distribute_or_broadcast() {
    let mut ledger = ledger();
    register(&mut ledger, "A", None, 100);
    register(&mut ledger, "B", Some("A"), 100);
    register(&mut ledger, "C", Some("A"), 100);
    let before = ledger.snapshot();
    assert!(matches!(
        ledger.distribute(ADMIN, GENESIS + CYCLE),
        Err(LedgerError::Unauthorized { .. })
    ));
    assert!(matches!(
        ledger.send_message(ADMIN, "hi", GENESIS),
        Err(LedgerError::Unauthorized { .. })
    ));
    assert_eq!(ledger.snapshot(), before);

    ledger.change_reward_cycle(ADMIN, 60, GENESIS).unwrap();
    assert_eq!(ledger.reward_cycle_duration(), 60);
    ledger
        .authorize_emergency_withdraw(ADMIN, None, GENESIS)
        .unwrap();
}

#[test]
fn matched_volume_pays_and_carries_over() {
    let mut ledger = ledger();
    register(&mut ledger, "A", None, 100);
    register(&mut ledger, "B", Some("A"), 300);
    register(&mut ledger, "C", Some("A"), 150);
    let a = ledger.get("A").unwrap();
    assert_eq!((a.current_left_volume, a.current_right_volume), (300, 150));

    let report = ledger.distribute(OWNER, GENESIS + CYCLE).unwrap();
    let rate = u64::from(ledger.engine_config().binary_rate_bps);
    let expected = 150 * rate / 10_000;
    assert_eq!(report.total_payout, expected);

    let a = ledger.get("A").unwrap();
    assert_eq!(a.balance_points, expected);
    assert_eq!(a.total_earnings, expected);
    assert_eq!(a.current_right_volume, 0);
    assert_eq!(a.current_left_volume, 150);
    assert_eq!((a.total_left_volume, a.total_right_volume), (300, 150));

    // The carried 150 on the left pays out once the right leg catches up.
    register(&mut ledger, "E", Some("C"), 200);
    ledger.distribute(OWNER, GENESIS + 2 * CYCLE).unwrap();
    let a = ledger.get("A").unwrap();
    assert_eq!(a.balance_points, 2 * expected);
    assert_eq!((a.current_left_volume, a.current_right_volume), (0, 50));
}

#[test]
fn second_distribution_inside_the_cycle_is_rejected() {
    let mut ledger = ledger();
    register(&mut ledger, "A", None, 100);
    let first = GENESIS + CYCLE;
    ledger.distribute(OWNER, first).unwrap();
    assert!(matches!(
        ledger.distribute(OWNER, first + CYCLE - 1),
        Err(LedgerError::CycleNotElapsed { .. })
    ));
    assert!(ledger.distribute(OWNER, first + CYCLE).is_ok());
}

#[test]
fn duplicate_and_self_referrals_are_rejected() {
    let mut ledger = ledger();
    register(&mut ledger, "A", None, 100);
    let err = ledger
        .register("A", Registration::new("A", Plan::InOrder), GENESIS)
        .unwrap_err();
    assert_eq!(err, LedgerError::AlreadyRegistered("A".into()));
    let err = ledger
        .register("B", Registration::new("B", Plan::Binary).referred_by("B"), GENESIS)
        .unwrap_err();
    assert_eq!(err, LedgerError::SelfReferral("B".into()));
    assert_eq!(ledger.list_all().len(), 1);
}

#[test]
fn in_order_participants_share_one_matrix() {
    let mut ledger = ledger();
    register(&mut ledger, "A", None, 100);
    for (id, sponsor) in [("m1", "A"), ("m2", "A"), ("m3", "m2"), ("m4", "m2"), ("m5", "m2")] {
        ledger
            .register(
                id,
                Registration::new(id, Plan::InOrder).referred_by(sponsor),
                GENESIS,
            )
            .unwrap();
    }
    let parent = |id: &str| ledger.get(id).unwrap().parent.unwrap();
    assert_eq!(parent("m1"), "A");
    assert_eq!(parent("m2"), "A");
    assert_eq!(parent("m3"), "m1");
    assert_eq!(parent("m4"), "m1");
    assert_eq!(parent("m5"), "m2");
    assert_eq!(ledger.get("m2").unwrap().directs, 3);
    ledger.check_invariants().unwrap();
}

#[test]
fn depth_limit_rejects_without_side_effects() {
    let global = GlobalConfig::new(OWNER.into(), ADMIN.into(), CYCLE, GENESIS).unwrap();
    let config = EngineConfig {
        max_depth: Some(1),
        ..EngineConfig::default()
    };
    let mut ledger = LedgerEngine::new(config, global).unwrap();
    register(&mut ledger, "A", None, 100);
    register(&mut ledger, "B", Some("A"), 100);
    register(&mut ledger, "C", Some("A"), 100);
    let before = ledger.snapshot();
    let err = ledger
        .register("D", Registration::new("D", Plan::Binary).referred_by("A"), GENESIS)
        .unwrap_err();
    assert_eq!(err, LedgerError::PlacementFull { max_depth: 1 });
    assert_eq!(ledger.snapshot(), before);
}

#[test]
fn deactivated_participants_are_skipped_by_distribution() {
    let mut ledger = ledger();
    register(&mut ledger, "A", None, 100);
    register(&mut ledger, "B", Some("A"), 100);
    register(&mut ledger, "C", Some("A"), 100);
    ledger.deactivate(OWNER, "A", GENESIS).unwrap();
    let report = ledger.distribute(OWNER, GENESIS + CYCLE).unwrap();
    assert_eq!(report.skipped_inactive, vec!["A".to_string()]);
    assert_eq!(report.paid, 0);
    assert_eq!(ledger.get("A").unwrap().balance_points, 0);
    assert!(matches!(
        ledger.events().last(),
        Some(LedgerEvent::Distributed { paid: 0, .. })
    ));
}
