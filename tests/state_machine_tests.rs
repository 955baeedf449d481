//! State Machine Tests
//!
//! Lifecycle guards for events and challenges, completion idempotency and
//! the challenge acceptance notifications.

mod test_helpers;

use chrono::{Duration as ChronoDuration, Utc};
use prize_settlement::*;
use test_helpers::*;

fn invalid_transition(err: &SettlementError) -> Option<(UnitStatus, UnitStatus)> {
    match err {
        SettlementError::Transition(TransitionError::InvalidTransition { from, to, .. }) => Some((*from, *to)),
        _ => None,
    }
}

async fn pending_challenge(h: &Harness, id: &str, challenged: &[&str]) -> CompetitiveUnit {
    let now = Utc::now();
    let terms = ChallengeTerms::new("alice", challenged.iter().map(|u| u.to_string()).collect());
    let unit = CompetitiveUnit::challenge(
        id,
        "team_runstr",
        terms,
        1_000,
        now + ChronoDuration::days(1),
        now + ChronoDuration::days(8),
    );
    h.machine.create_unit(unit).await.unwrap()
}

// ============================================================================
// EVENTS
// ============================================================================

#[tokio::test]
async fn test_event_follows_its_dates() {
    let h = Harness::new();
    let now = Utc::now();
    let start = now + ChronoDuration::hours(1);
    let end = now + ChronoDuration::hours(5);
    h.machine
        .create_unit(CompetitiveUnit::event("evt_dates", "Half Marathon", "team_runstr", 5_000, start, end))
        .await
        .unwrap();

    let err = h.machine.activate("evt_dates", now).await.unwrap_err();
    assert_eq!(invalid_transition(&err), Some((UnitStatus::Pending, UnitStatus::Active)));

    let unit = h.machine.activate("evt_dates", start).await.unwrap();
    assert_eq!(unit.status, UnitStatus::Active);

    let err = h
        .machine
        .complete("evt_dates", CompletionTrigger::EndDateReached, start)
        .await
        .unwrap_err();
    assert_eq!(invalid_transition(&err), Some((UnitStatus::Active, UnitStatus::Completed)));

    let transition = h
        .machine
        .complete("evt_dates", CompletionTrigger::EndDateReached, end)
        .await
        .unwrap();
    assert_eq!(transition.unit.status, UnitStatus::Completed);
    let event = transition.settlement.unwrap();
    assert_eq!(event.unit_id, "evt_dates");
    assert_eq!(event.requested_at, end);

    let stored = h.store.get_unit("evt_dates").unwrap().unwrap();
    let path: Vec<UnitStatus> = stored.history.iter().map(|c| c.to).collect();
    assert_eq!(path, vec![UnitStatus::Active, UnitStatus::Completed]);
}

#[tokio::test]
async fn test_early_completion_needs_results() {
    let h = Harness::new();
    h.past_event("evt_early", 100, 0, PayoutPolicy::Equal).await;
    h.machine.activate("evt_early", Utc::now()).await.unwrap();

    let err = h
        .machine
        .complete("evt_early", CompletionTrigger::Early, Utc::now())
        .await
        .unwrap_err();
    assert!(invalid_transition(&err).is_some());

    h.results.set("evt_early", &[]);
    let err = h
        .machine
        .complete("evt_early", CompletionTrigger::Early, Utc::now())
        .await
        .unwrap_err();
    assert!(invalid_transition(&err).is_some());

    h.results.set("evt_early", &[("alice", 12.5)]);
    let transition = h
        .machine
        .complete("evt_early", CompletionTrigger::Early, Utc::now())
        .await
        .unwrap();
    assert_eq!(transition.unit.status, UnitStatus::Completed);
}

#[tokio::test]
async fn test_events_cannot_be_accepted() {
    let h = Harness::new();
    h.past_event("evt_plain", 100, 0, PayoutPolicy::Equal).await;

    let err = h.machine.accept("evt_plain", "bob", Utc::now()).await.unwrap_err();
    assert_eq!(invalid_transition(&err), Some((UnitStatus::Pending, UnitStatus::Accepted)));
}

#[tokio::test]
async fn test_invalid_units_are_rejected() {
    let h = Harness::new();
    let now = Utc::now();

    let err = h
        .machine
        .create_unit(
            CompetitiveUnit::event("evt_fee", "Too Greedy", "team_runstr", 100, now, now)
                .with_arbitration_fee(150),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::InvalidUnit(_)));

    let err = h
        .machine
        .create_unit(CompetitiveUnit::event(
            "evt_backwards",
            "Backwards",
            "team_runstr",
            100,
            now,
            now - ChronoDuration::days(1),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::InvalidUnit(_)));

    h.past_event("evt_twice", 100, 0, PayoutPolicy::Equal).await;
    let err = h
        .machine
        .create_unit(CompetitiveUnit::event("evt_twice", "Again", "team_runstr", 100, now, now))
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::Store(StoreError::AlreadyExists(_))));
}

// ============================================================================
// CHALLENGES
// ============================================================================

#[tokio::test]
async fn test_challenge_needs_every_acceptance() {
    let h = Harness::new();
    let unit = pending_challenge(&h, "ch_group", &["bob", "carol"]).await;
    assert_eq!(unit.prize_pool, 3_000);
    assert_eq!(unit.arbitration_fee_percent, 10);
    assert_eq!(unit.arbitration_fee_amount(), 300);

    let err = h.machine.activate("ch_group", Utc::now()).await.unwrap_err();
    assert_eq!(invalid_transition(&err), Some((UnitStatus::Pending, UnitStatus::Active)));

    let unit = h.machine.accept("ch_group", "bob", Utc::now()).await.unwrap();
    assert_eq!(unit.status, UnitStatus::Pending);

    // Accepting twice changes nothing and notifies nobody
    h.machine.accept("ch_group", "bob", Utc::now()).await.unwrap();
    assert_eq!(h.notifier.count_kind("challenge_accepted"), 1);

    let unit = h.machine.accept("ch_group", "carol", Utc::now()).await.unwrap();
    assert_eq!(unit.status, UnitStatus::Accepted);

    let to_challenger = h.notifier.for_user("alice");
    assert_eq!(to_challenger.len(), 2);
    assert!(to_challenger
        .iter()
        .all(|n| n.payload.kind() == "challenge_accepted"));

    // Challenges start on acceptance, not on their start date
    let unit = h.machine.activate("ch_group", Utc::now()).await.unwrap();
    assert_eq!(unit.status, UnitStatus::Active);
}

#[tokio::test]
async fn test_declined_challenge_is_terminal() {
    let h = Harness::new();
    pending_challenge(&h, "ch_no", &["bob"]).await;

    let unit = h.machine.decline("ch_no", "bob", Utc::now()).await.unwrap();
    assert_eq!(unit.status, UnitStatus::Declined);
    assert_eq!(h.notifier.count_kind("challenge_declined"), 1);

    let err = h.machine.accept("ch_no", "bob", Utc::now()).await.unwrap_err();
    assert_eq!(invalid_transition(&err), Some((UnitStatus::Declined, UnitStatus::Accepted)));
    let err = h.machine.cancel("ch_no", Some("ops"), Utc::now()).await.unwrap_err();
    assert!(invalid_transition(&err).is_some());
}

#[tokio::test]
async fn test_outsiders_cannot_answer_a_challenge() {
    let h = Harness::new();
    pending_challenge(&h, "ch_private", &["bob"]).await;

    for user in ["mallory", "alice"] {
        let err = h.machine.accept("ch_private", user, Utc::now()).await.unwrap_err();
        assert!(matches!(
            err,
            SettlementError::Transition(TransitionError::NotChallenged { ref user_id, .. }) if user_id == user
        ));
    }
    let err = h.machine.decline("ch_private", "mallory", Utc::now()).await.unwrap_err();
    assert!(matches!(err, SettlementError::Transition(TransitionError::NotChallenged { .. })));
}

// ============================================================================
// CANCELLATION & DUPLICATE COMPLETION
// ============================================================================

#[tokio::test]
async fn test_cancel_from_open_states_only() {
    let h = Harness::new();
    h.past_event("evt_off", 100, 0, PayoutPolicy::Equal).await;
    let unit = h.machine.cancel("evt_off", Some("ops"), Utc::now()).await.unwrap();
    assert_eq!(unit.status, UnitStatus::Cancelled);
    assert_eq!(unit.history.last().unwrap().actor.as_deref(), Some("ops"));

    h.completed_event("evt_finished", 100, 0, PayoutPolicy::Equal, &[("alice", 1.0)])
        .await;
    let err = h.machine.cancel("evt_finished", None, Utc::now()).await.unwrap_err();
    assert_eq!(invalid_transition(&err), Some((UnitStatus::Completed, UnitStatus::Cancelled)));
}

#[tokio::test]
async fn test_repeated_completion_is_a_noop_once_settled() {
    let h = Harness::new();
    h.completed_event("evt_again", 100, 0, PayoutPolicy::Equal, &[("alice", 1.0)])
        .await;

    // Not settled yet: the request is emitted again
    let before = h
        .machine
        .complete("evt_again", CompletionTrigger::EndDateReached, Utc::now())
        .await
        .unwrap();
    assert!(before.settlement.is_some());

    h.orchestrator.request_settlement("evt_again").await.unwrap();

    let after = h
        .machine
        .complete("evt_again", CompletionTrigger::EndDateReached, Utc::now())
        .await
        .unwrap();
    assert!(after.settlement.is_none());
    assert_eq!(after.unit.status, UnitStatus::Completed);
    assert_eq!(h.orchestrator.distributions_for_unit("evt_again").unwrap().len(), 1);
}
