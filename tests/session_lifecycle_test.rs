//! End-to-end session scenarios against the in-process oracles

mod common;

use common::{participant, preferences, Harness};
use stakequiz::config::QuizConfig;
use stakequiz::oracle::RequestStatus;
use stakequiz::protocol::ContentRef;
use stakequiz::session::IgnoreReason;
use stakequiz::{
    AnswerOption, CallbackOutcome, Error, QuizTokens, SessionEvent, SessionPhase, TokenCustody,
};

#[test]
fn test_seven_of_ten_pays_seventy() {
    let h = Harness::new();
    let alice = participant(1);
    h.fund(alice, 100);
    h.start_in_progress(alice, 100, 10);
    let mut events = h.engine.subscribe();

    for i in 0..10u8 {
        let verify_id = h
            .engine
            .submit_answer(alice, AnswerOption::Choice(i % 4))
            .unwrap();
        h.engine.on_answer_verified(verify_id, i >= 3).unwrap();
    }

    assert!(h.engine.session(&alice).is_none());
    assert_eq!(h.ledger.balance_of(&alice).amount(), 70);
    assert_eq!(h.ledger.vault_balance().amount(), 30);
    assert_eq!(h.ledger.net_custody_flow(&alice), 30);

    let settled: Vec<SessionEvent> = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| e.is_terminal())
        .collect();
    assert_eq!(settled.len(), 1);
    match &settled[0] {
        SessionEvent::Settled {
            participant: who,
            correct_count,
            total_questions,
            reward,
            retained,
            ..
        } => {
            assert_eq!(who, &alice);
            assert_eq!(*correct_count, 7);
            assert_eq!(*total_questions, 10);
            assert_eq!(reward.amount(), 70);
            assert_eq!(retained.amount(), 30);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_double_submit_rejected_without_change() {
    let h = Harness::new();
    let alice = participant(1);
    h.fund(alice, 100);
    h.start_in_progress(alice, 100, 10);

    h.engine
        .submit_answer(alice, AnswerOption::Choice(2))
        .unwrap();
    let before = h.snapshot();
    let submitted = h.compute.submitted().len();

    let err = h
        .engine
        .submit_answer(alice, AnswerOption::Choice(3))
        .unwrap_err();
    assert!(err.is_precondition_violation());
    assert_eq!(h.snapshot(), before);
    assert_eq!(h.compute.submitted().len(), submitted);
}

#[test]
fn test_question_timeout_lets_anyone_cancel() {
    let h = Harness::new();
    let alice = participant(1);
    let bystander = participant(9);
    h.fund(alice, 250);
    h.start_in_progress(alice, 200, 10);

    // two answered questions earn nothing on cancellation
    for _ in 0..2 {
        let id = h
            .engine
            .submit_answer(alice, AnswerOption::Choice(0))
            .unwrap();
        h.engine.on_answer_verified(id, true).unwrap();
    }

    let window = h.engine.config().timeouts.question.as_secs();
    h.clock.advance(window);
    assert!(!h.engine.is_cancellable(&alice));
    assert!(matches!(
        h.engine.cancel(bystander, alice),
        Err(Error::TimeoutNotElapsed(_))
    ));

    h.clock.advance(1);
    let receipt = h.engine.cancel(bystander, alice).unwrap();
    assert_eq!(receipt.refund.amount(), 200);
    assert_eq!(receipt.caller, bystander);
    assert!(h.engine.session(&alice).is_none());
    assert_eq!(h.ledger.balance_of(&alice).amount(), 250);
    assert_eq!(h.ledger.net_custody_flow(&alice), 0);
    assert_eq!(h.ledger.vault_balance(), QuizTokens::ZERO);
}

#[test]
fn test_duplicate_randomness_is_a_no_op() {
    let h = Harness::new();
    let alice = participant(1);
    h.fund(alice, 100);
    let id = h
        .engine
        .start(alice, &preferences(), QuizTokens::new(100))
        .unwrap();

    assert_eq!(
        h.engine.on_randomness_fulfilled(id, [7u8; 32]).unwrap(),
        CallbackOutcome::Applied
    );
    let after_first = h.snapshot();
    let session = h.session(&alice);
    assert_eq!(session.phase, SessionPhase::AwaitingContent);

    assert!(matches!(
        h.engine.on_randomness_fulfilled(id, [7u8; 32]).unwrap(),
        CallbackOutcome::Ignored(_)
    ));
    // a different value under the same id changes nothing either
    assert!(matches!(
        h.engine.on_randomness_fulfilled(id, [8u8; 32]).unwrap(),
        CallbackOutcome::Ignored(_)
    ));
    assert_eq!(h.snapshot(), after_first);
    assert_eq!(h.compute.submitted().len(), 1);
}

#[test]
fn test_replayed_content_cannot_rebind_questions() {
    let h = Harness::new();
    let alice = participant(1);
    h.fund(alice, 100);
    let randomness_id = h
        .engine
        .start(alice, &preferences(), QuizTokens::new(100))
        .unwrap();
    h.engine
        .on_randomness_fulfilled(randomness_id, [4u8; 32])
        .unwrap();
    let generate_id = h.outstanding(&alice);
    let content_ref = ContentRef([4u8; 32]);
    h.engine
        .on_content_ready(generate_id, content_ref, 5)
        .unwrap();
    let before = h.snapshot();

    for (replayed_ref, count) in [(content_ref, 5), (ContentRef([9u8; 32]), 12)] {
        assert_eq!(
            h.engine
                .on_content_ready(generate_id, replayed_ref, count)
                .unwrap(),
            CallbackOutcome::Ignored(IgnoreReason::UnknownRequest)
        );
    }
    assert_eq!(h.snapshot(), before);

    let session = h.session(&alice);
    assert_eq!(session.phase, SessionPhase::InProgress);
    assert_eq!(session.content_ref, Some(content_ref));
    assert_eq!(session.total_questions, 5);
}

#[test]
fn test_replayed_verdict_cannot_score_twice() {
    let h = Harness::new();
    let alice = participant(1);
    h.fund(alice, 100);
    h.start_in_progress(alice, 100, 3);

    let first = h
        .engine
        .submit_answer(alice, AnswerOption::Choice(1))
        .unwrap();
    h.engine.on_answer_verified(first, true).unwrap();
    let second = h
        .engine
        .submit_answer(alice, AnswerOption::Choice(1))
        .unwrap();

    let before = h.snapshot();
    assert_eq!(
        h.engine.on_answer_verified(first, true).unwrap(),
        CallbackOutcome::Ignored(IgnoreReason::UnknownRequest)
    );
    assert_eq!(h.snapshot(), before);

    h.engine.on_answer_verified(second, false).unwrap();
    let session = h.session(&alice);
    assert_eq!(session.correct_count, 1);
    assert_eq!(session.current_question_index, 2);
}

#[test]
fn test_out_of_bounds_question_count_keeps_session_cancellable() {
    let h = Harness::new();
    let alice = participant(1);
    h.fund(alice, 100);
    let id = h
        .engine
        .start(alice, &preferences(), QuizTokens::new(100))
        .unwrap();
    h.engine.on_randomness_fulfilled(id, [1u8; 32]).unwrap();
    let generate_id = h.outstanding(&alice);
    let before = h.snapshot();

    let err = h
        .engine
        .on_content_ready(generate_id, ContentRef([3u8; 32]), 21)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidOracleResult(_)));
    assert_eq!(h.snapshot(), before);

    h.clock
        .advance(h.engine.config().timeouts.content.as_secs() + 1);
    h.engine.cancel(participant(2), alice).unwrap();
    assert_eq!(h.ledger.balance_of(&alice).amount(), 100);
}

#[test]
fn test_insufficient_funds_leave_nothing_behind() {
    let h = Harness::new();
    let alice = participant(1);
    let bob = participant(2);
    h.fund(alice, 50);
    h.ledger.mint(bob, QuizTokens::new(500)).unwrap();
    h.ledger
        .approve(bob, stakequiz::VAULT_ADDRESS, QuizTokens::new(10));

    let err = h
        .engine
        .start(alice, &preferences(), QuizTokens::new(100))
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientBalance(_)));

    let err = h
        .engine
        .start(bob, &preferences(), QuizTokens::new(100))
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientAllowance(_)));

    assert!(h.engine.store().is_empty());
    assert_eq!(h.randomness.pending(), 0);
    assert_eq!(h.ledger.vault_balance(), QuizTokens::ZERO);
    assert_eq!(h.ledger.balance_of(&alice).amount(), 50);
    assert_eq!(h.ledger.balance_of(&bob).amount(), 500);
}

#[test]
fn test_second_start_fails_closed() {
    let h = Harness::new();
    let alice = participant(1);
    h.fund(alice, 300);
    h.engine
        .start(alice, &preferences(), QuizTokens::new(100))
        .unwrap();

    let err = h
        .engine
        .start(alice, &preferences(), QuizTokens::new(100))
        .unwrap_err();
    assert!(matches!(err, Error::SessionAlreadyActive(_)));
    assert_eq!(h.ledger.vault_balance().amount(), 100);
    assert_eq!(h.randomness.pending(), 1);
    assert_eq!(
        h.engine.randomness_status(&alice),
        Some(RequestStatus::Pending)
    );
}

#[test]
fn test_participant_can_restart_after_settlement() {
    let h = Harness::new();
    let alice = participant(1);
    h.fund(alice, 100);
    h.start_in_progress(alice, 40, 1);
    let id = h
        .engine
        .submit_answer(alice, AnswerOption::Skipped)
        .unwrap();
    h.engine.on_answer_verified(id, true).unwrap();

    // skipped answer scores zero: whole stake retained
    assert!(h.engine.session(&alice).is_none());
    assert_eq!(h.ledger.balance_of(&alice).amount(), 60);
    assert_eq!(h.engine.stats().total_retained, 40);

    h.engine
        .start(alice, &preferences(), QuizTokens::new(60))
        .unwrap();
    assert_eq!(h.ledger.balance_of(&alice).amount(), 0);
}

#[test]
fn test_sessions_of_different_participants_are_independent() {
    let h = Harness::with_config(QuizConfig::fast());
    let alice = participant(1);
    let bob = participant(2);
    h.fund(alice, 100);
    h.fund(bob, 100);
    h.start_in_progress(alice, 100, 2);
    h.start_in_progress(bob, 100, 2);

    let alice_verify = h
        .engine
        .submit_answer(alice, AnswerOption::Choice(0))
        .unwrap();
    h.engine
        .submit_answer(bob, AnswerOption::Choice(1))
        .unwrap();
    h.engine.on_answer_verified(alice_verify, true).unwrap();

    assert_eq!(h.session(&alice).current_question_index, 1);
    assert_eq!(h.session(&bob).phase, SessionPhase::AwaitingVerification);

    h.clock.advance(6);
    h.engine.cancel(alice, bob).unwrap();
    assert!(h.engine.session(&alice).is_some());
    h.engine.store().check_invariants().unwrap();
}
