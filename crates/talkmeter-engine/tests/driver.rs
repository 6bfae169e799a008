//! Deduction driver tests, run against paused virtual time.

mod common;

use rust_decimal_macros::dec;

use std::sync::Arc;

use common::{run_for, FailingStore, TestHarness};
use talkmeter_core::{DeductionKind, EndReason, MeterError, SessionStatus};
use talkmeter_store::Store;

#[tokio::test(start_paused = true)]
async fn ninety_seconds_bill_one_minute() {
    let h = TestHarness::new();
    let (payer, provider) = h.funded_pair(dec!(10)).await;
    let id = h.start_session(payer, provider, dec!(1)).await;

    run_for(90_500).await;

    let record = h.record(id);
    assert_eq!(record.status, SessionStatus::Active);
    assert_eq!(record.allotted_seconds, 600);
    assert_eq!(record.remaining_seconds, 510);
    assert_eq!(record.deductions.len(), 1);
    assert_eq!(record.deductions[0].amount, dec!(1));
    assert_eq!(record.deductions[0].kind, DeductionKind::Minute);
    assert_eq!(record.deductions[0].balance_after, dec!(9));
    assert_eq!(record.remaining_balance, dec!(9));
    assert_eq!(h.balance(&payer), dec!(9));

    assert_eq!(h.events.count(id, "tick"), 90);
    assert_eq!(h.events.count(id, "balance_deducted"), 1);
    assert!(h.engine.is_driving(&id));
}

#[tokio::test(start_paused = true)]
async fn draining_the_ledger_ends_the_session_at_the_next_boundary() {
    let h = TestHarness::new();
    let (payer, provider) = h.funded_pair(dec!(10)).await;
    let id = h.start_session(payer, provider, dec!(1)).await;

    run_for(30_500).await;
    // Another charge against the same ledger leaves half a minute's worth.
    h.engine.ledgers().debit(&payer, dec!(9.5)).await.unwrap();
    run_for(30_000).await;

    let record = h.record(id);
    assert_eq!(record.status, SessionStatus::Completed);
    assert_eq!(record.end_reason, Some(EndReason::InsufficientFunds));
    assert_eq!(record.remaining_seconds, 0);
    assert_eq!(record.deductions.len(), 1);
    assert_eq!(record.deductions[0].amount, dec!(0.5));
    assert_eq!(record.deductions[0].seconds_covered, 30);
    assert_eq!(record.total_amount_paid, dec!(0.5));
    assert_eq!(h.balance(&payer), dec!(0));

    assert!(!h.engine.is_driving(&id));
    assert_eq!(h.engine.active_drivers(), 0);
    assert_eq!(h.events.count(id, "session_ended"), 1);
}

#[tokio::test(start_paused = true)]
async fn allotment_running_out_captures_the_partial_minute() {
    let h = TestHarness::new();
    let (payer, provider) = h.funded_pair(dec!(2.5)).await;
    let id = h.start_session(payer, provider, dec!(1)).await;

    run_for(150_500).await;

    let record = h.record(id);
    assert_eq!(record.status, SessionStatus::Completed);
    assert_eq!(record.end_reason, Some(EndReason::TimeExpired));
    let amounts: Vec<_> = record.deductions.iter().map(|d| (d.kind, d.amount)).collect();
    assert_eq!(
        amounts,
        vec![
            (DeductionKind::Minute, dec!(1)),
            (DeductionKind::Minute, dec!(1)),
            (DeductionKind::Closing, dec!(0.5)),
        ]
    );
    assert_eq!(record.deductions[2].seconds_covered, 30);
    assert_eq!(record.total_amount_paid, dec!(2.5));
    assert_eq!(h.balance(&payer), dec!(0));

    assert_eq!(h.events.count(id, "balance_low"), 1);
    assert_eq!(h.events.count(id, "session_ended"), 1);
    assert_eq!(h.engine.active_drivers(), 0);
}

#[tokio::test(start_paused = true)]
async fn short_allotment_warns_at_start() {
    let h = TestHarness::new();
    let (payer, provider) = h.funded_pair(dec!(2)).await;
    let id = h.start_session(payer, provider, dec!(2)).await;

    assert_eq!(h.record(id).allotted_seconds, 60);
    assert_eq!(h.events.count(id, "balance_low"), 1);
}

#[tokio::test(start_paused = true)]
async fn locked_ledger_defers_the_minute_debit() {
    let h = TestHarness::new();
    let (payer, provider) = h.funded_pair(dec!(10)).await;
    let id = h.start_session(payer, provider, dec!(1)).await;

    run_for(59_500).await;
    let held = h.store.acquire_ledger_lock(&payer, h.clock_now()).unwrap();
    run_for(1_000).await;

    let record = h.record(id);
    assert_eq!(record.remaining_seconds, 540);
    assert!(record.deductions.is_empty());

    h.store
        .release_ledger_lock(&payer, held.lock_acquired_at.unwrap(), held.balance, h.clock_now())
        .unwrap();
    run_for(1_000).await;

    let record = h.record(id);
    assert_eq!(record.status, SessionStatus::Active);
    assert_eq!(record.remaining_seconds, 539);
    assert_eq!(record.deductions.len(), 1);
    assert_eq!(h.balance(&payer), dec!(9));
}

#[tokio::test(start_paused = true)]
async fn paused_time_is_never_billed() {
    let h = TestHarness::new();
    let (payer, provider) = h.funded_pair(dec!(10)).await;
    let id = h.start_session(payer, provider, dec!(1)).await;

    run_for(30_500).await;
    let paused = h.engine.pause(id, provider).await.unwrap();
    assert!(paused.is_paused);
    assert_eq!(paused.remaining_seconds, 570);
    assert!(!h.engine.is_driving(&id));

    run_for(120_000).await;
    let record = h.record(id);
    assert_eq!(record.remaining_seconds, 570);
    assert!(record.deductions.is_empty());

    let resumed = h.engine.resume(id, payer).await.unwrap();
    assert!(!resumed.is_paused);
    run_for(30_250).await;

    let record = h.record(id);
    assert_eq!(record.remaining_seconds, 540);
    assert_eq!(record.deductions.len(), 1);
    assert_eq!(record.live.accumulated_pause_seconds, 120);
    assert_eq!(h.balance(&payer), dec!(9));
}

#[tokio::test(start_paused = true)]
async fn stop_captures_the_unbilled_remainder() {
    let h = TestHarness::new();
    let (payer, provider) = h.funded_pair(dec!(10)).await;
    let id = h.start_session(payer, provider, dec!(1)).await;

    run_for(90_500).await;
    let stopped = h.engine.stop(id, payer).await.unwrap();

    assert_eq!(stopped.status, SessionStatus::Completed);
    assert_eq!(stopped.end_reason, Some(EndReason::Manual));
    assert_eq!(stopped.remaining_seconds, 510);
    assert_eq!(stopped.total_amount_paid, dec!(1.5));

    let record = h.record(id);
    assert_eq!(record.deductions.len(), 2);
    assert_eq!(record.deductions[1].kind, DeductionKind::Closing);
    assert_eq!(record.deductions[1].amount, dec!(0.5));
    assert_eq!(record.deductions[1].seconds_covered, 30);
    assert_eq!(h.balance(&payer), dec!(8.5));
    assert!(!h.engine.is_driving(&id));
}

#[tokio::test(start_paused = true)]
async fn immediate_stop_charges_nothing() {
    let h = TestHarness::new();
    let (payer, provider) = h.funded_pair(dec!(10)).await;
    let id = h.start_session(payer, provider, dec!(1)).await;

    let stopped = h.engine.stop(id, provider).await.unwrap();

    assert_eq!(stopped.status, SessionStatus::Completed);
    assert_eq!(stopped.total_amount_paid, dec!(0));
    assert!(h.record(id).deductions.is_empty());
    assert_eq!(h.balance(&payer), dec!(10));
    assert_eq!(h.engine.active_drivers(), 0);
}

#[tokio::test(start_paused = true)]
async fn stop_while_paused_bills_only_active_time() {
    let h = TestHarness::new();
    let (payer, provider) = h.funded_pair(dec!(10)).await;
    let id = h.start_session(payer, provider, dec!(1)).await;

    run_for(30_500).await;
    h.engine.pause(id, payer).await.unwrap();
    run_for(100_000).await;
    let stopped = h.engine.stop(id, payer).await.unwrap();

    assert_eq!(stopped.total_amount_paid, dec!(0.5));
    assert_eq!(h.balance(&payer), dec!(9.5));
}

#[tokio::test(start_paused = true)]
async fn rapid_pause_resume_still_bills_active_time() {
    let h = TestHarness::new();
    let (payer, provider) = h.funded_pair(dec!(10)).await;
    let id = h.start_session(payer, provider, dec!(1)).await;

    // Each cycle runs for less than one tick before pausing.
    for _ in 0..100 {
        run_for(900).await;
        h.engine.pause(id, payer).await.unwrap();
        h.engine.resume(id, payer).await.unwrap();
    }

    let record = h.record(id);
    assert_eq!(record.remaining_seconds, 510);
    assert_eq!(record.deductions.len(), 1);
    assert_eq!(h.balance(&payer), dec!(9));
}

#[tokio::test(start_paused = true)]
async fn stop_blocked_by_the_ledger_lock_keeps_the_session_running() {
    let h = TestHarness::new();
    let (payer, provider) = h.funded_pair(dec!(10)).await;
    let id = h.start_session(payer, provider, dec!(1)).await;

    run_for(90_500).await;
    let held = h.store.acquire_ledger_lock(&payer, h.clock_now()).unwrap();

    let result = h.engine.stop(id, payer).await;
    assert!(matches!(result, Err(MeterError::Locked { .. })));

    let record = h.record(id);
    assert_eq!(record.status, SessionStatus::Active);
    assert_eq!(record.end_reason, None);
    assert_eq!(record.remaining_seconds, 510);
    assert_eq!(record.deductions.len(), 1);
    assert_eq!(record.total_amount_paid, dec!(1));
    assert!(h.engine.is_driving(&id));
    assert_eq!(h.events.count(id, "session_ended"), 0);

    h.store
        .release_ledger_lock(&payer, held.lock_acquired_at.unwrap(), held.balance, h.clock_now())
        .unwrap();
    let stopped = h.engine.stop(id, payer).await.unwrap();
    assert_eq!(stopped.status, SessionStatus::Completed);
    assert_eq!(stopped.total_amount_paid, dec!(1.5));
    assert_eq!(h.balance(&payer), dec!(8.5));
}

#[tokio::test(start_paused = true)]
async fn recovery_resumes_with_the_remaining_time() {
    let h = TestHarness::new();
    let (payer, provider) = h.funded_pair(dec!(0.75)).await;
    let record = h.persist_active(payer, provider, dec!(0.75), 0);
    assert_eq!(record.remaining_seconds, 45);

    let report = h.engine.recover().await.unwrap();
    assert_eq!(report.resumed_sessions, 1);
    assert!(h.engine.is_driving(&record.id));

    run_for(44_500).await;
    let live = h.record(record.id);
    assert_eq!(live.status, SessionStatus::Active);
    assert_eq!(live.remaining_seconds, 1);

    run_for(1_000).await;
    let done = h.record(record.id);
    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(done.end_reason, Some(EndReason::TimeExpired));
    assert_eq!(done.total_amount_paid, dec!(0.75));
    assert_eq!(h.balance(&payer), dec!(0));
}

#[tokio::test(start_paused = true)]
async fn recovery_bills_downtime_from_the_last_tick() {
    let before = TestHarness::new();
    let (payer, provider) = before.funded_pair(dec!(10)).await;
    let id = before.start_session(payer, provider, dec!(1)).await;

    run_for(30_500).await;
    before.engine.shutdown();
    assert_eq!(before.record(id).status, SessionStatus::Active);
    run_for(10_000).await;

    let after = before.restarted();
    let report = after.engine.recover().await.unwrap();
    assert_eq!(report.resumed_sessions, 1);
    assert_eq!(after.record(id).remaining_seconds, 560);

    run_for(20_250).await;
    let record = after.record(id);
    assert_eq!(record.remaining_seconds, 540);
    assert_eq!(record.deductions.len(), 1);
    assert_eq!(after.balance(&payer), dec!(9));
}

#[tokio::test(start_paused = true)]
async fn recovery_closes_sessions_that_ran_out_while_down() {
    let h = TestHarness::new();
    let (payer, provider) = h.funded_pair(dec!(0.75)).await;
    let record = h.persist_active(payer, provider, dec!(0.75), 100);
    h.store.acquire_ledger_lock(&payer, h.clock_now()).unwrap();

    let report = h.engine.recover().await.unwrap();
    assert_eq!(report.released_locks, 1);
    assert_eq!(report.finalized_sessions, 1);
    assert_eq!(report.resumed_sessions, 0);

    let done = h.record(record.id);
    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(done.end_reason, Some(EndReason::TimeExpired));
    assert_eq!(done.total_amount_paid, dec!(0.75));
    assert_eq!(h.balance(&payer), dec!(0));
    assert_eq!(h.engine.active_drivers(), 0);
}

#[tokio::test(start_paused = true)]
async fn recovery_leaves_paused_sessions_paused() {
    let h = TestHarness::new();
    let (payer, provider) = h.funded_pair(dec!(10)).await;
    let id = h.start_session(payer, provider, dec!(1)).await;
    h.engine.pause(id, payer).await.unwrap();

    let report = h.engine.recover().await.unwrap();
    assert_eq!(report.paused_sessions, 1);
    assert!(!h.engine.is_driving(&id));
}

#[tokio::test(start_paused = true)]
async fn recovery_continues_past_a_session_it_cannot_save() {
    let h = TestHarness::new();
    let (payer, provider) = h.funded_pair(dec!(10)).await;
    let (other_payer, other_provider) = h.funded_pair(dec!(10)).await;
    let broken = h.persist_active(payer, provider, dec!(10), 20);
    let healthy = h.persist_active(other_payer, other_provider, dec!(10), 20);

    let engine = h.engine_over(Arc::new(FailingStore::new(h.store.clone(), broken.id)));
    let report = engine.recover().await.unwrap();
    assert_eq!(report.errors, 1);
    assert_eq!(report.resumed_sessions, 1);
    assert!(engine.is_driving(&healthy.id));
    assert!(!engine.is_driving(&broken.id));

    assert_eq!(h.record(healthy.id).remaining_seconds, 580);
    let untouched = h.record(broken.id);
    assert_eq!(untouched.status, SessionStatus::Active);
    assert_eq!(untouched.remaining_seconds, 600);
}
