// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Compensation and cancellation scheduler integration tests.

use async_trait::async_trait;
use balance_ledger::clock::{Clock, ManualClock};
use balance_ledger::operation::{NOTE_AUTO_CANCEL, NOTE_INSUFFICIENT_FUNDS, NOTE_SCHEDULER};
use balance_ledger::scheduler::{ADVISORY_LOCK_KEY, Ticker};
use balance_ledger::store::{AdvisoryLock, Failpoint};
use balance_ledger::{
    AccountId, CancelScheduler, CompensationOutcome, Compensator, CycleOutcome, CycleSummary,
    Direction, Engine, LedgerStore, MemoryStore, NewOperation, OperationId, SchedulerSettings,
    SkipReason, Source, TxId,
};
use chrono::{Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Ledger {
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
    engine: Engine<MemoryStore>,
}

impl Ledger {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        Ledger {
            clock,
            engine: Engine::new(Arc::clone(&store)),
            store,
        }
    }

    fn compensator(&self) -> Compensator<MemoryStore> {
        Compensator::new(Arc::clone(&self.store))
    }

    fn scheduler(&self) -> CancelScheduler<MemoryStore> {
        CancelScheduler::new(Arc::clone(&self.store), SchedulerSettings::default())
    }

    async fn deposit(&self, account_id: AccountId, tx_id: &str, amount: Decimal) -> OperationId {
        self.engine
            .process(NewOperation::deposit(account_id, tx_id, amount))
            .await
            .unwrap();
        self.id_of(tx_id).await
    }

    async fn withdraw(&self, account_id: AccountId, tx_id: &str, amount: Decimal) -> OperationId {
        self.engine
            .process(NewOperation::withdraw(account_id, tx_id, amount))
            .await
            .unwrap();
        self.id_of(tx_id).await
    }

    async fn id_of(&self, tx_id: &str) -> OperationId {
        self.engine.operation(&TxId::from(tx_id)).await.unwrap().id
    }

    async fn balance(&self, account_id: AccountId) -> Decimal {
        self.engine.balance(account_id).await.unwrap().balance
    }

    /// One deposit per fresh account, one minute apart, oldest first.
    async fn spread_deposits(&self, count: usize) -> Vec<OperationId> {
        let mut ids = Vec::with_capacity(count);
        for i in 1..=count {
            self.clock.advance(Duration::minutes(1));
            ids.push(
                self.deposit(AccountId::new_v4(), &format!("t{i}"), dec!(10.00))
                    .await,
            );
        }
        ids
    }
}

/// Ticker driven by the test through a channel.
struct ManualTicker(mpsc::UnboundedReceiver<()>);

#[async_trait]
impl Ticker for ManualTicker {
    async fn tick(&mut self) -> bool {
        self.0.recv().await.is_some()
    }
}

fn summary(outcome: CycleOutcome) -> CycleSummary {
    match outcome {
        CycleOutcome::Completed(summary) => summary,
        other => panic!("expected a completed cycle, got {other:?}"),
    }
}

// === Compensation ===

#[tokio::test]
async fn compensating_a_deposit_debits_it() {
    let ledger = Ledger::new();
    let account_id = AccountId::new_v4();
    let id = ledger.deposit(account_id, "t1", dec!(50.00)).await;
    ledger.deposit(account_id, "t2", dec!(25.00)).await;

    let outcome = ledger.compensator().compensate(id).await;
    let CompensationOutcome::Cancelled { compensating_tx_id } = outcome else {
        panic!("expected cancellation, got {outcome:?}");
    };
    assert_eq!(compensating_tx_id, TxId::from("cancel::t1"));
    assert_eq!(ledger.balance(account_id).await, dec!(25.00));

    let original = ledger.engine.operation(&TxId::from("t1")).await.unwrap();
    assert!(original.applied);
    assert_eq!(original.canceled_at, Some(ledger.clock.now()));
    assert_eq!(original.cancel_note.as_deref(), Some(NOTE_SCHEDULER));

    let reversal = ledger.engine.operation(&compensating_tx_id).await.unwrap();
    assert!(reversal.applied);
    assert_eq!(reversal.account_id, account_id);
    assert_eq!(reversal.source, Source::Service);
    assert_eq!(reversal.direction, Direction::Withdraw);
    assert_eq!(reversal.amount, dec!(50.00));
    assert_eq!(reversal.cancel_note.as_deref(), Some(NOTE_AUTO_CANCEL));
    assert!(reversal.canceled_at.is_none());
}

#[tokio::test]
async fn compensating_a_withdrawal_credits_it() {
    let ledger = Ledger::new();
    let account_id = AccountId::new_v4();
    ledger.deposit(account_id, "t1", dec!(100.00)).await;
    let id = ledger.withdraw(account_id, "t2", dec!(40.00)).await;

    let outcome = ledger.compensator().compensate(id).await;
    assert!(matches!(outcome, CompensationOutcome::Cancelled { .. }));
    assert_eq!(ledger.balance(account_id).await, dec!(100.00));

    let reversal = ledger.engine.operation(&TxId::from("cancel::t2")).await.unwrap();
    assert_eq!(reversal.direction, Direction::Deposit);
    assert_eq!(reversal.amount, dec!(40.00));
}

#[tokio::test]
async fn compensating_twice_reverses_once() {
    let ledger = Ledger::new();
    let account_id = AccountId::new_v4();
    let id = ledger.deposit(account_id, "t1", dec!(50.00)).await;
    ledger.deposit(account_id, "t2", dec!(50.00)).await;
    let compensator = ledger.compensator();

    assert!(matches!(
        compensator.compensate(id).await,
        CompensationOutcome::Cancelled { .. }
    ));
    for _ in 0..2 {
        assert!(matches!(
            compensator.compensate(id).await,
            CompensationOutcome::Skipped(SkipReason::AlreadyCanceled)
        ));
    }

    assert_eq!(ledger.balance(account_id).await, dec!(50.00));
    let reversals = ledger
        .store
        .operations()
        .await
        .into_iter()
        .filter(|op| op.tx_id.as_str().starts_with("cancel::"))
        .count();
    assert_eq!(reversals, 1);
}

#[tokio::test]
async fn insufficient_funds_leaves_operation_eligible() {
    let ledger = Ledger::new();
    let account_id = AccountId::new_v4();
    let t1 = ledger.deposit(account_id, "t1", dec!(50.00)).await;
    ledger.withdraw(account_id, "t2", dec!(80.00)).await;
    ledger.withdraw(account_id, "t3", dec!(30.00)).await;
    assert_eq!(ledger.balance(account_id).await, dec!(20.00));

    let outcome = ledger.compensator().compensate(t1).await;
    assert!(matches!(
        outcome,
        CompensationOutcome::Skipped(SkipReason::InsufficientFunds)
    ));

    let original = ledger.engine.operation(&TxId::from("t1")).await.unwrap();
    assert!(original.applied);
    assert!(original.canceled_at.is_none());
    assert_eq!(original.cancel_note.as_deref(), Some(NOTE_INSUFFICIENT_FUNDS));
    assert_eq!(ledger.balance(account_id).await, dec!(20.00));
    assert!(
        ledger
            .engine
            .operation(&TxId::from("cancel::t1"))
            .await
            .is_err()
    );

    // still eligible; a later attempt meets the same guard
    assert!(original.is_cancelable());
    assert!(matches!(
        ledger.compensator().compensate(t1).await,
        CompensationOutcome::Skipped(SkipReason::InsufficientFunds)
    ));
}

#[tokio::test]
async fn rejected_operation_is_not_compensated() {
    let ledger = Ledger::new();
    let account_id = AccountId::new_v4();
    let id = ledger.withdraw(account_id, "t1", dec!(5.00)).await;

    assert!(matches!(
        ledger.compensator().compensate(id).await,
        CompensationOutcome::Skipped(SkipReason::NotApplied)
    ));
    assert!(matches!(
        ledger.compensator().compensate(OperationId(999)).await,
        CompensationOutcome::Skipped(SkipReason::Missing)
    ));
}

#[tokio::test]
async fn failed_compensation_changes_nothing() {
    let ledger = Ledger::new();
    let account_id = AccountId::new_v4();
    let id = ledger.deposit(account_id, "t1", dec!(50.00)).await;

    for point in [
        Failpoint::Begin,
        Failpoint::LoadOperation(id),
        Failpoint::AdjustBalance,
        Failpoint::InsertOperation,
        Failpoint::MarkCanceled,
        Failpoint::Commit,
    ] {
        ledger.store.fail_at(point);
        let outcome = ledger.compensator().compensate(id).await;
        assert!(
            matches!(outcome, CompensationOutcome::Failed(_)),
            "{point:?}: {outcome:?}"
        );
        ledger.store.clear_failures();

        assert_eq!(ledger.balance(account_id).await, dec!(50.00), "{point:?}");
        let original = ledger.engine.operation(&TxId::from("t1")).await.unwrap();
        assert!(original.canceled_at.is_none(), "{point:?}");
        assert_eq!(ledger.store.operations().await.len(), 1, "{point:?}");
    }
}

#[tokio::test]
async fn taken_reversal_key_rolls_back_the_compensation() {
    let ledger = Ledger::new();
    let account_id = AccountId::new_v4();
    let id = ledger.deposit(account_id, "t1", dec!(50.00)).await;
    // the engine takes any key; only request validation reserves the prefix
    ledger.deposit(account_id, "cancel::t1", dec!(1.00)).await;

    assert!(matches!(
        ledger.compensator().compensate(id).await,
        CompensationOutcome::Skipped(SkipReason::ReversalKeyTaken)
    ));

    let original = ledger.engine.operation(&TxId::from("t1")).await.unwrap();
    assert!(original.canceled_at.is_none());
    assert!(original.cancel_note.is_none());

    let ops = ledger.store.operations().await;
    assert_eq!(ops.len(), 2);
    let booked: Decimal = ops
        .iter()
        .filter(|op| op.applied)
        .map(|op| -op.compensating_delta())
        .sum();
    assert_eq!(booked, dec!(51.00));
    assert_eq!(ledger.balance(account_id).await, booked);
}

// === Cycles ===

#[tokio::test]
async fn cycle_cancels_odd_ranks_of_ten() {
    let ledger = Ledger::new();
    let ids = ledger.spread_deposits(10).await;

    let summary = summary(ledger.scheduler().run_cycle().await);
    assert_eq!(
        summary,
        CycleSummary {
            candidates: 5,
            cancelled: 5,
            skipped: 0,
            failed: 0,
        }
    );

    // ranks 1, 3, 5, 7, 9 by recency are t10, t8, t6, t4, t2
    let ops = ledger.store.operations().await;
    let canceled: Vec<OperationId> = ops
        .iter()
        .filter(|op| op.canceled_at.is_some())
        .map(|op| op.id)
        .collect();
    assert_eq!(canceled, vec![ids[1], ids[3], ids[5], ids[7], ids[9]]);
}

#[tokio::test]
async fn cycle_is_capped() {
    let ledger = Ledger::new();
    ledger.spread_deposits(30).await;

    let summary = summary(ledger.scheduler().run_cycle().await);
    assert_eq!(summary.candidates, 10);
    assert_eq!(summary.cancelled, 10);
}

#[tokio::test]
async fn cycle_ignores_rejected_rows_when_ranking() {
    let ledger = Ledger::new();
    let account_id = AccountId::new_v4();
    ledger.deposit(account_id, "t1", dec!(50.00)).await;
    ledger.withdraw(account_id, "t2", dec!(80.00)).await;
    ledger.withdraw(account_id, "t3", dec!(30.00)).await;

    // ranking: t3, t1; only t3 is picked, and it can be reversed
    let summary = summary(ledger.scheduler().run_cycle().await);
    assert_eq!(summary.candidates, 1);
    assert_eq!(summary.cancelled, 1);
    assert_eq!(ledger.balance(account_id).await, dec!(50.00));
}

#[tokio::test]
async fn cycle_counts_insufficient_funds_as_skipped() {
    let ledger = Ledger::new();
    let spent = AccountId::new_v4();
    let other = AccountId::new_v4();
    ledger.deposit(spent, "t1", dec!(50.00)).await;
    ledger.clock.advance(Duration::minutes(1));
    ledger.withdraw(spent, "t2", dec!(30.00)).await;
    ledger.clock.advance(Duration::minutes(1));
    ledger.deposit(other, "t3", dec!(10.00)).await;

    // ranking t3, t2, t1 picks t3 and t1; reversing t1 would overdraw
    let summary = summary(ledger.scheduler().run_cycle().await);
    assert_eq!(
        summary,
        CycleSummary {
            candidates: 2,
            cancelled: 1,
            skipped: 1,
            failed: 0,
        }
    );
    assert_eq!(ledger.balance(spent).await, dec!(20.00));
    assert_eq!(ledger.balance(other).await, Decimal::ZERO);
}

#[tokio::test]
async fn one_failure_does_not_stop_the_cycle() {
    let ledger = Ledger::new();
    // ranking t5, t4, t3, t2, t1 picks t5, t3, t1
    let ids = ledger.spread_deposits(5).await;
    ledger.store.fail_at(Failpoint::LoadOperation(ids[2]));

    let summary = summary(ledger.scheduler().run_cycle().await);
    assert_eq!(
        summary,
        CycleSummary {
            candidates: 3,
            cancelled: 2,
            skipped: 0,
            failed: 1,
        }
    );
}

#[tokio::test]
async fn busy_lock_skips_the_cycle() {
    let ledger = Ledger::new();
    ledger.spread_deposits(4).await;
    let before = ledger.store.operations().await;

    // another replica holds the lock
    let replica = ledger.store.as_ref().clone();
    let held = replica
        .try_advisory_lock(ADVISORY_LOCK_KEY)
        .await
        .unwrap()
        .expect("lock is free");

    assert!(matches!(
        ledger.scheduler().run_cycle().await,
        CycleOutcome::Skipped
    ));
    assert_eq!(ledger.store.operations().await, before);

    held.release().await.unwrap();
    assert!(matches!(
        ledger.scheduler().run_cycle().await,
        CycleOutcome::Completed(_)
    ));
}

#[tokio::test]
async fn concurrent_cycles_run_one_at_a_time() {
    let ledger = Ledger::new();
    // ranking t4, t3, t2, t1 picks t4 and t2
    let ids = ledger.spread_deposits(4).await;

    let one = CancelScheduler::new(
        Arc::new(ledger.store.as_ref().clone()),
        SchedulerSettings::default(),
    );
    let two = CancelScheduler::new(
        Arc::new(ledger.store.as_ref().clone()),
        SchedulerSettings::default(),
    );

    // An open unit of work stalls whichever cycle takes the lock first, so
    // the other one runs while the lock is held.
    let gate = ledger.store.begin().await.unwrap();
    let (first, second, ()) = tokio::join!(one.run_cycle(), two.run_cycle(), async move {
        tokio::task::yield_now().await;
        drop(gate);
    });

    let mut completed = Vec::new();
    let mut skipped = 0;
    for outcome in [first, second] {
        match outcome {
            CycleOutcome::Completed(summary) => completed.push(summary),
            CycleOutcome::Skipped => skipped += 1,
            other => panic!("unexpected cycle outcome {other:?}"),
        }
    }
    assert_eq!(skipped, 1);
    assert_eq!(
        completed,
        vec![CycleSummary {
            candidates: 2,
            cancelled: 2,
            skipped: 0,
            failed: 0,
        }]
    );

    let ops = ledger.store.operations().await;
    assert_eq!(ops.len(), 6);
    for tx_id in ["cancel::t4", "cancel::t2"] {
        assert_eq!(
            ops.iter().filter(|op| op.tx_id.as_str() == tx_id).count(),
            1,
            "{tx_id}"
        );
    }
    let canceled: Vec<OperationId> = ops
        .iter()
        .filter(|op| op.canceled_at.is_some())
        .map(|op| op.id)
        .collect();
    assert_eq!(canceled, vec![ids[1], ids[3]]);
}

#[tokio::test]
async fn lock_is_released_after_every_cycle() {
    let ledger = Ledger::new();
    ledger.spread_deposits(2).await;

    summary(ledger.scheduler().run_cycle().await);
    let lock = ledger.store.try_advisory_lock(ADVISORY_LOCK_KEY).await.unwrap();
    assert!(lock.is_some());
    drop(lock);

    ledger.store.fail_at(Failpoint::Candidates);
    assert!(matches!(
        ledger.scheduler().run_cycle().await,
        CycleOutcome::Failed(_)
    ));
    ledger.store.clear_failures();
    assert!(
        ledger
            .store
            .try_advisory_lock(ADVISORY_LOCK_KEY)
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn lock_failure_fails_the_cycle() {
    let ledger = Ledger::new();
    ledger.store.fail_at(Failpoint::AdvisoryLock);
    assert!(matches!(
        ledger.scheduler().run_cycle().await,
        CycleOutcome::Failed(_)
    ));
}

#[tokio::test]
async fn empty_ledger_completes_with_nothing_to_do() {
    let ledger = Ledger::new();
    assert_eq!(
        summary(ledger.scheduler().run_cycle().await),
        CycleSummary::default()
    );
}

// === Loop ===

#[tokio::test]
async fn runs_once_immediately_then_once_per_tick() {
    let ledger = Ledger::new();
    let account_id = AccountId::new_v4();
    ledger.deposit(account_id, "t1", dec!(50.00)).await;

    let (tx, rx) = mpsc::unbounded_channel();
    tx.send(()).unwrap();
    tx.send(()).unwrap();
    drop(tx);

    // three cycles; each one reverses the entry written by the one before
    ledger
        .scheduler()
        .run(ManualTicker(rx), CancellationToken::new())
        .await;

    let ops = ledger.store.operations().await;
    let keys: Vec<&str> = ops.iter().map(|op| op.tx_id.as_str()).collect();
    assert_eq!(
        keys,
        vec!["t1", "cancel::t1", "cancel::cancel::t1", "cancel::cancel::cancel::t1"]
    );
    assert_eq!(ledger.balance(account_id).await, Decimal::ZERO);
}

#[tokio::test]
async fn shutdown_stops_the_loop() {
    let ledger = Ledger::new();
    let account_id = AccountId::new_v4();
    ledger.deposit(account_id, "t1", dec!(50.00)).await;

    let (_tx, rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let handle = ledger.scheduler().spawn(ManualTicker(rx), shutdown.clone());

    // wait for the immediate cycle
    let mut cancelled = false;
    for _ in 0..100 {
        let op = ledger.engine.operation(&TxId::from("t1")).await.unwrap();
        if op.canceled_at.is_some() {
            cancelled = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(cancelled);

    shutdown.cancel();
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("scheduler stops")
        .unwrap();
    assert_eq!(ledger.store.operations().await.len(), 2);
}
