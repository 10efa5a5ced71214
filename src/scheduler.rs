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

//! Cancellation scheduler.
//!
//! Each cycle moves through `Idle -> LockAttempt -> {Skipped | Running} -> Idle`:
//!
//! - `LockAttempt` tries the cluster-wide advisory lock without waiting. A
//!   busy lock abandons the cycle; another replica (or another cycle) is
//!   already reconciling.
//! - `Running` holds the lock for the whole cycle, selects candidates and
//!   compensates each in its own unit of work. One candidate failing never
//!   stops the others. The lock is released on every exit path.
//!
//! The loop runs one cycle immediately and then one per [`Ticker::tick`], so
//! tests can drive cycles deterministically instead of waiting on a timer.

use crate::compensation::{CompensationOutcome, Compensator};
use crate::error::{StoreError, StoreResult};
use crate::selection::CANDIDATE_LIMIT;
use crate::store::{AdvisoryLock, LedgerStore};
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Key of the advisory lock guarding reconciliation cycles.
pub const ADVISORY_LOCK_KEY: i64 = 0xBABA_CAFE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Time between cycles.
    pub period: Duration,
    pub lock_key: i64,
    pub candidate_limit: usize,
    /// Bound on every store call a cycle makes, per call.
    pub call_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            period: Duration::from_secs(5 * 60),
            lock_key: ADVISORY_LOCK_KEY,
            candidate_limit: CANDIDATE_LIMIT,
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// Source of cycle triggers.
#[async_trait]
pub trait Ticker: Send {
    /// Waits for the next trigger. `false` means no more will come.
    async fn tick(&mut self) -> bool;
}

/// Fixed-period ticker. The first tick fires one period after creation; ticks
/// missed while a cycle overran are dropped rather than replayed.
#[derive(Debug)]
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    /// # Panics
    ///
    /// If `period` is zero.
    pub fn new(period: Duration) -> Self {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        IntervalTicker { interval }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) -> bool {
        self.interval.tick().await;
        true
    }
}

/// Tally of one completed cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub candidates: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub enum CycleOutcome {
    /// The lock was held elsewhere; nothing was touched.
    Skipped,
    Completed(CycleSummary),
    /// The cycle could not start (lock or selection failure).
    Failed(StoreError),
}

/// Periodic reconciliation over a shared store.
pub struct CancelScheduler<S> {
    store: Arc<S>,
    compensator: Compensator<S>,
    settings: SchedulerSettings,
}

impl<S: LedgerStore> CancelScheduler<S> {
    pub fn new(store: Arc<S>, settings: SchedulerSettings) -> Self {
        CancelScheduler {
            compensator: Compensator::new(Arc::clone(&store)),
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Runs `run` on a background task.
    pub fn spawn<T: Ticker + 'static>(self, ticker: T, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(ticker, shutdown).await })
    }

    /// Runs one cycle now and one per tick until `shutdown` fires or the
    /// ticker is exhausted. A cycle in progress is never interrupted.
    #[instrument(name = "cancel_scheduler", skip_all)]
    pub async fn run<T: Ticker>(&self, mut ticker: T, shutdown: CancellationToken) {
        info!(period = ?self.settings.period, "starting cancel scheduler");
        while !shutdown.is_cancelled() {
            self.run_cycle().await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                more = ticker.tick() => {
                    if !more {
                        break;
                    }
                }
            }
        }
        info!("cancel scheduler stopped");
    }

    /// One full cycle: lock, select, compensate, release.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let lock = match self
            .bounded(self.store.try_advisory_lock(self.settings.lock_key))
            .await
        {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                debug!("advisory lock busy, skipping cycle");
                return CycleOutcome::Skipped;
            }
            Err(err) => {
                error!(error = %err, "failed to acquire advisory lock");
                return CycleOutcome::Failed(err);
            }
        };

        let outcome = self.reconcile().await;

        if let Err(err) = self.bounded(lock.release()).await {
            warn!(error = %err, "failed to release advisory lock");
        }
        outcome
    }

    async fn reconcile(&self) -> CycleOutcome {
        let candidates = match self
            .bounded(self.store.reconciliation_candidates(self.settings.candidate_limit))
            .await
        {
            Ok(candidates) => candidates,
            Err(err) => {
                error!(error = %err, "failed to select candidate operations");
                return CycleOutcome::Failed(err);
            }
        };

        info!(candidates = candidates.len(), "starting cancellation cycle");
        let mut summary = CycleSummary {
            candidates: candidates.len(),
            ..CycleSummary::default()
        };

        for candidate in candidates {
            match timeout(
                self.settings.call_timeout,
                self.compensator.compensate(candidate.id),
            )
            .await
            {
                Ok(CompensationOutcome::Cancelled { .. }) => summary.cancelled += 1,
                Ok(CompensationOutcome::Skipped(_)) => summary.skipped += 1,
                Ok(CompensationOutcome::Failed(_)) => summary.failed += 1,
                Err(_) => {
                    warn!(op_id = %candidate.id, tx_id = %candidate.tx_id, "compensation timed out");
                    summary.failed += 1;
                }
            }
        }

        info!(
            cancelled = summary.cancelled,
            skipped = summary.skipped,
            failed = summary.failed,
            "cancellation cycle finished"
        );
        CycleOutcome::Completed(summary)
    }

    async fn bounded<T>(&self, call: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        timeout(self.settings.call_timeout, call)
            .await
            .unwrap_or_else(|_| Err(StoreError::Timeout))
    }
}
