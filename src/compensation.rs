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

//! Compensating entries.
//!
//! Reverses one applied operation inside its own unit of work. The fresh read
//! at the start makes the procedure idempotent: an operation that has already
//! been canceled, or was never applied, is left alone. The compensating row's
//! key is derived from the original's. If that key is already taken the whole
//! unit of work is rolled back, so a balance never moves without its row.

use crate::base::{OperationId, TxId};
use crate::error::{StoreError, StoreResult};
use crate::operation::{NOTE_INSUFFICIENT_FUNDS, NOTE_SCHEDULER, OperationDraft};
use crate::store::{LedgerStore, LedgerTx};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Why an operation was left as it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The row does not exist.
    Missing,
    NotApplied,
    AlreadyCanceled,
    /// Reversing would drive the balance below zero. The operation stays
    /// applied and uncanceled, so later cycles may pick it again.
    InsufficientFunds,
    /// Another row already carries the compensating key.
    ReversalKeyTaken,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::Missing => "missing",
            SkipReason::NotApplied => "not applied",
            SkipReason::AlreadyCanceled => "already canceled",
            SkipReason::InsufficientFunds => "insufficient funds",
            SkipReason::ReversalKeyTaken => "reversal key taken",
        })
    }
}

#[derive(Debug)]
pub enum CompensationOutcome {
    Cancelled { compensating_tx_id: TxId },
    Skipped(SkipReason),
    /// The unit of work was rolled back; nothing changed.
    Failed(StoreError),
}

/// Runs the compensation procedure against a shared store.
pub struct Compensator<S> {
    store: Arc<S>,
}

impl<S: LedgerStore> Compensator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Compensator { store }
    }

    /// Cancels operation `id` by booking its exact inverse.
    pub async fn compensate(&self, id: OperationId) -> CompensationOutcome {
        match self.try_compensate(id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(op_id = %id, error = %err, "compensation failed");
                CompensationOutcome::Failed(err)
            }
        }
    }

    async fn try_compensate(&self, id: OperationId) -> StoreResult<CompensationOutcome> {
        let mut tx = self.store.begin().await?;

        let Some(op) = tx.operation(id).await? else {
            tx.commit().await?;
            return Ok(CompensationOutcome::Skipped(SkipReason::Missing));
        };
        let reason = if !op.applied {
            Some(SkipReason::NotApplied)
        } else if op.canceled_at.is_some() {
            Some(SkipReason::AlreadyCanceled)
        } else {
            None
        };
        if let Some(reason) = reason {
            tx.commit().await?;
            debug!(op_id = %id, %reason, "nothing to compensate");
            return Ok(CompensationOutcome::Skipped(reason));
        }

        let delta = op.compensating_delta();
        if tx.adjust_balance(op.account_id, delta).await?.is_none() {
            tx.annotate(id, NOTE_INSUFFICIENT_FUNDS).await?;
            tx.commit().await?;
            info!(
                op_id = %id,
                tx_id = %op.tx_id,
                delta = %delta,
                "compensation skipped: insufficient funds"
            );
            return Ok(CompensationOutcome::Skipped(SkipReason::InsufficientFunds));
        }

        let draft = OperationDraft::compensating(&op);
        if tx.insert_operation(&draft).await?.is_none() {
            tx.rollback().await?;
            warn!(
                op_id = %id,
                tx_id = %draft.tx_id,
                "compensation skipped: reversal key already taken"
            );
            return Ok(CompensationOutcome::Skipped(SkipReason::ReversalKeyTaken));
        }
        tx.mark_canceled(id, NOTE_SCHEDULER).await?;
        tx.commit().await?;

        info!(op_id = %id, tx_id = %op.tx_id, delta = %delta, "operation cancelled");
        Ok(CompensationOutcome::Cancelled {
            compensating_tx_id: draft.tx_id,
        })
    }
}
