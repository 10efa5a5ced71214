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

//! Transaction engine.
//!
//! The [`Engine`] applies one incoming operation per call inside a single unit
//! of work on the [`LedgerStore`]:
//!
//! 1. upsert the account with a zero balance,
//! 2. insert the operation row with `applied = false`, insert-if-absent on
//!    `tx_id`; a collision means the key was already processed,
//! 3. apply the signed delta through the conditional balance update,
//! 4. mark the row applied and commit.
//!
//! A refused balance update still commits the row: it is the audit record of
//! the rejected attempt. Any storage failure rolls the whole unit back.
//!
//! # Concurrency
//!
//! The engine holds no locks of its own. Calls against the same account
//! serialise on the account row inside the store; calls against different
//! accounts are independent.

use crate::account::Account;
use crate::base::{AccountId, TxId};
use crate::error::LedgerError;
use crate::operation::{NewOperation, Operation, OperationDraft};
use crate::store::{LedgerStore, LedgerTx};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Result of processing one operation. Every variant carries the account
/// snapshot the caller should report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The balance effect was booked; carries the new balance.
    Applied(Account),
    /// The `tx_id` had been seen before; nothing changed.
    AlreadyProcessed(Account),
    /// Applying the operation would have driven the balance below zero;
    /// carries the unchanged balance.
    RejectedNegativeBalance(Account),
}

/// Wire status of a [`ProcessOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    #[serde(rename = "OK")]
    Applied,
    AlreadyProcessed,
    RejectedNegative,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Applied => "OK",
            ProcessStatus::AlreadyProcessed => "ALREADY_PROCESSED",
            ProcessStatus::RejectedNegative => "REJECTED_NEGATIVE",
        }
    }
}

/// What a caller of `Process` gets back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub tx_id: TxId,
    pub status: ProcessStatus,
    pub balance: Decimal,
    pub processed_at: DateTime<Utc>,
}

impl ProcessOutcome {
    pub fn account(&self) -> &Account {
        match self {
            ProcessOutcome::Applied(account)
            | ProcessOutcome::AlreadyProcessed(account)
            | ProcessOutcome::RejectedNegativeBalance(account) => account,
        }
    }

    pub fn status(&self) -> ProcessStatus {
        match self {
            ProcessOutcome::Applied(_) => ProcessStatus::Applied,
            ProcessOutcome::AlreadyProcessed(_) => ProcessStatus::AlreadyProcessed,
            ProcessOutcome::RejectedNegativeBalance(_) => ProcessStatus::RejectedNegative,
        }
    }

    pub fn receipt(&self, tx_id: TxId) -> Receipt {
        let account = self.account();
        Receipt {
            tx_id,
            status: self.status(),
            balance: account.balance,
            processed_at: account.updated_at,
        }
    }

    /// Strict view: only a booked operation is `Ok`.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::DuplicateTransaction`] for [`ProcessOutcome::AlreadyProcessed`].
    /// - [`LedgerError::NegativeBalance`] for [`ProcessOutcome::RejectedNegativeBalance`].
    pub fn into_result(self) -> Result<Account, LedgerError> {
        match self {
            ProcessOutcome::Applied(account) => Ok(account),
            ProcessOutcome::AlreadyProcessed(_) => Err(LedgerError::DuplicateTransaction),
            ProcessOutcome::RejectedNegativeBalance(_) => Err(LedgerError::NegativeBalance),
        }
    }
}

/// Transaction engine over a shared store.
pub struct Engine<S> {
    store: Arc<S>,
}

impl<S: LedgerStore> Engine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Engine { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Applies `op` to its account.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] - `amount` is zero or negative; the
    ///   store is not touched.
    /// - [`LedgerError::Storage`] - the unit of work failed and was rolled back.
    #[instrument(
        skip(self, op),
        fields(tx_id = %op.tx_id, account_id = %op.account_id, state = %op.direction)
    )]
    pub async fn process(&self, op: NewOperation) -> Result<ProcessOutcome, LedgerError> {
        if op.amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount);
        }

        let mut tx = self.store.begin().await?;
        tx.ensure_account(op.account_id).await?;

        let Some(id) = tx.insert_operation(&OperationDraft::pending(&op)).await? else {
            let account = snapshot(&mut tx, op.account_id).await?;
            tx.commit().await?;
            debug!("tx_id already processed");
            return Ok(ProcessOutcome::AlreadyProcessed(account));
        };

        match tx.adjust_balance(op.account_id, op.delta()).await? {
            Some(account) => {
                tx.mark_applied(id).await?;
                tx.commit().await?;
                debug!(balance = %account.balance, "operation applied");
                Ok(ProcessOutcome::Applied(account))
            }
            None => {
                // keep the row: it records the refused attempt
                let account = snapshot(&mut tx, op.account_id).await?;
                tx.commit().await?;
                info!(
                    amount = %op.amount,
                    balance = %account.balance,
                    "operation rejected: balance would become negative"
                );
                Ok(ProcessOutcome::RejectedNegativeBalance(account))
            }
        }
    }

    /// Current balance of an account.
    ///
    /// # Errors
    ///
    /// [`LedgerError::AccountNotFound`] if no operation ever referenced it.
    pub async fn balance(&self, id: AccountId) -> Result<Account, LedgerError> {
        self.store
            .account(id)
            .await?
            .ok_or(LedgerError::AccountNotFound(id))
    }

    /// The operation row stored under `tx_id`.
    pub async fn operation(&self, tx_id: &TxId) -> Result<Operation, LedgerError> {
        self.store
            .operation_by_tx_id(tx_id)
            .await?
            .ok_or_else(|| LedgerError::OperationNotFound(tx_id.clone()))
    }
}

async fn snapshot<T: LedgerTx>(tx: &mut T, id: AccountId) -> Result<Account, LedgerError> {
    tx.account(id)
        .await?
        .ok_or(LedgerError::AccountNotFound(id))
}
