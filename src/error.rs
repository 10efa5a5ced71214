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

//! Error types for ledger processing and storage.

use crate::base::{AccountId, TxId};
use thiserror::Error;

/// Failures of the underlying transactional store.
///
/// Any of these aborts the current unit of work; nothing it wrote is visible.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Backend refused the call (simulated faults of the in-memory store).
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage call timed out")]
    Timeout,

    /// The new balance does not fit the balance column.
    #[error("balance out of range")]
    BalanceOutOfRange,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Ledger processing errors.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Amount is zero or negative
    #[error("invalid amount (must be positive)")]
    InvalidAmount,

    /// The account has no ledger history
    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    /// No operation carries this idempotency key
    #[error("operation {0} not found")]
    OperationNotFound(TxId),

    /// Idempotency key already processed
    #[error("duplicate transaction ID")]
    DuplicateTransaction,

    /// The mutation would drive the balance below zero
    #[error("insufficient funds: balance would become negative")]
    NegativeBalance,

    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

impl LedgerError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LedgerError::AccountNotFound(_) | LedgerError::OperationNotFound(_)
        )
    }
}
