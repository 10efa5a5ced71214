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

//! Ledger operations.
//!
//! An [`Operation`] is an append-only audit row. It is written once, either by
//! the engine for an incoming request or by the compensation procedure for a
//! reversing entry, and afterwards only annotated:
//!
//! - `applied` flips to `true` when the balance effect was actually booked.
//! - `canceled_at` / `cancel_note` record reconciliation.
//!
//! Rows rejected for insufficient funds stay with `applied = false`.

use crate::base::{AccountId, OperationId, TxId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Note left on an operation the scheduler could not reverse.
pub const NOTE_INSUFFICIENT_FUNDS: &str = "skip: insufficient funds";
/// Note carried by a compensating entry.
pub const NOTE_AUTO_CANCEL: &str = "auto-cancel";
/// Note left on an operation the scheduler reversed.
pub const NOTE_SCHEDULER: &str = "scheduler";

/// Origin of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "source_t", rename_all = "lowercase")]
pub enum Source {
    Game,
    Payment,
    Service,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Game => "game",
            Source::Payment => "payment",
            Source::Service => "service",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "game" => Ok(Source::Game),
            "payment" => Ok(Source::Payment),
            "service" => Ok(Source::Service),
            _ => Err(()),
        }
    }
}

/// Direction of the balance effect (the `state` column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "state_t", rename_all = "lowercase")]
pub enum Direction {
    Deposit,
    Withdraw,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Deposit => "deposit",
            Direction::Withdraw => "withdraw",
        }
    }

    /// Signed balance delta of an operation of `amount` in this direction.
    pub fn delta(&self, amount: Decimal) -> Decimal {
        match self {
            Direction::Deposit => amount,
            Direction::Withdraw => -amount,
        }
    }

    /// Direction of the entry that reverses an operation in this direction.
    pub fn inverse(&self) -> Direction {
        match self {
            Direction::Deposit => Direction::Withdraw,
            Direction::Withdraw => Direction::Deposit,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(Direction::Deposit),
            "withdraw" => Ok(Direction::Withdraw),
            _ => Err(()),
        }
    }
}

/// An operation as submitted to the engine.
///
/// `amount` is the absolute magnitude; the sign comes from `direction`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOperation {
    pub tx_id: TxId,
    pub account_id: AccountId,
    pub source: Source,
    pub direction: Direction,
    pub amount: Decimal,
}

impl NewOperation {
    pub fn deposit(account_id: AccountId, tx_id: impl Into<TxId>, amount: Decimal) -> Self {
        NewOperation {
            tx_id: tx_id.into(),
            account_id,
            source: Source::Payment,
            direction: Direction::Deposit,
            amount,
        }
    }

    pub fn withdraw(account_id: AccountId, tx_id: impl Into<TxId>, amount: Decimal) -> Self {
        NewOperation {
            tx_id: tx_id.into(),
            account_id,
            source: Source::Payment,
            direction: Direction::Withdraw,
            amount,
        }
    }

    pub fn with_source(mut self, source: Source) -> Self {
        self.source = source;
        self
    }

    pub fn delta(&self) -> Decimal {
        self.direction.delta(self.amount)
    }
}

/// A row about to be inserted into the operations table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDraft {
    pub tx_id: TxId,
    pub account_id: AccountId,
    pub source: Source,
    pub direction: Direction,
    pub amount: Decimal,
    pub applied: bool,
    pub note: Option<&'static str>,
}

impl OperationDraft {
    /// Draft for an incoming request, not yet applied.
    pub fn pending(op: &NewOperation) -> Self {
        OperationDraft {
            tx_id: op.tx_id.clone(),
            account_id: op.account_id,
            source: op.source,
            direction: op.direction,
            amount: op.amount,
            applied: false,
            note: None,
        }
    }

    /// Already-applied entry reversing `original`.
    pub fn compensating(original: &Operation) -> Self {
        OperationDraft {
            tx_id: original.tx_id.compensating(),
            account_id: original.account_id,
            source: Source::Service,
            direction: original.direction.inverse(),
            amount: original.compensating_delta().abs(),
            applied: true,
            note: Some(NOTE_AUTO_CANCEL),
        }
    }
}

/// Persisted ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Operation {
    pub id: OperationId,
    pub tx_id: TxId,
    pub account_id: AccountId,
    pub source: Source,
    #[serde(rename = "state")]
    #[sqlx(rename = "state")]
    pub direction: Direction,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
    pub applied: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub cancel_note: Option<String>,
}

impl Operation {
    /// Balance delta that exactly undoes this operation's effect.
    pub fn compensating_delta(&self) -> Decimal {
        -self.direction.delta(self.amount)
    }

    /// Whether reconciliation may still pick this operation up.
    pub fn is_cancelable(&self) -> bool {
        self.applied && self.canceled_at.is_none()
    }
}
